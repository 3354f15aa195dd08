use std::error::Error;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::engine::core::Engine;
use crate::engine::keeper::StreamKeeper;
use crate::engine::models::{
    StreamKey, STREAM_CONSUMPTION, STREAM_ENERGY, STREAM_EOL_EMISSIONS, STREAM_EQUIPMENT,
    STREAM_IMPORT, STREAM_MANUFACTURE, STREAM_NEW_EQUIPMENT, STREAM_RECHARGE_EMISSIONS,
    STREAM_RECYCLE, STREAM_SALES,
};
use crate::engine::recalc::recharge_volume_kg;
use crate::units::models::{rate_per_base, UnitValue};
use crate::utils::{clamp_non_negative, safe_div, EngineError};

// ======================================================================
// RESULT ROWS
// ======================================================================

/// Attribution of imports between servicing recharge and equipment
/// newly placed this year, in all three measures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSupplement {
    pub import_new_value: UnitValue,
    pub import_new_consumption: UnitValue,
    pub import_new_population: UnitValue,
}

/// One output row: every reported measure for a
/// (scenario, trial, year, application, substance) combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineResult {
    pub scenario: String,
    pub trial: u32,
    pub year: i32,
    pub application: String,
    pub substance: String,
    pub manufacture: UnitValue,
    pub import: UnitValue,
    pub recycle: UnitValue,
    pub domestic_consumption: UnitValue,
    pub import_consumption: UnitValue,
    pub recycle_consumption: UnitValue,
    pub population: UnitValue,
    pub population_new: UnitValue,
    pub recharge_emissions: UnitValue,
    pub eol_emissions: UnitValue,
    pub energy_consumption: UnitValue,
    pub initial_charge_value: UnitValue,
    pub initial_charge_consumption: UnitValue,
    pub import_supplement: ImportSupplement,
}

/// Column order of the CSV export surface.
pub const CSV_HEADER: &[&str] = &[
    "scenario",
    "trial",
    "year",
    "application",
    "substance",
    "manufacture",
    "import",
    "recycle",
    "domesticConsumption",
    "importConsumption",
    "recycleConsumption",
    "population",
    "populationNew",
    "rechargeEmissions",
    "eolEmissions",
    "energyConsumption",
    "initialChargeValue",
    "initialChargeConsumption",
    "importNewPopulation",
];

// ======================================================================
// SERIALIZER
// ======================================================================

/// Snapshots per-year engine state into result rows with consumption
/// attributed across the sales sub-streams.
pub struct ResultSerializer;

impl ResultSerializer {
    /// Rows for every (application, substance) pair the engine has
    /// touched, for the engine's current year.
    pub fn serialize_year(
        engine: &Engine,
        scenario: &str,
        trial: u32,
    ) -> Result<Vec<EngineResult>, EngineError> {
        let keeper = engine.keeper();
        let keys: Vec<StreamKey> = keeper.keys().cloned().collect();
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            rows.push(Self::serialize_key(keeper, &key, scenario, trial, engine.year())?);
        }
        Ok(rows)
    }

    /// Row for one pair. The pair must already exist in the keeper;
    /// asking for an untouched pair means required inputs were never
    /// provided.
    pub fn serialize_key(
        keeper: &StreamKeeper,
        key: &StreamKey,
        scenario: &str,
        trial: u32,
        year: i32,
    ) -> Result<EngineResult, EngineError> {
        if !keeper.has_entry(key) {
            return Err(EngineError::MissingParameter(format!(
                "no streams recorded for {}",
                key
            )));
        }

        let manufacture = keeper.get_stream(key, STREAM_MANUFACTURE)?;
        let import = keeper.get_stream(key, STREAM_IMPORT)?;
        let recycle = keeper.get_stream(key, STREAM_RECYCLE)?;
        let consumption = keeper.get_stream(key, STREAM_CONSUMPTION)?;
        let ghg = rate_per_base(&keeper.get_ghg_intensity(key));

        // Recycled material displaces virgin consumption before the
        // domestic / import split
        let recycle_consumption = recycle.value() * ghg;
        let attributable = clamp_non_negative(consumption.value() - recycle_consumption);
        let virgin_total = manufacture.value() + import.value();
        let domestic_share = safe_div(manufacture.value(), virgin_total);
        let import_share = safe_div(import.value(), virgin_total);

        let charge = keeper.amortized_initial_charge(key);
        let supplement = Self::import_supplement(keeper, key, &import, ghg)?;

        Ok(EngineResult {
            scenario: scenario.to_string(),
            trial,
            year,
            application: key.application.clone(),
            substance: key.substance.clone(),
            manufacture,
            import,
            recycle,
            domestic_consumption: UnitValue::new(attributable * domestic_share, "tCO2e"),
            import_consumption: UnitValue::new(attributable * import_share, "tCO2e"),
            recycle_consumption: UnitValue::new(recycle_consumption, "tCO2e"),
            population: keeper.get_stream(key, STREAM_EQUIPMENT)?,
            population_new: keeper.get_stream(key, STREAM_NEW_EQUIPMENT)?,
            recharge_emissions: keeper.get_stream(key, STREAM_RECHARGE_EMISSIONS)?,
            eol_emissions: keeper.get_stream(key, STREAM_EOL_EMISSIONS)?,
            energy_consumption: keeper.get_stream(key, STREAM_ENERGY)?,
            initial_charge_consumption: UnitValue::new(
                rate_per_base(&charge) * ghg,
                "tCO2e / unit",
            ),
            initial_charge_value: charge,
            import_supplement: supplement,
        })
    }

    /// New-equipment share of imports: the fraction of sales volume
    /// left after the servicing recharge, applied to the import stream.
    fn import_supplement(
        keeper: &StreamKeeper,
        key: &StreamKey,
        import: &UnitValue,
        ghg: Decimal,
    ) -> Result<ImportSupplement, EngineError> {
        let sales_kg = keeper.get_stream(key, STREAM_SALES)?.value();
        let recharge_kg = recharge_volume_kg(keeper, key)?;
        let new_fraction = clamp_non_negative(safe_div(sales_kg - recharge_kg, sales_kg));

        let new_kg = import.value() * new_fraction;
        let charge = rate_per_base(&keeper.get_initial_charge(key, STREAM_IMPORT));
        Ok(ImportSupplement {
            import_new_value: UnitValue::new(new_kg, "kg"),
            import_new_consumption: UnitValue::new(new_kg * ghg, "tCO2e"),
            import_new_population: UnitValue::new(safe_div(new_kg, charge), "units"),
        })
    }
}

// ======================================================================
// CSV EXPORT AND TRANSPORT FRAMING
// ======================================================================

/// Render rows as the CSV surface expected by downstream tooling, with
/// every measure as "<magnitude> <unit>".
pub fn render_csv(rows: &[EngineResult]) -> Result<String, Box<dyn Error>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;

    for row in rows {
        writer.write_record(&[
            row.scenario.clone(),
            row.trial.to_string(),
            row.year.to_string(),
            row.application.clone(),
            row.substance.clone(),
            row.manufacture.to_string(),
            row.import.to_string(),
            row.recycle.to_string(),
            row.domestic_consumption.to_string(),
            row.import_consumption.to_string(),
            row.recycle_consumption.to_string(),
            row.population.to_string(),
            row.population_new.to_string(),
            row.recharge_emissions.to_string(),
            row.eol_emissions.to_string(),
            row.energy_consumption.to_string(),
            row.initial_charge_value.to_string(),
            row.initial_charge_consumption.to_string(),
            row.import_supplement.import_new_population.to_string(),
        ])?;
    }

    let bytes = writer.into_inner()?;
    Ok(String::from_utf8(bytes)?)
}

/// Success framing for the worker-style transport: a status line, a
/// blank line, then the CSV payload.
pub fn render_ok_response(rows: &[EngineResult]) -> Result<String, Box<dyn Error>> {
    Ok(format!("OK\n\n{}", render_csv(rows)?))
}

/// Failure framing: "<ErrorKind>: <message>" and no payload.
pub fn render_error_response(error: &EngineError) -> String {
    format!("{}: {}\n\n", error.kind(), error)
}
