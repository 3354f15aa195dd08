use log::debug;
use rust_decimal::Decimal;

use crate::engine::keeper::StreamKeeper;
use crate::engine::models::{
    StreamKey, STREAM_CONSUMPTION, STREAM_ENERGY, STREAM_EOL_EMISSIONS, STREAM_EQUIPMENT,
    STREAM_IMPLICIT_RECHARGE, STREAM_IMPORT, STREAM_MANUFACTURE, STREAM_NEW_EQUIPMENT,
    STREAM_PRIOR_EQUIPMENT, STREAM_RECHARGE_EMISSIONS, STREAM_RECYCLE, STREAM_SALES,
};
use crate::units::models::{base_scale, parse_units, rate_per_base, UnitValue};
use crate::units::state::{ConverterState, StateSnapshot};
use crate::utils::{clamp_non_negative, pct_to_fraction, safe_div, EngineError};

// ======================================================================
// SALES DISTRIBUTION
// ======================================================================

/// Percentage split of total sales across the manufacture, import and
/// export sub-streams, held as plain fractions summing to one.
#[derive(Debug, Clone, PartialEq)]
pub struct SalesStreamDistribution {
    pub pct_manufacture: Decimal,
    pub pct_import: Decimal,
    pub pct_export: Decimal,
}

impl SalesStreamDistribution {
    /// Distribution rules, in order: exclusion of exports, proportional
    /// to current values when any participant is non-zero, uniform over
    /// enabled participants, uniform over all participants.
    #[allow(clippy::too_many_arguments)]
    pub fn calculate(
        manufacture: Decimal,
        import: Decimal,
        export: Decimal,
        manufacture_enabled: bool,
        import_enabled: bool,
        export_enabled: bool,
        include_exports: bool,
    ) -> Self {
        let export = if include_exports { export } else { Decimal::ZERO };
        let export_enabled = export_enabled && include_exports;

        let total = manufacture + import + export;
        if !total.is_zero() {
            return Self {
                pct_manufacture: safe_div(manufacture, total),
                pct_import: safe_div(import, total),
                pct_export: safe_div(export, total),
            };
        }

        let enabled_count = [manufacture_enabled, import_enabled, export_enabled]
            .iter()
            .filter(|e| **e)
            .count();
        if enabled_count > 0 {
            let share = safe_div(Decimal::ONE, Decimal::from(enabled_count as i64));
            return Self {
                pct_manufacture: if manufacture_enabled { share } else { Decimal::ZERO },
                pct_import: if import_enabled { share } else { Decimal::ZERO },
                pct_export: if export_enabled { share } else { Decimal::ZERO },
            };
        }

        // Nothing written yet: uniform across all participating streams
        let participants = if include_exports { 3 } else { 2 };
        let share = safe_div(Decimal::ONE, Decimal::from(participants));
        Self {
            pct_manufacture: share,
            pct_import: share,
            pct_export: if include_exports { share } else { Decimal::ZERO },
        }
    }

    pub fn pct_for(&self, stream: &str) -> Decimal {
        match stream {
            STREAM_MANUFACTURE => self.pct_manufacture,
            STREAM_IMPORT => self.pct_import,
            _ => self.pct_export,
        }
    }
}

// ======================================================================
// SHARED DERIVATIONS
// ======================================================================

/// A rate parameter expressed either as a percentage of a whole or as an
/// absolute mass: percentages resolve against the whole, masses stand.
fn resolve_rate_kg(rate: &UnitValue, whole_kg: Decimal) -> Decimal {
    if rate.is_percentage() {
        pct_to_fraction(rate.value()) * whole_kg
    } else {
        rate.value() * base_scale(&parse_units(rate.units()).numerator).unwrap_or(Decimal::ONE)
    }
}

/// Servicing recharge demand in kg: population share of prior equipment
/// times the per-unit recharge intensity.
pub fn recharge_volume_kg(keeper: &StreamKeeper, key: &StreamKey) -> Result<Decimal, EngineError> {
    let prior = keeper.get_stream(key, STREAM_PRIOR_EQUIPMENT)?.value();
    let population_pct = pct_to_fraction(keeper.get_recharge_population(key).value());
    let intensity = rate_per_base(&keeper.get_recharge_intensity(key));
    Ok(population_pct * prior * intensity)
}

/// Material recovered and successfully reprocessed this year, in kg.
pub fn recycled_volume_kg(keeper: &StreamKeeper, key: &StreamKey) -> Result<Decimal, EngineError> {
    let recharge = recharge_volume_kg(keeper, key)?;
    let recovered = resolve_rate_kg(&keeper.get_recovery_rate(key), recharge).min(recharge);
    let yielded = resolve_rate_kg(&keeper.get_yield_rate(key), recovered).min(recovered);
    Ok(yielded)
}

/// Portion of recycled material that displaces virgin sales, in kg.
pub fn displaced_recycling_kg(
    keeper: &StreamKeeper,
    key: &StreamKey,
) -> Result<Decimal, EngineError> {
    let recycled = recycled_volume_kg(keeper, key)?;
    Ok(pct_to_fraction(keeper.get_displacement_rate(key).value()) * recycled)
}

/// Live ambient state for unit conversion, assembled from the streams
/// of one (application, substance) pair.
pub fn build_converter_state(
    keeper: &StreamKeeper,
    key: &StreamKey,
) -> Result<ConverterState, EngineError> {
    let equipment = keeper.get_stream(key, STREAM_EQUIPMENT)?;
    let prior = keeper.get_stream(key, STREAM_PRIOR_EQUIPMENT)?;
    let change = equipment.value() - prior.value();
    Ok(ConverterState::live(StateSnapshot {
        population: equipment,
        volume: keeper.get_stream(key, STREAM_SALES)?,
        gas_consumption: keeper.get_stream(key, STREAM_CONSUMPTION)?,
        energy_consumption: keeper.get_stream(key, STREAM_ENERGY)?,
        amortized_unit_volume: keeper.amortized_initial_charge(key),
        years_elapsed: UnitValue::new(Decimal::ONE, "years"),
        population_change: UnitValue::new(change, "units"),
    }))
}

// ======================================================================
// RECALC KIT
// ======================================================================

/// Collaborators a strategy needs for one execution. Strategies are
/// transient values dispatched through the kit; they hold no
/// back-references and do not outlive the call.
pub struct RecalcKit<'a> {
    pub keeper: &'a mut StreamKeeper,
}

impl<'a> RecalcKit<'a> {
    pub fn new(keeper: &'a mut StreamKeeper) -> Self {
        Self { keeper }
    }

    pub fn converter_state(&self, key: &StreamKey) -> Result<ConverterState, EngineError> {
        build_converter_state(self.keeper, key)
    }
}

// ======================================================================
// STRATEGIES
// ======================================================================

/// The closed family of recalculation steps. Each strategy reads the
/// keeper and rewrites one or more streams; every strategy is
/// idempotent on unchanged inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum RecalcStrategy {
    /// consumption = sales * ghg intensity; energy = sales * energy intensity
    Consumption,
    /// Derive new equipment from sales volume and write population
    PopulationChange { subtract_recharge: bool },
    /// Recompute sales sub-streams from targets and the distribution
    Sales { preserve_unit_spec: Option<bool> },
    /// Servicing emissions and the recycled-material stream
    RechargeEmissions,
    /// Emissions from equipment retired this year
    EolEmissions,
    /// Apply the retirement rate against prior equipment
    Retire,
}

impl RecalcStrategy {
    pub fn execute(&self, key: &StreamKey, kit: &mut RecalcKit) -> Result<(), EngineError> {
        match self {
            RecalcStrategy::Consumption => recalc_consumption(key, kit.keeper),
            RecalcStrategy::PopulationChange { subtract_recharge } => {
                recalc_population_change(key, kit.keeper, *subtract_recharge)
            }
            RecalcStrategy::Sales { preserve_unit_spec } => {
                recalc_sales(key, kit.keeper, *preserve_unit_spec)
            }
            RecalcStrategy::RechargeEmissions => recalc_recharge_emissions(key, kit.keeper),
            RecalcStrategy::EolEmissions => recalc_eol_emissions(key, kit.keeper),
            RecalcStrategy::Retire => recalc_retire(key, kit.keeper),
        }
    }
}

fn recalc_consumption(key: &StreamKey, keeper: &mut StreamKeeper) -> Result<(), EngineError> {
    let sales_kg = keeper.get_stream(key, STREAM_SALES)?.value();
    let ghg = rate_per_base(&keeper.get_ghg_intensity(key));
    let energy = rate_per_base(&keeper.get_energy_intensity(key));

    keeper.set_stream(key, STREAM_CONSUMPTION, UnitValue::new(sales_kg * ghg, "tCO2e"))?;
    keeper.set_stream(key, STREAM_ENERGY, UnitValue::new(sales_kg * energy, "kwh"))?;
    Ok(())
}

fn recalc_population_change(
    key: &StreamKey,
    keeper: &mut StreamKeeper,
    subtract_recharge: bool,
) -> Result<(), EngineError> {
    let prior = keeper.get_stream(key, STREAM_PRIOR_EQUIPMENT)?.value();
    let sales_kg = keeper.get_stream(key, STREAM_SALES)?.value();
    let recharge_kg = recharge_volume_kg(keeper, key)?;
    let charge = keeper.amortized_initial_charge(key).value();

    let available_kg = if subtract_recharge {
        sales_kg - recharge_kg
    } else {
        sales_kg
    };
    let new_units = safe_div(available_kg, charge);

    debug!(
        "population change for {}: prior {} + new {} units",
        key, prior, new_units
    );

    keeper.set_stream(
        key,
        STREAM_EQUIPMENT,
        UnitValue::new(clamp_non_negative(prior + new_units), "units"),
    )?;
    keeper.set_stream(
        key,
        STREAM_NEW_EQUIPMENT,
        UnitValue::new(clamp_non_negative(new_units), "units"),
    )?;
    Ok(())
}

fn recalc_sales(
    key: &StreamKey,
    keeper: &mut StreamKeeper,
    preserve_unit_spec: Option<bool>,
) -> Result<(), EngineError> {
    let recharge_kg = recharge_volume_kg(keeper, key)?;
    let distribution = keeper.get_distribution(key, false);

    if keeper.get_sales_intent(key) {
        // The user wrote sales directly this year: their mass values are
        // authoritative. Unit-based specifications are refreshed so the
        // specified equipment count survives parameter changes, with the
        // recharge demand folded back in as implicit recharge.
        let implicit_active = !keeper
            .get_stream(key, STREAM_IMPLICIT_RECHARGE)?
            .value()
            .is_zero()
            || recharge_kg.is_zero();

        let preserve = preserve_unit_spec.unwrap_or(implicit_active);
        let mut implicit_total = Decimal::ZERO;
        for stream in keeper.enabled_substreams(key) {
            if !(preserve && keeper.has_equipment_units(key, stream)) {
                continue;
            }
            let Some(specified) = keeper.get_last_specified(key, stream) else {
                continue;
            };
            let new_kg =
                specified.value() * rate_per_base(&keeper.get_initial_charge(key, stream));
            let recharge_share = recharge_kg * distribution.pct_for(stream);
            implicit_total += recharge_share;
            keeper.set_stream(
                key,
                stream,
                UnitValue::new(new_kg + recharge_share, "kg"),
            )?;
        }
        keeper.set_stream(
            key,
            STREAM_IMPLICIT_RECHARGE,
            UnitValue::new(implicit_total, "kg"),
        )?;
        return Ok(());
    }

    // Derived target: demand implied by the population change plus the
    // servicing recharge, net of displaced recycled material.
    let new_units = keeper.get_stream(key, STREAM_NEW_EQUIPMENT)?.value();
    let charge = keeper.amortized_initial_charge(key).value();
    let displaced = displaced_recycling_kg(keeper, key)?;
    let demand_kg = clamp_non_negative(new_units * charge + recharge_kg - displaced);

    let targets: Vec<(&str, Decimal)> = keeper
        .enabled_substreams(key)
        .into_iter()
        .map(|stream| (stream, demand_kg * distribution.pct_for(stream)))
        .collect();
    for (stream, value) in targets {
        keeper.set_stream(key, stream, UnitValue::new(value, "kg"))?;
    }
    Ok(())
}

fn recalc_recharge_emissions(key: &StreamKey, keeper: &mut StreamKeeper) -> Result<(), EngineError> {
    let recharge_kg = recharge_volume_kg(keeper, key)?;
    let ghg = rate_per_base(&keeper.get_ghg_intensity(key));

    keeper.set_stream(
        key,
        STREAM_RECHARGE_EMISSIONS,
        UnitValue::new(recharge_kg * ghg, "tCO2e"),
    )?;

    // Recovery happens at servicing, so the recycled stream is kept in
    // lockstep with the recharge volume.
    let recycled = recycled_volume_kg(keeper, key)?;
    keeper.set_stream(key, STREAM_RECYCLE, UnitValue::new(recycled, "kg"))?;
    Ok(())
}

fn recalc_eol_emissions(key: &StreamKey, keeper: &mut StreamKeeper) -> Result<(), EngineError> {
    let retired_units = keeper.get_retired_year_to_date(key);
    let charge = keeper.amortized_initial_charge(key).value();
    let ghg = rate_per_base(&keeper.get_ghg_intensity(key));

    keeper.set_stream(
        key,
        STREAM_EOL_EMISSIONS,
        UnitValue::new(retired_units * charge * ghg, "tCO2e"),
    )?;
    Ok(())
}

fn recalc_retire(key: &StreamKey, keeper: &mut StreamKeeper) -> Result<(), EngineError> {
    let rate = pct_to_fraction(keeper.get_retirement_rate(key).value());
    let already = keeper.get_retired_year_to_date(key);
    let prior = keeper.get_stream(key, STREAM_PRIOR_EQUIPMENT)?.value();

    // The rate applies to the population as it stood at the start of
    // the year, so re-running the strategy never retires twice.
    let prior_at_year_start = prior + already;
    let target = rate * prior_at_year_start;
    let delta = target - already;
    if delta.is_zero() {
        return Ok(());
    }

    let equipment = keeper.get_stream(key, STREAM_EQUIPMENT)?.value();
    keeper.set_stream(
        key,
        STREAM_PRIOR_EQUIPMENT,
        UnitValue::new(clamp_non_negative(prior - delta), "units"),
    )?;
    keeper.set_stream(
        key,
        STREAM_EQUIPMENT,
        UnitValue::new(clamp_non_negative(equipment - delta), "units"),
    )?;
    keeper.set_retired_year_to_date(key, target);
    Ok(())
}

// ======================================================================
// PIPELINE
// ======================================================================

/// Ordered composition of strategies: exactly one initial step followed
/// by any number of propagate steps, executed synchronously in order.
pub struct RecalcPipelineBuilder {
    initial: Option<RecalcStrategy>,
    propagates: Vec<RecalcStrategy>,
}

impl RecalcPipelineBuilder {
    pub fn new() -> Self {
        Self {
            initial: None,
            propagates: Vec::new(),
        }
    }

    pub fn initial(mut self, strategy: RecalcStrategy) -> Self {
        assert!(
            self.initial.is_none(),
            "recalc pipeline already has an initial strategy"
        );
        self.initial = Some(strategy);
        self
    }

    pub fn then(mut self, strategy: RecalcStrategy) -> Self {
        self.propagates.push(strategy);
        self
    }

    pub fn build(self) -> RecalcPipeline {
        let mut steps = Vec::with_capacity(self.propagates.len() + 1);
        if let Some(initial) = self.initial {
            steps.push(initial);
        }
        steps.extend(self.propagates);
        RecalcPipeline { steps }
    }
}

impl Default for RecalcPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RecalcPipeline {
    steps: Vec<RecalcStrategy>,
}

impl RecalcPipeline {
    pub fn execute(&self, key: &StreamKey, keeper: &mut StreamKeeper) -> Result<(), EngineError> {
        let mut kit = RecalcKit::new(keeper);
        for step in &self.steps {
            step.execute(key, &mut kit)?;
        }
        Ok(())
    }
}
