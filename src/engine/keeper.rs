use std::collections::{BTreeMap, HashMap, HashSet};

use rust_decimal::Decimal;

use crate::engine::models::{
    ensure_known_stream, stream_base_units, StreamKey, SALES_SUBSTREAMS, PER_YEAR_STREAMS,
    STREAM_EQUIPMENT, STREAM_EXPORT, STREAM_IMPORT, STREAM_MANUFACTURE, STREAM_PRIOR_EQUIPMENT,
    STREAM_SALES,
};
use crate::engine::recalc::SalesStreamDistribution;
use crate::units::{rate_per_base, UnitValue};
use crate::utils::{safe_div, EngineError};

// ======================================================================
// PER-SUBSTANCE RECORD
// ======================================================================

/// All streams, parameters and bookkeeping flags for one
/// (application, substance) pair.
#[derive(Debug, Clone)]
pub struct SubstanceRecord {
    streams: HashMap<String, UnitValue>,
    ghg_intensity: UnitValue,
    energy_intensity: UnitValue,
    initial_charges: HashMap<String, UnitValue>,
    recharge_population: UnitValue,
    recharge_intensity: UnitValue,
    retirement_rate: UnitValue,
    recovery_rate: UnitValue,
    yield_rate: UnitValue,
    displacement_rate: UnitValue,
    enabled: HashSet<String>,
    last_specified: HashMap<String, UnitValue>,
    sales_intent: bool,
    retired_year_to_date: Decimal,
}

impl Default for SubstanceRecord {
    fn default() -> Self {
        Self {
            streams: HashMap::new(),
            ghg_intensity: UnitValue::zero("tCO2e / kg"),
            energy_intensity: UnitValue::zero("kwh / kg"),
            initial_charges: HashMap::new(),
            recharge_population: UnitValue::zero("%"),
            recharge_intensity: UnitValue::zero("kg / unit"),
            retirement_rate: UnitValue::zero("% / year"),
            recovery_rate: UnitValue::zero("%"),
            yield_rate: UnitValue::new(Decimal::ONE_HUNDRED, "%"),
            displacement_rate: UnitValue::new(Decimal::ONE_HUNDRED, "%"),
            enabled: HashSet::new(),
            last_specified: HashMap::new(),
            sales_intent: false,
            retired_year_to_date: Decimal::ZERO,
        }
    }
}

// ======================================================================
// STREAM KEEPER
// ======================================================================

/// Per-(application, substance) storage of all streams and substance
/// parameters. Entries spring into existence on first touch and persist
/// until the engine is dropped. Keys are held in a sorted map so that
/// iteration, and therefore every serialized result, is deterministic.
#[derive(Debug, Clone, Default)]
pub struct StreamKeeper {
    records: BTreeMap<StreamKey, SubstanceRecord>,
}

impl StreamKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&mut self, key: &StreamKey) {
        self.records.entry(key.clone()).or_default();
    }

    pub fn has_entry(&self, key: &StreamKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &StreamKey> {
        self.records.keys()
    }

    fn record(&self, key: &StreamKey) -> Option<&SubstanceRecord> {
        self.records.get(key)
    }

    fn record_mut(&mut self, key: &StreamKey) -> &mut SubstanceRecord {
        self.records.entry(key.clone()).or_default()
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Read a stream. Undefined streams read as zero in the stream's
    /// natural unit; the virtual "sales" stream sums its sub-streams
    /// (export participates only once explicitly enabled).
    pub fn get_stream(&self, key: &StreamKey, name: &str) -> Result<UnitValue, EngineError> {
        ensure_known_stream(name)?;

        if name == STREAM_SALES {
            let mut total = Decimal::ZERO;
            total += self.stream_value(key, STREAM_MANUFACTURE);
            total += self.stream_value(key, STREAM_IMPORT);
            if self.is_enabled(key, STREAM_EXPORT) {
                total += self.stream_value(key, STREAM_EXPORT);
            }
            return Ok(UnitValue::new(total, "kg"));
        }

        Ok(self
            .record(key)
            .and_then(|r| r.streams.get(name).cloned())
            .unwrap_or_else(|| UnitValue::zero(stream_base_units(name))))
    }

    fn stream_value(&self, key: &StreamKey, name: &str) -> Decimal {
        self.record(key)
            .and_then(|r| r.streams.get(name))
            .map(|v| v.value())
            .unwrap_or(Decimal::ZERO)
    }

    /// Overwrite a stream with a value already expressed in the
    /// stream's natural unit. Writing the virtual "sales" stream is the
    /// engine's job (it distributes first), so it is rejected here.
    pub fn set_stream(
        &mut self,
        key: &StreamKey,
        name: &str,
        value: UnitValue,
    ) -> Result<(), EngineError> {
        ensure_known_stream(name)?;
        if name == STREAM_SALES {
            return Err(EngineError::UnknownStream(
                "'sales' is virtual; write its sub-streams".to_string(),
            ));
        }
        self.record_mut(key).streams.insert(name.to_string(), value);
        Ok(())
    }

    /// Record the user-facing value of the most recent write so the
    /// units of intent survive recalculation.
    pub fn set_last_specified(&mut self, key: &StreamKey, name: &str, value: UnitValue) {
        self.record_mut(key)
            .last_specified
            .insert(name.to_string(), value);
    }

    pub fn get_last_specified(&self, key: &StreamKey, name: &str) -> Option<UnitValue> {
        self.record(key)
            .and_then(|r| r.last_specified.get(name).cloned())
    }

    /// True when the most recent user write to the stream was counted
    /// in equipment units.
    pub fn has_equipment_units(&self, key: &StreamKey, name: &str) -> bool {
        self.get_last_specified(key, name)
            .map(|v| v.has_equipment_units())
            .unwrap_or(false)
    }

    pub fn mark_enabled(&mut self, key: &StreamKey, name: &str) {
        self.record_mut(key).enabled.insert(name.to_string());
    }

    pub fn is_enabled(&self, key: &StreamKey, name: &str) -> bool {
        self.record(key)
            .map(|r| r.enabled.contains(name))
            .unwrap_or(false)
    }

    pub fn enabled_substreams(&self, key: &StreamKey) -> Vec<&'static str> {
        SALES_SUBSTREAMS
            .iter()
            .copied()
            .filter(|s| self.is_enabled(key, s))
            .collect()
    }

    /// Percentage split of sales across manufacture / import / export.
    pub fn get_distribution(
        &self,
        key: &StreamKey,
        include_exports: bool,
    ) -> SalesStreamDistribution {
        SalesStreamDistribution::calculate(
            self.stream_value(key, STREAM_MANUFACTURE),
            self.stream_value(key, STREAM_IMPORT),
            self.stream_value(key, STREAM_EXPORT),
            self.is_enabled(key, STREAM_MANUFACTURE),
            self.is_enabled(key, STREAM_IMPORT),
            self.is_enabled(key, STREAM_EXPORT),
            include_exports,
        )
    }

    // ------------------------------------------------------------------
    // Sales intent
    // ------------------------------------------------------------------

    pub fn set_sales_intent(&mut self, key: &StreamKey) {
        self.record_mut(key).sales_intent = true;
    }

    pub fn get_sales_intent(&self, key: &StreamKey) -> bool {
        self.record(key).map(|r| r.sales_intent).unwrap_or(false)
    }

    pub fn reset_sales_intent_flag(&mut self, key: &StreamKey) {
        self.record_mut(key).sales_intent = false;
    }

    // ------------------------------------------------------------------
    // Substance parameters
    // ------------------------------------------------------------------

    pub fn get_ghg_intensity(&self, key: &StreamKey) -> UnitValue {
        self.record(key)
            .map(|r| r.ghg_intensity.clone())
            .unwrap_or_else(|| UnitValue::zero("tCO2e / kg"))
    }

    pub fn set_ghg_intensity(&mut self, key: &StreamKey, value: UnitValue) {
        self.record_mut(key).ghg_intensity = value;
    }

    pub fn get_energy_intensity(&self, key: &StreamKey) -> UnitValue {
        self.record(key)
            .map(|r| r.energy_intensity.clone())
            .unwrap_or_else(|| UnitValue::zero("kwh / kg"))
    }

    pub fn set_energy_intensity(&mut self, key: &StreamKey, value: UnitValue) {
        self.record_mut(key).energy_intensity = value;
    }

    pub fn get_recharge_population(&self, key: &StreamKey) -> UnitValue {
        self.record(key)
            .map(|r| r.recharge_population.clone())
            .unwrap_or_else(|| UnitValue::zero("%"))
    }

    pub fn set_recharge_population(&mut self, key: &StreamKey, value: UnitValue) {
        self.record_mut(key).recharge_population = value;
    }

    pub fn get_recharge_intensity(&self, key: &StreamKey) -> UnitValue {
        self.record(key)
            .map(|r| r.recharge_intensity.clone())
            .unwrap_or_else(|| UnitValue::zero("kg / unit"))
    }

    pub fn set_recharge_intensity(&mut self, key: &StreamKey, value: UnitValue) {
        self.record_mut(key).recharge_intensity = value;
    }

    pub fn get_retirement_rate(&self, key: &StreamKey) -> UnitValue {
        self.record(key)
            .map(|r| r.retirement_rate.clone())
            .unwrap_or_else(|| UnitValue::zero("% / year"))
    }

    pub fn set_retirement_rate(&mut self, key: &StreamKey, value: UnitValue) {
        self.record_mut(key).retirement_rate = value;
    }

    pub fn get_recovery_rate(&self, key: &StreamKey) -> UnitValue {
        self.record(key)
            .map(|r| r.recovery_rate.clone())
            .unwrap_or_else(|| UnitValue::zero("%"))
    }

    pub fn set_recovery_rate(&mut self, key: &StreamKey, value: UnitValue) {
        self.record_mut(key).recovery_rate = value;
    }

    pub fn get_yield_rate(&self, key: &StreamKey) -> UnitValue {
        self.record(key)
            .map(|r| r.yield_rate.clone())
            .unwrap_or_else(|| UnitValue::new(Decimal::ONE_HUNDRED, "%"))
    }

    pub fn set_yield_rate(&mut self, key: &StreamKey, value: UnitValue) {
        self.record_mut(key).yield_rate = value;
    }

    pub fn get_displacement_rate(&self, key: &StreamKey) -> UnitValue {
        self.record(key)
            .map(|r| r.displacement_rate.clone())
            .unwrap_or_else(|| UnitValue::new(Decimal::ONE_HUNDRED, "%"))
    }

    pub fn set_displacement_rate(&mut self, key: &StreamKey, value: UnitValue) {
        self.record_mut(key).displacement_rate = value;
    }

    /// Initial charge for a sales stream. A sub-stream without its own
    /// charge falls back to the charge recorded against "sales"; the
    /// "sales" charge itself is the sales-weighted mean of the
    /// sub-stream charges whenever sub-stream volumes exist.
    pub fn get_initial_charge(&self, key: &StreamKey, stream: &str) -> UnitValue {
        if stream == STREAM_SALES {
            return self.amortized_initial_charge(key);
        }
        self.raw_initial_charge(key, stream)
            .or_else(|| self.raw_initial_charge(key, STREAM_SALES))
            .unwrap_or_else(|| UnitValue::zero("kg / unit"))
    }

    pub fn set_initial_charge(&mut self, key: &StreamKey, stream: &str, value: UnitValue) {
        self.record_mut(key)
            .initial_charges
            .insert(stream.to_string(), value);
    }

    fn raw_initial_charge(&self, key: &StreamKey, stream: &str) -> Option<UnitValue> {
        self.record(key)
            .and_then(|r| r.initial_charges.get(stream).cloned())
    }

    /// Sales-weighted amortized charge in kg per unit.
    pub fn amortized_initial_charge(&self, key: &StreamKey) -> UnitValue {
        let manufacture_kg = self.stream_value(key, STREAM_MANUFACTURE);
        let import_kg = self.stream_value(key, STREAM_IMPORT);
        let total = manufacture_kg + import_kg;

        if !total.is_zero() {
            let charge_m = self.substream_charge_value(key, STREAM_MANUFACTURE);
            let charge_i = self.substream_charge_value(key, STREAM_IMPORT);
            let weighted = safe_div(manufacture_kg * charge_m + import_kg * charge_i, total);
            return UnitValue::new(weighted, "kg / unit");
        }

        let fallback = self
            .raw_initial_charge(key, STREAM_SALES)
            .or_else(|| self.raw_initial_charge(key, STREAM_MANUFACTURE))
            .or_else(|| self.raw_initial_charge(key, STREAM_IMPORT))
            .unwrap_or_else(|| UnitValue::zero("kg / unit"));
        UnitValue::new(rate_per_base(&fallback), "kg / unit")
    }

    fn substream_charge_value(&self, key: &StreamKey, stream: &str) -> Decimal {
        rate_per_base(&self.get_initial_charge(key, stream))
    }

    // ------------------------------------------------------------------
    // Retirement bookkeeping
    // ------------------------------------------------------------------

    pub fn get_retired_year_to_date(&self, key: &StreamKey) -> Decimal {
        self.record(key)
            .map(|r| r.retired_year_to_date)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn set_retired_year_to_date(&mut self, key: &StreamKey, value: Decimal) {
        self.record_mut(key).retired_year_to_date = value;
    }

    // ------------------------------------------------------------------
    // Year rollover
    // ------------------------------------------------------------------

    /// Snapshot equipment into priorEquipment and zero the per-year
    /// accumulators for every known pair.
    pub fn roll_over_year(&mut self) {
        for record in self.records.values_mut() {
            let equipment = record
                .streams
                .get(STREAM_EQUIPMENT)
                .cloned()
                .unwrap_or_else(|| UnitValue::zero("units"));
            record
                .streams
                .insert(STREAM_PRIOR_EQUIPMENT.to_string(), equipment);

            for name in PER_YEAR_STREAMS {
                record
                    .streams
                    .insert(name.to_string(), UnitValue::zero(stream_base_units(name)));
            }

            record.retired_year_to_date = Decimal::ZERO;
            record.sales_intent = false;
        }
    }
}
