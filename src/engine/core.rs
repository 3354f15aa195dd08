use log::{debug, info};
use rust_decimal::Decimal;

use crate::engine::keeper::StreamKeeper;
use crate::engine::models::{
    ensure_known_stream, is_known_stream, is_sales_substream, Scope, StreamKey, YearMatcher,
    STREAM_CONSUMPTION, STREAM_ENERGY, STREAM_EQUIPMENT, STREAM_NEW_EQUIPMENT,
    STREAM_PRIOR_EQUIPMENT, STREAM_RECYCLE, STREAM_SALES,
};
use crate::engine::recalc::{
    build_converter_state, recharge_volume_kg, RecalcPipeline, RecalcPipelineBuilder,
    RecalcStrategy,
};
use crate::units::models::{base_scale, family_of, parse_units, rate_per_base, UnitFamily, UnitValue};
use crate::units::converter::UnitConverter;
use crate::utils::{clamp_non_negative, safe_div, EngineError};

// ======================================================================
// SIMULATION ENGINE
// ======================================================================

/// The public simulation object: a year cursor, the current scope and
/// the command verbs. Verbs guarded by a year range no-op outside the
/// range, and every mutating verb either completes its full
/// recalculation pipeline or leaves the keeper exactly as it was.
pub struct Engine {
    keeper: StreamKeeper,
    scope: Scope,
    current_year: i32,
    start_year: i32,
    end_year: i32,
}

impl Engine {
    pub fn new(start_year: i32, end_year: i32) -> Self {
        // A reversed simulation window normalizes the same way a
        // reversed verb range does
        let (start_year, end_year) = if start_year <= end_year {
            (start_year, end_year)
        } else {
            (end_year, start_year)
        };
        Self {
            keeper: StreamKeeper::new(),
            scope: Scope::new(),
            current_year: start_year,
            start_year,
            end_year,
        }
    }

    pub fn year(&self) -> i32 {
        self.current_year
    }

    pub fn start_year(&self) -> i32 {
        self.start_year
    }

    pub fn end_year(&self) -> i32 {
        self.end_year
    }

    /// True once the year cursor has advanced past the end year.
    pub fn is_done(&self) -> bool {
        self.current_year > self.end_year
    }

    pub fn keeper(&self) -> &StreamKeeper {
        &self.keeper
    }

    // ------------------------------------------------------------------
    // Scope management
    // ------------------------------------------------------------------

    pub fn set_stanza(&mut self, name: &str) {
        self.scope.set_stanza(name);
    }

    pub fn set_application(&mut self, name: &str) {
        self.scope.set_application(name);
    }

    pub fn set_substance(&mut self, name: &str) {
        self.scope.set_substance(name);
        if let Ok(key) = self.scope.key() {
            self.keeper.ensure(&key);
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn set_variable(&mut self, name: &str, value: UnitValue) {
        self.scope.set_variable(name, value);
    }

    pub fn get_variable(&self, name: &str) -> Option<&UnitValue> {
        self.scope.get_variable(name)
    }

    fn current_key(&self) -> Result<StreamKey, EngineError> {
        self.scope.key()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read a stream for the current scope, in its natural unit.
    pub fn get_stream(&self, name: &str) -> Result<UnitValue, EngineError> {
        let key = self.current_key()?;
        self.keeper.get_stream(&key, name)
    }

    /// Read a stream converted to the requested units under the live
    /// ambient state.
    pub fn get_stream_as(&self, name: &str, units: &str) -> Result<UnitValue, EngineError> {
        let key = self.current_key()?;
        let value = self.keeper.get_stream(&key, name)?;
        let state = build_converter_state(&self.keeper, &key)?;
        UnitConverter::convert(&value, units, &state)
    }

    // ------------------------------------------------------------------
    // Verbs
    // ------------------------------------------------------------------

    pub fn set_stream(
        &mut self,
        name: &str,
        value: UnitValue,
        range: &YearMatcher,
    ) -> Result<(), EngineError> {
        if !range.matches(self.current_year) {
            return Ok(());
        }
        ensure_known_stream(name)?;
        let key = self.current_key()?;
        self.keeper.ensure(&key);
        self.with_rollback(|engine| engine.apply_set_stream(&key, name, &value))
    }

    pub fn change_stream(
        &mut self,
        name: &str,
        delta: UnitValue,
        range: &YearMatcher,
    ) -> Result<(), EngineError> {
        if !range.matches(self.current_year) {
            return Ok(());
        }
        ensure_known_stream(name)?;
        let key = self.current_key()?;
        self.keeper.ensure(&key);

        let current = self.keeper.get_stream(&key, name)?;
        let next = if delta.is_percentage() {
            // Proportional change, applied once per simulated year
            let factor = Decimal::ONE + delta.value() / Decimal::ONE_HUNDRED;
            current.with_value(current.value() * factor)
        } else {
            let state = build_converter_state(&self.keeper, &key)?;
            let converted = UnitConverter::convert(&delta, current.units(), &state)?;
            current.add(&converted)?
        };

        self.with_rollback(|engine| engine.apply_set_stream(&key, name, &next))
    }

    /// Reduce the stream to the limit when it exceeds it, routing the
    /// trimmed volume into the displacement target.
    pub fn cap(
        &mut self,
        name: &str,
        limit: UnitValue,
        range: &YearMatcher,
        displace: Option<&str>,
    ) -> Result<(), EngineError> {
        self.apply_limit(name, limit, range, displace, true)
    }

    /// Raise the stream to the limit when it falls short, drawing the
    /// added volume out of the displacement target.
    pub fn floor(
        &mut self,
        name: &str,
        limit: UnitValue,
        range: &YearMatcher,
        displace: Option<&str>,
    ) -> Result<(), EngineError> {
        self.apply_limit(name, limit, range, displace, false)
    }

    /// Transfer an amount of a stream to the same stream of another
    /// substance in the current application.
    pub fn replace(
        &mut self,
        amount: UnitValue,
        name: &str,
        other_substance: &str,
        range: &YearMatcher,
    ) -> Result<(), EngineError> {
        if !range.matches(self.current_year) {
            return Ok(());
        }
        ensure_known_stream(name)?;
        if !is_sales_substream(name) {
            return Err(EngineError::UnknownStream(format!(
                "replace applies to sales streams, not '{}'",
                name
            )));
        }
        let key = self.current_key()?;
        let other = key.with_substance(other_substance);
        self.keeper.ensure(&key);
        self.keeper.ensure(&other);

        self.with_rollback(|engine| {
            let (kg_out, kg_in) = if amount.has_equipment_units() {
                let units = amount.value();
                let charge_src = rate_per_base(&engine.keeper.get_initial_charge(&key, name));
                let charge_dst = rate_per_base(&engine.keeper.get_initial_charge(&other, name));
                (units * charge_src, units * charge_dst)
            } else {
                let state = build_converter_state(&engine.keeper, &key)?;
                let kg = UnitConverter::convert(&amount, "kg", &state)?.value();
                (kg, kg)
            };

            info!(
                "replacing {} of {} from {} with {}",
                amount, name, key, other_substance
            );

            let source_value = engine.keeper.get_stream(&key, name)?.value();
            engine.write_sales_mass(&key, name, source_value - kg_out)?;
            engine.standard_pipeline().execute(&key, &mut engine.keeper)?;

            let dest_value = engine.keeper.get_stream(&other, name)?.value();
            engine.write_sales_mass(&other, name, dest_value + kg_in)?;
            engine.standard_pipeline().execute(&other, &mut engine.keeper)
        })
    }

    /// Set the per-year recharge parameters: population share of prior
    /// equipment and per-unit intensity.
    pub fn recharge(
        &mut self,
        population: UnitValue,
        intensity: UnitValue,
        range: &YearMatcher,
    ) -> Result<(), EngineError> {
        if !range.matches(self.current_year) {
            return Ok(());
        }
        let key = self.current_key()?;
        self.keeper.ensure(&key);

        self.with_rollback(|engine| {
            engine.keeper.set_recharge_population(&key, population.clone());
            engine.keeper.set_recharge_intensity(&key, intensity.clone());
            let pipeline = RecalcPipelineBuilder::new()
                .initial(RecalcStrategy::Sales {
                    preserve_unit_spec: Some(true),
                })
                .then(RecalcStrategy::PopulationChange {
                    subtract_recharge: true,
                })
                .then(RecalcStrategy::RechargeEmissions)
                .then(RecalcStrategy::Consumption)
                .build();
            pipeline.execute(&key, &mut engine.keeper)
        })
    }

    /// Set recycling parameters: recovery rate, yield rate and the
    /// share of recycled material displacing virgin sales.
    pub fn recycle(
        &mut self,
        recovery: UnitValue,
        yield_rate: UnitValue,
        displacement: UnitValue,
        range: &YearMatcher,
    ) -> Result<(), EngineError> {
        if !range.matches(self.current_year) {
            return Ok(());
        }
        let key = self.current_key()?;
        self.keeper.ensure(&key);

        self.with_rollback(|engine| {
            engine.keeper.set_recovery_rate(&key, recovery.clone());
            engine.keeper.set_yield_rate(&key, yield_rate.clone());
            engine.keeper.set_displacement_rate(&key, displacement.clone());
            let pipeline = RecalcPipelineBuilder::new()
                .initial(RecalcStrategy::RechargeEmissions)
                .then(RecalcStrategy::Sales {
                    preserve_unit_spec: None,
                })
                .then(RecalcStrategy::PopulationChange {
                    subtract_recharge: true,
                })
                .then(RecalcStrategy::Consumption)
                .build();
            pipeline.execute(&key, &mut engine.keeper)
        })
    }

    /// Set the retirement rate and retire against prior equipment.
    pub fn retire(&mut self, rate: UnitValue, range: &YearMatcher) -> Result<(), EngineError> {
        if !range.matches(self.current_year) {
            return Ok(());
        }
        let key = self.current_key()?;
        self.keeper.ensure(&key);

        self.with_rollback(|engine| {
            engine.keeper.set_retirement_rate(&key, rate.clone());
            let pipeline = RecalcPipelineBuilder::new()
                .initial(RecalcStrategy::Retire)
                .then(RecalcStrategy::EolEmissions)
                .then(RecalcStrategy::PopulationChange {
                    subtract_recharge: true,
                })
                .then(RecalcStrategy::RechargeEmissions)
                .then(RecalcStrategy::Sales {
                    preserve_unit_spec: None,
                })
                .then(RecalcStrategy::Consumption)
                .build();
            pipeline.execute(&key, &mut engine.keeper)
        })
    }

    /// Set the GHG or energy intensity of the scoped substance; the
    /// unit of the operand discriminates between the two.
    pub fn equals(&mut self, intensity: UnitValue, range: &YearMatcher) -> Result<(), EngineError> {
        if !range.matches(self.current_year) {
            return Ok(());
        }
        let key = self.current_key()?;
        self.keeper.ensure(&key);

        let numerator = parse_units(intensity.units()).numerator;
        let family = family_of(&numerator);
        self.with_rollback(|engine| {
            match family {
                Some(UnitFamily::Consumption) => {
                    engine.keeper.set_ghg_intensity(&key, intensity.clone())
                }
                Some(UnitFamily::Energy) => {
                    engine.keeper.set_energy_intensity(&key, intensity.clone())
                }
                _ => {
                    return Err(EngineError::IncompatibleUnits(format!(
                        "'{}' is neither a GHG nor an energy intensity",
                        intensity.units()
                    )))
                }
            }
            let pipeline = RecalcPipelineBuilder::new()
                .initial(RecalcStrategy::Consumption)
                .then(RecalcStrategy::RechargeEmissions)
                .then(RecalcStrategy::EolEmissions)
                .build();
            pipeline.execute(&key, &mut engine.keeper)
        })
    }

    /// Record the initial charge for a sales stream.
    pub fn set_initial_charge(
        &mut self,
        value: UnitValue,
        name: &str,
        range: &YearMatcher,
    ) -> Result<(), EngineError> {
        if !range.matches(self.current_year) {
            return Ok(());
        }
        if !is_sales_substream(name) && name != STREAM_SALES {
            return Err(EngineError::UnknownStream(format!(
                "initial charge applies to sales streams, not '{}'",
                name
            )));
        }
        let key = self.current_key()?;
        self.keeper.ensure(&key);

        self.with_rollback(|engine| {
            engine.keeper.set_initial_charge(&key, name, value.clone());
            let pipeline = RecalcPipelineBuilder::new()
                .initial(RecalcStrategy::Sales {
                    preserve_unit_spec: Some(true),
                })
                .then(RecalcStrategy::PopulationChange {
                    subtract_recharge: true,
                })
                .then(RecalcStrategy::RechargeEmissions)
                .then(RecalcStrategy::Consumption)
                .build();
            pipeline.execute(&key, &mut engine.keeper)
        })
    }

    /// Advance the year cursor: equipment becomes prior equipment and
    /// per-year accumulators reset. The only temporal mutation.
    pub fn increment_year(&mut self) {
        self.keeper.roll_over_year();
        self.current_year += 1;
        info!("advanced to year {}", self.current_year);
    }

    // ------------------------------------------------------------------
    // Verb internals
    // ------------------------------------------------------------------

    /// Run a mutation atomically: on any error the keeper is restored
    /// to its pre-verb state before the error is surfaced.
    fn with_rollback<F>(&mut self, mutate: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut Self) -> Result<(), EngineError>,
    {
        let snapshot = self.keeper.clone();
        let result = mutate(self);
        if result.is_err() {
            self.keeper = snapshot;
        }
        result
    }

    fn apply_set_stream(
        &mut self,
        key: &StreamKey,
        name: &str,
        value: &UnitValue,
    ) -> Result<(), EngineError> {
        match name {
            _ if is_sales_substream(name) => self.set_sales_substream(key, name, value),
            STREAM_SALES => self.set_sales_total(key, value),
            STREAM_EQUIPMENT => self.set_equipment_target(key, value),
            STREAM_PRIOR_EQUIPMENT => {
                let units = self.to_units(key, value)?;
                self.keeper
                    .set_stream(key, name, UnitValue::new(units, "units"))?;
                self.standard_pipeline().execute(key, &mut self.keeper)
            }
            STREAM_CONSUMPTION => {
                let tco2e = self.to_simple_base(value, UnitFamily::Consumption, key)?;
                let ghg = rate_per_base(&self.keeper.get_ghg_intensity(key));
                let sales_kg = safe_div(tco2e, ghg);
                self.distribute_sales_total(key, sales_kg, value)
            }
            STREAM_ENERGY => {
                let kwh = self.to_simple_base(value, UnitFamily::Energy, key)?;
                let intensity = rate_per_base(&self.keeper.get_energy_intensity(key));
                let sales_kg = safe_div(kwh, intensity);
                self.distribute_sales_total(key, sales_kg, value)
            }
            STREAM_RECYCLE => {
                let kg = self.to_simple_base(value, UnitFamily::Mass, key)?;
                self.keeper.set_stream(key, name, UnitValue::new(kg, "kg"))?;
                RecalcPipelineBuilder::new()
                    .initial(RecalcStrategy::Consumption)
                    .build()
                    .execute(key, &mut self.keeper)
            }
            _ => {
                // Emission and bookkeeping streams accept direct writes
                let state = build_converter_state(&self.keeper, key)?;
                let natural = crate::engine::models::stream_base_units(name);
                let converted = UnitConverter::convert(value, natural, &state)?;
                self.keeper.set_stream(key, name, converted)
            }
        }
    }

    fn set_sales_substream(
        &mut self,
        key: &StreamKey,
        name: &str,
        value: &UnitValue,
    ) -> Result<(), EngineError> {
        self.keeper.mark_enabled(key, name);
        self.keeper.set_last_specified(key, name, value.clone());
        self.keeper.set_sales_intent(key);

        if value.has_equipment_units() {
            // Units of new equipment: the stream carries the charge
            // volume now and the sales recalc folds the recharge
            // demand back in as implicit recharge. The conversion runs
            // with the amortized charge pinned to this stream's own
            // initial charge.
            let mut state = build_converter_state(&self.keeper, key)?;
            state.set_amortized_unit_volume_override(self.keeper.get_initial_charge(key, name));
            let kg_new = UnitConverter::convert(value, "kg", &state)?.value();
            state.clear_amortized_unit_volume_override();
            self.keeper
                .set_stream(key, name, UnitValue::new(kg_new, "kg"))?;

            let pipeline = RecalcPipelineBuilder::new()
                .initial(RecalcStrategy::PopulationChange {
                    subtract_recharge: false,
                })
                .then(RecalcStrategy::RechargeEmissions)
                .then(RecalcStrategy::Sales {
                    preserve_unit_spec: Some(true),
                })
                .then(RecalcStrategy::Consumption)
                .build();
            return pipeline.execute(key, &mut self.keeper);
        }

        let kg = self.to_simple_base(value, UnitFamily::Mass, key)?;
        self.write_sales_mass(key, name, kg)?;
        debug!("set {} {} to {} kg", key, name, kg);

        let pipeline = RecalcPipelineBuilder::new()
            .initial(RecalcStrategy::Sales {
                preserve_unit_spec: None,
            })
            .then(RecalcStrategy::PopulationChange {
                subtract_recharge: true,
            })
            .then(RecalcStrategy::RechargeEmissions)
            .then(RecalcStrategy::Consumption)
            .build();
        pipeline.execute(key, &mut self.keeper)
    }

    /// Write a kg value into a sales sub-stream, keeping the
    /// last-specified record in mass so later recalcs treat it as
    /// authoritative.
    fn write_sales_mass(
        &mut self,
        key: &StreamKey,
        name: &str,
        kg: Decimal,
    ) -> Result<(), EngineError> {
        let value = UnitValue::new(kg, "kg");
        self.keeper.mark_enabled(key, name);
        self.keeper.set_last_specified(key, name, value.clone());
        self.keeper.set_sales_intent(key);
        self.keeper.set_stream(key, name, value)
    }

    fn set_sales_total(&mut self, key: &StreamKey, value: &UnitValue) -> Result<(), EngineError> {
        let total_kg = if value.has_equipment_units() {
            let charge = rate_per_base(&self.keeper.amortized_initial_charge(key));
            value.value() * charge + recharge_volume_kg(&self.keeper, key)?
        } else {
            self.to_simple_base(value, UnitFamily::Mass, key)?
        };
        self.distribute_sales_total(key, total_kg, value)
    }

    /// Distribute a total sales target over the enabled sub-streams.
    fn distribute_sales_total(
        &mut self,
        key: &StreamKey,
        total_kg: Decimal,
        specified: &UnitValue,
    ) -> Result<(), EngineError> {
        let distribution = self.keeper.get_distribution(key, false);
        self.keeper
            .set_last_specified(key, STREAM_SALES, specified.clone());

        for stream in [
            crate::engine::models::STREAM_MANUFACTURE,
            crate::engine::models::STREAM_IMPORT,
        ] {
            let share = distribution.pct_for(stream);
            if share.is_zero() && !self.keeper.is_enabled(key, stream) {
                continue;
            }
            self.write_sales_mass(key, stream, total_kg * share)?;
        }

        self.standard_pipeline().execute(key, &mut self.keeper)
    }

    fn set_equipment_target(
        &mut self,
        key: &StreamKey,
        value: &UnitValue,
    ) -> Result<(), EngineError> {
        let target = self.to_units(key, value)?;
        let prior = self.keeper.get_stream(key, STREAM_PRIOR_EQUIPMENT)?.value();
        let new_units = clamp_non_negative(target - prior);

        self.keeper.set_stream(
            key,
            STREAM_EQUIPMENT,
            UnitValue::new(clamp_non_negative(target), "units"),
        )?;
        self.keeper
            .set_stream(key, STREAM_NEW_EQUIPMENT, UnitValue::new(new_units, "units"))?;

        // Sales are now derived from the population target
        self.keeper.reset_sales_intent_flag(key);

        let pipeline = RecalcPipelineBuilder::new()
            .initial(RecalcStrategy::Sales {
                preserve_unit_spec: None,
            })
            .then(RecalcStrategy::RechargeEmissions)
            .then(RecalcStrategy::Consumption)
            .build();
        pipeline.execute(key, &mut self.keeper)
    }

    fn apply_limit(
        &mut self,
        name: &str,
        limit: UnitValue,
        range: &YearMatcher,
        displace: Option<&str>,
        is_cap: bool,
    ) -> Result<(), EngineError> {
        if !range.matches(self.current_year) {
            return Ok(());
        }
        ensure_known_stream(name)?;
        if !is_sales_substream(name) && name != STREAM_EQUIPMENT {
            return Err(EngineError::UnknownStream(format!(
                "cap and floor apply to sales streams or equipment, not '{}'",
                name
            )));
        }
        let key = self.current_key()?;
        self.keeper.ensure(&key);

        self.with_rollback(|engine| {
            let unit_based = limit.has_equipment_units();

            if name == STREAM_EQUIPMENT {
                let current = engine.keeper.get_stream(&key, name)?.value();
                let limit_units = engine.to_units(&key, &limit)?;
                let exceeded = if is_cap {
                    current > limit_units
                } else {
                    current < limit_units
                };
                if !exceeded {
                    return Ok(());
                }
                return engine.set_equipment_target(&key, &UnitValue::new(limit_units, "units"));
            }

            let current_kg = engine.keeper.get_stream(&key, name)?.value();
            let limit_kg = if unit_based {
                // Equipment-valued limits account for the recharge the
                // stream would carry on top of the new-equipment charge
                let charge = rate_per_base(&engine.keeper.get_initial_charge(&key, name));
                let recharge = recharge_volume_kg(&engine.keeper, &key)?;
                let share = engine.keeper.get_distribution(&key, false).pct_for(name);
                limit.value() * charge + recharge * share
            } else if limit.is_percentage() {
                current_kg * limit.value() / Decimal::ONE_HUNDRED
            } else {
                engine.to_simple_base(&limit, UnitFamily::Mass, &key)?
            };

            let delta_kg = if is_cap {
                current_kg - limit_kg
            } else {
                limit_kg - current_kg
            };
            if delta_kg <= Decimal::ZERO {
                return Ok(());
            }

            info!(
                "{} {} {} at {}: moving {} kg",
                if is_cap { "capping" } else { "flooring" },
                key,
                name,
                limit,
                delta_kg
            );

            engine.write_sales_mass(&key, name, limit_kg)?;
            engine.standard_pipeline().execute(&key, &mut engine.keeper)?;

            let Some(target) = displace else {
                return Ok(());
            };
            // Positive when volume leaves this stream for the target
            let signed = if is_cap { delta_kg } else { -delta_kg };
            engine.displace(&key, name, target, signed, unit_based)
        })
    }

    /// Route displaced volume into another stream of this substance or
    /// the same stream of another substance.
    fn displace(
        &mut self,
        key: &StreamKey,
        name: &str,
        target: &str,
        amount_kg: Decimal,
        unit_based: bool,
    ) -> Result<(), EngineError> {
        if is_known_stream(target) {
            if !is_sales_substream(target) {
                return Err(EngineError::UnknownStream(format!(
                    "displacement target '{}' is not a sales stream",
                    target
                )));
            }
            let current = self.keeper.get_stream(key, target)?.value();
            self.write_sales_mass(key, target, current + amount_kg)?;
            return self.standard_pipeline().execute(key, &mut self.keeper);
        }

        // Substance displacement: converted through per-unit charges
        // when the limit was expressed in equipment units
        let other = key.with_substance(target);
        self.keeper.ensure(&other);
        let amount_dest_kg = if unit_based {
            let charge_src = rate_per_base(&self.keeper.get_initial_charge(key, name));
            let charge_dst = rate_per_base(&self.keeper.get_initial_charge(&other, name));
            safe_div(amount_kg, charge_src) * charge_dst
        } else {
            amount_kg
        };

        let current = self.keeper.get_stream(&other, name)?.value();
        self.write_sales_mass(&other, name, current + amount_dest_kg)?;
        self.standard_pipeline().execute(&other, &mut self.keeper)
    }

    /// The default propagate pipeline after a direct stream mutation.
    fn standard_pipeline(&self) -> RecalcPipeline {
        RecalcPipelineBuilder::new()
            .initial(RecalcStrategy::PopulationChange {
                subtract_recharge: true,
            })
            .then(RecalcStrategy::RechargeEmissions)
            .then(RecalcStrategy::Consumption)
            .build()
    }

    /// Convert an operand into equipment units under the live state.
    fn to_units(&self, key: &StreamKey, value: &UnitValue) -> Result<Decimal, EngineError> {
        if value.has_equipment_units() {
            return Ok(value.value());
        }
        let state = build_converter_state(&self.keeper, key)?;
        Ok(UnitConverter::convert(value, "units", &state)?.value())
    }

    /// Convert an operand into the base unit of a family, accepting
    /// static in-family scaling and percentage-of-ambient values.
    fn to_simple_base(
        &self,
        value: &UnitValue,
        family: UnitFamily,
        key: &StreamKey,
    ) -> Result<Decimal, EngineError> {
        if value.family() == Some(family) {
            let scale =
                base_scale(&parse_units(value.units()).numerator).unwrap_or(Decimal::ONE);
            return Ok(value.value() * scale);
        }
        let dest = crate::units::models::base_unit(family).ok_or_else(|| {
            EngineError::UnsupportedConversion(value.units().to_string(), format!("{:?}", family))
        })?;
        let state = build_converter_state(&self.keeper, key)?;
        Ok(UnitConverter::convert(value, dest, &state)?.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kg(value: i64) -> UnitValue {
        UnitValue::new(Decimal::from(value), "kg")
    }

    fn units(value: i64) -> UnitValue {
        UnitValue::new(Decimal::from(value), "units")
    }

    fn pct(value: i64) -> UnitValue {
        UnitValue::new(Decimal::from(value), "%")
    }

    fn per_unit(value: i64) -> UnitValue {
        UnitValue::new(Decimal::from(value), "kg / unit")
    }

    fn scoped_engine() -> Engine {
        let mut engine = Engine::new(1, 3);
        engine.set_stanza("policy");
        engine.set_application("Domestic Refrigeration");
        engine.set_substance("HFC-134a");
        engine
    }

    #[test]
    fn test_verb_requires_scope() {
        let mut engine = Engine::new(1, 3);
        let result = engine.set_stream("manufacture", kg(10), &YearMatcher::unbounded());
        assert!(matches!(
            result,
            Err(EngineError::NoApplicationOrSubstance(_))
        ));
    }

    #[test]
    fn test_unknown_stream_rejected() {
        let mut engine = scoped_engine();
        let result = engine.set_stream("bogus", kg(10), &YearMatcher::unbounded());
        assert!(matches!(result, Err(EngineError::UnknownStream(_))));
    }

    #[test]
    fn test_out_of_range_verb_is_noop() {
        let mut engine = scoped_engine();
        engine
            .set_stream("manufacture", kg(10), &YearMatcher::new(Some(2), Some(3)))
            .unwrap();
        assert_eq!(
            engine.get_stream("manufacture").unwrap().value(),
            Decimal::ZERO
        );
    }

    #[test]
    fn test_set_stream_in_units_applies_initial_charge() {
        let mut engine = scoped_engine();
        engine
            .set_initial_charge(per_unit(123), "sales", &YearMatcher::unbounded())
            .unwrap();
        engine
            .equals(UnitValue::new(Decimal::ONE, "tCO2e / kg"), &YearMatcher::unbounded())
            .unwrap();
        engine
            .set_stream("manufacture", units(2), &YearMatcher::unbounded())
            .unwrap();

        assert_eq!(
            engine.get_stream("manufacture").unwrap().value(),
            Decimal::from(246)
        );
        assert_eq!(
            engine.get_stream("equipment").unwrap().value(),
            Decimal::from(2)
        );
        assert_eq!(
            engine.get_stream("consumption").unwrap().value(),
            Decimal::from(246)
        );
    }

    #[test]
    fn test_change_stream_percentage() {
        let mut engine = scoped_engine();
        engine
            .set_stream("manufacture", kg(100), &YearMatcher::unbounded())
            .unwrap();
        engine
            .change_stream(
                "manufacture",
                UnitValue::new(Decimal::from(5), "% / year"),
                &YearMatcher::unbounded(),
            )
            .unwrap();
        assert_eq!(
            engine.get_stream("manufacture").unwrap().value(),
            Decimal::from(105)
        );
    }

    #[test]
    fn test_change_stream_additive() {
        let mut engine = scoped_engine();
        engine
            .set_stream("import", kg(100), &YearMatcher::unbounded())
            .unwrap();
        engine
            .change_stream(
                "import",
                UnitValue::new(Decimal::from(-2), "mt"),
                &YearMatcher::unbounded(),
            )
            .unwrap();
        assert_eq!(
            engine.get_stream("import").unwrap().value(),
            Decimal::from(-1900)
        );
    }

    #[test]
    fn test_equals_discriminates_by_unit() {
        let mut engine = scoped_engine();
        engine
            .equals(UnitValue::new(Decimal::from(2), "tCO2e / kg"), &YearMatcher::unbounded())
            .unwrap();
        engine
            .equals(UnitValue::new(Decimal::from(3), "kwh / kg"), &YearMatcher::unbounded())
            .unwrap();
        engine
            .set_stream("manufacture", kg(10), &YearMatcher::unbounded())
            .unwrap();

        assert_eq!(
            engine.get_stream("consumption").unwrap().value(),
            Decimal::from(20)
        );
        assert_eq!(
            engine.get_stream("energy").unwrap().value(),
            Decimal::from(30)
        );

        let bad = engine.equals(
            UnitValue::new(Decimal::from(3), "kg / unit"),
            &YearMatcher::unbounded(),
        );
        assert!(matches!(bad, Err(EngineError::IncompatibleUnits(_))));
    }

    #[test]
    fn test_failed_verb_rolls_back_state() {
        let mut engine = scoped_engine();
        engine
            .set_stream("manufacture", kg(100), &YearMatcher::unbounded())
            .unwrap();

        // A displacement target outside the sales streams fails after
        // the cap already trimmed the stream; the trim must not survive
        let result = engine.cap(
            "manufacture",
            kg(50),
            &YearMatcher::unbounded(),
            Some("rechargeEmissions"),
        );
        assert!(result.is_err());
        assert_eq!(
            engine.get_stream("manufacture").unwrap().value(),
            Decimal::from(100)
        );
    }

    #[test]
    fn test_cap_without_displacement() {
        let mut engine = scoped_engine();
        engine
            .set_stream("manufacture", kg(100), &YearMatcher::unbounded())
            .unwrap();
        engine
            .cap("manufacture", kg(60), &YearMatcher::unbounded(), None)
            .unwrap();
        assert_eq!(
            engine.get_stream("manufacture").unwrap().value(),
            Decimal::from(60)
        );

        // Below the cap nothing changes
        engine
            .cap("manufacture", kg(80), &YearMatcher::unbounded(), None)
            .unwrap();
        assert_eq!(
            engine.get_stream("manufacture").unwrap().value(),
            Decimal::from(60)
        );
    }

    #[test]
    fn test_floor_raises_to_limit() {
        let mut engine = scoped_engine();
        engine
            .set_stream("manufacture", kg(40), &YearMatcher::unbounded())
            .unwrap();
        engine
            .floor("manufacture", kg(60), &YearMatcher::unbounded(), None)
            .unwrap();
        assert_eq!(
            engine.get_stream("manufacture").unwrap().value(),
            Decimal::from(60)
        );
    }

    #[test]
    fn test_cap_displaces_to_stream() {
        let mut engine = scoped_engine();
        engine
            .set_stream("manufacture", kg(100), &YearMatcher::unbounded())
            .unwrap();
        engine
            .set_stream("import", kg(50), &YearMatcher::unbounded())
            .unwrap();
        engine
            .cap(
                "manufacture",
                kg(70),
                &YearMatcher::unbounded(),
                Some("import"),
            )
            .unwrap();

        assert_eq!(
            engine.get_stream("manufacture").unwrap().value(),
            Decimal::from(70)
        );
        assert_eq!(
            engine.get_stream("import").unwrap().value(),
            Decimal::from(80)
        );
        // Total sales preserved
        assert_eq!(
            engine.get_stream("sales").unwrap().value(),
            Decimal::from(150)
        );
    }

    #[test]
    fn test_increment_year_rolls_over() {
        let mut engine = scoped_engine();
        engine
            .set_initial_charge(per_unit(1), "sales", &YearMatcher::unbounded())
            .unwrap();
        engine
            .set_stream("manufacture", kg(10), &YearMatcher::unbounded())
            .unwrap();
        assert_eq!(engine.year(), 1);

        engine.increment_year();
        assert_eq!(engine.year(), 2);
        assert_eq!(
            engine.get_stream("priorEquipment").unwrap().value(),
            Decimal::from(10)
        );
        assert!(!engine.is_done());

        engine.increment_year();
        engine.increment_year();
        assert!(engine.is_done());
    }

    #[test]
    fn test_reversed_simulation_window_normalizes() {
        let engine = Engine::new(5, 1);
        assert_eq!(engine.start_year(), 1);
        assert_eq!(engine.end_year(), 5);
    }
}
