use rust_decimal::Decimal;

use crate::units::models::UnitValue;

// ======================================================================
// AMBIENT CONVERSION STATE
// ======================================================================

/// Ambient quantities the unit converter draws on. Assembled by the
/// engine from live streams immediately before a conversion; all values
/// are expressed in family base units (units, kg, tCO2e, kwh, years).
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub population: UnitValue,
    pub volume: UnitValue,
    pub gas_consumption: UnitValue,
    pub energy_consumption: UnitValue,
    pub amortized_unit_volume: UnitValue,
    pub years_elapsed: UnitValue,
    pub population_change: UnitValue,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            population: UnitValue::zero("units"),
            volume: UnitValue::zero("kg"),
            gas_consumption: UnitValue::zero("tCO2e"),
            energy_consumption: UnitValue::zero("kwh"),
            amortized_unit_volume: UnitValue::zero("kg / unit"),
            years_elapsed: UnitValue::new(Decimal::ONE, "years"),
            population_change: UnitValue::zero("units"),
        }
    }
}

/// Per-attribute temporary overrides. At most one value per attribute;
/// setting again replaces, clearing restores the base.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateOverrides {
    pub population: Option<UnitValue>,
    pub volume: Option<UnitValue>,
    pub gas_consumption: Option<UnitValue>,
    pub energy_consumption: Option<UnitValue>,
    pub amortized_unit_volume: Option<UnitValue>,
    pub years_elapsed: Option<UnitValue>,
    pub population_change: Option<UnitValue>,
}

impl StateOverrides {
    pub fn is_empty(&self) -> bool {
        self.population.is_none()
            && self.volume.is_none()
            && self.gas_consumption.is_none()
            && self.energy_consumption.is_none()
            && self.amortized_unit_volume.is_none()
            && self.years_elapsed.is_none()
            && self.population_change.is_none()
    }
}

/// Read-only view over ambient quantities. The live variant exposes the
/// snapshot as assembled; the overriding variant decorates it with
/// scoped overrides (typical: population pinned to prior equipment while
/// recharge volume is computed, then cleared).
#[derive(Debug, Clone, PartialEq)]
pub enum ConverterState {
    Live(StateSnapshot),
    Overriding {
        base: StateSnapshot,
        overrides: StateOverrides,
    },
}

impl ConverterState {
    pub fn live(snapshot: StateSnapshot) -> Self {
        ConverterState::Live(snapshot)
    }

    pub fn overriding(base: StateSnapshot) -> Self {
        ConverterState::Overriding {
            base,
            overrides: StateOverrides::default(),
        }
    }

    fn base(&self) -> &StateSnapshot {
        match self {
            ConverterState::Live(snapshot) => snapshot,
            ConverterState::Overriding { base, .. } => base,
        }
    }

    fn overrides(&self) -> Option<&StateOverrides> {
        match self {
            ConverterState::Live(_) => None,
            ConverterState::Overriding { overrides, .. } => Some(overrides),
        }
    }

    fn overrides_mut(&mut self) -> &mut StateOverrides {
        if let ConverterState::Live(snapshot) = self {
            let base = snapshot.clone();
            *self = ConverterState::Overriding {
                base,
                overrides: StateOverrides::default(),
            };
        }
        match self {
            ConverterState::Overriding { overrides, .. } => overrides,
            ConverterState::Live(_) => unreachable!("state promoted above"),
        }
    }

    pub fn population(&self) -> UnitValue {
        self.overrides()
            .and_then(|o| o.population.clone())
            .unwrap_or_else(|| self.base().population.clone())
    }

    pub fn volume(&self) -> UnitValue {
        self.overrides()
            .and_then(|o| o.volume.clone())
            .unwrap_or_else(|| self.base().volume.clone())
    }

    pub fn gas_consumption(&self) -> UnitValue {
        self.overrides()
            .and_then(|o| o.gas_consumption.clone())
            .unwrap_or_else(|| self.base().gas_consumption.clone())
    }

    pub fn energy_consumption(&self) -> UnitValue {
        self.overrides()
            .and_then(|o| o.energy_consumption.clone())
            .unwrap_or_else(|| self.base().energy_consumption.clone())
    }

    pub fn amortized_unit_volume(&self) -> UnitValue {
        self.overrides()
            .and_then(|o| o.amortized_unit_volume.clone())
            .unwrap_or_else(|| self.base().amortized_unit_volume.clone())
    }

    pub fn years_elapsed(&self) -> UnitValue {
        self.overrides()
            .and_then(|o| o.years_elapsed.clone())
            .unwrap_or_else(|| self.base().years_elapsed.clone())
    }

    pub fn population_change(&self) -> UnitValue {
        self.overrides()
            .and_then(|o| o.population_change.clone())
            .unwrap_or_else(|| self.base().population_change.clone())
    }

    pub fn set_population_override(&mut self, value: UnitValue) {
        self.overrides_mut().population = Some(value);
    }

    pub fn clear_population_override(&mut self) {
        self.overrides_mut().population = None;
    }

    pub fn set_volume_override(&mut self, value: UnitValue) {
        self.overrides_mut().volume = Some(value);
    }

    pub fn clear_volume_override(&mut self) {
        self.overrides_mut().volume = None;
    }

    pub fn set_amortized_unit_volume_override(&mut self, value: UnitValue) {
        self.overrides_mut().amortized_unit_volume = Some(value);
    }

    pub fn clear_amortized_unit_volume_override(&mut self) {
        self.overrides_mut().amortized_unit_volume = None;
    }

    pub fn set_years_elapsed_override(&mut self, value: UnitValue) {
        self.overrides_mut().years_elapsed = Some(value);
    }

    pub fn clear_years_elapsed_override(&mut self) {
        self.overrides_mut().years_elapsed = None;
    }
}
