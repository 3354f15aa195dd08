use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::units::UnitValue;
use crate::utils::EngineError;

// ======================================================================
// STREAM REGISTRY
// ======================================================================

pub const STREAM_MANUFACTURE: &str = "manufacture";
pub const STREAM_IMPORT: &str = "import";
pub const STREAM_EXPORT: &str = "export";
pub const STREAM_SALES: &str = "sales";
pub const STREAM_RECYCLE: &str = "recycle";
pub const STREAM_EQUIPMENT: &str = "equipment";
pub const STREAM_PRIOR_EQUIPMENT: &str = "priorEquipment";
pub const STREAM_NEW_EQUIPMENT: &str = "newEquipment";
pub const STREAM_CONSUMPTION: &str = "consumption";
pub const STREAM_ENERGY: &str = "energy";
pub const STREAM_RECHARGE_EMISSIONS: &str = "rechargeEmissions";
pub const STREAM_EOL_EMISSIONS: &str = "eolEmissions";
pub const STREAM_IMPLICIT_RECHARGE: &str = "implicitRecharge";

/// Every recognized stream name, in presentation order.
pub const ALL_STREAMS: &[&str] = &[
    STREAM_MANUFACTURE,
    STREAM_IMPORT,
    STREAM_EXPORT,
    STREAM_SALES,
    STREAM_RECYCLE,
    STREAM_EQUIPMENT,
    STREAM_PRIOR_EQUIPMENT,
    STREAM_NEW_EQUIPMENT,
    STREAM_CONSUMPTION,
    STREAM_ENERGY,
    STREAM_RECHARGE_EMISSIONS,
    STREAM_EOL_EMISSIONS,
    STREAM_IMPLICIT_RECHARGE,
];

/// The physical sales sub-streams the virtual "sales" stream unions.
pub const SALES_SUBSTREAMS: &[&str] = &[STREAM_MANUFACTURE, STREAM_IMPORT, STREAM_EXPORT];

/// Per-year accumulators zeroed at year rollover.
pub const PER_YEAR_STREAMS: &[&str] = &[
    STREAM_NEW_EQUIPMENT,
    STREAM_RECHARGE_EMISSIONS,
    STREAM_EOL_EMISSIONS,
    STREAM_IMPLICIT_RECHARGE,
    STREAM_RECYCLE,
];

pub fn is_known_stream(name: &str) -> bool {
    ALL_STREAMS.contains(&name)
}

pub fn is_sales_substream(name: &str) -> bool {
    SALES_SUBSTREAMS.contains(&name)
}

pub fn ensure_known_stream(name: &str) -> Result<(), EngineError> {
    if is_known_stream(name) {
        Ok(())
    } else {
        Err(EngineError::UnknownStream(name.to_string()))
    }
}

/// Natural storage unit for a stream.
pub fn stream_base_units(name: &str) -> &'static str {
    match name {
        STREAM_EQUIPMENT | STREAM_PRIOR_EQUIPMENT | STREAM_NEW_EQUIPMENT => "units",
        STREAM_CONSUMPTION | STREAM_RECHARGE_EMISSIONS | STREAM_EOL_EMISSIONS => "tCO2e",
        STREAM_ENERGY => "kwh",
        _ => "kg",
    }
}

// ======================================================================
// STREAM KEY
// ======================================================================

/// Identifies one (application, substance) pair. Applications and
/// substances are opaque labels; the engine never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub application: String,
    pub substance: String,
}

impl StreamKey {
    pub fn new(application: &str, substance: &str) -> Self {
        Self {
            application: application.to_string(),
            substance: substance.to_string(),
        }
    }

    pub fn with_substance(&self, substance: &str) -> Self {
        Self::new(&self.application, substance)
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} / {}", self.application, self.substance)
    }
}

// ======================================================================
// YEAR MATCHER
// ======================================================================

/// Inclusive year range guard. Either bound is optional; a reversed
/// range normalizes to the canonical ascending form on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearMatcher {
    pub min: Option<i32>,
    pub max: Option<i32>,
}

impl YearMatcher {
    pub fn new(min: Option<i32>, max: Option<i32>) -> Self {
        match (min, max) {
            (Some(a), Some(b)) if a > b => Self {
                min: Some(b),
                max: Some(a),
            },
            _ => Self { min, max },
        }
    }

    pub fn unbounded() -> Self {
        Self {
            min: None,
            max: None,
        }
    }

    pub fn single(year: i32) -> Self {
        Self {
            min: Some(year),
            max: Some(year),
        }
    }

    pub fn matches(&self, year: i32) -> bool {
        self.min.map_or(true, |m| year >= m) && self.max.map_or(true, |m| year <= m)
    }
}

impl Default for YearMatcher {
    fn default() -> Self {
        Self::unbounded()
    }
}

// ======================================================================
// SCOPE
// ======================================================================

/// Current (stanza, application, substance) pointer plus the nested
/// variable environment. Changing an outer level clears the inner
/// levels and their variable frames. Variables shadow by default and
/// read through to enclosing frames.
#[derive(Debug, Clone)]
pub struct Scope {
    stanza: Option<String>,
    application: Option<String>,
    substance: Option<String>,
    frames: [HashMap<String, UnitValue>; 4],
}

const LEVEL_ROOT: usize = 0;
const LEVEL_STANZA: usize = 1;
const LEVEL_APPLICATION: usize = 2;
const LEVEL_SUBSTANCE: usize = 3;

impl Scope {
    pub fn new() -> Self {
        Self {
            stanza: None,
            application: None,
            substance: None,
            frames: Default::default(),
        }
    }

    pub fn stanza(&self) -> Option<&str> {
        self.stanza.as_deref()
    }

    pub fn application(&self) -> Option<&str> {
        self.application.as_deref()
    }

    pub fn substance(&self) -> Option<&str> {
        self.substance.as_deref()
    }

    pub fn set_stanza(&mut self, name: &str) {
        self.stanza = Some(name.to_string());
        self.application = None;
        self.substance = None;
        for level in LEVEL_STANZA..=LEVEL_SUBSTANCE {
            self.frames[level].clear();
        }
    }

    pub fn set_application(&mut self, name: &str) {
        self.application = Some(name.to_string());
        self.substance = None;
        for level in LEVEL_APPLICATION..=LEVEL_SUBSTANCE {
            self.frames[level].clear();
        }
    }

    pub fn set_substance(&mut self, name: &str) {
        self.substance = Some(name.to_string());
        self.frames[LEVEL_SUBSTANCE].clear();
    }

    /// Key for the scoped (application, substance) pair, required by
    /// every stream-touching verb.
    pub fn key(&self) -> Result<StreamKey, EngineError> {
        match (&self.application, &self.substance) {
            (Some(app), Some(sub)) => Ok(StreamKey::new(app, sub)),
            _ => Err(EngineError::NoApplicationOrSubstance(
                "set application and substance before using streams".to_string(),
            )),
        }
    }

    fn current_level(&self) -> usize {
        if self.substance.is_some() {
            LEVEL_SUBSTANCE
        } else if self.application.is_some() {
            LEVEL_APPLICATION
        } else if self.stanza.is_some() {
            LEVEL_STANZA
        } else {
            LEVEL_ROOT
        }
    }

    /// Bind a variable in the current frame, shadowing any enclosing
    /// binding of the same name.
    pub fn set_variable(&mut self, name: &str, value: UnitValue) {
        let level = self.current_level();
        self.frames[level].insert(name.to_string(), value);
    }

    /// Read a variable, searching the current frame first and then the
    /// enclosing frames.
    pub fn get_variable(&self, name: &str) -> Option<&UnitValue> {
        let current = self.current_level();
        for level in (LEVEL_ROOT..=current).rev() {
            if let Some(value) = self.frames[level].get(name) {
                return Some(value);
            }
        }
        None
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn test_stream_registry() {
        assert!(is_known_stream("manufacture"));
        assert!(is_known_stream("priorEquipment"));
        assert!(!is_known_stream("bogus"));
        assert!(is_sales_substream("import"));
        assert!(!is_sales_substream("equipment"));
        assert_eq!(stream_base_units("equipment"), "units");
        assert_eq!(stream_base_units("consumption"), "tCO2e");
        assert_eq!(stream_base_units("manufacture"), "kg");
    }

    #[test]
    fn test_year_matcher_bounds() {
        let m = YearMatcher::new(Some(2), Some(4));
        assert!(!m.matches(1));
        assert!(m.matches(2));
        assert!(m.matches(4));
        assert!(!m.matches(5));

        let open_min = YearMatcher::new(None, Some(3));
        assert!(open_min.matches(-10));
        assert!(!open_min.matches(4));

        assert!(YearMatcher::unbounded().matches(1999));
    }

    #[test]
    fn test_year_matcher_normalizes_reversed_range() {
        let m = YearMatcher::new(Some(5), Some(2));
        assert_eq!(m.min, Some(2));
        assert_eq!(m.max, Some(5));
        assert!(m.matches(3));
    }

    #[test]
    fn test_scope_clearing_cascade() {
        let mut scope = Scope::new();
        scope.set_stanza("policy");
        scope.set_application("Domestic Refrigeration");
        scope.set_substance("HFC-134a");
        assert!(scope.key().is_ok());

        scope.set_application("Commercial Refrigeration");
        assert_eq!(scope.substance(), None);
        assert!(scope.key().is_err());

        scope.set_stanza("simulations");
        assert_eq!(scope.application(), None);
    }

    #[test]
    fn test_scope_requires_application_and_substance() {
        let mut scope = Scope::new();
        assert!(matches!(
            scope.key(),
            Err(EngineError::NoApplicationOrSubstance(_))
        ));
        scope.set_application("Domestic AC");
        assert!(scope.key().is_err());
        scope.set_substance("HFC-32");
        assert!(scope.key().is_ok());
    }

    #[test]
    fn test_variable_shadowing_and_read_through() {
        let mut scope = Scope::new();
        scope.set_stanza("policy");
        scope.set_variable("target", UnitValue::new(Decimal::from(10), "kg"));

        scope.set_application("Domestic Refrigeration");
        // Read-through to the stanza frame
        assert_eq!(
            scope.get_variable("target").unwrap().value(),
            Decimal::from(10)
        );

        // Shadow in the application frame
        scope.set_variable("target", UnitValue::new(Decimal::from(99), "kg"));
        assert_eq!(
            scope.get_variable("target").unwrap().value(),
            Decimal::from(99)
        );

        // Re-entering the application resets its frame
        scope.set_application("Domestic Refrigeration");
        assert_eq!(
            scope.get_variable("target").unwrap().value(),
            Decimal::from(10)
        );
    }
}
