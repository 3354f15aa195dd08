use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::utils::EngineError;

// ======================================================================
// UNIT VOCABULARY
// ======================================================================

/// Dimension families of the closed unit vocabulary. Composite
/// "X / Y" forms are a family of their own; their numerator and
/// denominator tokens classify individually via [`family_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitFamily {
    Mass,
    Equipment,
    Consumption,
    Energy,
    Time,
    Ratio,
    Composite,
}

/// Units string decomposed into numerator and optional denominator
/// (e.g. "kg / unit" -> numerator "kg", denominator "unit").
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUnits {
    pub numerator: String,
    pub denominator: Option<String>,
}

impl ParsedUnits {
    pub fn is_composite(&self) -> bool {
        self.denominator.is_some()
    }
}

/// Split a units string on '/'. Whitespace around the slash is not
/// significant: "kg / unit" and "kg/unit" parse identically.
pub fn parse_units(units: &str) -> ParsedUnits {
    match units.split_once('/') {
        Some((num, den)) => ParsedUnits {
            numerator: num.trim().to_string(),
            denominator: Some(den.trim().to_string()),
        },
        None => ParsedUnits {
            numerator: units.trim().to_string(),
            denominator: None,
        },
    }
}

/// Family of a simple (non-composite) unit token.
pub fn family_of(token: &str) -> Option<UnitFamily> {
    match token {
        "kg" | "mt" => Some(UnitFamily::Mass),
        "unit" | "units" => Some(UnitFamily::Equipment),
        "tCO2e" | "MtCO2e" => Some(UnitFamily::Consumption),
        "kwh" | "mwh" => Some(UnitFamily::Energy),
        "year" | "years" => Some(UnitFamily::Time),
        "%" => Some(UnitFamily::Ratio),
        _ => None,
    }
}

/// Family of a full units string: "X / Y" forms classify as Composite,
/// everything else by its token.
pub fn unit_family(units: &str) -> Option<UnitFamily> {
    let parsed = parse_units(units);
    if parsed.is_composite() {
        return Some(UnitFamily::Composite);
    }
    family_of(&parsed.numerator)
}

/// Scale from a token to its family base unit (kg, unit, tCO2e, kwh, year).
pub fn base_scale(token: &str) -> Option<Decimal> {
    match token {
        "kg" | "unit" | "units" | "tCO2e" | "kwh" | "year" | "years" | "%" => Some(Decimal::ONE),
        "mt" | "mwh" => Some(Decimal::from(1000)),
        "MtCO2e" => Some(Decimal::from(1_000_000)),
        _ => None,
    }
}

/// Base unit token for a family, used when materializing converted
/// values. Composite forms have no single base token.
pub fn base_unit(family: UnitFamily) -> Option<&'static str> {
    match family {
        UnitFamily::Mass => Some("kg"),
        UnitFamily::Equipment => Some("units"),
        UnitFamily::Consumption => Some("tCO2e"),
        UnitFamily::Energy => Some("kwh"),
        UnitFamily::Time => Some("years"),
        UnitFamily::Ratio => Some("%"),
        UnitFamily::Composite => None,
    }
}

/// Two simple tokens name the same unit once pluralization is ignored.
pub fn same_unit_token(a: &str, b: &str) -> bool {
    fn canon(t: &str) -> &str {
        match t {
            "unit" => "units",
            "year" => "years",
            other => other,
        }
    }
    canon(a) == canon(b)
}

// ======================================================================
// VALUE WITH UNITS
// ======================================================================

/// A numeric magnitude paired with a unit string from the closed
/// vocabulary. Magnitudes are exact decimals; unknown unit strings are
/// data until the value is combined or converted, at which point the
/// converter rejects them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitValue {
    value: Decimal,
    units: String,
}

impl UnitValue {
    pub fn new(value: Decimal, units: &str) -> Self {
        Self {
            value,
            units: units.trim().to_string(),
        }
    }

    pub fn zero(units: &str) -> Self {
        Self::new(Decimal::ZERO, units)
    }

    pub fn value(&self) -> Decimal {
        self.value
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    pub fn parsed(&self) -> ParsedUnits {
        parse_units(&self.units)
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// Family of this value's units; composite forms classify as
    /// [`UnitFamily::Composite`].
    pub fn family(&self) -> Option<UnitFamily> {
        unit_family(&self.units)
    }

    /// True when the magnitude counts equipment ("unit" / "units").
    pub fn has_equipment_units(&self) -> bool {
        self.family() == Some(UnitFamily::Equipment)
    }

    /// True for plain percentages and percentage-per-year values.
    pub fn is_percentage(&self) -> bool {
        let parsed = self.parsed();
        family_of(&parsed.numerator) == Some(UnitFamily::Ratio)
    }

    /// True for "X / year" rate values.
    pub fn is_per_year(&self) -> bool {
        match self.parsed().denominator {
            Some(den) => family_of(&den) == Some(UnitFamily::Time),
            None => false,
        }
    }

    pub fn with_value(&self, value: Decimal) -> Self {
        Self::new(value, &self.units)
    }

    pub fn negate(&self) -> Self {
        Self::new(-self.value, &self.units)
    }

    /// Add another value, converting statically within the same family.
    /// Values whose units cannot be reconciled without ambient state are
    /// rejected; callers needing those go through the UnitConverter.
    pub fn add(&self, other: &UnitValue) -> Result<UnitValue, EngineError> {
        let other_value = reconcile(other, &self.units)?;
        Ok(Self::new(self.value + other_value, &self.units))
    }

    pub fn subtract(&self, other: &UnitValue) -> Result<UnitValue, EngineError> {
        let other_value = reconcile(other, &self.units)?;
        Ok(Self::new(self.value - other_value, &self.units))
    }
}

impl std::fmt::Display for UnitValue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {}", self.value.normalize(), self.units)
    }
}

/// Normalize a rate or intensity ("tCO2e / kg", "tCO2e / mt",
/// "kwh / kg", "kg / unit") to base-unit-per-base-unit magnitude.
pub fn rate_per_base(intensity: &UnitValue) -> Decimal {
    let parsed = intensity.parsed();
    let up = base_scale(&parsed.numerator).unwrap_or(Decimal::ONE);
    let down = parsed
        .denominator
        .as_deref()
        .and_then(base_scale)
        .unwrap_or(Decimal::ONE);
    intensity.value() * up / down
}

/// Express `other` in `target_units` using only static family ratios.
fn reconcile(other: &UnitValue, target_units: &str) -> Result<Decimal, EngineError> {
    if other.units() == target_units {
        return Ok(other.value());
    }

    let target = parse_units(target_units);
    let source = other.parsed();

    // Composite units must match token for token
    if target.is_composite() || source.is_composite() {
        let num_ok = same_unit_token(&target.numerator, &source.numerator);
        let den_ok = match (&target.denominator, &source.denominator) {
            (Some(a), Some(b)) => same_unit_token(a, b),
            (None, None) => true,
            _ => false,
        };
        if num_ok && den_ok {
            return Ok(other.value());
        }
        return Err(EngineError::IncompatibleUnits(format!(
            "cannot combine '{}' with '{}'",
            other.units(),
            target_units
        )));
    }

    let source_family = family_of(&source.numerator);
    let target_family = family_of(&target.numerator);
    match (source_family, target_family) {
        (Some(sf), Some(tf)) if sf == tf => {
            let up = base_scale(&source.numerator).unwrap_or(Decimal::ONE);
            let down = base_scale(&target.numerator).unwrap_or(Decimal::ONE);
            Ok(other.value() * up / down)
        }
        _ => Err(EngineError::IncompatibleUnits(format!(
            "cannot combine '{}' with '{}'",
            other.units(),
            target_units
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        let parsed = parse_units("kg");
        assert_eq!(parsed.numerator, "kg");
        assert_eq!(parsed.denominator, None);
        assert!(!parsed.is_composite());
    }

    #[test]
    fn test_parse_composite_units() {
        let parsed = parse_units("kg / unit");
        assert_eq!(parsed.numerator, "kg");
        assert_eq!(parsed.denominator, Some("unit".to_string()));
        assert!(parsed.is_composite());

        let tight = parse_units("tCO2e/mt");
        assert_eq!(tight.numerator, "tCO2e");
        assert_eq!(tight.denominator, Some("mt".to_string()));
    }

    #[test]
    fn test_family_classification() {
        assert_eq!(family_of("kg"), Some(UnitFamily::Mass));
        assert_eq!(family_of("mt"), Some(UnitFamily::Mass));
        assert_eq!(family_of("units"), Some(UnitFamily::Equipment));
        assert_eq!(family_of("tCO2e"), Some(UnitFamily::Consumption));
        assert_eq!(family_of("MtCO2e"), Some(UnitFamily::Consumption));
        assert_eq!(family_of("kwh"), Some(UnitFamily::Energy));
        assert_eq!(family_of("years"), Some(UnitFamily::Time));
        assert_eq!(family_of("%"), Some(UnitFamily::Ratio));
        assert_eq!(family_of("furlong"), None);
    }

    #[test]
    fn test_unit_family_classifies_composites() {
        assert_eq!(unit_family("kg"), Some(UnitFamily::Mass));
        assert_eq!(unit_family("kg / unit"), Some(UnitFamily::Composite));
        assert_eq!(unit_family("% / year"), Some(UnitFamily::Composite));
        assert_eq!(unit_family("tCO2e/mt"), Some(UnitFamily::Composite));
        assert_eq!(unit_family("furlong"), None);

        let charge = UnitValue::new(Decimal::from(10), "kg / unit");
        assert_eq!(charge.family(), Some(UnitFamily::Composite));
        assert_eq!(UnitValue::new(Decimal::ONE, "mt").family(), Some(UnitFamily::Mass));
    }

    #[test]
    fn test_base_unit_per_family() {
        assert_eq!(base_unit(UnitFamily::Mass), Some("kg"));
        assert_eq!(base_unit(UnitFamily::Consumption), Some("tCO2e"));
        assert_eq!(base_unit(UnitFamily::Composite), None);
    }

    #[test]
    fn test_negate_flips_sign_and_keeps_units() {
        let v = UnitValue::new(Decimal::from(25), "mt");
        let negated = v.negate();
        assert_eq!(negated.value(), Decimal::from(-25));
        assert_eq!(negated.units(), "mt");
        assert_eq!(negated.negate(), v);
    }

    #[test]
    fn test_equipment_and_percentage_detection() {
        assert!(UnitValue::new(Decimal::from(2), "units").has_equipment_units());
        assert!(UnitValue::new(Decimal::from(2), "unit").has_equipment_units());
        assert!(!UnitValue::new(Decimal::from(2), "kg").has_equipment_units());
        assert!(!UnitValue::new(Decimal::from(2), "kg / unit").has_equipment_units());

        assert!(UnitValue::new(Decimal::from(5), "%").is_percentage());
        assert!(UnitValue::new(Decimal::from(5), "% / year").is_percentage());
        assert!(UnitValue::new(Decimal::from(5), "% / year").is_per_year());
        assert!(UnitValue::new(Decimal::from(5), "kg / year").is_per_year());
        assert!(!UnitValue::new(Decimal::from(5), "kg").is_per_year());
    }

    #[test]
    fn test_add_same_units() {
        let a = UnitValue::new(Decimal::from(10), "kg");
        let b = UnitValue::new(Decimal::from(5), "kg");
        assert_eq!(a.add(&b).unwrap().value(), Decimal::from(15));
    }

    #[test]
    fn test_add_across_static_scale() {
        let a = UnitValue::new(Decimal::from(500), "kg");
        let b = UnitValue::new(Decimal::from(2), "mt");
        let sum = a.add(&b).unwrap();
        assert_eq!(sum.value(), Decimal::from(2500));
        assert_eq!(sum.units(), "kg");
    }

    #[test]
    fn test_add_incompatible_units_rejected() {
        let a = UnitValue::new(Decimal::from(10), "kg");
        let b = UnitValue::new(Decimal::from(5), "units");
        assert!(matches!(a.add(&b), Err(EngineError::IncompatibleUnits(_))));
    }

    #[test]
    fn test_subtract_composite_units() {
        let a = UnitValue::new(Decimal::from(10), "kg / unit");
        let b = UnitValue::new(Decimal::from(4), "kg / unit");
        assert_eq!(a.subtract(&b).unwrap().value(), Decimal::from(6));

        let c = UnitValue::new(Decimal::from(4), "tCO2e / unit");
        assert!(a.subtract(&c).is_err());
    }

    #[test]
    fn test_display_normalizes_scale() {
        let v = UnitValue::new(Decimal::from(100) - Decimal::new(300, 1), "kg");
        assert_eq!(v.to_string(), "70 kg");
    }
}
