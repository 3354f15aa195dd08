use rust_decimal::Decimal;
use thiserror::Error;

/// Closed error set surfaced at every verb boundary.
///
/// Division by zero inside unit conversion is deliberately absent: a zero
/// divisor yields a zero result so that empty populations or zero
/// intensities do not abort a scenario.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("No application or substance in scope: {0}")]
    NoApplicationOrSubstance(String),

    #[error("Unsupported conversion from '{0}' to '{1}'")]
    UnsupportedConversion(String, String),

    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    #[error("Invalid year range: {0}")]
    InvalidYearRange(String),

    #[error("Incompatible units: {0}")]
    IncompatibleUnits(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(String),
}

impl EngineError {
    /// Machine-readable kind name used by the transport status line.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NoApplicationOrSubstance(_) => "NoApplicationOrSubstance",
            EngineError::UnsupportedConversion(_, _) => "UnsupportedConversion",
            EngineError::UnknownStream(_) => "UnknownStream",
            EngineError::InvalidYearRange(_) => "InvalidYearRange",
            EngineError::IncompatibleUnits(_) => "IncompatibleUnits",
            EngineError::MissingParameter(_) => "MissingParameter",
        }
    }

}

/// Division that treats a zero divisor as a zero result.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator.is_zero() {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Percentage magnitude to a plain fraction (50 -> 0.5).
pub fn pct_to_fraction(pct: Decimal) -> Decimal {
    pct / Decimal::ONE_HUNDRED
}

/// Clamp a decimal at zero from below. Equipment counts and per-year
/// accumulators must never go negative.
pub fn clamp_non_negative(value: Decimal) -> Decimal {
    if value < Decimal::ZERO {
        Decimal::ZERO
    } else {
        value
    }
}

pub fn validate_application_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::NoApplicationOrSubstance(
            "Application name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_substance_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::NoApplicationOrSubstance(
            "Substance name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_div_zero_denominator() {
        assert_eq!(safe_div(Decimal::from(10), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_safe_div_normal() {
        assert_eq!(safe_div(Decimal::from(10), Decimal::from(4)), Decimal::new(25, 1));
    }

    #[test]
    fn test_pct_to_fraction() {
        assert_eq!(pct_to_fraction(Decimal::from(50)), Decimal::new(5, 1));
    }

    #[test]
    fn test_clamp_non_negative() {
        assert_eq!(clamp_non_negative(Decimal::from(-3)), Decimal::ZERO);
        assert_eq!(clamp_non_negative(Decimal::from(3)), Decimal::from(3));
    }

    #[test]
    fn test_error_kind_names() {
        let err = EngineError::UnknownStream("bogus".to_string());
        assert_eq!(err.kind(), "UnknownStream");
        assert_eq!(err.to_string(), "Unknown stream: bogus");
    }
}
