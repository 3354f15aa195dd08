use rust_decimal::Decimal;

use crate::units::models::{
    base_scale, family_of, parse_units, same_unit_token, UnitFamily, UnitValue,
};
use crate::units::state::ConverterState;
use crate::utils::{safe_div, EngineError};

// ======================================================================
// UNIT CONVERTER
// ======================================================================

/// Dimensional conversion between vocabulary units, drawing ambient
/// quantities (population, volume, consumption, elapsed years) from a
/// ConverterState. Pure given the state; holds no state of its own.
///
/// Division by a zero ambient quantity yields a zero result rather than
/// an error so that empty populations or zero intensities never abort a
/// scenario.
pub struct UnitConverter;

impl UnitConverter {
    pub fn convert(
        source: &UnitValue,
        dest_units: &str,
        state: &ConverterState,
    ) -> Result<UnitValue, EngineError> {
        let dest_units = dest_units.trim();
        if source.units() == dest_units {
            return Ok(UnitValue::new(source.value(), dest_units));
        }

        let src = parse_units(source.units());
        let dst = parse_units(dest_units);

        // Same-denominator composites convert numerator for numerator
        if let (Some(src_den), Some(dst_den)) = (&src.denominator, &dst.denominator) {
            if same_unit_token(src_den, dst_den) {
                let numerator = UnitValue::new(source.value(), &src.numerator);
                let converted = Self::convert(&numerator, &dst.numerator, state)?;
                return Ok(UnitValue::new(converted.value(), dest_units));
            }
        }

        // "X / Y" -> strip the denominator by multiplying with the
        // ambient quantity measured in Y, then continue with plain X
        if let Some(den) = &src.denominator {
            let ambient = ambient_in_token(den, state, source.units(), dest_units)?;
            let stripped = UnitValue::new(source.value() * ambient, &src.numerator);
            return Self::convert(&stripped, dest_units, state);
        }

        // X -> "Y / Z": convert to Y, then normalize by ambient Z
        if let Some(den) = &dst.denominator {
            let numerator = Self::convert(source, &dst.numerator, state)?;
            let ambient = ambient_in_token(den, state, source.units(), dest_units)?;
            return Ok(UnitValue::new(safe_div(numerator.value(), ambient), dest_units));
        }

        convert_simple(source, dest_units, state)
    }
}

/// Simple-token to simple-token conversion.
fn convert_simple(
    source: &UnitValue,
    dest_token: &str,
    state: &ConverterState,
) -> Result<UnitValue, EngineError> {
    let src_token = source.units();
    let unsupported =
        || EngineError::UnsupportedConversion(src_token.to_string(), dest_token.to_string());

    let src_family = family_of(src_token).ok_or_else(unsupported)?;
    let dst_family = family_of(dest_token).ok_or_else(unsupported)?;

    // Static ratio within a family (kg<->mt, kwh<->mwh, tCO2e<->MtCO2e)
    if src_family == dst_family {
        let up = base_scale(src_token).ok_or_else(unsupported)?;
        let down = base_scale(dest_token).ok_or_else(unsupported)?;
        return Ok(UnitValue::new(source.value() * up / down, dest_token));
    }

    // Percentage of the ambient total for the destination family
    if src_family == UnitFamily::Ratio {
        let total = ambient_total(dst_family, state).ok_or_else(unsupported)?;
        let base = source.value() / Decimal::ONE_HUNDRED * total;
        return scale_from_base(base, dest_token, unsupported);
    }

    // Share of the ambient total for the source family
    if dst_family == UnitFamily::Ratio {
        let total = ambient_total(src_family, state).ok_or_else(unsupported)?;
        let in_base = to_base(source, unsupported)?;
        return Ok(UnitValue::new(
            safe_div(in_base, total) * Decimal::ONE_HUNDRED,
            dest_token,
        ));
    }

    // Years required to reach the source amount at the ambient rate
    if dst_family == UnitFamily::Time {
        let rate = match src_family {
            UnitFamily::Equipment => state.population_change().value(),
            UnitFamily::Mass => state.volume().value(),
            UnitFamily::Consumption => state.gas_consumption().value(),
            _ => return Err(unsupported()),
        };
        let in_base = to_base(source, unsupported)?;
        return scale_from_base(safe_div(in_base, rate), dest_token, unsupported);
    }

    if src_family == UnitFamily::Time {
        return Err(unsupported());
    }

    // Cross-dimension conversion pivots through mass
    let kg = to_mass_kg(source.value(), src_token, src_family, state, &unsupported)?;
    let base = from_mass_kg(kg, dst_family, state).ok_or_else(unsupported)?;
    scale_from_base(base, dest_token, unsupported)
}

/// Source magnitude in its family base unit.
fn to_base(
    source: &UnitValue,
    unsupported: impl Fn() -> EngineError,
) -> Result<Decimal, EngineError> {
    let scale = base_scale(source.units()).ok_or_else(unsupported)?;
    Ok(source.value() * scale)
}

fn scale_from_base(
    base_value: Decimal,
    dest_token: &str,
    unsupported: impl Fn() -> EngineError,
) -> Result<UnitValue, EngineError> {
    let down = base_scale(dest_token).ok_or_else(unsupported)?;
    Ok(UnitValue::new(base_value / down, dest_token))
}

/// Magnitude expressed in kilograms, for families that can reach mass.
fn to_mass_kg(
    value: Decimal,
    token: &str,
    family: UnitFamily,
    state: &ConverterState,
    unsupported: &impl Fn() -> EngineError,
) -> Result<Decimal, EngineError> {
    let scale = base_scale(token).ok_or_else(unsupported)?;
    let in_base = value * scale;
    match family {
        UnitFamily::Mass => Ok(in_base),
        UnitFamily::Equipment => Ok(in_base * amortized_kg_per_unit(state)),
        UnitFamily::Consumption => {
            // tCO2e / (tCO2e per kg) with the intensity drawn from ambient totals
            let intensity = safe_div(state.gas_consumption().value(), state.volume().value());
            Ok(safe_div(in_base, intensity))
        }
        UnitFamily::Energy => {
            let intensity = safe_div(state.energy_consumption().value(), state.volume().value());
            Ok(safe_div(in_base, intensity))
        }
        _ => Err(unsupported()),
    }
}

/// Kilograms expressed in the base unit of the destination family.
fn from_mass_kg(kg: Decimal, family: UnitFamily, state: &ConverterState) -> Option<Decimal> {
    match family {
        UnitFamily::Mass => Some(kg),
        UnitFamily::Equipment => Some(safe_div(kg, amortized_kg_per_unit(state))),
        UnitFamily::Consumption => {
            let intensity = safe_div(state.gas_consumption().value(), state.volume().value());
            Some(kg * intensity)
        }
        UnitFamily::Energy => {
            let intensity = safe_div(state.energy_consumption().value(), state.volume().value());
            Some(kg * intensity)
        }
        _ => None,
    }
}

/// Ambient amortized charge normalized to kg per unit.
fn amortized_kg_per_unit(state: &ConverterState) -> Decimal {
    let amortized = state.amortized_unit_volume();
    let parsed = parse_units(amortized.units());
    let scale = base_scale(&parsed.numerator).unwrap_or(Decimal::ONE);
    amortized.value() * scale
}

/// Ambient total for a family, in that family's base unit.
fn ambient_total(family: UnitFamily, state: &ConverterState) -> Option<Decimal> {
    match family {
        UnitFamily::Mass => Some(state.volume().value()),
        UnitFamily::Equipment => Some(state.population().value()),
        UnitFamily::Consumption => Some(state.gas_consumption().value()),
        UnitFamily::Energy => Some(state.energy_consumption().value()),
        UnitFamily::Time => Some(state.years_elapsed().value()),
        UnitFamily::Ratio | UnitFamily::Composite => None,
    }
}

/// Ambient quantity measured in the given denominator token.
fn ambient_in_token(
    token: &str,
    state: &ConverterState,
    from: &str,
    to: &str,
) -> Result<Decimal, EngineError> {
    let family = family_of(token)
        .ok_or_else(|| EngineError::UnsupportedConversion(from.to_string(), to.to_string()))?;
    let total = ambient_total(family, state)
        .ok_or_else(|| EngineError::UnsupportedConversion(from.to_string(), to.to_string()))?;
    let scale = base_scale(token)
        .ok_or_else(|| EngineError::UnsupportedConversion(from.to_string(), to.to_string()))?;
    Ok(total / scale)
}
