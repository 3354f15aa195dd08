use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::engine::core::Engine;
use crate::engine::models::{is_known_stream, YearMatcher};
use crate::results::{EngineResult, ResultSerializer};
use crate::units::models::UnitValue;
use crate::utils::{validate_application_name, validate_substance_name, EngineError};

// ======================================================================
// COMMAND RECORDS
// ======================================================================

/// A numeric operand as a front end emits it. The optional relative
/// standard deviation (percent) drives uncertainty sampling on trials
/// past the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandValue {
    pub value: Decimal,
    pub units: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncertainty_pct: Option<Decimal>,
}

impl CommandValue {
    pub fn exact(value: Decimal, units: &str) -> Self {
        Self {
            value,
            units: units.to_string(),
            uncertainty_pct: None,
        }
    }

    /// Nominal value, or a Normal sample around it when an uncertainty
    /// is declared and a trial generator is supplied.
    fn resolve(&self, rng: Option<&mut StdRng>) -> UnitValue {
        let sampled = match (self.uncertainty_pct.as_ref(), rng) {
            (Some(pct), Some(rng)) if !pct.is_zero() => sample_normal(self.value, *pct, rng),
            _ => self.value,
        };
        UnitValue::new(sampled, &self.units)
    }
}

fn sample_normal(mean: Decimal, relative_sd_pct: Decimal, rng: &mut StdRng) -> Decimal {
    let mean_f = mean.to_f64().unwrap_or(0.0);
    let sd_f = (mean.abs() * relative_sd_pct / Decimal::ONE_HUNDRED)
        .to_f64()
        .unwrap_or(0.0);
    match Normal::new(mean_f, sd_f) {
        Ok(dist) => Decimal::from_f64(dist.sample(rng)).unwrap_or(mean),
        Err(_) => mean,
    }
}

/// Optional inclusive year bounds carried by a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearRange {
    #[serde(default)]
    pub min_year: Option<i32>,
    #[serde(default)]
    pub max_year: Option<i32>,
}

impl YearRange {
    pub fn to_matcher(self) -> YearMatcher {
        YearMatcher::new(self.min_year, self.max_year)
    }
}

/// Typed records matching the engine verbs, as a parser front end is
/// expected to emit them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ScenarioCommand {
    SetStanza {
        name: String,
    },
    SetApplication {
        name: String,
    },
    SetSubstance {
        name: String,
    },
    SetVariable {
        name: String,
        value: CommandValue,
    },
    SetStream {
        stream: String,
        value: CommandValue,
        #[serde(default)]
        range: YearRange,
    },
    ChangeStream {
        stream: String,
        delta: CommandValue,
        #[serde(default)]
        range: YearRange,
    },
    Cap {
        stream: String,
        limit: CommandValue,
        #[serde(default)]
        range: YearRange,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        displace: Option<String>,
    },
    Floor {
        stream: String,
        limit: CommandValue,
        #[serde(default)]
        range: YearRange,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        displace: Option<String>,
    },
    Replace {
        amount: CommandValue,
        stream: String,
        substance: String,
        #[serde(default)]
        range: YearRange,
    },
    Recharge {
        population: CommandValue,
        intensity: CommandValue,
        #[serde(default)]
        range: YearRange,
    },
    Recycle {
        recovery: CommandValue,
        #[serde(rename = "yield")]
        yield_rate: CommandValue,
        displacement: CommandValue,
        #[serde(default)]
        range: YearRange,
    },
    Retire {
        rate: CommandValue,
        #[serde(default)]
        range: YearRange,
    },
    Equals {
        intensity: CommandValue,
        #[serde(default)]
        range: YearRange,
    },
    SetInitialCharge {
        value: CommandValue,
        stream: String,
        #[serde(default)]
        range: YearRange,
    },
}

impl ScenarioCommand {
    /// Stream name carried by the command, when it has one.
    fn stream_name(&self) -> Option<&str> {
        match self {
            ScenarioCommand::SetStream { stream, .. }
            | ScenarioCommand::ChangeStream { stream, .. }
            | ScenarioCommand::Cap { stream, .. }
            | ScenarioCommand::Floor { stream, .. }
            | ScenarioCommand::Replace { stream, .. }
            | ScenarioCommand::SetInitialCharge { stream, .. } => Some(stream),
            _ => None,
        }
    }
}

// ======================================================================
// SCENARIOS
// ======================================================================

/// A named command script over an inclusive simulation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub name: String,
    pub start_year: i32,
    pub end_year: i32,
    pub commands: Vec<ScenarioCommand>,
}

/// The full request a front end submits: scenarios plus the trial axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    pub scenarios: Vec<Scenario>,
    #[serde(default = "default_trials")]
    pub trials: u32,
    #[serde(default)]
    pub base_seed: u64,
}

fn default_trials() -> u32 {
    1
}

// ======================================================================
// RUNNER
// ======================================================================

/// Invokes the engine across (scenario x trial x year) and collects
/// result rows. Each (scenario, trial) pair gets a fresh engine; every
/// command is re-evaluated every year and the year-range guards decide
/// what applies.
pub struct SimulationRunner {
    request: SimulationRequest,
}

impl SimulationRunner {
    pub fn new(request: SimulationRequest) -> Self {
        Self { request }
    }

    pub fn run(&self) -> Result<Vec<EngineResult>, EngineError> {
        self.validate()?;

        let mut rows = Vec::new();
        for (scenario_index, scenario) in self.request.scenarios.iter().enumerate() {
            for trial in 0..self.request.trials.max(1) {
                info!(
                    "running scenario '{}' trial {} over years {}..={}",
                    scenario.name, trial, scenario.start_year, scenario.end_year
                );
                rows.extend(self.run_trial(scenario, scenario_index, trial)?);
            }
        }
        Ok(rows)
    }

    /// Reject malformed scripts before any engine is touched.
    fn validate(&self) -> Result<(), EngineError> {
        for scenario in &self.request.scenarios {
            if scenario.start_year > scenario.end_year {
                return Err(EngineError::InvalidYearRange(format!(
                    "scenario '{}' runs {} to {}",
                    scenario.name, scenario.start_year, scenario.end_year
                )));
            }
            for command in &scenario.commands {
                if let Some(stream) = command.stream_name() {
                    if !is_known_stream(stream) {
                        return Err(EngineError::UnknownStream(stream.to_string()));
                    }
                }
                match command {
                    ScenarioCommand::SetApplication { name } => {
                        validate_application_name(name)?
                    }
                    ScenarioCommand::SetSubstance { name } => validate_substance_name(name)?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn run_trial(
        &self,
        scenario: &Scenario,
        scenario_index: usize,
        trial: u32,
    ) -> Result<Vec<EngineResult>, EngineError> {
        let seed = trial_seed(self.request.base_seed, scenario_index, trial);
        let mut rng = StdRng::seed_from_u64(seed);
        // Trial zero is the deterministic baseline; sampling applies to
        // the trials after it
        let sampling = trial > 0;

        let mut engine = Engine::new(scenario.start_year, scenario.end_year);
        let mut rows = Vec::new();

        while !engine.is_done() {
            for command in &scenario.commands {
                let rng_ref = if sampling { Some(&mut rng) } else { None };
                execute_command(&mut engine, command, rng_ref)?;
            }
            rows.extend(ResultSerializer::serialize_year(&engine, &scenario.name, trial)?);
            engine.increment_year();
        }
        Ok(rows)
    }
}

/// Deterministic per-trial seed via splitmix64 over the base seed and
/// the (scenario, trial) coordinates.
pub fn trial_seed(base_seed: u64, scenario_index: usize, trial: u32) -> u64 {
    let mut z = base_seed
        .wrapping_add((scenario_index as u64).wrapping_shl(32))
        .wrapping_add(trial as u64)
        .wrapping_add(0x9e3779b97f4a7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

fn execute_command(
    engine: &mut Engine,
    command: &ScenarioCommand,
    rng: Option<&mut StdRng>,
) -> Result<(), EngineError> {
    match command {
        ScenarioCommand::SetStanza { name } => {
            engine.set_stanza(name);
            Ok(())
        }
        ScenarioCommand::SetApplication { name } => {
            engine.set_application(name);
            Ok(())
        }
        ScenarioCommand::SetSubstance { name } => {
            engine.set_substance(name);
            Ok(())
        }
        ScenarioCommand::SetVariable { name, value } => {
            engine.set_variable(name, value.resolve(rng));
            Ok(())
        }
        ScenarioCommand::SetStream { stream, value, range } => {
            engine.set_stream(stream, value.resolve(rng), &range.to_matcher())
        }
        ScenarioCommand::ChangeStream { stream, delta, range } => {
            engine.change_stream(stream, delta.resolve(rng), &range.to_matcher())
        }
        ScenarioCommand::Cap {
            stream,
            limit,
            range,
            displace,
        } => engine.cap(
            stream,
            limit.resolve(rng),
            &range.to_matcher(),
            displace.as_deref(),
        ),
        ScenarioCommand::Floor {
            stream,
            limit,
            range,
            displace,
        } => engine.floor(
            stream,
            limit.resolve(rng),
            &range.to_matcher(),
            displace.as_deref(),
        ),
        ScenarioCommand::Replace {
            amount,
            stream,
            substance,
            range,
        } => engine.replace(amount.resolve(rng), stream, substance, &range.to_matcher()),
        ScenarioCommand::Recharge {
            population,
            intensity,
            range,
        } => {
            let mut rng = rng;
            let population = population.resolve(rng.as_deref_mut());
            let intensity = intensity.resolve(rng.as_deref_mut());
            engine.recharge(population, intensity, &range.to_matcher())
        }
        ScenarioCommand::Recycle {
            recovery,
            yield_rate,
            displacement,
            range,
        } => {
            let mut rng = rng;
            let recovery = recovery.resolve(rng.as_deref_mut());
            let yield_rate = yield_rate.resolve(rng.as_deref_mut());
            let displacement = displacement.resolve(rng.as_deref_mut());
            engine.recycle(recovery, yield_rate, displacement, &range.to_matcher())
        }
        ScenarioCommand::Retire { rate, range } => {
            engine.retire(rate.resolve(rng), &range.to_matcher())
        }
        ScenarioCommand::Equals { intensity, range } => {
            engine.equals(intensity.resolve(rng), &range.to_matcher())
        }
        ScenarioCommand::SetInitialCharge { value, stream, range } => {
            engine.set_initial_charge(value.resolve(rng), stream, &range.to_matcher())
        }
    }
}

/// Run a full request and frame the outcome for the transport: the
/// status line plus CSV on success, the error line otherwise.
pub fn run_request(request: SimulationRequest) -> String {
    let runner = SimulationRunner::new(request);
    match runner.run() {
        Ok(rows) => match crate::results::render_ok_response(&rows) {
            Ok(response) => response,
            Err(err) => {
                warn!("result rendering failed: {}", err);
                crate::results::render_error_response(&EngineError::MissingParameter(
                    err.to_string(),
                ))
            }
        },
        Err(err) => crate::results::render_error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(magnitude: i64, units: &str) -> CommandValue {
        CommandValue::exact(Decimal::from(magnitude), units)
    }

    fn basic_scenario() -> Scenario {
        Scenario {
            name: "baseline".to_string(),
            start_year: 1,
            end_year: 3,
            commands: vec![
                ScenarioCommand::SetApplication {
                    name: "Domestic Refrigeration".to_string(),
                },
                ScenarioCommand::SetSubstance {
                    name: "HFC-134a".to_string(),
                },
                ScenarioCommand::SetInitialCharge {
                    value: value(1, "kg / unit"),
                    stream: "sales".to_string(),
                    range: YearRange::default(),
                },
                ScenarioCommand::Equals {
                    intensity: value(1, "tCO2e / kg"),
                    range: YearRange::default(),
                },
                ScenarioCommand::SetStream {
                    stream: "manufacture".to_string(),
                    value: value(10, "kg"),
                    range: YearRange::default(),
                },
            ],
        }
    }

    #[test]
    fn test_runner_covers_scenario_years() {
        let runner = SimulationRunner::new(SimulationRequest {
            scenarios: vec![basic_scenario()],
            trials: 1,
            base_seed: 0,
        });
        let rows = runner.run().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].year, 1);
        assert_eq!(rows[2].year, 3);
        assert_eq!(rows[0].manufacture.value(), Decimal::from(10));
    }

    #[test]
    fn test_unknown_stream_rejected_before_engine() {
        let mut scenario = basic_scenario();
        scenario.commands.push(ScenarioCommand::SetStream {
            stream: "bogus".to_string(),
            value: value(1, "kg"),
            range: YearRange::default(),
        });
        let runner = SimulationRunner::new(SimulationRequest {
            scenarios: vec![scenario],
            trials: 1,
            base_seed: 0,
        });
        assert!(matches!(
            runner.run(),
            Err(EngineError::UnknownStream(_))
        ));
    }

    #[test]
    fn test_reversed_scenario_window_rejected() {
        let mut scenario = basic_scenario();
        scenario.start_year = 5;
        scenario.end_year = 1;
        let runner = SimulationRunner::new(SimulationRequest {
            scenarios: vec![scenario],
            trials: 1,
            base_seed: 0,
        });
        assert!(matches!(
            runner.run(),
            Err(EngineError::InvalidYearRange(_))
        ));
    }

    #[test]
    fn test_year_range_guards_commands() {
        let mut scenario = basic_scenario();
        if let ScenarioCommand::SetStream { range, .. } = &mut scenario.commands[4] {
            *range = YearRange {
                min_year: Some(2),
                max_year: None,
            };
        }
        let runner = SimulationRunner::new(SimulationRequest {
            scenarios: vec![scenario],
            trials: 1,
            base_seed: 0,
        });
        let rows = runner.run().unwrap();
        assert_eq!(rows[0].manufacture.value(), Decimal::ZERO);
        assert_eq!(rows[1].manufacture.value(), Decimal::from(10));
    }

    #[test]
    fn test_identical_requests_are_bit_identical() {
        let request = SimulationRequest {
            scenarios: vec![basic_scenario()],
            trials: 3,
            base_seed: 42,
        };
        let first = run_request(request.clone());
        let second = run_request(request);
        assert_eq!(first, second);
        assert!(first.starts_with("OK\n\n"));
    }

    #[test]
    fn test_trial_zero_is_nominal_with_uncertainty() {
        let mut scenario = basic_scenario();
        if let ScenarioCommand::SetStream { value, .. } = &mut scenario.commands[4] {
            value.uncertainty_pct = Some(Decimal::from(10));
        }
        let runner = SimulationRunner::new(SimulationRequest {
            scenarios: vec![scenario],
            trials: 2,
            base_seed: 7,
        });
        let rows = runner.run().unwrap();

        let baseline: Vec<_> = rows.iter().filter(|r| r.trial == 0).collect();
        assert!(baseline
            .iter()
            .all(|r| r.manufacture.value() == Decimal::from(10)));
    }

    #[test]
    fn test_trial_seed_is_stable_and_distinct() {
        assert_eq!(trial_seed(1, 0, 0), trial_seed(1, 0, 0));
        assert_ne!(trial_seed(1, 0, 0), trial_seed(1, 0, 1));
        assert_ne!(trial_seed(1, 0, 0), trial_seed(1, 1, 0));
        assert_ne!(trial_seed(1, 0, 0), trial_seed(2, 0, 0));
    }

    #[test]
    fn test_command_json_round_trip() {
        let json = r#"{
            "command": "setStream",
            "stream": "manufacture",
            "value": { "value": "10", "units": "kg" },
            "range": { "minYear": 1, "maxYear": 3 }
        }"#;
        let parsed: ScenarioCommand = serde_json::from_str(json).unwrap();
        match &parsed {
            ScenarioCommand::SetStream { stream, value, range } => {
                assert_eq!(stream, "manufacture");
                assert_eq!(value.value, Decimal::from(10));
                assert_eq!(range.min_year, Some(1));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
