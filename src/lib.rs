pub mod units;
pub mod engine;
pub mod results;
pub mod runner;
pub mod utils;

pub use units::*;
pub use engine::*;
pub use results::{
    render_csv, render_error_response, render_ok_response, EngineResult, ImportSupplement,
    ResultSerializer, CSV_HEADER,
};
pub use runner::{
    run_request, trial_seed, CommandValue, Scenario, ScenarioCommand, SimulationRequest,
    SimulationRunner, YearRange,
};
pub use utils::*;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn kg(value: i64) -> UnitValue {
        UnitValue::new(Decimal::from(value), "kg")
    }

    fn mt(value: i64) -> UnitValue {
        UnitValue::new(Decimal::from(value), "mt")
    }

    fn units_of(value: i64) -> UnitValue {
        UnitValue::new(Decimal::from(value), "units")
    }

    fn pct(value: i64) -> UnitValue {
        UnitValue::new(Decimal::from(value), "%")
    }

    fn per_unit(value: i64) -> UnitValue {
        UnitValue::new(Decimal::from(value), "kg / unit")
    }

    fn all_years() -> YearMatcher {
        YearMatcher::unbounded()
    }

    fn scoped(start: i32, end: i32, substance: &str) -> Engine {
        let mut engine = Engine::new(start, end);
        engine.set_application("Domestic Refrigeration");
        engine.set_substance(substance);
        engine
    }

    #[test]
    fn test_basic_consumption_scenario() {
        // Initial charge 123 kg/unit, intensity 1 tCO2e/kg, two units of
        // domestic manufacture
        let mut engine = scoped(1, 3, "HFC-134a");
        engine
            .set_initial_charge(per_unit(123), "sales", &all_years())
            .unwrap();
        engine
            .equals(UnitValue::new(Decimal::ONE, "tCO2e / kg"), &all_years())
            .unwrap();
        engine
            .set_stream("manufacture", units_of(2), &all_years())
            .unwrap();

        assert_eq!(
            engine.get_stream("consumption").unwrap().value(),
            Decimal::from(246)
        );
    }

    #[test]
    fn test_retire_and_recharge_keep_sales_constant() {
        let mut engine = scoped(1, 3, "HFC-134a");

        for _ in 1..=3 {
            engine
                .set_stream("manufacture", kg(10), &all_years())
                .unwrap();
            engine
                .set_initial_charge(per_unit(1), "sales", &all_years())
                .unwrap();
            engine
                .retire(UnitValue::new(Decimal::from(10), "% / year"), &all_years())
                .unwrap();
            engine
                .recharge(pct(10), per_unit(1), &all_years())
                .unwrap();

            assert_eq!(
                engine.get_stream("manufacture").unwrap().value(),
                Decimal::from(10)
            );
            engine.increment_year();
        }
    }

    #[test]
    fn test_recycling_with_full_displacement() {
        let mut engine = scoped(1, 3, "HFC-134a");

        let run_year = |engine: &mut Engine| {
            engine
                .set_stream("manufacture", kg(10), &all_years())
                .unwrap();
            engine
                .set_initial_charge(per_unit(1), "sales", &all_years())
                .unwrap();
            engine
                .recharge(pct(50), per_unit(1), &all_years())
                .unwrap();
            engine
                .recycle(pct(50), pct(100), pct(100), &all_years())
                .unwrap();
        };

        run_year(&mut engine);
        assert_eq!(engine.get_stream("recycle").unwrap().value(), Decimal::ZERO);
        assert_eq!(
            engine.get_stream("equipment").unwrap().value(),
            Decimal::from(10)
        );

        engine.increment_year();
        run_year(&mut engine);
        assert_eq!(
            engine.get_stream("manufacture").unwrap().value(),
            Decimal::from(10)
        );
        assert_eq!(
            engine.get_stream("recycle").unwrap().value(),
            Decimal::new(25, 1)
        );
        assert_eq!(
            engine.get_stream("equipment").unwrap().value(),
            Decimal::from(15)
        );
    }

    #[test]
    fn test_cap_with_unit_displacement_to_other_substance() {
        let mut engine = Engine::new(1, 1);
        engine.set_application("Commercial Refrigeration");

        engine.set_substance("sub_a");
        engine
            .set_stream("priorEquipment", units_of(20), &all_years())
            .unwrap();
        engine
            .set_initial_charge(per_unit(10), "sales", &all_years())
            .unwrap();
        engine
            .recharge(pct(10), per_unit(10), &all_years())
            .unwrap();
        engine
            .set_stream("manufacture", kg(100), &all_years())
            .unwrap();

        engine.set_substance("sub_b");
        engine
            .set_initial_charge(per_unit(20), "sales", &all_years())
            .unwrap();
        engine
            .set_stream("manufacture", kg(200), &all_years())
            .unwrap();

        engine.set_substance("sub_a");
        engine
            .cap("manufacture", units_of(5), &all_years(), Some("sub_b"))
            .unwrap();

        assert_eq!(
            engine.get_stream("manufacture").unwrap().value(),
            Decimal::from(70)
        );

        engine.set_substance("sub_b");
        assert_eq!(
            engine.get_stream("manufacture").unwrap().value(),
            Decimal::from(260)
        );
    }

    #[test]
    fn test_replace_preserves_total_mass() {
        let mut engine = Engine::new(1, 1);
        engine.set_application("Industrial Chillers");

        engine.set_substance("sub_a");
        engine
            .equals(UnitValue::new(Decimal::from(10), "tCO2e / mt"), &all_years())
            .unwrap();
        engine.set_stream("manufacture", mt(50), &all_years()).unwrap();

        engine.set_substance("sub_b");
        engine
            .equals(UnitValue::new(Decimal::from(5), "tCO2e / mt"), &all_years())
            .unwrap();
        engine.set_stream("manufacture", mt(50), &all_years()).unwrap();

        engine.set_substance("sub_a");
        assert_eq!(
            engine.get_stream("consumption").unwrap().value(),
            Decimal::from(500)
        );
        engine
            .replace(mt(25), "manufacture", "sub_b", &all_years())
            .unwrap();
        assert_eq!(
            engine.get_stream("consumption").unwrap().value(),
            Decimal::from(250)
        );

        engine.set_substance("sub_b");
        assert_eq!(
            engine.get_stream("consumption").unwrap().value(),
            Decimal::from(375)
        );
    }

    #[test]
    fn test_initialization_is_order_independent() {
        // The same parameter commands issued in three orders must give
        // identical consumption every year
        let charge = || per_unit(2);
        let intensity = || UnitValue::new(Decimal::from(3), "tCO2e / kg");
        let recharge_pop = || pct(10);
        let recharge_intensity = || per_unit(1);

        let mut engine = Engine::new(1, 3);
        engine.set_application("Domestic AC");

        engine.set_substance("sub_1");
        engine.set_initial_charge(charge(), "sales", &all_years()).unwrap();
        engine.equals(intensity(), &all_years()).unwrap();
        engine
            .recharge(recharge_pop(), recharge_intensity(), &all_years())
            .unwrap();

        engine.set_substance("sub_2");
        engine.equals(intensity(), &all_years()).unwrap();
        engine
            .recharge(recharge_pop(), recharge_intensity(), &all_years())
            .unwrap();
        engine.set_initial_charge(charge(), "sales", &all_years()).unwrap();

        engine.set_substance("sub_3");
        engine
            .recharge(recharge_pop(), recharge_intensity(), &all_years())
            .unwrap();
        engine.set_initial_charge(charge(), "sales", &all_years()).unwrap();
        engine.equals(intensity(), &all_years()).unwrap();

        while !engine.is_done() {
            let mut consumptions = Vec::new();
            for substance in ["sub_1", "sub_2", "sub_3"] {
                engine.set_substance(substance);
                engine
                    .set_stream("manufacture", kg(10), &all_years())
                    .unwrap();
                consumptions.push(engine.get_stream("consumption").unwrap().value());
            }
            assert_eq!(consumptions[0], consumptions[1]);
            assert_eq!(consumptions[1], consumptions[2]);
            engine.increment_year();
        }
    }

    #[test]
    fn test_equipment_never_negative() {
        let mut engine = scoped(1, 2, "HFC-32");
        engine
            .set_initial_charge(per_unit(1), "sales", &all_years())
            .unwrap();
        engine
            .set_stream("manufacture", kg(5), &all_years())
            .unwrap();
        engine.increment_year();

        // Recharge demand far beyond available sales
        engine
            .recharge(pct(100), per_unit(100), &all_years())
            .unwrap();
        engine
            .set_stream("manufacture", kg(1), &all_years())
            .unwrap();

        assert!(engine.get_stream("equipment").unwrap().value() >= Decimal::ZERO);
        assert!(engine.get_stream("newEquipment").unwrap().value() >= Decimal::ZERO);
    }

    #[test]
    fn test_sales_reads_as_sum_of_substreams() {
        let mut engine = scoped(1, 1, "HFC-134a");
        engine
            .set_stream("manufacture", kg(30), &all_years())
            .unwrap();
        engine.set_stream("import", kg(20), &all_years()).unwrap();

        assert_eq!(
            engine.get_stream("sales").unwrap().value(),
            Decimal::from(50)
        );
    }

    #[test]
    fn test_repeated_verb_is_idempotent() {
        let mut engine = scoped(1, 1, "HFC-134a");
        engine
            .set_initial_charge(per_unit(2), "sales", &all_years())
            .unwrap();
        engine
            .equals(UnitValue::new(Decimal::from(2), "tCO2e / kg"), &all_years())
            .unwrap();
        engine
            .set_stream("manufacture", kg(10), &all_years())
            .unwrap();

        engine.recharge(pct(10), per_unit(1), &all_years()).unwrap();
        let first: Vec<Decimal> = ["manufacture", "equipment", "consumption", "rechargeEmissions"]
            .iter()
            .map(|s| engine.get_stream(s).unwrap().value())
            .collect();

        engine.recharge(pct(10), per_unit(1), &all_years()).unwrap();
        let second: Vec<Decimal> = ["manufacture", "equipment", "consumption", "rechargeEmissions"]
            .iter()
            .map(|s| engine.get_stream(s).unwrap().value())
            .collect();

        assert_eq!(first, second);
    }
}
