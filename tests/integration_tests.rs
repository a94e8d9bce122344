//! Integration tests for pavement back-calculation
//!
//! These tests run the full pipeline (noise injection, cached log-space adapter, Trust
//! Region Reflective solve) against an analytic basin model standing in for the
//! layered-elastic solver.
//!
//! # Test Coverage
//!
//! - **Noiseless recovery**: the true moduli are recovered from the prior center, the
//!   physical midpoint and the true values themselves
//! - **Noisy runs**: seeded perturbations are reproducible and stay inside the bounds
//! - **Budget**: exhausting the evaluation cap is a status, not an error
//! - **Failures**: invalid bounds, zero targets and forward-model errors

mod common;

use common::{BasinModel, TRUE_MODULI, max_relative_error, measured_scenario};
use approx::assert_relative_eq;
use pavement_backcalc::core::CoreError;
use pavement_backcalc::core::prior::LogPrior;
use pavement_backcalc::core::scenario::{Moduli, N_LAYERS, Scenario};
use pavement_backcalc::forward::{ForwardError, ForwardResponse, ForwardResult};
use pavement_backcalc::linalg::LinearSolverType;
use pavement_backcalc::optimizer::OptimizationStatus;
use pavement_backcalc::{
    BackCalculator, BackcalcConfig, BackcalcError, InitialGuessStrategy, NoisePrior,
    ResidualNormalization, TrustRegionReflectiveConfig, back_calculate, forward_calculate,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn assert_within_bounds(moduli: &Moduli, prior: &NoisePrior) {
    for i in 0..N_LAYERS {
        assert!(
            moduli[i] >= prior.modulus_lower[i] && moduli[i] <= prior.modulus_upper[i],
            "layer {} modulus {} outside [{}, {}]",
            i + 1,
            moduli[i],
            prior.modulus_lower[i],
            prior.modulus_upper[i]
        );
    }
}

#[test]
fn test_noiseless_recovery_from_prior_center() -> TestResult {
    let scenario = measured_scenario().with_moduli(Moduli::zeros());
    let prior = NoisePrior::default().without_noise();
    let model = BasinModel::new();

    let outcome = BackCalculator::new(&model, BackcalcConfig::new()).back_calculate(&scenario, &prior)?;

    let center = LogPrior::from_bounds(&prior)?.center;
    for i in 0..N_LAYERS {
        assert_relative_eq!(outcome.initial_moduli[i], center[i].exp(), max_relative = 1e-12);
    }

    let truth = Moduli::from(TRUE_MODULI);
    assert!(outcome.converged, "status {:?}", outcome.status);
    assert!(
        max_relative_error(&outcome.moduli, &truth) < 1e-4,
        "recovered {:?}",
        outcome.moduli.as_slice()
    );
    assert!(outcome.final_cost < outcome.initial_cost);
    assert!(outcome.function_evaluations <= 100);
    Ok(())
}

#[test]
fn test_single_zero_modulus_resets_whole_initial_guess() -> TestResult {
    let mut moduli = Moduli::from(TRUE_MODULI);
    moduli[2] = 0.0;
    let scenario = measured_scenario().with_moduli(moduli);
    let prior = NoisePrior::default().without_noise();
    let model = BasinModel::new();

    let outcome = BackCalculator::new(&model, BackcalcConfig::new()).back_calculate(&scenario, &prior)?;

    // Layers with a usable modulus are reset too, not only the zero one.
    let center = LogPrior::from_bounds(&prior)?.center;
    for i in 0..N_LAYERS {
        assert_relative_eq!(outcome.initial_moduli[i], center[i].exp(), max_relative = 1e-12);
    }
    assert!(max_relative_error(&outcome.moduli, &Moduli::from(TRUE_MODULI)) < 1e-4);
    Ok(())
}

#[test]
fn test_noiseless_recovery_from_physical_midpoint() -> TestResult {
    let scenario = measured_scenario();
    let prior = NoisePrior::default().without_noise();
    let model = BasinModel::new();
    let config = BackcalcConfig::new().with_initial_guess(InitialGuessStrategy::PhysicalMidpoint);

    let outcome = BackCalculator::new(&model, config).back_calculate(&scenario, &prior)?;

    assert!(outcome.converged);
    assert!(max_relative_error(&outcome.moduli, &Moduli::from(TRUE_MODULI)) < 1e-4);
    Ok(())
}

#[test]
fn test_starting_at_truth_stays_at_truth() -> TestResult {
    let scenario = measured_scenario();
    let prior = NoisePrior::default().without_noise();
    let model = BasinModel::new();

    let outcome = BackCalculator::new(&model, BackcalcConfig::new()).back_calculate(&scenario, &prior)?;

    assert_eq!(outcome.initial_moduli, Moduli::from(TRUE_MODULI));
    assert!(max_relative_error(&outcome.moduli, &Moduli::from(TRUE_MODULI)) < 1e-8);
    Ok(())
}

#[test]
fn test_absolute_normalization_and_qr_solver() -> TestResult {
    let scenario = measured_scenario().with_moduli(Moduli::zeros());
    let prior = NoisePrior::default().without_noise();
    let model = BasinModel::new();
    let config = BackcalcConfig::new()
        .with_normalization(ResidualNormalization::Absolute)
        .with_solver_config(
            TrustRegionReflectiveConfig::new()
                .with_linear_solver_type(LinearSolverType::DenseQR)
                .with_cost_tolerance(1e-12)
                .with_parameter_tolerance(1e-12)
                .with_gradient_tolerance(1e-14),
        );

    let outcome = BackCalculator::new(&model, config).back_calculate(&scenario, &prior)?;

    assert!(max_relative_error(&outcome.moduli, &Moduli::from(TRUE_MODULI)) < 1e-3);
    Ok(())
}

#[test]
fn test_seeded_noisy_runs_are_reproducible() -> TestResult {
    let scenario = measured_scenario();
    let prior = NoisePrior::default();
    let model = BasinModel::new();
    let config = BackcalcConfig::new().with_seed(2024);

    let first = BackCalculator::new(&model, config.clone()).back_calculate(&scenario, &prior)?;
    let second = BackCalculator::new(&model, config).back_calculate(&scenario, &prior)?;

    assert_eq!(first.noise_report, second.noise_report);
    assert_eq!(first.moduli, second.moduli);
    assert!(!first.noise_report.deflection.is_unchanged());
    assert!(!first.noise_report.load.is_unchanged());
    assert_within_bounds(&first.moduli, &prior);
    // The caller's scenario is never perturbed in place
    assert_eq!(scenario, measured_scenario());
    Ok(())
}

#[test]
fn test_active_bound_keeps_moduli_inside() -> TestResult {
    let scenario = measured_scenario();
    let mut prior = NoisePrior::default().without_noise();
    // True surface modulus 4000 MPa lies above this cap.
    prior.modulus_upper[0] = 3000.0;
    let model = BasinModel::new();

    let outcome = BackCalculator::new(&model, BackcalcConfig::new()).back_calculate(&scenario, &prior)?;

    assert_eq!(outcome.initial_moduli[0], 3000.0);
    assert_within_bounds(&outcome.moduli, &prior);
    assert!(outcome.moduli[0] > 2900.0);
    Ok(())
}

#[test]
fn test_evaluation_cap_returns_last_iterate() -> TestResult {
    let scenario = measured_scenario().with_moduli(Moduli::zeros());
    let prior = NoisePrior::default().without_noise();
    let model = BasinModel::new();
    let config = BackcalcConfig::new().with_max_function_evaluations(4);

    let outcome = BackCalculator::new(&model, config).back_calculate(&scenario, &prior)?;

    assert_eq!(outcome.status, OptimizationStatus::MaxFunctionEvaluationsReached);
    assert!(!outcome.converged);
    assert_eq!(outcome.function_evaluations, 4);
    assert!(outcome.final_cost <= outcome.initial_cost);
    assert_within_bounds(&outcome.moduli, &prior);
    Ok(())
}

#[test]
fn test_call_counters_match_model_invocations() -> TestResult {
    let scenario = measured_scenario().with_moduli(Moduli::zeros());
    let prior = NoisePrior::default().without_noise();
    let model = BasinModel::new();

    let outcome = BackCalculator::new(&model, BackcalcConfig::new()).back_calculate(&scenario, &prior)?;

    assert_eq!(outcome.forward_calls, model.calls.get());
    assert_eq!(outcome.forward_gradient_calls, model.gradient_calls.get());
    assert_eq!(outcome.forward_gradient_calls, outcome.jacobian_evaluations);
    assert!(outcome.forward_calls <= outcome.function_evaluations + outcome.jacobian_evaluations);
    Ok(())
}

#[test]
fn test_free_function_matches_calculator() -> TestResult {
    let scenario = measured_scenario().with_moduli(Moduli::zeros());
    let prior = NoisePrior::default().without_noise();
    let model = BasinModel::new();

    let moduli = back_calculate(&scenario, &prior, &model)?;
    let outcome = BackCalculator::new(&model, BackcalcConfig::new()).back_calculate(&scenario, &prior)?;

    assert_eq!(moduli, outcome.moduli);
    Ok(())
}

#[test]
fn test_invalid_prior_bounds() {
    let mut prior = NoisePrior::default();
    prior.modulus_lower[4] = 0.0;
    let model = BasinModel::new();

    let result = back_calculate(&measured_scenario(), &prior, &model);

    assert!(matches!(
        result,
        Err(BackcalcError::Core(CoreError::InvalidPriorBounds { layer: 5, .. }))
    ));
    assert_eq!(model.calls.get(), 0);
}

#[test]
fn test_zero_target_deflection() {
    let mut deflections = measured_scenario().deflections_um;
    deflections[9] = 0.0;
    let scenario = measured_scenario().with_deflections_um(deflections);
    let model = BasinModel::new();

    let result = back_calculate(&scenario, &NoisePrior::default().without_noise(), &model);

    assert!(matches!(
        result,
        Err(BackcalcError::Core(CoreError::NonPositiveDeflection { point: 10, .. }))
    ));
}

#[test]
fn test_forward_failure_propagates() {
    let model = |_: &Scenario, _: bool| -> ForwardResult<ForwardResponse> {
        Err(ForwardError::Evaluation("Bessel integration did not converge".to_string()))
    };

    let result = back_calculate(
        &measured_scenario(),
        &NoisePrior::default().without_noise(),
        &model,
    );

    assert!(matches!(
        result,
        Err(BackcalcError::Forward(ForwardError::Evaluation(_)))
    ));
}

#[test]
fn test_missing_jacobian_is_reported() {
    let model = |scenario: &Scenario, _: bool| -> ForwardResult<ForwardResponse> {
        Ok(ForwardResponse::new(BasinModel::deflections(scenario)))
    };

    let result = back_calculate(
        &measured_scenario().with_moduli(Moduli::zeros()),
        &NoisePrior::default().without_noise(),
        &model,
    );

    assert!(matches!(
        result,
        Err(BackcalcError::Forward(ForwardError::MissingJacobian))
    ));
}

#[test]
fn test_forward_calculate_predicts_deflections() -> TestResult {
    let scenario = Scenario::default().with_moduli(Moduli::from(TRUE_MODULI));
    let model = BasinModel::new();

    let deflections = forward_calculate(&model, &scenario)?;

    assert_eq!(deflections, BasinModel::deflections(&scenario));
    assert_eq!(model.gradient_calls.get(), 0);
    // Deflection basin decreases away from the load
    assert!(deflections.iter().zip(deflections.iter().skip(1)).all(|(a, b)| a > b));
    assert!(deflections.iter().all(|&u| u > 0.0));
    Ok(())
}
