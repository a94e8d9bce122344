//! Layer modulus back-calculation.
//!
//! One run goes through the following stages:
//!
//! 1. Validate the scenario and the prior bounds
//! 2. Perturb the observations with the configured noise ([`NoiseInjector`])
//! 3. Pick the initial moduli and move them into log space
//! 4. Solve the bounded least-squares problem
//!    `min ½‖(u(exp x) - u_target) / u_target‖²` with `ln lo ≤ x ≤ ln hi`
//!    using [`TrustRegionReflective`] over a [`LogCachedForwardModel`]
//! 5. Map the optimum back to physical moduli
//!
//! Running out of function evaluations is not an error: the outcome carries the last
//! iterate with `converged == false`.
//!
//! # Example
//!
//! ```
//! use pavement_backcalc::backcalc::{BackCalculator, BackcalcConfig};
//! use pavement_backcalc::core::prior::NoisePrior;
//! use pavement_backcalc::core::scenario::{Deflections, ModulusJacobian, N_LAYERS, Scenario};
//! use pavement_backcalc::forward::{ForwardResponse, ForwardResult};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // u_j = (j + 1) / E_(j mod 5)
//! let model = |scenario: &Scenario, gradient: bool| -> ForwardResult<ForwardResponse> {
//!     let e = scenario.moduli;
//!     let u = Deflections::from_fn(|j, _| (j + 1) as f64 / e[j % N_LAYERS]);
//!     let mut response = ForwardResponse::new(u);
//!     if gradient {
//!         response = response.with_jacobian(ModulusJacobian::from_fn(|j, i| {
//!             if i == j % N_LAYERS { -u[j] / e[i] } else { 0.0 }
//!         }));
//!     }
//!     Ok(response)
//! };
//!
//! let truth = Scenario::default();
//! let observed = Deflections::from_fn(|j, _| (j + 1) as f64 / truth.moduli[j % N_LAYERS]) * 1e3;
//! let scenario = truth.clone().with_deflections_um(observed);
//!
//! let prior = NoisePrior::default().without_noise();
//! let calculator = BackCalculator::new(&model, BackcalcConfig::new());
//! let outcome = calculator.back_calculate(&scenario, &prior)?;
//! assert!(outcome.converged);
//! # Ok(())
//! # }
//! ```

use crate::core::prior::{LogPrior, NoisePrior};
use crate::core::problem::Bounds;
use crate::core::scenario::{Deflections, Moduli, Scenario};
use crate::core::transform;
use crate::diagnostics::{self, IterationTraceObserver};
use crate::error::BackcalcResult;
use crate::forward::{ForwardModel, LogCachedForwardModel, ResidualNormalization};
use crate::noise::{NoiseInjector, NoiseReport};
use crate::optimizer::{OptimizationStatus, TrustRegionReflective, TrustRegionReflectiveConfig};
use nalgebra::DVector;
use std::time;
use tracing::{debug, info, warn};

/// How the starting moduli are chosen.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum InitialGuessStrategy {
    /// The scenario's moduli when all five are nonzero, otherwise the geometric mean of
    /// the bounds `exp((ln lo + ln hi) / 2)` for every layer.
    #[default]
    ScenarioOrCenter,
    /// The arithmetic midpoint `(lo + hi) / 2` for every layer.
    PhysicalMidpoint,
}

/// Configuration of a back-calculation run.
///
/// # Example
///
/// ```
/// use pavement_backcalc::backcalc::{BackcalcConfig, InitialGuessStrategy};
///
/// let config = BackcalcConfig::new()
///     .with_seed(42)
///     .with_max_function_evaluations(200)
///     .with_initial_guess(InitialGuessStrategy::PhysicalMidpoint);
/// assert_eq!(config.seed, Some(42));
/// ```
#[derive(Debug, Clone)]
pub struct BackcalcConfig {
    /// Trust Region Reflective settings
    pub solver: TrustRegionReflectiveConfig,
    /// Noise generator seed; OS entropy when `None`
    pub seed: Option<u64>,
    /// Initial guess selection
    pub initial_guess: InitialGuessStrategy,
    /// Residual normalization of the deflection misfit
    pub normalization: ResidualNormalization,
}

impl Default for BackcalcConfig {
    fn default() -> Self {
        Self {
            solver: TrustRegionReflectiveConfig::new()
                .with_max_function_evaluations(100)
                .with_cost_tolerance(1e-9)
                .with_parameter_tolerance(1e-9)
                .with_gradient_tolerance(1e-9),
            seed: None,
            initial_guess: InitialGuessStrategy::default(),
            normalization: ResidualNormalization::default(),
        }
    }
}

impl BackcalcConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the solver configuration
    pub fn with_solver_config(mut self, solver: TrustRegionReflectiveConfig) -> Self {
        self.solver = solver;
        self
    }

    /// Seed the noise generator for reproducible runs
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the initial guess strategy
    pub fn with_initial_guess(mut self, initial_guess: InitialGuessStrategy) -> Self {
        self.initial_guess = initial_guess;
        self
    }

    /// Set the residual normalization
    pub fn with_normalization(mut self, normalization: ResidualNormalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Set the forward evaluation budget of the solver
    pub fn with_max_function_evaluations(mut self, max_function_evaluations: usize) -> Self {
        self.solver.max_function_evaluations = max_function_evaluations;
        self
    }

    /// Set cost, parameter and gradient tolerances at once
    pub fn with_tolerances(mut self, ftol: f64, xtol: f64, gtol: f64) -> Self {
        self.solver.cost_tolerance = ftol;
        self.solver.parameter_tolerance = xtol;
        self.solver.gradient_tolerance = gtol;
        self
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "Back-calculation:\n  Seed:           {:?}\n  Initial guess:  {:?}\n  Normalization:  {:?}",
            self.seed, self.initial_guess, self.normalization
        );
    }
}

/// Result of one back-calculation run.
#[derive(Debug, Clone)]
pub struct BackcalcOutcome {
    /// Back-calculated moduli [MPa], layer order, inside the prior bounds
    pub moduli: Moduli,
    /// Starting moduli [MPa] after clipping into the bounds
    pub initial_moduli: Moduli,
    /// Solver termination status
    pub status: OptimizationStatus,
    /// Whether a tolerance criterion was met
    pub converged: bool,
    /// Cost `½‖r‖²` at the initial guess
    pub initial_cost: f64,
    /// Cost at the returned moduli
    pub final_cost: f64,
    /// Outer solver iterations
    pub iterations: usize,
    /// Residual evaluations requested by the solver
    pub function_evaluations: usize,
    /// Jacobian evaluations requested by the solver
    pub jacobian_evaluations: usize,
    /// Forward model invocations (cache misses)
    pub forward_calls: usize,
    /// Forward model invocations that computed a Jacobian
    pub forward_gradient_calls: usize,
    /// Wall-clock time of the solve
    pub elapsed: time::Duration,
    /// Perturbed target deflections [mm]
    pub target_mm: Deflections,
    /// Perturbations applied before the solve
    pub noise_report: NoiseReport,
}

/// Starting moduli for `strategy`, before clipping.
pub fn initial_moduli(
    scenario: &Scenario,
    prior: &NoisePrior,
    log_prior: &LogPrior,
    strategy: InitialGuessStrategy,
) -> Moduli {
    match strategy {
        InitialGuessStrategy::ScenarioOrCenter if scenario.has_complete_moduli() => {
            scenario.moduli
        }
        InitialGuessStrategy::ScenarioOrCenter => {
            debug!("Scenario has unknown moduli, starting from the log-space prior center");
            log_prior.center_moduli()
        }
        InitialGuessStrategy::PhysicalMidpoint => {
            (prior.modulus_lower + prior.modulus_upper) * 0.5
        }
    }
}

/// Back-calculates layer moduli through an injected forward model.
pub struct BackCalculator<'m, M: ForwardModel + ?Sized> {
    model: &'m M,
    config: BackcalcConfig,
}

impl<'m, M: ForwardModel + ?Sized> BackCalculator<'m, M> {
    pub fn new(model: &'m M, config: BackcalcConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &BackcalcConfig {
        &self.config
    }

    /// Run one back-calculation.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidPriorBounds`](crate::core::CoreError::InvalidPriorBounds) for
    ///   bounds violating `0 < lower < upper`
    /// - [`CoreError::NonPositiveDeflection`](crate::core::CoreError::NonPositiveDeflection)
    ///   when a perturbed target deflection is not strictly positive
    /// - [`BackcalcError::Forward`](crate::error::BackcalcError::Forward) when the model fails
    pub fn back_calculate(
        &self,
        scenario: &Scenario,
        prior: &NoisePrior,
    ) -> BackcalcResult<BackcalcOutcome> {
        scenario.validate().map_err(|e| e.log())?;
        let log_prior = LogPrior::from_bounds(prior).map_err(|e| e.log())?;
        self.config.solver.validate()?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            self.config.print_configuration();
        }

        let observation = match self.config.seed {
            Some(seed) => NoiseInjector::from_seed(seed).inject(scenario, prior)?,
            None => NoiseInjector::from_os_entropy().inject(scenario, prior)?,
        };
        diagnostics::log_noise_report(&observation.report);

        let initial = initial_moduli(
            &observation.scenario,
            prior,
            &log_prior,
            self.config.initial_guess,
        );
        let clipped = transform::clamp_moduli(&initial, &prior.modulus_lower, &prior.modulus_upper);
        if clipped != initial {
            warn!(
                "Initial moduli {:?} outside the prior bounds, clipped to {:?}",
                initial.as_slice(),
                clipped.as_slice()
            );
        }
        info!("Initial modulus values [MPa]: {:?}", clipped.as_slice());

        let mut adapter = LogCachedForwardModel::new(
            self.model,
            observation.scenario.clone(),
            observation.target_mm,
            log_prior.clone(),
        )?
        .with_normalization(self.config.normalization);

        let bounds = Bounds::new(
            DVector::from_column_slice(log_prior.lower.as_slice()),
            DVector::from_column_slice(log_prior.upper.as_slice()),
        )?;
        let x0 = DVector::from_column_slice(transform::to_log_space(&clipped)?.as_slice());

        let mut solver = TrustRegionReflective::with_config(self.config.solver.clone());
        if tracing::enabled!(tracing::Level::DEBUG) {
            solver.add_observer(IterationTraceObserver::new());
        }

        info!("Start optimizing...");
        let start_time = time::Instant::now();
        let result = solver.minimize(&mut adapter, &bounds, &x0)?;
        let elapsed = start_time.elapsed();

        let log_moduli = transform::layer_vector_from_dynamic(&result.parameters)?;
        let moduli = transform::clamp_moduli(
            &transform::to_physical(&log_moduli),
            &prior.modulus_lower,
            &prior.modulus_upper,
        );

        let (function_evaluations, jacobian_evaluations) = result
            .convergence_info
            .as_ref()
            .map_or((0, 0), |info| {
                (info.cost_evaluations, info.jacobian_evaluations)
            });

        let outcome = BackcalcOutcome {
            moduli,
            initial_moduli: clipped,
            status: result.status,
            converged: result.converged(),
            initial_cost: result.initial_cost,
            final_cost: result.final_cost,
            iterations: result.iterations,
            function_evaluations,
            jacobian_evaluations,
            forward_calls: adapter.call_count(),
            forward_gradient_calls: adapter.gradient_call_count(),
            elapsed,
            target_mm: observation.target_mm,
            noise_report: observation.report,
        };
        diagnostics::log_outcome(&outcome);

        Ok(outcome)
    }
}

/// Back-calculate layer moduli [MPa] with the default configuration.
///
/// Noise is drawn from OS entropy; use [`BackCalculator`] with
/// [`BackcalcConfig::with_seed`] for reproducible runs and the full outcome.
pub fn back_calculate<M>(
    scenario: &Scenario,
    noise_prior: &NoisePrior,
    model: &M,
) -> BackcalcResult<Moduli>
where
    M: ForwardModel + ?Sized,
{
    BackCalculator::new(model, BackcalcConfig::default())
        .back_calculate(scenario, noise_prior)
        .map(|outcome| outcome.moduli)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoreError;
    use crate::core::scenario::{ModulusJacobian, N_LAYERS};
    use crate::error::BackcalcError;
    use crate::forward::{ForwardError, ForwardResponse, ForwardResult};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    /// `u_j = (j + 1) / E_(j mod 5)` [mm]
    fn diagonal_model(scenario: &Scenario, gradient: bool) -> ForwardResult<ForwardResponse> {
        let e = scenario.moduli;
        let u = Deflections::from_fn(|j, _| (j + 1) as f64 / e[j % N_LAYERS]);
        let mut response = ForwardResponse::new(u);
        if gradient {
            response = response.with_jacobian(ModulusJacobian::from_fn(|j, i| {
                if i == j % N_LAYERS { -u[j] / e[i] } else { 0.0 }
            }));
        }
        Ok(response)
    }

    fn observed_scenario(truth: &Moduli) -> Scenario {
        let u_mm = Deflections::from_fn(|j, _| (j + 1) as f64 / truth[j % N_LAYERS]);
        Scenario::default()
            .with_moduli(*truth)
            .with_deflections_um(u_mm * 1e3)
    }

    #[test]
    fn test_initial_guess_uses_complete_scenario_moduli() -> TestResult {
        let prior = NoisePrior::default();
        let log_prior = LogPrior::from_bounds(&prior)?;
        let scenario = Scenario::default();

        let initial = initial_moduli(
            &scenario,
            &prior,
            &log_prior,
            InitialGuessStrategy::ScenarioOrCenter,
        );
        assert_eq!(initial, scenario.moduli);
        Ok(())
    }

    #[test]
    fn test_single_zero_modulus_replaces_whole_vector() -> TestResult {
        let prior = NoisePrior::default();
        let log_prior = LogPrior::from_bounds(&prior)?;
        let scenario =
            Scenario::default().with_moduli(Moduli::from([4000.0, 400.0, 0.0, 200.0, 100.0]));

        let initial = initial_moduli(
            &scenario,
            &prior,
            &log_prior,
            InitialGuessStrategy::ScenarioOrCenter,
        );
        for i in 0..N_LAYERS {
            let expected = (prior.modulus_lower[i] * prior.modulus_upper[i]).sqrt();
            assert!((initial[i] - expected).abs() < 1e-9 * expected);
        }
        Ok(())
    }

    #[test]
    fn test_physical_midpoint_strategy() -> TestResult {
        let prior = NoisePrior::default();
        let log_prior = LogPrior::from_bounds(&prior)?;

        let initial = initial_moduli(
            &Scenario::default(),
            &prior,
            &log_prior,
            InitialGuessStrategy::PhysicalMidpoint,
        );
        assert_eq!(initial[0], 13000.0);
        assert_eq!(initial[4], 82.5);
        Ok(())
    }

    #[test]
    fn test_default_config_tolerances() {
        let config = BackcalcConfig::default();
        assert_eq!(config.solver.max_function_evaluations, 100);
        assert_eq!(config.solver.cost_tolerance, 1e-9);
        assert_eq!(config.solver.parameter_tolerance, 1e-9);
        assert_eq!(config.solver.gradient_tolerance, 1e-9);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn test_noiseless_recovery() -> TestResult {
        let truth = Moduli::from([4000.0, 400.0, 300.0, 200.0, 100.0]);
        let scenario = observed_scenario(&truth).with_moduli(Moduli::zeros());
        let prior = NoisePrior::default().without_noise();

        let calculator = BackCalculator::new(&diagonal_model, BackcalcConfig::new());
        let outcome = calculator.back_calculate(&scenario, &prior)?;

        for i in 0..N_LAYERS {
            assert!(((outcome.moduli[i] - truth[i]) / truth[i]).abs() < 1e-4);
        }
        assert!(outcome.noise_report.deflection.is_unchanged());
        assert!(outcome.forward_calls >= outcome.forward_gradient_calls);
        Ok(())
    }

    #[test]
    fn test_out_of_bounds_guess_is_clipped() -> TestResult {
        let truth = Moduli::from([4000.0, 400.0, 300.0, 200.0, 100.0]);
        // Layer 1 starts above its upper bound of 25000 MPa.
        let scenario = observed_scenario(&truth)
            .with_moduli(Moduli::from([90000.0, 400.0, 300.0, 200.0, 100.0]));
        let prior = NoisePrior::default().without_noise();

        let calculator = BackCalculator::new(&diagonal_model, BackcalcConfig::new());
        let outcome = calculator.back_calculate(&scenario, &prior)?;

        assert_eq!(outcome.initial_moduli[0], 25000.0);
        for i in 0..N_LAYERS {
            assert!(outcome.moduli[i] >= prior.modulus_lower[i]);
            assert!(outcome.moduli[i] <= prior.modulus_upper[i]);
        }
        Ok(())
    }

    #[test]
    fn test_invalid_bounds_fail_before_any_forward_call() {
        let calls = std::cell::Cell::new(0);
        let model = |scenario: &Scenario, gradient: bool| -> ForwardResult<ForwardResponse> {
            calls.set(calls.get() + 1);
            diagonal_model(scenario, gradient)
        };
        let mut prior = NoisePrior::default().without_noise();
        prior.modulus_lower[2] = 700.0;

        let result = BackCalculator::new(&model, BackcalcConfig::new())
            .back_calculate(&observed_scenario(&Scenario::default().moduli), &prior);

        assert!(matches!(
            result,
            Err(BackcalcError::Core(CoreError::InvalidPriorBounds { layer: 3, .. }))
        ));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_zero_target_is_rejected() {
        let scenario = Scenario::default();
        let prior = NoisePrior::default().without_noise();

        let result = back_calculate(&scenario, &prior, &diagonal_model);
        assert!(matches!(
            result,
            Err(BackcalcError::Core(CoreError::NonPositiveDeflection { point: 1, .. }))
        ));
    }

    #[test]
    fn test_forward_failure_aborts() {
        let model = |_: &Scenario, _: bool| -> ForwardResult<ForwardResponse> {
            Err(ForwardError::Evaluation("solver diverged".to_string()))
        };
        let prior = NoisePrior::default().without_noise();

        let result = back_calculate(
            &observed_scenario(&Scenario::default().moduli),
            &prior,
            &model,
        );
        assert!(matches!(result, Err(BackcalcError::Forward(_))));
    }
}
