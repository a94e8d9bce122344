//! Trust Region Reflective optimization for bound-constrained nonlinear least squares.
//!
//! Solves
//!
//! ```text
//! min F(x) = ½||r(x)||²   subject to   lb ≤ x ≤ ub
//! ```
//!
//! where `r: ℝⁿ → ℝᵐ` is the residual vector function and either side of each bound may
//! be infinite.
//!
//! # Algorithm Overview
//!
//! Iterates are kept strictly inside the box. At every iteration the gradient `g = J^T·r`
//! is rescaled with the Coleman–Li vector `v`:
//!
//! ```text
//! v_i = ub_i - x_i   if g_i < 0 and ub_i finite
//! v_i = x_i - lb_i   if g_i > 0 and lb_i finite
//! v_i = 1            otherwise
//! ```
//!
//! so that components pushing against a nearby bound are damped. First-order optimality
//! for the bounded problem is `||v·g||∞ = 0`.
//!
//! ## Scaled Trust Region Subproblem
//!
//! With `d = √v`, `J_h = J·diag(d)`, `g_h = d·g` and `C = diag(g·dv)` (where `dv` is the
//! derivative of `v`), the quadratic model in scaled variables `p_h` is
//!
//! ```text
//! m(p_h) = ½·p_hᵀ(J_hᵀJ_h + C)·p_h + g_hᵀ·p_h,   ||p_h|| ≤ Δ
//! ```
//!
//! It is the least-squares model of the augmented system
//!
//! ```text
//! | J_h  |        | r |
//! | C^½  | p_h ≈ -| 0 |
//! ```
//!
//! and is minimized approximately with Powell's dog leg: the regularized Gauss-Newton
//! point `(J_augᵀJ_aug + μI)·p_gn = -g_h`, the Cauchy point along `-g_h`, and the
//! interpolation between them clipped to the trust region. The physical step is
//! `p = d·p_h`.
//!
//! ## Reflective Step Selection
//!
//! When `x + p` leaves the box three candidates are compared by model value:
//!
//! 1. **Truncated step**: `p` shortened to the first bound it hits, then scaled by
//!    `θ = max(0.995, 1 - ||v·g||∞)` to stay strictly interior
//! 2. **Reflected step**: from the hit point, continue along `p` with the hit components
//!    mirrored, up to the nearer of the box or the trust region boundary
//! 3. **Anti-gradient step**: the minimizer of the model along `-g_h` inside both regions
//!
//! ## Trust Region Management
//!
//! ```text
//! ρ = (actual reduction) / (predicted reduction)
//! ```
//!
//! **Poor step** (`ρ < 0.25`): `Δ ← 0.25·||p_h||`
//! **Good step on the boundary** (`ρ > 0.75` and `||p_h|| > 0.95·Δ`): `Δ ← 2·Δ`
//!
//! A trial point with non-finite residuals counts as a failed step and shrinks `Δ` the
//! same way. Steps are retried until the cost decreases or the evaluation budget runs out.
//!
//! ## Adaptive μ Regularization
//!
//! The Gauss-Newton point solves the damped system with μ increased ×`mu_increase_factor`
//! after a failed factorization and decreased after every accepted step, bounded by
//! `[min_mu, max_mu]`.
//!
//! # Convergence Criteria
//!
//! - **Gradient**: `||v·g||∞ < gradient_tolerance`
//! - **Cost**: `dF < cost_tolerance·F` with `ρ > 0.25`
//! - **Parameter**: `||dx|| < parameter_tolerance·(parameter_tolerance + ||x||)`
//! - **Evaluation cap**: residual evaluations reach `max_function_evaluations`
//! - **Timeout**: wall-clock limit, when configured
//!
//! # Examples
//!
//! ```
//! use pavement_backcalc::core::problem::{Bounds, LeastSquaresProblem};
//! use pavement_backcalc::error::BackcalcResult;
//! use pavement_backcalc::optimizer::{TrustRegionReflective, TrustRegionReflectiveConfig};
//! use nalgebra::{DMatrix, DVector, dvector};
//!
//! /// r(x) = x - 3, restricted to [0, 1].
//! struct Shifted;
//!
//! impl LeastSquaresProblem for Shifted {
//!     fn num_parameters(&self) -> usize { 1 }
//!     fn num_residuals(&self) -> usize { 1 }
//!     fn residuals(&mut self, x: &DVector<f64>) -> BackcalcResult<DVector<f64>> {
//!         Ok(dvector![x[0] - 3.0])
//!     }
//!     fn jacobian(&mut self, _x: &DVector<f64>) -> BackcalcResult<DMatrix<f64>> {
//!         Ok(DMatrix::from_element(1, 1, 1.0))
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bounds = Bounds::new(dvector![0.0], dvector![1.0])?;
//! let mut solver = TrustRegionReflective::with_config(TrustRegionReflectiveConfig::new());
//! let result = solver.minimize(&mut Shifted, &bounds, &dvector![0.5])?;
//! assert!((result.parameters[0] - 1.0).abs() < 1e-6);
//! # Ok(())
//! # }
//! ```

use crate::core::problem::{Bounds, LeastSquaresProblem};
use crate::error::BackcalcResult;
use crate::{linalg, optimizer};
use nalgebra::{DMatrix, DVector};
use std::{fmt, time};
use tracing::debug;

/// Relative offset used to place the initial point strictly inside the box.
const INITIAL_FEASIBILITY_STEP: f64 = 1e-10;

/// Summary statistics for the Trust Region Reflective optimization process.
#[derive(Debug, Clone)]
pub struct TrfSummary {
    /// Initial cost value
    pub initial_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Total number of outer iterations performed
    pub iterations: usize,
    /// Outer iterations that ended with an accepted step
    pub successful_steps: usize,
    /// Outer iterations that ended without a cost decrease
    pub unsuccessful_steps: usize,
    /// Final trust region radius
    pub final_trust_region_radius: f64,
    /// Maximum scaled gradient norm encountered
    pub max_gradient_norm: f64,
    /// Final scaled gradient norm
    pub final_gradient_norm: f64,
    /// Final parameter update norm
    pub final_parameter_update_norm: f64,
    /// Residual evaluations
    pub function_evaluations: usize,
    /// Jacobian evaluations
    pub jacobian_evaluations: usize,
    /// Total time elapsed
    pub total_time: time::Duration,
    /// Per-iteration statistics (collected at debug level only)
    pub iteration_history: Vec<IterationStats>,
    /// Convergence status
    pub convergence_status: optimizer::OptimizationStatus,
}

/// Per-iteration statistics for detailed logging.
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration number (0-indexed)
    pub iteration: usize,
    /// Cost at the end of this iteration
    pub cost: f64,
    /// Cost decrease achieved by this iteration
    pub cost_change: f64,
    /// Scaled gradient infinity norm at the start of this iteration
    pub gradient_norm: f64,
    /// L2 norm of the accepted step (0 if none)
    pub step_norm: f64,
    /// Ratio of actual to predicted reduction of the last trial step
    pub tr_ratio: f64,
    /// Trust region radius after the update
    pub tr_radius: f64,
    /// Residual evaluations so far
    pub function_evaluations: usize,
    /// Time taken for this iteration in milliseconds
    pub iter_time_ms: f64,
    /// Total elapsed time since optimization started in milliseconds
    pub total_time_ms: f64,
    /// Whether the iteration ended with an accepted step
    pub accepted: bool,
}

impl IterationStats {
    /// Print table header
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>11}  {:>11}  {:>5}  {:>11}  {:>13}  {:>6}",
            "iter",
            "cost",
            "cost_change",
            "|v*gradient|",
            "|step|",
            "tr_ratio",
            "tr_radius",
            "nfev",
            "iter_time",
            "total_time",
            "status"
        );
    }

    /// Print single iteration line with scientific notation
    pub fn print_line(&self) {
        let status = if self.accepted { "✓" } else { "✗" };

        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>11.2e}  {:>11.2e}  {:>5}  {:>9.2}ms  {:>11.2}ms  {:>6}",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_norm,
            self.step_norm,
            self.tr_ratio,
            self.tr_radius,
            self.function_evaluations,
            self.iter_time_ms,
            self.total_time_ms,
            status
        );
    }
}

impl fmt::Display for TrfSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Trust-Region-Reflective Final Result")?;

        if self.convergence_status.is_converged() {
            writeln!(f, "CONVERGED ({:?})", self.convergence_status)?;
        } else {
            writeln!(f, "NOT CONVERGED ({:?})", self.convergence_status)?;
        }

        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Total:              {}", self.iterations)?;
        writeln!(
            f,
            "  Successful steps:   {} ({:.1}%)",
            self.successful_steps,
            100.0 * self.successful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(
            f,
            "  Unsuccessful steps: {} ({:.1}%)",
            self.unsuccessful_steps,
            100.0 * self.unsuccessful_steps as f64 / self.iterations.max(1) as f64
        )?;
        writeln!(f, "  Function evals:     {}", self.function_evaluations)?;
        writeln!(f, "  Jacobian evals:     {}", self.jacobian_evaluations)?;
        writeln!(f)?;
        writeln!(f, "Trust Region:")?;
        writeln!(f, "  Final radius: {:.6e}", self.final_trust_region_radius)?;
        writeln!(f)?;
        writeln!(f, "Scaled Gradient:")?;
        writeln!(f, "  Max norm:   {:.2e}", self.max_gradient_norm)?;
        writeln!(f, "  Final norm: {:.2e}", self.final_gradient_norm)?;
        writeln!(f)?;
        writeln!(f, "Parameter Update:")?;
        writeln!(f, "  Final norm: {:.2e}", self.final_parameter_update_norm)?;
        writeln!(f)?;
        writeln!(f, "Performance:")?;
        writeln!(
            f,
            "  Total time:             {:.2}ms",
            self.total_time.as_secs_f64() * 1000.0
        )?;

        Ok(())
    }
}

/// Configuration parameters for the Trust Region Reflective optimizer.
///
/// # Builder Pattern
///
/// ```
/// use pavement_backcalc::optimizer::TrustRegionReflectiveConfig;
///
/// let config = TrustRegionReflectiveConfig::new()
///     .with_max_function_evaluations(200)
///     .with_cost_tolerance(1e-10)
///     .with_mu_params(1e-4, 1e-8, 1.0, 10.0);
/// assert!(config.validate().is_ok());
/// ```
///
/// # Convergence Criteria
///
/// The optimizer terminates when ANY of the following conditions is met:
///
/// - **Cost tolerance**: `dF < cost_tolerance * F` on a step with `ρ > 0.25`
/// - **Parameter tolerance**: `||dx|| < parameter_tolerance * (parameter_tolerance + ||x||)`
/// - **Gradient tolerance**: `||v·g||∞ < gradient_tolerance`
/// - **Evaluation cap**: residual evaluations reach `max_function_evaluations`
/// - **Timeout**: `elapsed_time >= timeout`
#[derive(Debug, Clone)]
pub struct TrustRegionReflectiveConfig {
    /// Type of linear solver for the Gauss-Newton point
    pub linear_solver_type: linalg::LinearSolverType,
    /// Maximum number of residual evaluations, including the initial one
    pub max_function_evaluations: usize,
    /// Relative cost-decrease tolerance (ftol)
    pub cost_tolerance: f64,
    /// Relative step tolerance (xtol)
    pub parameter_tolerance: f64,
    /// Scaled gradient tolerance (gtol)
    pub gradient_tolerance: f64,
    /// Timeout duration
    pub timeout: Option<time::Duration>,
    /// Initial trust region radius; derived from the initial point when `None`
    pub initial_trust_region_radius: Option<f64>,

    /// Initial mu regularization parameter for the Gauss-Newton point
    pub initial_mu: f64,
    /// Minimum mu regularization parameter
    pub min_mu: f64,
    /// Maximum mu regularization parameter
    pub max_mu: f64,
    /// Factor to increase mu when the linear solver fails
    pub mu_increase_factor: f64,
}

impl Default for TrustRegionReflectiveConfig {
    fn default() -> Self {
        Self {
            linear_solver_type: linalg::LinearSolverType::default(),
            max_function_evaluations: 100,
            cost_tolerance: 1e-8,
            parameter_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            timeout: None,
            initial_trust_region_radius: None,

            initial_mu: 1e-4,
            min_mu: 1e-8,
            max_mu: 1.0,
            mu_increase_factor: 10.0,
        }
    }
}

impl TrustRegionReflectiveConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the linear solver type
    pub fn with_linear_solver_type(mut self, linear_solver_type: linalg::LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    /// Set the residual evaluation budget
    pub fn with_max_function_evaluations(mut self, max_function_evaluations: usize) -> Self {
        self.max_function_evaluations = max_function_evaluations;
        self
    }

    /// Set the cost tolerance
    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    /// Set the parameter tolerance
    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    /// Set the gradient tolerance
    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    /// Set the timeout duration
    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the initial trust region radius
    pub fn with_initial_trust_region_radius(mut self, radius: f64) -> Self {
        self.initial_trust_region_radius = Some(radius);
        self
    }

    /// Set adaptive mu regularization parameters
    pub fn with_mu_params(
        mut self,
        initial_mu: f64,
        min_mu: f64,
        max_mu: f64,
        increase_factor: f64,
    ) -> Self {
        self.initial_mu = initial_mu;
        self.min_mu = min_mu;
        self.max_mu = max_mu;
        self.mu_increase_factor = increase_factor;
        self
    }

    /// Reject non-positive tolerances, an empty evaluation budget or inconsistent mu
    /// parameters.
    pub fn validate(&self) -> optimizer::OptimizerResult<()> {
        let tolerances = [
            ("cost_tolerance", self.cost_tolerance),
            ("parameter_tolerance", self.parameter_tolerance),
            ("gradient_tolerance", self.gradient_tolerance),
        ];
        for (name, value) in tolerances {
            if !(value.is_finite() && value > 0.0) {
                return Err(optimizer::OptimizerError::InvalidParameters(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                ))
                .log());
            }
        }

        if self.max_function_evaluations == 0 {
            return Err(optimizer::OptimizerError::InvalidParameters(
                "max_function_evaluations must be at least 1".to_string(),
            )
            .log());
        }

        if let Some(radius) = self.initial_trust_region_radius
            && !(radius.is_finite() && radius > 0.0)
        {
            return Err(optimizer::OptimizerError::InvalidParameters(format!(
                "initial trust region radius must be positive, got {}",
                radius
            ))
            .log());
        }

        if !(self.min_mu > 0.0
            && self.min_mu <= self.initial_mu
            && self.initial_mu <= self.max_mu
            && self.max_mu.is_finite()
            && self.mu_increase_factor > 1.0)
        {
            return Err(optimizer::OptimizerError::InvalidParameters(format!(
                "mu parameters must satisfy 0 < min ({}) <= initial ({}) <= max ({}) and factor ({}) > 1",
                self.min_mu, self.initial_mu, self.max_mu, self.mu_increase_factor
            ))
            .log());
        }

        Ok(())
    }

    /// Print configuration parameters (debug level logging)
    pub fn print_configuration(&self) {
        debug!(
            "Configuration:\n  Solver:        Trust-Region-Reflective\n  Linear solver: {}\n\nConvergence Criteria:\n  Max function evals:  {}\n  Cost tolerance:      {:.2e}\n  Parameter tolerance: {:.2e}\n  Gradient tolerance:  {:.2e}\n  Timeout:             {:?}\n\nTrust Region:\n  Initial radius:      {:?}\n\nRegularization:\n  Initial mu:          {:.2e}\n  Mu range:            [{:.2e}, {:.2e}]\n  Mu increase factor:  {:.2}",
            self.linear_solver_type,
            self.max_function_evaluations,
            self.cost_tolerance,
            self.parameter_tolerance,
            self.gradient_tolerance,
            self.timeout,
            self.initial_trust_region_radius,
            self.initial_mu,
            self.min_mu,
            self.max_mu,
            self.mu_increase_factor,
        );
    }
}

/// A candidate step in physical and scaled variables.
struct SelectedStep {
    step: DVector<f64>,
    scaled_step: DVector<f64>,
    predicted_reduction: f64,
}

/// Trust Region Reflective solver for bound-constrained nonlinear least squares.
///
/// # Algorithm
///
/// At each iteration k:
/// 1. Compute the Coleman–Li vector `v` and the scaled gradient norm `||v·g||∞`
/// 2. Build the scaled, augmented system `[J·diag(√v); C^½]`
/// 3. Solve the trust region subproblem with the dog leg method
/// 4. Select among truncated, reflected and anti-gradient steps
/// 5. Evaluate the residuals at the strictly feasible trial point
/// 6. Update the trust region radius from `ρ`; retry until the cost decreases
/// 7. On acceptance, evaluate the Jacobian at the new point
pub struct TrustRegionReflective {
    config: TrustRegionReflectiveConfig,
    observers: optimizer::OptObserverVec,
    mu: f64,
}

impl Default for TrustRegionReflective {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustRegionReflective {
    /// Create a new solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(TrustRegionReflectiveConfig::default())
    }

    /// Create a new solver with the given configuration.
    pub fn with_config(config: TrustRegionReflectiveConfig) -> Self {
        Self {
            mu: config.initial_mu,
            config,
            observers: optimizer::OptObserverVec::new(),
        }
    }

    pub fn config(&self) -> &TrustRegionReflectiveConfig {
        &self.config
    }

    /// Add an observer notified after every outer iteration.
    pub fn add_observer(&mut self, observer: impl optimizer::OptObserver + 'static) {
        self.observers.add(observer);
    }

    /// Check shapes and feasibility before the first evaluation.
    fn validate_problem<P>(
        &self,
        problem: &P,
        bounds: &Bounds,
        x0: &DVector<f64>,
    ) -> optimizer::OptimizerResult<()>
    where
        P: LeastSquaresProblem + ?Sized,
    {
        let n = problem.num_parameters();
        if n == 0 {
            return Err(optimizer::OptimizerError::EmptyProblem.log());
        }
        if x0.len() != n || bounds.dim() != n {
            return Err(optimizer::OptimizerError::InvalidParameters(format!(
                "problem has {} parameters, initial point has {}, bounds have {}",
                n,
                x0.len(),
                bounds.dim()
            ))
            .log());
        }
        if x0.iter().any(|v| !v.is_finite()) {
            return Err(optimizer::OptimizerError::InvalidParameters(
                "initial point contains NaN or Inf".to_string(),
            )
            .log());
        }
        if !bounds.contains(x0) {
            return Err(optimizer::OptimizerError::InvalidParameters(
                "initial point lies outside the bounds".to_string(),
            )
            .log());
        }
        Ok(())
    }

    /// Evaluate the Jacobian and check its shape.
    fn evaluate_jacobian<P>(
        problem: &mut P,
        x: &DVector<f64>,
        num_residuals: usize,
    ) -> BackcalcResult<DMatrix<f64>>
    where
        P: LeastSquaresProblem + ?Sized,
    {
        let jacobian = problem.jacobian(x)?;
        if jacobian.shape() != (num_residuals, x.len()) {
            return Err(optimizer::OptimizerError::InvalidParameters(format!(
                "Jacobian is {}x{}, expected {}x{}",
                jacobian.nrows(),
                jacobian.ncols(),
                num_residuals,
                x.len()
            ))
            .log()
            .into());
        }
        Ok(jacobian)
    }

    /// Approximately solve `min ||J_aug·p + r_aug||` s.t. `||p|| ≤ Δ` with Powell's dog leg.
    fn solve_trust_region_subproblem(
        &mut self,
        linear_solver: &mut dyn linalg::DenseLinearSolver,
        residuals: &DVector<f64>,
        jacobian: &DMatrix<f64>,
        delta: f64,
    ) -> optimizer::OptimizerResult<DVector<f64>> {
        let mut gauss_newton_step = None;
        let mut mu_attempts = 0;

        while mu_attempts < 10 && self.mu <= self.config.max_mu {
            match linear_solver.solve_augmented_equation(residuals, jacobian, self.mu) {
                Ok(step) => {
                    gauss_newton_step = Some(step);
                    break;
                }
                Err(e) => {
                    debug!("Gauss-Newton solve failed at mu = {:.2e}: {}", self.mu, e);
                    self.mu = (self.mu * self.config.mu_increase_factor).min(self.config.max_mu);
                    mu_attempts += 1;
                }
            }
        }

        let gauss_newton_step = gauss_newton_step.ok_or_else(|| {
            optimizer::OptimizerError::LinearSolveFailed(
                "Linear solver failed to solve the scaled system".to_string(),
            )
            .log()
        })?;

        let (gradient, hessian) = match (linear_solver.get_gradient(), linear_solver.get_hessian())
        {
            (Some(gradient), Some(hessian)) => (gradient, hessian),
            _ => {
                return Err(optimizer::OptimizerError::LinearSolveFailed(
                    "Linear solver did not cache the normal equations".to_string(),
                )
                .log());
            }
        };

        let cauchy_point = compute_cauchy_point(gradient, hessian);
        Ok(compute_dog_leg_step(
            gradient,
            &cauchy_point,
            &gauss_newton_step,
            delta,
        ))
    }

    /// Minimize `½||r(x)||²` over `bounds`, starting from `x0`.
    ///
    /// `x0` must lie inside the closed box; it is moved strictly inside before the first
    /// evaluation. Reaching the evaluation cap or the timeout is reported through the
    /// result status, not as an error.
    pub fn minimize<P>(
        &mut self,
        problem: &mut P,
        bounds: &Bounds,
        x0: &DVector<f64>,
    ) -> BackcalcResult<optimizer::SolverResult<DVector<f64>>>
    where
        P: LeastSquaresProblem + ?Sized,
    {
        self.config.validate()?;
        self.validate_problem(problem, bounds, x0)?;

        let start_time = time::Instant::now();
        let max_nfev = self.config.max_function_evaluations;
        self.mu = self.config.initial_mu;
        let mut linear_solver = linalg::create_linear_solver(self.config.linear_solver_type);

        let mut x = bounds.make_strictly_feasible(x0, INITIAL_FEASIBILITY_STEP);
        let mut residuals = problem.residuals(&x)?;
        let mut nfev = 1;
        if residuals.iter().any(|v| !v.is_finite()) {
            return Err(optimizer::OptimizerError::NumericalInstability(
                "residuals at the initial point contain NaN or Inf".to_string(),
            )
            .log()
            .into());
        }
        let m = residuals.len();

        let mut jacobian = Self::evaluate_jacobian(problem, &x, m)?;
        let mut njev = 1;
        if jacobian.iter().any(|v| !v.is_finite()) {
            return Err(optimizer::OptimizerError::NumericalInstability(
                "Jacobian at the initial point contains NaN or Inf".to_string(),
            )
            .log()
            .into());
        }

        let mut cost = optimizer::compute_cost(&residuals);
        let initial_cost = cost;
        let mut gradient = jacobian.transpose() * &residuals;

        let mut delta = match self.config.initial_trust_region_radius {
            Some(radius) => radius,
            None => {
                let (v, _) = coleman_li_scaling(&x, &gradient, bounds);
                let radius = x.component_div(&v.map(f64::sqrt)).norm();
                if radius > 0.0 && radius.is_finite() {
                    radius
                } else {
                    1.0
                }
            }
        };

        let mut status: Option<optimizer::OptimizationStatus> = None;
        let mut iteration = 0;
        let mut successful_steps = 0;
        let mut unsuccessful_steps = 0;
        let mut step_norm = 0.0;
        let mut gradient_norm;
        let mut max_gradient_norm: f64 = 0.0;
        let mut ratio = 0.0;

        let collect_stats = tracing::enabled!(tracing::Level::DEBUG);
        let mut iteration_stats = Vec::new();
        if collect_stats {
            self.config.print_configuration();
            IterationStats::print_header();
        }

        let final_status = loop {
            let iter_start = time::Instant::now();

            let (v, dv) = coleman_li_scaling(&x, &gradient, bounds);
            gradient_norm = gradient.component_mul(&v).amax();
            max_gradient_norm = max_gradient_norm.max(gradient_norm);

            if status.is_none() && gradient_norm < self.config.gradient_tolerance {
                status = Some(optimizer::OptimizationStatus::GradientToleranceReached);
            }
            if status.is_none() && nfev >= max_nfev {
                status = Some(optimizer::OptimizationStatus::MaxFunctionEvaluationsReached);
            }
            if status.is_none()
                && let Some(timeout) = self.config.timeout
                && start_time.elapsed() >= timeout
            {
                status = Some(optimizer::OptimizationStatus::Timeout);
            }
            if let Some(status) = status {
                break status;
            }

            let d = v.map(f64::sqrt);
            let diag_h = gradient.component_mul(&dv);
            let g_h = d.component_mul(&gradient);
            let mut j_h = jacobian.clone();
            for (i, mut column) in j_h.column_iter_mut().enumerate() {
                column *= d[i];
            }
            let (j_augmented, r_augmented) = augment_system(&j_h, &diag_h, &residuals);
            let theta = (1.0 - gradient_norm).max(0.995);

            let cost_before = cost;
            let mut actual_reduction = -1.0;
            let mut candidate = None;

            while actual_reduction <= 0.0 && nfev < max_nfev {
                let p_h = self.solve_trust_region_subproblem(
                    linear_solver.as_mut(),
                    &r_augmented,
                    &j_augmented,
                    delta,
                )?;
                let p = d.component_mul(&p_h);
                let selected =
                    select_step(&x, &j_h, &diag_h, &g_h, p, p_h, &d, delta, bounds, theta);

                let x_new = bounds.make_strictly_feasible(&(&x + &selected.step), 0.0);
                let residuals_new = problem.residuals(&x_new)?;
                nfev += 1;

                let step_h_norm = selected.scaled_step.norm();
                if residuals_new.iter().any(|v| !v.is_finite()) {
                    debug!("Non-finite residuals at trial point, shrinking trust region");
                    delta = 0.25 * step_h_norm;
                    continue;
                }

                let cost_new = optimizer::compute_cost(&residuals_new);
                actual_reduction = cost - cost_new;
                let (delta_new, step_ratio) = update_trust_region_radius(
                    delta,
                    actual_reduction,
                    selected.predicted_reduction,
                    step_h_norm,
                    step_h_norm > 0.95 * delta,
                );
                ratio = step_ratio;
                step_norm = selected.step.norm();

                status = check_termination(
                    actual_reduction,
                    cost,
                    step_norm,
                    x.norm(),
                    ratio,
                    self.config.cost_tolerance,
                    self.config.parameter_tolerance,
                );
                candidate = Some((x_new, residuals_new, cost_new));
                if status.is_some() {
                    break;
                }
                delta = delta_new;
            }

            let accepted = actual_reduction > 0.0;
            if accepted && let Some((x_new, residuals_new, cost_new)) = candidate {
                x = x_new;
                residuals = residuals_new;
                cost = cost_new;

                jacobian = Self::evaluate_jacobian(problem, &x, m)?;
                njev += 1;
                if jacobian.iter().any(|v| !v.is_finite()) {
                    status = Some(optimizer::OptimizationStatus::InvalidNumericalValues);
                } else {
                    gradient = jacobian.transpose() * &residuals;
                }

                self.mu = (self.mu / (0.5 * self.config.mu_increase_factor)).max(self.config.min_mu);
                successful_steps += 1;
            } else {
                step_norm = 0.0;
                unsuccessful_steps += 1;
            }

            if collect_stats {
                let stats = IterationStats {
                    iteration,
                    cost,
                    cost_change: cost_before - cost,
                    gradient_norm,
                    step_norm,
                    tr_ratio: ratio,
                    tr_radius: delta,
                    function_evaluations: nfev,
                    iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                    total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                    accepted,
                };
                stats.print_line();
                iteration_stats.push(stats);
            }

            self.observers.set_iteration_metrics(
                cost,
                gradient_norm,
                Some(delta),
                step_norm,
                Some(ratio),
            );
            if !self.observers.is_empty() {
                self.observers.set_matrix_data(
                    linear_solver.get_hessian().cloned(),
                    linear_solver.get_gradient().cloned(),
                );
            }
            self.observers.notify(&x, iteration);

            iteration += 1;
        };

        let elapsed = start_time.elapsed();
        let summary = TrfSummary {
            initial_cost,
            final_cost: cost,
            iterations: iteration,
            successful_steps,
            unsuccessful_steps,
            final_trust_region_radius: delta,
            max_gradient_norm,
            final_gradient_norm: gradient_norm,
            final_parameter_update_norm: step_norm,
            function_evaluations: nfev,
            jacobian_evaluations: njev,
            total_time: elapsed,
            iteration_history: iteration_stats,
            convergence_status: final_status,
        };
        if collect_stats {
            debug!("{}", summary);
        }

        Ok(optimizer::SolverResult {
            parameters: x,
            status: final_status,
            initial_cost,
            final_cost: cost,
            iterations: iteration,
            elapsed_time: elapsed,
            convergence_info: Some(optimizer::ConvergenceInfo {
                final_gradient_norm: gradient_norm,
                final_parameter_update_norm: step_norm,
                cost_evaluations: nfev,
                jacobian_evaluations: njev,
            }),
        })
    }
}

/// Coleman–Li scaling vector `v` and its derivative `dv`.
fn coleman_li_scaling(
    x: &DVector<f64>,
    gradient: &DVector<f64>,
    bounds: &Bounds,
) -> (DVector<f64>, DVector<f64>) {
    let n = x.len();
    let mut v = DVector::from_element(n, 1.0);
    let mut dv = DVector::zeros(n);
    let (lower, upper) = (bounds.lower(), bounds.upper());

    for i in 0..n {
        if gradient[i] < 0.0 && upper[i].is_finite() {
            v[i] = upper[i] - x[i];
            dv[i] = -1.0;
        } else if gradient[i] > 0.0 && lower[i].is_finite() {
            v[i] = x[i] - lower[i];
            dv[i] = 1.0;
        }
    }
    (v, dv)
}

/// Stack `[J_h; diag(√diag_h)]` and `[r; 0]`.
fn augment_system(
    j_h: &DMatrix<f64>,
    diag_h: &DVector<f64>,
    residuals: &DVector<f64>,
) -> (DMatrix<f64>, DVector<f64>) {
    let (m, n) = j_h.shape();
    let mut j_augmented = DMatrix::zeros(m + n, n);
    j_augmented.view_mut((0, 0), (m, n)).copy_from(j_h);
    for i in 0..n {
        j_augmented[(m + i, i)] = diag_h[i].sqrt();
    }
    let mut r_augmented = DVector::zeros(m + n);
    r_augmented.rows_mut(0, m).copy_from(residuals);
    (j_augmented, r_augmented)
}

/// Optimal step along the steepest descent direction: `p_c = -(g^T·g / g^T·H·g)·g`.
fn compute_cauchy_point(gradient: &DVector<f64>, hessian: &DMatrix<f64>) -> DVector<f64> {
    let g_norm_sq = gradient.norm_squared();
    let g_h_g = gradient.dot(&(hessian * gradient));
    let alpha = if g_h_g.abs() > 1e-15 {
        g_norm_sq / g_h_g
    } else {
        1.0
    };
    gradient * -alpha
}

/// Powell's dog leg between the Cauchy point and the Gauss-Newton point.
fn compute_dog_leg_step(
    gradient: &DVector<f64>,
    cauchy_point: &DVector<f64>,
    h_gn: &DVector<f64>,
    delta: f64,
) -> DVector<f64> {
    let gn_norm = h_gn.norm();
    let cauchy_norm = cauchy_point.norm();
    let gradient_norm = gradient.norm();

    // Full Gauss-Newton step fits in the trust region
    if gn_norm <= delta || gradient_norm == 0.0 {
        return h_gn.clone();
    }

    // Even the Cauchy point is outside: steepest descent to the boundary
    if cauchy_norm >= delta {
        return gradient * (-delta / gradient_norm);
    }

    // ||p_c + β·(h_gn - p_c)||² = Δ², solved without cancellation
    let v = h_gn - cauchy_point;
    let a = v.norm_squared();
    let b = cauchy_point.dot(&v);
    let c = cauchy_norm * cauchy_norm - delta * delta;
    let d_squared = b * b - a * c;

    let beta = if d_squared < 0.0 || a.abs() < 1e-15 {
        1.0
    } else {
        let d = d_squared.sqrt();
        if b <= 0.0 { (-b + d) / a } else { -c / (b + d) }
    };

    cauchy_point + v * beta.clamp(0.0, 1.0)
}

/// Largest `t` keeping `x + t·s` inside the box, and which components hit first
/// (`±1` for the side, `0` otherwise).
fn step_size_to_bound(x: &DVector<f64>, s: &DVector<f64>, bounds: &Bounds) -> (f64, DVector<f64>) {
    let n = x.len();
    let (lower, upper) = (bounds.lower(), bounds.upper());
    let steps = DVector::from_fn(n, |i, _| {
        if s[i] == 0.0 {
            f64::INFINITY
        } else {
            ((lower[i] - x[i]) / s[i]).max((upper[i] - x[i]) / s[i])
        }
    });
    let min_step = steps.min();
    let hits = DVector::from_fn(n, |i, _| {
        if s[i] != 0.0 && steps[i] == min_step {
            s[i].signum()
        } else {
            0.0
        }
    });
    (min_step, hits)
}

/// Both roots `t` of `||x + t·s|| = Δ`, in increasing order.
fn intersect_trust_region(x: &DVector<f64>, s: &DVector<f64>, delta: f64) -> (f64, f64) {
    let a = s.norm_squared();
    if a == 0.0 {
        return (0.0, 0.0);
    }
    let b = x.dot(s);
    // x is inside the region up to rounding
    let c = (x.norm_squared() - delta * delta).min(0.0);
    let d = (b * b - a * c).max(0.0).sqrt();
    let q = -(b + d.copysign(b));
    if q == 0.0 {
        return (0.0, 0.0);
    }
    let (t1, t2) = (q / a, c / q);
    if t1 < t2 { (t1, t2) } else { (t2, t1) }
}

/// Coefficients of the model along `s0 + t·s`: `a·t² + b·t + c`.
fn build_quadratic_1d(
    j: &DMatrix<f64>,
    g: &DVector<f64>,
    s: &DVector<f64>,
    diag: &DVector<f64>,
    s0: Option<&DVector<f64>>,
) -> (f64, f64, f64) {
    let v = j * s;
    let a = 0.5 * (v.norm_squared() + s.component_mul(diag).dot(s));
    let mut b = g.dot(s);
    let mut c = 0.0;

    if let Some(s0) = s0 {
        let u = j * s0;
        b += u.dot(&v) + s0.component_mul(diag).dot(s);
        c = 0.5 * (u.norm_squared() + s0.component_mul(diag).dot(s0)) + g.dot(s0);
    }
    (a, b, c)
}

/// Minimize `a·t² + b·t + c` over `[lb, ub]`.
fn minimize_quadratic_1d(a: f64, b: f64, lb: f64, ub: f64, c: f64) -> (f64, f64) {
    let mut candidates = vec![lb, ub];
    if a != 0.0 {
        let extremum = -0.5 * b / a;
        if lb < extremum && extremum < ub {
            candidates.push(extremum);
        }
    }
    candidates
        .into_iter()
        .map(|t| (t, t * (a * t + b) + c))
        .fold((lb, f64::INFINITY), |best, candidate| {
            if candidate.1 < best.1 { candidate } else { best }
        })
}

/// Model value `½(||J·s||² + sᵀ·diag·s) + gᵀ·s`.
fn evaluate_quadratic(
    j: &DMatrix<f64>,
    g: &DVector<f64>,
    s: &DVector<f64>,
    diag: &DVector<f64>,
) -> f64 {
    let js = j * s;
    0.5 * (js.norm_squared() + s.component_mul(diag).dot(s)) + g.dot(s)
}

/// Pick the best of the truncated, reflected and anti-gradient steps.
#[allow(clippy::too_many_arguments)]
fn select_step(
    x: &DVector<f64>,
    j_h: &DMatrix<f64>,
    diag_h: &DVector<f64>,
    g_h: &DVector<f64>,
    mut p: DVector<f64>,
    mut p_h: DVector<f64>,
    d: &DVector<f64>,
    delta: f64,
    bounds: &Bounds,
    theta: f64,
) -> SelectedStep {
    if bounds.contains(&(x + &p)) {
        let p_value = evaluate_quadratic(j_h, g_h, &p_h, diag_h);
        return SelectedStep {
            step: p,
            scaled_step: p_h,
            predicted_reduction: -p_value,
        };
    }

    let (p_stride, hits) = step_size_to_bound(x, &p, bounds);

    // Reflected direction
    let mut r_h = p_h.clone();
    for i in 0..r_h.len() {
        if hits[i] != 0.0 {
            r_h[i] = -r_h[i];
        }
    }
    let r = d.component_mul(&r_h);

    // Restrict the trust region step so that it stops on the bound
    p *= p_stride;
    p_h *= p_stride;
    let x_on_bound = x + &p;

    let (_, to_tr) = intersect_trust_region(&p_h, &r_h, delta);
    let (to_bound, _) = step_size_to_bound(&x_on_bound, &r, bounds);

    let r_stride = to_bound.min(to_tr);
    let (r_stride_l, r_stride_u) = if r_stride > 0.0 {
        let lower = (1.0 - theta) * p_stride / r_stride;
        let upper = if r_stride == to_bound {
            theta * to_bound
        } else {
            to_tr
        };
        (lower, upper)
    } else {
        (0.0, -1.0)
    };

    let reflected = if r_stride_l <= r_stride_u {
        let (a, b, c) = build_quadratic_1d(j_h, g_h, &r_h, diag_h, Some(&p_h));
        let (t, value) = minimize_quadratic_1d(a, b, r_stride_l, r_stride_u, c);
        let r_h = &p_h + r_h * t;
        let r = d.component_mul(&r_h);
        Some((r, r_h, value))
    } else {
        None
    };

    // Pull the truncated step strictly inside
    p *= theta;
    p_h *= theta;
    let p_value = evaluate_quadratic(j_h, g_h, &p_h, diag_h);

    // Anti-gradient step
    let ag_h = -g_h;
    let ag = d.component_mul(&ag_h);
    let ag_norm = ag_h.norm();
    let anti_gradient = if ag_norm > 0.0 {
        let to_tr = delta / ag_norm;
        let (to_bound, _) = step_size_to_bound(x, &ag, bounds);
        let ag_stride = if to_bound < to_tr {
            theta * to_bound
        } else {
            to_tr
        };
        let (a, b, _) = build_quadratic_1d(j_h, g_h, &ag_h, diag_h, None);
        let (t, value) = minimize_quadratic_1d(a, b, 0.0, ag_stride, 0.0);
        Some((ag * t, ag_h * t, value))
    } else {
        None
    };

    let r_value = reflected.as_ref().map_or(f64::INFINITY, |r| r.2);
    let ag_value = anti_gradient.as_ref().map_or(f64::INFINITY, |ag| ag.2);

    if p_value < r_value && p_value < ag_value {
        SelectedStep {
            step: p,
            scaled_step: p_h,
            predicted_reduction: -p_value,
        }
    } else if let Some((r, r_h, value)) = reflected
        && r_value < p_value
        && r_value < ag_value
    {
        SelectedStep {
            step: r,
            scaled_step: r_h,
            predicted_reduction: -value,
        }
    } else if let Some((ag, ag_h, value)) = anti_gradient {
        SelectedStep {
            step: ag,
            scaled_step: ag_h,
            predicted_reduction: -value,
        }
    } else {
        SelectedStep {
            step: p,
            scaled_step: p_h,
            predicted_reduction: -p_value,
        }
    }
}

/// New radius and reduction ratio for a trial step.
fn update_trust_region_radius(
    delta: f64,
    actual_reduction: f64,
    predicted_reduction: f64,
    step_norm: f64,
    bound_hit: bool,
) -> (f64, f64) {
    let ratio = if predicted_reduction > 0.0 {
        actual_reduction / predicted_reduction
    } else if predicted_reduction == 0.0 && actual_reduction == 0.0 {
        1.0
    } else {
        0.0
    };

    let delta = if ratio < 0.25 {
        0.25 * step_norm
    } else if ratio > 0.75 && bound_hit {
        delta * 2.0
    } else {
        delta
    };
    (delta, ratio)
}

/// Cost and parameter tolerance tests for a trial step.
fn check_termination(
    cost_reduction: f64,
    cost: f64,
    step_norm: f64,
    x_norm: f64,
    ratio: f64,
    cost_tolerance: f64,
    parameter_tolerance: f64,
) -> Option<optimizer::OptimizationStatus> {
    let cost_satisfied = cost_reduction < cost_tolerance * cost && ratio > 0.25;
    let parameter_satisfied =
        step_norm < parameter_tolerance * (parameter_tolerance + x_norm);

    match (cost_satisfied, parameter_satisfied) {
        (true, true) => Some(optimizer::OptimizationStatus::CostAndParameterToleranceReached),
        (true, false) => Some(optimizer::OptimizationStatus::CostToleranceReached),
        (false, true) => Some(optimizer::OptimizationStatus::ParameterToleranceReached),
        (false, false) => None,
    }
}
