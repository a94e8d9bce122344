//! Bounded nonlinear least-squares optimization.
//!
//! Provides the trust-region-reflective solver used to back-calculate layer moduli:
//! - [`TrustRegionReflective`]: Coleman–Li scaled trust region with reflective bound
//!   handling and a dog-leg subproblem

use crate::linalg;
use nalgebra::DVector;
use std::{
    fmt,
    fmt::{Display, Formatter},
    time,
};
use thiserror::Error;
use tracing::error;

pub mod trust_region_reflective;

pub use trust_region_reflective::{TrustRegionReflective, TrustRegionReflectiveConfig};

// Re-export observer types from the observers module
pub use crate::observers::{OptObserver, OptObserverVec};

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Linear system solve failed during optimization
    #[error("Linear system solve failed: {0}")]
    LinearSolveFailed(String),

    /// Invalid optimization parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Numerical instability detected (NaN, Inf in cost, gradient, or parameters)
    #[error("Numerical instability detected: {0}")]
    NumericalInstability(String),

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] linalg::LinAlgError),

    /// Problem has no parameters to optimize
    #[error("Problem has no parameters to optimize")]
    EmptyProblem,
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| OptimizerError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Detailed convergence information.
#[derive(Debug, Clone)]
pub struct ConvergenceInfo {
    /// Final scaled gradient infinity norm
    pub final_gradient_norm: f64,
    /// Final parameter update norm
    pub final_parameter_update_norm: f64,
    /// Residual evaluation count
    pub cost_evaluations: usize,
    /// Jacobian evaluation count
    pub jacobian_evaluations: usize,
}

impl Display for ConvergenceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Final gradient norm: {:.2e}, Final parameter update norm: {:.2e}, Cost evaluations: {}, Jacobian evaluations: {}",
            self.final_gradient_norm,
            self.final_parameter_update_norm,
            self.cost_evaluations,
            self.jacobian_evaluations
        )
    }
}

/// Status of an optimization process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// Cost function tolerance reached
    CostToleranceReached,
    /// Parameter tolerance reached
    ParameterToleranceReached,
    /// Both cost and parameter tolerances reached on the same step
    CostAndParameterToleranceReached,
    /// Gradient tolerance reached
    GradientToleranceReached,
    /// Evaluation budget exhausted before any tolerance was met
    MaxFunctionEvaluationsReached,
    /// Timeout reached
    Timeout,
    /// NaN or Inf detected in the Jacobian or cost
    InvalidNumericalValues,
}

impl OptimizationStatus {
    /// Whether a tolerance-based termination criterion was met.
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            OptimizationStatus::CostToleranceReached
                | OptimizationStatus::ParameterToleranceReached
                | OptimizationStatus::CostAndParameterToleranceReached
                | OptimizationStatus::GradientToleranceReached
        )
    }
}

impl Display for OptimizationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::CostToleranceReached => write!(f, "Cost tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::CostAndParameterToleranceReached => {
                write!(f, "Cost and parameter tolerances reached")
            }
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::MaxFunctionEvaluationsReached => {
                write!(f, "Maximum function evaluations reached")
            }
            OptimizationStatus::Timeout => write!(f, "Timeout"),
            OptimizationStatus::InvalidNumericalValues => {
                write!(f, "Invalid numerical values (NaN/Inf) detected")
            }
        }
    }
}

/// Result of a solver execution.
#[derive(Debug, Clone)]
pub struct SolverResult<T> {
    /// Final parameters
    pub parameters: T,
    /// Final optimization status
    pub status: OptimizationStatus,
    /// Initial cost value
    pub initial_cost: f64,
    /// Final cost value
    pub final_cost: f64,
    /// Number of outer iterations performed
    pub iterations: usize,
    /// Total time elapsed
    pub elapsed_time: time::Duration,
    /// Convergence statistics
    pub convergence_info: Option<ConvergenceInfo>,
}

impl<T> SolverResult<T> {
    /// Shorthand for `status.is_converged()`.
    pub fn converged(&self) -> bool {
        self.status.is_converged()
    }
}

/// Least-squares cost `½‖r‖²`.
pub fn compute_cost(residual: &DVector<f64>) -> f64 {
    0.5 * residual.norm_squared()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_cost() {
        let residual = DVector::from_vec(vec![3.0, 4.0]);
        assert_eq!(compute_cost(&residual), 12.5);
    }

    #[test]
    fn test_converged_statuses() {
        assert!(OptimizationStatus::CostToleranceReached.is_converged());
        assert!(OptimizationStatus::CostAndParameterToleranceReached.is_converged());
        assert!(OptimizationStatus::GradientToleranceReached.is_converged());
        assert!(!OptimizationStatus::MaxFunctionEvaluationsReached.is_converged());
        assert!(!OptimizationStatus::Timeout.is_converged());
        assert!(!OptimizationStatus::InvalidNumericalValues.is_converged());
    }

    #[test]
    fn test_linalg_error_converts() {
        let error = OptimizerError::from(linalg::LinAlgError::SingularMatrix);
        assert!(error.to_string().contains("Singular matrix"));
    }
}
