//! Error types for the pavement-backcalc library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! # Error Hierarchy
//!
//! - **`BackcalcError`** is the top-level error exposed to callers via public APIs
//! - **Module errors** (`CoreError`, `ForwardError`, `OptimizerError`, `LinAlgError`)
//!   are wrapped inside `BackcalcError` transparently
//! - **Error sources** are preserved, allowing full error chain inspection
//!
//! Example error chain:
//! ```text
//! BackcalcError::Core(
//!     CoreError::InvalidPriorBounds { layer: 3, lower: 600.0, upper: 80.0 }
//! )
//! ```
//!
//! Non-convergence of the solver within its evaluation cap is *not* an error: it is
//! reported through [`OptimizationStatus`](crate::optimizer::OptimizationStatus).

use crate::{
    core::CoreError, forward::ForwardError, linalg::LinAlgError, optimizer::OptimizerError,
};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the pavement-backcalc library
pub type BackcalcResult<T> = Result<T, BackcalcError>;

/// Main error type for the pavement-backcalc library
///
/// Each variant is a distinguishable kind so callers can tell invalid input apart
/// from a failing forward model or a numerical breakdown inside the solver.
///
/// ```rust,ignore
/// if let Err(e) = calculator.back_calculate(&scenario, &prior) {
///     warn!("Back-calculation failed: {}", e.chain_compact());
/// }
/// ```
#[derive(Debug, Error)]
pub enum BackcalcError {
    /// Input validation errors (scenario geometry, prior bounds, targets)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Failures reported by the injected forward model
    #[error(transparent)]
    Forward(#[from] ForwardError),

    /// Optimization algorithm errors
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),
}

impl BackcalcError {
    /// Returns true when the error originates from invalid caller input.
    pub fn is_input_error(&self) -> bool {
        matches!(self, BackcalcError::Core(_))
    }

    /// Returns true when the error was raised by the forward model.
    pub fn is_forward_error(&self) -> bool {
        matches!(self, BackcalcError::Forward(_))
    }

    /// Get the full error chain as a multi-line string for logging and debugging.
    ///
    /// ```rust,ignore
    /// Err(e) => {
    ///     warn!("Error chain: {}", e.chain());
    ///     // Output: "Linear system solve failed: ...
    ///     //            → Singular matrix detected"
    /// }
    /// ```
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backcalc_error_display() {
        let error = BackcalcError::from(LinAlgError::SingularMatrix);
        assert!(error.to_string().contains("Singular matrix"));
    }

    #[test]
    fn test_invalid_bounds_is_input_error() {
        let error = BackcalcError::from(CoreError::InvalidPriorBounds {
            layer: 2,
            lower: 500.0,
            upper: 100.0,
        });
        assert!(error.is_input_error());
        assert!(!error.is_forward_error());
        assert!(error.to_string().contains("layer 2"));
    }

    #[test]
    fn test_forward_error_is_distinguishable() {
        let error = BackcalcError::from(ForwardError::Evaluation("kernel diverged".to_string()));
        assert!(error.is_forward_error());
        assert!(!error.is_input_error());
    }

    #[test]
    fn test_chain_preserves_linalg_source() {
        let optimizer_error = OptimizerError::from(LinAlgError::FactorizationFailed(
            "Cholesky factorization failed".to_string(),
        ));
        let error = BackcalcError::from(optimizer_error);

        let chain = error.chain();
        assert!(chain.contains("Cholesky"));

        let compact = error.chain_compact();
        assert!(compact.contains("Cholesky"));
    }

    #[test]
    fn test_transparent_error_conversion() {
        let core_error = CoreError::NonPositiveDeflection {
            point: 9,
            value: 0.0,
        };

        let error: BackcalcError = core_error.into();
        match error {
            BackcalcError::Core(CoreError::NonPositiveDeflection { point, .. }) => {
                assert_eq!(point, 9)
            }
            _ => panic!("Expected Core variant"),
        }
    }
}
