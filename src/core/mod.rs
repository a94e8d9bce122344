//! Core data model for the back-calculation engine
//!
//! This module contains the strongly typed records the rest of the crate operates on:
//! - [`scenario::Scenario`]: layered pavement structure, load and evaluation points
//! - [`prior::NoisePrior`]: modulus bounds and measurement-noise magnitudes
//! - [`transform`]: natural/log parameter space conversions
//! - [`problem`]: the bounded least-squares problem seam used by the optimizer

pub mod prior;
pub mod problem;
pub mod scenario;
pub mod transform;

use thiserror::Error;
use tracing::error;

/// Core module error types for input records and problem construction
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Prior bounds must satisfy `0 < lower < upper` with both finite
    #[error("Invalid prior bounds for layer {layer}: lower={lower}, upper={upper}")]
    InvalidPriorBounds { layer: usize, lower: f64, upper: f64 },

    /// Target deflections are divisors of the relative residual and must be positive
    #[error("Target deflection at point {point} must be positive and finite, got {value}")]
    NonPositiveDeflection { point: usize, value: f64 },

    /// Dimension mismatch between parameter vectors and the fixed layer count
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Invalid input parameter or configuration
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// prior.validate().map_err(|e| e.log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the original source error from a third-party library
    ///
    /// # Example
    /// ```ignore
    /// Triangular::new(-m, m, 0.0).map_err(|e| {
    ///     CoreError::InvalidInput(format!("noise magnitude {m}")).log_with_source(e)
    /// })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for core module operations
pub type CoreResult<T> = Result<T, CoreError>;
