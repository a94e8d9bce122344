//! Observer pattern for optimization monitoring.
//!
//! Observers registered with the trust-region solver are notified once per outer
//! iteration with the current parameter vector, after receiving that iteration's
//! metrics. They never influence the optimization.
//!
//! ```text
//! ┌──────────────────────┐
//! │ TrustRegionReflective│
//! └──────────┬───────────┘
//!            │ observers.notify(x, iteration)
//!            ├──────────────┐
//!            ▼              ▼
//!    ┌──────────────┐ ┌──────────┐
//!    │IterationTrace│ │  Custom  │
//!    │   Observer   │ │ Observer │
//!    └──────────────┘ └──────────┘
//! ```
//!
//! # Custom Observer
//!
//! ```
//! use pavement_backcalc::observers::OptObserver;
//! use nalgebra::DVector;
//! use std::sync::Mutex;
//!
//! struct LastIterate {
//!     last: Mutex<Option<DVector<f64>>>,
//! }
//!
//! impl OptObserver for LastIterate {
//!     fn on_step(&self, parameters: &DVector<f64>, _iteration: usize) {
//!         if let Ok(mut guard) = self.last.lock() {
//!             *guard = Some(parameters.clone());
//!         }
//!     }
//! }
//! ```

use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::error;

/// Observer-specific error types
#[derive(Debug, Clone, Error)]
pub enum ObserverError {
    /// Mutex was poisoned (thread panicked while holding lock)
    #[error("Mutex poisoned in {context}: {reason}")]
    MutexPoisoned { context: String, reason: String },
}

impl ObserverError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for observer operations
pub type ObserverResult<T> = Result<T, ObserverError>;

/// Observer trait for monitoring optimization progress.
///
/// Observers must be `Send`; use interior mutability (`Mutex`, atomics) to record
/// state. Errors should be handled inside the observer rather than panicking.
pub trait OptObserver: Send {
    /// Called after each outer iteration.
    ///
    /// # Arguments
    ///
    /// * `parameters` - Current solver parameters (log moduli for back-calculation)
    /// * `iteration` - Zero-based outer iteration number
    fn on_step(&self, parameters: &DVector<f64>, iteration: usize);

    /// Receive the metrics of the iteration about to be reported through `on_step`.
    ///
    /// # Arguments
    ///
    /// * `cost` - Current cost `½‖r‖²`
    /// * `gradient_norm` - Scaled gradient infinity norm
    /// * `trust_region_radius` - Trust region radius after the update, if the solver has one
    /// * `step_norm` - L2 norm of the last accepted step
    /// * `step_quality` - Ratio of actual to predicted reduction
    fn set_iteration_metrics(
        &self,
        _cost: f64,
        _gradient_norm: f64,
        _trust_region_radius: Option<f64>,
        _step_norm: f64,
        _step_quality: Option<f64>,
    ) {
    }

    /// Receive `J^T J` and `J^T r` at the current iterate.
    fn set_matrix_data(&self, _hessian: Option<DMatrix<f64>>, _gradient: Option<DVector<f64>>) {}
}

/// Collection of observers, called in registration order.
#[derive(Default)]
pub struct OptObserverVec {
    observers: Vec<Box<dyn OptObserver>>,
}

impl OptObserverVec {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    pub fn add(&mut self, observer: impl OptObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    #[inline]
    pub fn set_iteration_metrics(
        &self,
        cost: f64,
        gradient_norm: f64,
        trust_region_radius: Option<f64>,
        step_norm: f64,
        step_quality: Option<f64>,
    ) {
        for observer in &self.observers {
            observer.set_iteration_metrics(
                cost,
                gradient_norm,
                trust_region_radius,
                step_norm,
                step_quality,
            );
        }
    }

    #[inline]
    pub fn set_matrix_data(&self, hessian: Option<DMatrix<f64>>, gradient: Option<DVector<f64>>) {
        for observer in &self.observers {
            observer.set_matrix_data(hessian.clone(), gradient.clone());
        }
    }

    /// Notify all observers; a no-op when none are registered.
    #[inline]
    pub fn notify(&self, parameters: &DVector<f64>, iteration: usize) {
        for observer in &self.observers {
            observer.on_step(parameters, iteration);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.observers.len()
    }
}
