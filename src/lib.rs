//! # Pavement Backcalc
//!
//! Back-calculation of pavement layer moduli from falling-weight-deflectometer surface
//! deflections, built around a bounded nonlinear least-squares solver.
//!
//! ## Features
//!
//! - **Injected forward model**: any layered-elastic solver implementing
//!   [`ForwardModel`] (or a plain closure) predicts deflections and their modulus Jacobian
//! - **Log-space parameters**: moduli spanning orders of magnitude stay positive and
//!   equally scaled
//! - **Memoized evaluations**: one-entry cache so residual and Jacobian requests at the
//!   same point cost a single forward call
//! - **Trust Region Reflective solver**: Coleman–Li scaling with reflective bound handling
//! - **Synthetic noise**: triangular perturbation of deflections, thicknesses, radii and
//!   load with an explicit, seedable generator
//!
//! ## Workflow
//!
//! ```text
//! Scenario + NoisePrior ──► NoiseInjector ──► LogCachedForwardModel ⇄ ForwardModel
//!                                                   │
//!                                    TrustRegionReflective (ln lo ≤ x ≤ ln hi)
//!                                                   │
//!                                          moduli = exp(x*)
//! ```
//!
//! ## Linear Algebra Backends
//!
//! - **Dense Cholesky**: normal equations, fastest for well-conditioned problems
//! - **Dense QR**: stacked least-squares system, more robust for ill-conditioned Jacobians

pub mod backcalc;
pub mod core;
pub mod diagnostics;
pub mod error;
pub mod forward;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod noise;
pub mod observers;
pub mod optimizer;

pub use backcalc::{
    BackCalculator, BackcalcConfig, BackcalcOutcome, InitialGuessStrategy, back_calculate,
};
pub use core::prior::{LogPrior, NoisePrior};
pub use core::scenario::{Deflections, Moduli, N_LAYERS, N_POINTS, Scenario};
pub use error::{BackcalcError, BackcalcResult};
pub use forward::{
    ForwardError, ForwardModel, ForwardResponse, ForwardResult, LogCachedForwardModel,
    ResidualNormalization, forward_calculate,
};
pub use linalg::{DenseCholeskySolver, DenseLinearSolver, DenseQRSolver, LinearSolverType};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use noise::{NoiseInjector, NoiseReport};
pub use optimizer::{
    OptObserver, OptObserverVec, OptimizationStatus, TrustRegionReflective,
    TrustRegionReflectiveConfig,
};
