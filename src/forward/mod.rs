//! Forward model seam: predicted surface deflections for a layered scenario.
//!
//! The layered-elastic solution itself is an external collaborator. It is consumed
//! through the [`ForwardModel`] trait, so production bindings, analytic surrogates and
//! test doubles are interchangeable.
//!
//! # Contract
//!
//! Given a [`Scenario`] and a gradient flag, a forward model returns exactly ten surface
//! deflections in **millimetres** (one per evaluation point, in point order) and, when
//! the flag is set, the 10×5 Jacobian of those deflections with respect to the physical
//! layer moduli (mm/MPa). Table-driven solvers can obtain the packed array through
//! [`Scenario::to_input_table`].
//!
//! The model is assumed pure: identical inputs yield identical outputs. The
//! back-calculation adapter in [`cached`] relies on this to memoize evaluations.

pub mod cached;

pub use cached::{LogCachedForwardModel, ResidualNormalization};

use crate::core::scenario::{Deflections, ModulusJacobian, Scenario};
use crate::error::BackcalcResult;
use thiserror::Error;
use tracing::{debug, error, info};

/// Conversion factor from millimetres to micrometres.
pub const MM_TO_UM: f64 = 1e3;

/// Forward-model specific error types
#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    /// The model failed to evaluate the scenario
    #[error("Forward model evaluation failed: {0}")]
    Evaluation(String),

    /// A Jacobian was requested but the model did not provide one
    #[error("Forward model returned no Jacobian although one was requested")]
    MissingJacobian,

    /// The model produced NaN or infinite deflections
    #[error("Forward model produced a non-finite deflection at point {point}: {value}")]
    NonFiniteOutput { point: usize, value: f64 },
}

impl ForwardError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying error of a foreign binding
    ///
    /// # Example
    /// ```ignore
    /// binding.calculate(&table).map_err(|e| {
    ///     ForwardError::Evaluation("layered-elastic kernel failed".to_string()).log_with_source(e)
    /// })?;
    /// ```
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for forward-model operations
pub type ForwardResult<T> = Result<T, ForwardError>;

/// Output of one forward evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardResponse {
    /// Predicted surface deflections [mm].
    pub deflections: Deflections,
    /// `∂u_j/∂E_i` [mm/MPa], present when requested.
    pub jacobian: Option<ModulusJacobian>,
}

impl ForwardResponse {
    /// Deflections only.
    pub fn new(deflections: Deflections) -> Self {
        Self {
            deflections,
            jacobian: None,
        }
    }

    /// Attach the modulus Jacobian.
    pub fn with_jacobian(mut self, jacobian: ModulusJacobian) -> Self {
        self.jacobian = Some(jacobian);
        self
    }
}

/// Layered-elastic forward solver.
///
/// # Example
///
/// ```
/// use pavement_backcalc::core::scenario::{Deflections, ModulusJacobian, Scenario};
/// use pavement_backcalc::forward::{ForwardModel, ForwardResponse, ForwardResult};
///
/// /// Deflection inversely proportional to the mean modulus.
/// struct MeanModulusModel;
///
/// impl ForwardModel for MeanModulusModel {
///     fn evaluate(&self, scenario: &Scenario, compute_jacobian: bool) -> ForwardResult<ForwardResponse> {
///         let mean = scenario.moduli.mean();
///         let scale = scenario.stress * scenario.load_radius;
///         let response = ForwardResponse::new(Deflections::from_element(scale / mean));
///         Ok(if compute_jacobian {
///             response.with_jacobian(ModulusJacobian::from_element(-scale / (5.0 * mean * mean)))
///         } else {
///             response
///         })
///     }
/// }
/// ```
pub trait ForwardModel {
    /// Predict the ten surface deflections, optionally with their modulus Jacobian.
    fn evaluate(&self, scenario: &Scenario, compute_jacobian: bool)
    -> ForwardResult<ForwardResponse>;
}

impl<F> ForwardModel for F
where
    F: Fn(&Scenario, bool) -> ForwardResult<ForwardResponse>,
{
    fn evaluate(
        &self,
        scenario: &Scenario,
        compute_jacobian: bool,
    ) -> ForwardResult<ForwardResponse> {
        self(scenario, compute_jacobian)
    }
}

/// Predict surface deflections [mm] for a scenario (forward path, no inversion).
///
/// The scenario is validated first; non-finite predictions are reported as
/// [`ForwardError::NonFiniteOutput`].
pub fn forward_calculate<M>(model: &M, scenario: &Scenario) -> BackcalcResult<Deflections>
where
    M: ForwardModel + ?Sized,
{
    scenario.validate().map_err(|e| e.log())?;

    let response = model.evaluate(scenario, false).map_err(|e| e.log())?;
    if let Some((point, &value)) = response
        .deflections
        .iter()
        .enumerate()
        .find(|(_, u)| !u.is_finite())
    {
        return Err(ForwardError::NonFiniteOutput {
            point: point + 1,
            value,
        }
        .log()
        .into());
    }

    debug!(
        "Forward deflections [um]: {:?}",
        millimetres_to_micrometres(&response.deflections).as_slice()
    );
    info!("Forward calculation finished");
    Ok(response.deflections)
}

/// Convert deflections from millimetres to micrometres.
pub fn millimetres_to_micrometres(deflections_mm: &Deflections) -> Deflections {
    deflections_mm * MM_TO_UM
}
