//! Cached log-parameter adapter between the optimizer and an expensive forward model.
//!
//! The optimizer asks for residuals and Jacobians at log-space points. For a trust-region
//! solver these requests arrive in pairs at the same point (residual at a trial step,
//! Jacobian once the step is accepted), so the adapter keeps exactly one cache entry:
//!
//! | request       | cached point equal? | cached Jacobian? | action                   |
//! |---------------|---------------------|------------------|--------------------------|
//! | value         | yes                 | any              | return cached values     |
//! | value+grad    | yes                 | yes              | return cached values     |
//! | value+grad    | yes                 | no               | re-invoke with gradient  |
//! | any           | no / empty          | -                | invoke the model         |
//!
//! Every model invocation replaces the entry wholesale, so a value-only entry never
//! carries a stale Jacobian. Equality is exact, component-wise.

use crate::core::prior::LogPrior;
use crate::core::problem::LeastSquaresProblem;
use crate::core::scenario::{Deflections, LayerVector, ModulusJacobian, N_LAYERS, N_POINTS, Scenario};
use crate::core::{CoreError, CoreResult, transform};
use crate::error::BackcalcResult;
use crate::forward::{ForwardError, ForwardModel};
use nalgebra::{DMatrix, DVector};
use tracing::trace;

/// How deflection misfits are normalized into residuals.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ResidualNormalization {
    /// `(u_pred - u_target) / u_target`: every point weighs the same regardless of its
    /// deflection magnitude.
    #[default]
    Relative,
    /// `u_pred - u_target` [mm]: far geophones with small deflections weigh less.
    Absolute,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    log_moduli: LayerVector,
    deflections: Deflections,
    log_jacobian: Option<ModulusJacobian>,
}

/// Forward model wrapped for log-space least squares, with a one-entry memo.
///
/// One adapter serves one back-calculation run: its cache and counters are never
/// shared between runs.
pub struct LogCachedForwardModel<'m, M: ForwardModel + ?Sized> {
    model: &'m M,
    scenario: Scenario,
    target: Deflections,
    prior: LogPrior,
    normalization: ResidualNormalization,
    cache: Option<CacheEntry>,
    call_count: usize,
    gradient_call_count: usize,
}

impl<'m, M: ForwardModel + ?Sized> LogCachedForwardModel<'m, M> {
    /// Create the adapter.
    ///
    /// `scenario` is the working copy whose moduli are overwritten on each evaluation;
    /// `target` holds the observed deflections in millimetres and must be strictly
    /// positive (it divides the relative residual).
    pub fn new(
        model: &'m M,
        scenario: Scenario,
        target: Deflections,
        prior: LogPrior,
    ) -> CoreResult<Self> {
        if let Some((point, &value)) = target
            .iter()
            .enumerate()
            .find(|(_, u)| !(u.is_finite() && **u > 0.0))
        {
            return Err(CoreError::NonPositiveDeflection {
                point: point + 1,
                value,
            }
            .log());
        }

        Ok(Self {
            model,
            scenario,
            target,
            prior,
            normalization: ResidualNormalization::default(),
            cache: None,
            call_count: 0,
            gradient_call_count: 0,
        })
    }

    /// Select the residual normalization.
    pub fn with_normalization(mut self, normalization: ResidualNormalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Number of forward-model invocations so far.
    pub fn call_count(&self) -> usize {
        self.call_count
    }

    /// Number of forward-model invocations that computed a Jacobian.
    pub fn gradient_call_count(&self) -> usize {
        self.gradient_call_count
    }

    /// Observed deflections [mm].
    pub fn target(&self) -> &Deflections {
        &self.target
    }

    /// Log-space prior this adapter was built with.
    pub fn prior(&self) -> &LogPrior {
        &self.prior
    }

    /// Working scenario (moduli reflect the most recent model invocation).
    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    /// Predicted deflections and, if requested, the log-space Jacobian at `log_moduli`.
    pub fn evaluate(
        &mut self,
        log_moduli: &LayerVector,
        need_gradient: bool,
    ) -> BackcalcResult<(Deflections, Option<ModulusJacobian>)> {
        if let Some(entry) = &self.cache
            && entry.log_moduli == *log_moduli
        {
            match (need_gradient, entry.log_jacobian) {
                (false, _) => return Ok((entry.deflections, None)),
                (true, Some(jacobian)) => return Ok((entry.deflections, Some(jacobian))),
                (true, None) => {}
            }
        }

        let moduli = transform::to_physical(log_moduli);
        self.scenario.moduli = moduli;

        let response = self
            .model
            .evaluate(&self.scenario, need_gradient)
            .map_err(|e| e.log())?;

        let log_jacobian = if need_gradient {
            let physical = response
                .jacobian
                .ok_or_else(|| ForwardError::MissingJacobian.log())?;
            self.gradient_call_count += 1;
            Some(transform::log_space_jacobian(&physical, &moduli))
        } else {
            None
        };

        self.call_count += 1;
        trace!(
            "Forward call {} (gradient: {}) at E = {:?}",
            self.call_count,
            need_gradient,
            moduli.as_slice()
        );

        self.cache = Some(CacheEntry {
            log_moduli: *log_moduli,
            deflections: response.deflections,
            log_jacobian,
        });

        Ok((response.deflections, log_jacobian))
    }

    /// Residual vector at `log_moduli` under the configured normalization.
    pub fn residual(&mut self, log_moduli: &LayerVector) -> BackcalcResult<Deflections> {
        let (predicted, _) = self.evaluate(log_moduli, false)?;
        Ok(match self.normalization {
            ResidualNormalization::Relative => transform::relative_residual(&predicted, &self.target),
            ResidualNormalization::Absolute => predicted - self.target,
        })
    }

    /// Jacobian of [`residual`](Self::residual) with respect to the log moduli.
    pub fn jacobian(&mut self, log_moduli: &LayerVector) -> BackcalcResult<ModulusJacobian> {
        let (_, log_jacobian) = self.evaluate(log_moduli, true)?;
        let log_jacobian = log_jacobian.ok_or_else(|| ForwardError::MissingJacobian.log())?;
        Ok(match self.normalization {
            ResidualNormalization::Relative => {
                transform::relative_jacobian(&log_jacobian, &self.target)
            }
            ResidualNormalization::Absolute => log_jacobian,
        })
    }
}

impl<M: ForwardModel + ?Sized> LeastSquaresProblem for LogCachedForwardModel<'_, M> {
    fn num_parameters(&self) -> usize {
        N_LAYERS
    }

    fn num_residuals(&self) -> usize {
        N_POINTS
    }

    fn residuals(&mut self, x: &DVector<f64>) -> BackcalcResult<DVector<f64>> {
        let log_moduli = transform::layer_vector_from_dynamic(x)?;
        let residual = self.residual(&log_moduli)?;
        Ok(DVector::from_column_slice(residual.as_slice()))
    }

    fn jacobian(&mut self, x: &DVector<f64>) -> BackcalcResult<DMatrix<f64>> {
        let log_moduli = transform::layer_vector_from_dynamic(x)?;
        let jacobian = LogCachedForwardModel::jacobian(self, &log_moduli)?;
        Ok(DMatrix::from_column_slice(N_POINTS, N_LAYERS, jacobian.as_slice()))
    }
}
