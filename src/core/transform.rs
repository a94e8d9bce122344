//! Natural/log parameter space conversions.
//!
//! The solver works on `x = ln(E)` so that moduli spanning several orders of magnitude
//! are equally scaled and stay positive. Derivatives follow the chain rule
//! `∂u/∂(ln E_i) = ∂u/∂E_i · E_i`.

use crate::core::scenario::{Deflections, LayerVector, ModulusJacobian, Moduli, N_LAYERS};
use crate::core::{CoreError, CoreResult};
use nalgebra::DVector;

/// Map positive physical moduli to log space.
pub fn to_log_space(moduli: &Moduli) -> CoreResult<LayerVector> {
    if let Some((i, &e)) = moduli
        .iter()
        .enumerate()
        .find(|(_, e)| !(e.is_finite() && **e > 0.0))
    {
        return Err(CoreError::InvalidInput(format!(
            "modulus of layer {} must be positive to enter log space, got {}",
            i + 1,
            e
        )));
    }
    Ok(moduli.map(f64::ln))
}

/// Map log-space moduli back to physical moduli.
pub fn to_physical(log_moduli: &LayerVector) -> Moduli {
    log_moduli.map(f64::exp)
}

/// Convert a dynamically sized solver vector into the fixed layer vector.
pub fn layer_vector_from_dynamic(values: &DVector<f64>) -> CoreResult<LayerVector> {
    if values.len() != N_LAYERS {
        return Err(CoreError::DimensionMismatch {
            expected: N_LAYERS,
            actual: values.len(),
        });
    }
    Ok(LayerVector::from_iterator(values.iter().copied()))
}

/// Scale each Jacobian column by its modulus: `J_log[:, i] = J_phys[:, i] · E_i`.
pub fn log_space_jacobian(physical_jacobian: &ModulusJacobian, moduli: &Moduli) -> ModulusJacobian {
    let mut jacobian = *physical_jacobian;
    for (i, mut column) in jacobian.column_iter_mut().enumerate() {
        column *= moduli[i];
    }
    jacobian
}

/// Relative deflection misfit `(u_pred - u_target) / u_target`.
pub fn relative_residual(predicted: &Deflections, target: &Deflections) -> Deflections {
    (predicted - target).component_div(target)
}

/// Divide each Jacobian row by its target deflection.
pub fn relative_jacobian(log_jacobian: &ModulusJacobian, target: &Deflections) -> ModulusJacobian {
    let mut jacobian = *log_jacobian;
    for (j, mut row) in jacobian.row_iter_mut().enumerate() {
        row /= target[j];
    }
    jacobian
}

/// Clamp moduli component-wise into `[lower, upper]`.
pub fn clamp_moduli(moduli: &Moduli, lower: &Moduli, upper: &Moduli) -> Moduli {
    Moduli::from_fn(|i, _| moduli[i].clamp(lower[i], upper[i]))
}
