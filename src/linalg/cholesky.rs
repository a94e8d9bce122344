use nalgebra::{Cholesky, DMatrix, DVector};

use crate::linalg::{
    DenseLinearSolver, LinAlgError, LinAlgResult, check_dimensions, has_negligible_pivot,
};

#[derive(Debug, Clone, Default)]
pub struct DenseCholeskySolver {
    /// The Hessian matrix, computed as `(J^T * J)`.
    ///
    /// This is `None` until a system has been solved.
    hessian: Option<DMatrix<f64>>,

    /// The gradient vector, computed as `J^T * r`.
    gradient: Option<DVector<f64>>,
}

impl DenseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DenseLinearSolver for DenseCholeskySolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &DVector<f64>,
        jacobian: &DMatrix<f64>,
        lambda: f64,
    ) -> LinAlgResult<DVector<f64>> {
        check_dimensions(residuals, jacobian)?;

        let jt = jacobian.transpose();
        let hessian = &jt * jacobian;
        let gradient = &jt * residuals;

        let mut augmented_hessian = hessian.clone();
        for i in 0..augmented_hessian.nrows() {
            augmented_hessian[(i, i)] += lambda;
        }

        let cholesky = Cholesky::new(augmented_hessian).ok_or_else(|| {
            LinAlgError::SingularMatrix.log_with_source("Cholesky: matrix not positive definite")
        })?;
        if has_negligible_pivot(cholesky.l_dirty().diagonal().iter().map(|p| p * p)) {
            return Err(LinAlgError::SingularMatrix.log_with_source("Cholesky: negligible pivot"));
        }

        let dx = cholesky.solve(&(-&gradient));
        if dx.iter().any(|v| !v.is_finite()) {
            return Err(LinAlgError::FactorizationFailed(
                "Cholesky solve produced non-finite values".to_string(),
            )
            .log());
        }

        self.hessian = Some(hessian);
        self.gradient = Some(gradient);
        Ok(dx)
    }

    fn get_hessian(&self) -> Option<&DMatrix<f64>> {
        self.hessian.as_ref()
    }

    fn get_gradient(&self) -> Option<&DVector<f64>> {
        self.gradient.as_ref()
    }
}
