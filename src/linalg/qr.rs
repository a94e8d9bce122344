use nalgebra::{DMatrix, DVector};

use crate::linalg::{
    DenseLinearSolver, LinAlgError, LinAlgResult, check_dimensions, has_negligible_pivot,
};

/// Solves the damped normal equations through a QR factorization of the stacked
/// system `[J; √λ·I] dx = [-r; 0]`, avoiding the squared condition number of `J^T J`.
#[derive(Debug, Clone, Default)]
pub struct DenseQRSolver {
    hessian: Option<DMatrix<f64>>,
    gradient: Option<DVector<f64>>,
}

impl DenseQRSolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DenseLinearSolver for DenseQRSolver {
    fn solve_augmented_equation(
        &mut self,
        residuals: &DVector<f64>,
        jacobian: &DMatrix<f64>,
        lambda: f64,
    ) -> LinAlgResult<DVector<f64>> {
        check_dimensions(residuals, jacobian)?;
        if lambda < 0.0 {
            return Err(LinAlgError::FactorizationFailed(format!(
                "negative damping {} has no square root",
                lambda
            ))
            .log());
        }

        let (m, n) = jacobian.shape();
        let sqrt_lambda = lambda.sqrt();

        let mut stacked = DMatrix::<f64>::zeros(m + n, n);
        stacked.view_mut((0, 0), (m, n)).copy_from(jacobian);
        for i in 0..n {
            stacked[(m + i, i)] = sqrt_lambda;
        }
        let mut rhs = DVector::<f64>::zeros(m + n);
        rhs.rows_mut(0, m).copy_from(&(-residuals));

        let qr = stacked.qr();
        let r = qr.r();
        if has_negligible_pivot(r.diagonal().iter().map(|p| p * p)) {
            return Err(LinAlgError::SingularMatrix.log_with_source("QR: negligible pivot in R"));
        }
        let qt_rhs = qr.q().transpose() * rhs;

        let dx = r
            .solve_upper_triangular(&qt_rhs)
            .ok_or_else(|| LinAlgError::SingularMatrix.log_with_source("QR: zero pivot in R"))?;
        if dx.iter().any(|v| !v.is_finite()) {
            return Err(LinAlgError::SingularMatrix.log_with_source("QR: non-finite solution"));
        }

        let jt = jacobian.transpose();
        self.hessian = Some(&jt * jacobian);
        self.gradient = Some(&jt * residuals);
        Ok(dx)
    }

    fn get_hessian(&self) -> Option<&DMatrix<f64>> {
        self.hessian.as_ref()
    }

    fn get_gradient(&self) -> Option<&DVector<f64>> {
        self.gradient.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    const TOLERANCE: f64 = 1e-10;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_least_squares_solution() -> TestResult {
        let mut solver = DenseQRSolver::new();
        // Fit y = a + b·t to (0, 1), (1, 3), (2, 5): exact line a = 1, b = 2.
        // Residual r = J·x - y at x = 0 is -y, so dx = x*.
        let jacobian = dmatrix![1.0, 0.0; 1.0, 1.0; 1.0, 2.0];
        let residuals = DVector::from_vec(vec![-1.0, -3.0, -5.0]);

        let dx = solver.solve_augmented_equation(&residuals, &jacobian, 0.0)?;
        assert!((dx[0] - 1.0).abs() < TOLERANCE);
        assert!((dx[1] - 2.0).abs() < TOLERANCE);
        Ok(())
    }

    #[test]
    fn test_caches_hessian_and_gradient() -> TestResult {
        let mut solver = DenseQRSolver::new();
        let jacobian = dmatrix![2.0, 0.0; 0.0, 3.0];
        let residuals = DVector::from_vec(vec![1.0, 1.0]);

        solver.solve_augmented_equation(&residuals, &jacobian, 0.5)?;
        let hessian = solver.get_hessian().ok_or("hessian not cached")?;
        let gradient = solver.get_gradient().ok_or("gradient not cached")?;
        assert_eq!(*hessian, dmatrix![4.0, 0.0; 0.0, 9.0]);
        assert_eq!(*gradient, DVector::from_vec(vec![2.0, 3.0]));
        Ok(())
    }

    #[test]
    fn test_rank_deficient_without_damping_fails() {
        let mut solver = DenseQRSolver::new();
        let jacobian = dmatrix![1.0, 2.0; 2.0, 4.0; 3.0, 6.0];
        let residuals = DVector::from_vec(vec![1.0, 0.0, 1.0]);
        assert!(
            solver
                .solve_augmented_equation(&residuals, &jacobian, 0.0)
                .is_err()
        );
    }

    #[test]
    fn test_negative_damping_rejected() {
        let mut solver = DenseQRSolver::new();
        let jacobian = DMatrix::<f64>::identity(2, 2);
        let residuals = DVector::from_element(2, 1.0);
        assert!(matches!(
            solver.solve_augmented_equation(&residuals, &jacobian, -1.0),
            Err(LinAlgError::FactorizationFailed(_))
        ));
    }
}
