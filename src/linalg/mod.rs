pub mod cholesky;
pub mod qr;

use nalgebra::{DMatrix, DVector};
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolverType {
    #[default]
    DenseCholesky,
    DenseQR,
}

impl Display for LinearSolverType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::DenseCholesky => write!(f, "Dense Cholesky"),
            LinearSolverType::DenseQR => write!(f, "Dense QR"),
        }
    }
}

/// Linear algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (Cholesky, QR, etc.)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix detected
    #[error("Singular matrix detected (matrix is not invertible)")]
    SingularMatrix,

    /// Residual and Jacobian shapes do not agree
    #[error("Dimension mismatch: Jacobian has {jacobian_rows} rows, residual has {residual_len}")]
    DimensionMismatch {
        jacobian_rows: usize,
        residual_len: usize,
    },
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    ///
    /// # Example
    /// ```ignore
    /// operation()
    ///     .map_err(|e| LinAlgError::from(e).log())?;
    /// ```
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Arguments
    /// * `source_error` - The original error (must implement Debug)
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Trait for dense solvers of the damped normal equations
pub trait DenseLinearSolver {
    /// Solve the augmented equation: (J^T * J + λI) * dx = -J^T * r
    ///
    /// # Errors
    /// Returns `LinAlgError` if:
    /// - Residual and Jacobian shapes disagree
    /// - Matrix factorization fails
    /// - Matrix is singular or ill-conditioned
    fn solve_augmented_equation(
        &mut self,
        residuals: &DVector<f64>,
        jacobian: &DMatrix<f64>,
        lambda: f64,
    ) -> LinAlgResult<DVector<f64>>;

    /// Get the cached Hessian matrix (J^T * J) from the last solve
    fn get_hessian(&self) -> Option<&DMatrix<f64>>;

    /// Get the cached gradient vector (J^T * r) from the last solve
    fn get_gradient(&self) -> Option<&DVector<f64>>;
}

pub use cholesky::DenseCholeskySolver;
pub use qr::DenseQRSolver;

/// Create the solver matching `solver_type`.
pub fn create_linear_solver(solver_type: LinearSolverType) -> Box<dyn DenseLinearSolver> {
    match solver_type {
        LinearSolverType::DenseCholesky => Box::new(DenseCholeskySolver::new()),
        LinearSolverType::DenseQR => Box::new(DenseQRSolver::new()),
    }
}

fn check_dimensions(residuals: &DVector<f64>, jacobian: &DMatrix<f64>) -> LinAlgResult<()> {
    if jacobian.nrows() != residuals.len() {
        return Err(LinAlgError::DimensionMismatch {
            jacobian_rows: jacobian.nrows(),
            residual_len: residuals.len(),
        }
        .log());
    }
    Ok(())
}

/// Smallest accepted ratio between the squared smallest and squared largest pivot of a
/// triangular factor, i.e. a condition-number limit of about 1e7 on `J`.
const SQUARED_PIVOT_TOLERANCE: f64 = 1e-14;

/// Whether the squared pivots contain one negligible relative to the largest.
fn has_negligible_pivot(squared_pivots: impl Iterator<Item = f64>) -> bool {
    let squared: Vec<f64> = squared_pivots.collect();
    let largest = squared.iter().copied().fold(0.0, f64::max);
    largest == 0.0 || squared.iter().any(|&p| p <= SQUARED_PIVOT_TOLERANCE * largest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_both_solvers_agree() -> TestResult {
        let jacobian = dmatrix![
            2.0, 1.0, 0.0;
            1.0, 3.0, 1.0;
            0.0, 1.0, 2.0;
            1.5, 0.0, 0.5
        ];
        let residuals = DVector::from_vec(vec![1.0, -2.0, 0.5, 1.2]);

        for lambda in [0.0, 1e-3, 1.0] {
            let mut cholesky = create_linear_solver(LinearSolverType::DenseCholesky);
            let mut qr = create_linear_solver(LinearSolverType::DenseQR);
            let a = cholesky.solve_augmented_equation(&residuals, &jacobian, lambda)?;
            let b = qr.solve_augmented_equation(&residuals, &jacobian, lambda)?;
            assert!((a - b).norm() < 1e-10, "solvers disagree at lambda {}", lambda);
        }
        Ok(())
    }

    #[test]
    fn test_dimension_mismatch() {
        let jacobian = DMatrix::<f64>::identity(3, 2);
        let residuals = DVector::from_element(2, 1.0);
        let mut solver = create_linear_solver(LinearSolverType::default());
        assert!(matches!(
            solver.solve_augmented_equation(&residuals, &jacobian, 0.0),
            Err(LinAlgError::DimensionMismatch {
                jacobian_rows: 3,
                residual_len: 2
            })
        ));
    }

    #[test]
    fn test_solver_type_display() {
        assert_eq!(LinearSolverType::DenseCholesky.to_string(), "Dense Cholesky");
        assert_eq!(LinearSolverType::DenseQR.to_string(), "Dense QR");
    }
}
