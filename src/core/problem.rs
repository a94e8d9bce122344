//! Bounded nonlinear least-squares problem definition.
//!
//! The optimizer minimizes `F(x) = ½‖r(x)‖²` over a box `lower ≤ x ≤ upper`. Anything
//! able to produce residuals and their Jacobian at a point implements
//! [`LeastSquaresProblem`]; the back-calculation adapter is the production
//! implementation.
//!
//! Both methods take `&mut self` so implementations may memoize expensive evaluations
//! between the residual and Jacobian requests of one iterate.

use crate::core::{CoreError, CoreResult};
use crate::error::BackcalcResult;
use nalgebra::{DMatrix, DVector};

/// A residual function with an analytic Jacobian.
pub trait LeastSquaresProblem {
    /// Dimension of the parameter vector `x`.
    fn num_parameters(&self) -> usize;

    /// Dimension of the residual vector `r(x)`.
    fn num_residuals(&self) -> usize;

    /// Evaluate `r(x)`.
    fn residuals(&mut self, x: &DVector<f64>) -> BackcalcResult<DVector<f64>>;

    /// Evaluate `∂r/∂x` at `x` (`num_residuals × num_parameters`).
    fn jacobian(&mut self, x: &DVector<f64>) -> BackcalcResult<DMatrix<f64>>;
}

/// Box constraints `lower ≤ x ≤ upper`; infinite entries leave a side open.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    lower: DVector<f64>,
    upper: DVector<f64>,
}

impl Bounds {
    /// Create bounds, requiring equal lengths and `lower < upper` everywhere.
    pub fn new(lower: DVector<f64>, upper: DVector<f64>) -> CoreResult<Self> {
        if lower.len() != upper.len() {
            return Err(CoreError::DimensionMismatch {
                expected: lower.len(),
                actual: upper.len(),
            });
        }

        for (i, (&lo, &hi)) in lower.iter().zip(upper.iter()).enumerate() {
            if lo.is_nan() || hi.is_nan() || lo >= hi {
                return Err(CoreError::InvalidInput(format!(
                    "bound {} requires lower < upper, got [{}, {}]",
                    i, lo, hi
                )));
            }
        }

        Ok(Self { lower, upper })
    }

    /// No constraints in any of the `dim` directions.
    pub fn unbounded(dim: usize) -> Self {
        Self {
            lower: DVector::from_element(dim, f64::NEG_INFINITY),
            upper: DVector::from_element(dim, f64::INFINITY),
        }
    }

    pub fn lower(&self) -> &DVector<f64> {
        &self.lower
    }

    pub fn upper(&self) -> &DVector<f64> {
        &self.upper
    }

    pub fn dim(&self) -> usize {
        self.lower.len()
    }

    /// Whether `x` lies inside the closed box.
    pub fn contains(&self, x: &DVector<f64>) -> bool {
        x.len() == self.dim()
            && x
                .iter()
                .zip(self.lower.iter().zip(self.upper.iter()))
                .all(|(&xi, (&lo, &hi))| xi >= lo && xi <= hi)
    }

    /// Project `x` onto the closed box.
    pub fn clip(&self, x: &DVector<f64>) -> DVector<f64> {
        DVector::from_fn(x.len(), |i, _| x[i].clamp(self.lower[i], self.upper[i]))
    }

    /// Move `x` into the interior of the box.
    ///
    /// Components within `rstep · max(1, |bound|)` of a bound are pushed that far inside.
    /// With `rstep == 0` only components on or beyond a bound are moved, by the smallest
    /// representable relative distance. Components that still end up outside (very tight
    /// boxes) are placed at the midpoint.
    pub fn make_strictly_feasible(&self, x: &DVector<f64>, rstep: f64) -> DVector<f64> {
        DVector::from_fn(x.len(), |i, _| {
            let (lo, hi) = (self.lower[i], self.upper[i]);
            let mut xi = x[i];

            if rstep == 0.0 {
                if xi <= lo {
                    xi = lo + f64::EPSILON * lo.abs().max(1.0);
                } else if xi >= hi {
                    xi = hi - f64::EPSILON * hi.abs().max(1.0);
                }
            } else if lo.is_finite() && xi - lo <= rstep * lo.abs().max(1.0) {
                xi = lo + rstep * lo.abs().max(1.0);
            } else if hi.is_finite() && hi - xi <= rstep * hi.abs().max(1.0) {
                xi = hi - rstep * hi.abs().max(1.0);
            }

            if !(xi > lo && xi < hi) {
                xi = 0.5 * (lo + hi);
            }
            xi
        })
    }
}
