//! Modulus prior bounds and measurement-noise magnitudes.
//!
//! [`NoisePrior`] carries everything the caller specifies about uncertainty: the
//! physical search range of each layer modulus and the half-widths of the triangular
//! perturbations applied to deflections, thicknesses, radii and load. [`LogPrior`] is
//! the derived log-space view used by the solver.

use crate::core::scenario::{
    Deflections, LayerVector, Moduli, N_BOUNDED_LAYERS, N_LAYERS, N_POINTS, PointVector,
};
use crate::core::{CoreError, CoreResult};
use nalgebra::{SMatrix, SVector};

/// Per-layer thickness noise magnitudes for the layers of finite thickness.
pub type ThicknessNoise = SVector<f64, N_BOUNDED_LAYERS>;

/// Rows of the packed noise/prior table.
pub const NOISE_TABLE_ROWS: usize = 11;
/// Columns of the packed noise/prior table.
pub const NOISE_TABLE_COLS: usize = 7;
/// Packed noise/prior table as edited by spreadsheet-style front ends.
pub type NoiseTable = SMatrix<f64, NOISE_TABLE_ROWS, NOISE_TABLE_COLS>;

const LAYER_ROW_OFFSET: usize = 2;
const POINT_ROW_OFFSET: usize = 1;
const COL_LAYER_INDEX: usize = 0;
const COL_LOWER: usize = 1;
const COL_UPPER: usize = 2;
const COL_THICKNESS_NOISE: usize = 3;
const COL_POINT_INDEX: usize = 4;
const COL_RADIUS_NOISE: usize = 5;
const COL_DEFLECTION_NOISE: usize = 6;
const STRESS_FRACTION_CELL: (usize, usize) = (10, 1);

/// Prior modulus bounds and noise magnitudes for one back-calculation.
///
/// A noise magnitude of exactly zero disables perturbation of that entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NoisePrior {
    /// Lower modulus bound per layer [MPa].
    pub modulus_lower: Moduli,
    /// Upper modulus bound per layer [MPa].
    pub modulus_upper: Moduli,
    /// Thickness noise half-width per bounded layer [mm].
    pub thickness_noise: ThicknessNoise,
    /// Radius noise half-width per evaluation point [mm].
    pub radius_noise: PointVector,
    /// Deflection noise half-width per evaluation point [μm].
    pub deflection_noise_um: Deflections,
    /// Load noise half-width as a fraction of the scenario stress.
    pub stress_noise_fraction: f64,
}

impl Default for NoisePrior {
    fn default() -> Self {
        let mut radius_noise = PointVector::from_element(2.0);
        radius_noise[0] = 0.0;

        Self {
            modulus_lower: Moduli::from([1000.0, 100.0, 80.0, 20.0, 15.0]),
            modulus_upper: Moduli::from([25000.0, 8000.0, 600.0, 500.0, 150.0]),
            thickness_noise: ThicknessNoise::from_element(10.0),
            radius_noise,
            deflection_noise_um: Deflections::from_element(1.0),
            stress_noise_fraction: 0.025,
        }
    }
}

impl NoisePrior {
    /// Bounds only, with every noise magnitude set to zero.
    pub fn noiseless(modulus_lower: Moduli, modulus_upper: Moduli) -> Self {
        Self {
            modulus_lower,
            modulus_upper,
            thickness_noise: ThicknessNoise::zeros(),
            radius_noise: PointVector::zeros(),
            deflection_noise_um: Deflections::zeros(),
            stress_noise_fraction: 0.0,
        }
    }

    /// Same bounds with all noise disabled.
    pub fn without_noise(&self) -> Self {
        Self::noiseless(self.modulus_lower, self.modulus_upper)
    }

    /// Whether every noise magnitude is exactly zero.
    pub fn is_noiseless(&self) -> bool {
        self.thickness_noise.iter().all(|&m| m == 0.0)
            && self.radius_noise.iter().all(|&m| m == 0.0)
            && self.deflection_noise_um.iter().all(|&m| m == 0.0)
            && self.stress_noise_fraction == 0.0
    }

    /// Check `0 < lower < upper` (finite) for every layer.
    pub fn validate_bounds(&self) -> CoreResult<()> {
        for i in 0..N_LAYERS {
            let lower = self.modulus_lower[i];
            let upper = self.modulus_upper[i];
            let valid = lower.is_finite() && upper.is_finite() && lower > 0.0 && lower < upper;
            if !valid {
                return Err(CoreError::InvalidPriorBounds {
                    layer: i + 1,
                    lower,
                    upper,
                });
            }
        }
        Ok(())
    }

    /// Check bounds and that every noise magnitude is finite and non-negative.
    pub fn validate(&self) -> CoreResult<()> {
        self.validate_bounds()?;

        let magnitudes = self
            .thickness_noise
            .iter()
            .chain(self.radius_noise.iter())
            .chain(self.deflection_noise_um.iter())
            .chain(std::iter::once(&self.stress_noise_fraction));
        if let Some(bad) = magnitudes.copied().find(|m| !m.is_finite() || *m < 0.0) {
            return Err(CoreError::InvalidInput(format!(
                "noise magnitudes must be finite and non-negative, got {}",
                bad
            )));
        }
        Ok(())
    }

    /// Unpack the noise/prior table and validate it.
    ///
    /// Layout (row, column): rows 2..=6 hold layers 1..5 with column 1 = lower bound,
    /// column 2 = upper bound and, for rows 2..=5, column 3 = thickness noise; rows
    /// 1..=10 hold points 1..10 with column 5 = radius noise and column 6 = deflection
    /// noise [μm]; cell (10, 1) holds the stress noise fraction.
    pub fn from_table(table: &NoiseTable) -> CoreResult<Self> {
        let prior = Self {
            modulus_lower: Moduli::from_fn(|i, _| table[(LAYER_ROW_OFFSET + i, COL_LOWER)]),
            modulus_upper: Moduli::from_fn(|i, _| table[(LAYER_ROW_OFFSET + i, COL_UPPER)]),
            thickness_noise: ThicknessNoise::from_fn(|i, _| {
                table[(LAYER_ROW_OFFSET + i, COL_THICKNESS_NOISE)]
            }),
            radius_noise: PointVector::from_fn(|j, _| {
                table[(POINT_ROW_OFFSET + j, COL_RADIUS_NOISE)]
            }),
            deflection_noise_um: Deflections::from_fn(|j, _| {
                table[(POINT_ROW_OFFSET + j, COL_DEFLECTION_NOISE)]
            }),
            stress_noise_fraction: table[STRESS_FRACTION_CELL],
        };
        prior.validate()?;
        Ok(prior)
    }

    /// Pack into the noise/prior table layout described in [`NoisePrior::from_table`].
    pub fn to_table(&self) -> NoiseTable {
        let mut table = NoiseTable::zeros();

        for i in 0..N_LAYERS {
            let row = LAYER_ROW_OFFSET + i;
            table[(row, COL_LAYER_INDEX)] = (i + 1) as f64;
            table[(row, COL_LOWER)] = self.modulus_lower[i];
            table[(row, COL_UPPER)] = self.modulus_upper[i];
            if i < N_BOUNDED_LAYERS {
                table[(row, COL_THICKNESS_NOISE)] = self.thickness_noise[i];
            }
        }

        for j in 0..N_POINTS {
            let row = POINT_ROW_OFFSET + j;
            table[(row, COL_POINT_INDEX)] = (j + 1) as f64;
            table[(row, COL_RADIUS_NOISE)] = self.radius_noise[j];
            table[(row, COL_DEFLECTION_NOISE)] = self.deflection_noise_um[j];
        }

        table[STRESS_FRACTION_CELL] = self.stress_noise_fraction;
        table
    }
}

/// Log-space view of the modulus prior.
///
/// `center` and `spread` describe a log-normal prior spanning the bounds at ±2σ. The
/// base least-squares formulation only uses the bounds and the center (as fallback
/// initial guess); the spread is carried for prior-penalty formulations.
#[derive(Debug, Clone, PartialEq)]
pub struct LogPrior {
    /// `ln(lower)` per layer.
    pub lower: LayerVector,
    /// `ln(upper)` per layer.
    pub upper: LayerVector,
    /// `(ln(lower) + ln(upper)) / 2` per layer.
    pub center: LayerVector,
    /// `(ln(upper) - ln(lower)) / 4` per layer.
    pub spread: LayerVector,
}

impl LogPrior {
    /// Derive the log-space prior, rejecting invalid bounds.
    pub fn from_bounds(prior: &NoisePrior) -> CoreResult<Self> {
        prior.validate_bounds()?;

        let lower = prior.modulus_lower.map(f64::ln);
        let upper = prior.modulus_upper.map(f64::ln);
        let center = (lower + upper) * 0.5;
        let spread = (upper - lower) * 0.25;

        Ok(Self {
            lower,
            upper,
            center,
            spread,
        })
    }

    /// Physical moduli at the log-space center (geometric mean of the bounds).
    pub fn center_moduli(&self) -> Moduli {
        self.center.map(f64::exp)
    }
}
