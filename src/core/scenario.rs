//! Layered pavement scenario: structure, load and evaluation points.
//!
//! A [`Scenario`] is the typed replacement for the packed numeric table the forward
//! solver consumes. The fixed shapes of the problem are encoded in the types: five
//! layers (the bottom one semi-infinite) and ten evaluation points.
//!
//! # Packed table layout
//!
//! [`Scenario::to_input_table`] produces an 11×8 array (row, column):
//!
//! ```text
//! rows 2..=6   layers 1..5     col 1 = modulus [MPa], col 2 = Poisson, col 3 = thickness [mm]
//! rows 1..=10  points 1..10    col 5 = point number, col 6 = radius [mm], col 7 = deflection [μm]
//! row 10                       col 1 = stress [MPa], col 3 = load radius [mm]
//! ```
//!
//! The bottom layer thickness is written as `0.0`, the semi-infinite sentinel. Row 0 is
//! reserved for headers and left at zero.

use crate::core::{CoreError, CoreResult};
use nalgebra::{SMatrix, SVector};

/// Number of pavement layers, including the semi-infinite subgrade.
pub const N_LAYERS: usize = 5;
/// Number of layers with a finite thickness.
pub const N_BOUNDED_LAYERS: usize = N_LAYERS - 1;
/// Number of deflection evaluation points.
pub const N_POINTS: usize = 10;

/// Rows of the packed forward-model input table.
pub const INPUT_TABLE_ROWS: usize = 11;
/// Columns of the packed forward-model input table.
pub const INPUT_TABLE_COLS: usize = 8;

/// Per-layer quantities (moduli, Poisson ratios, thicknesses).
pub type LayerVector = SVector<f64, N_LAYERS>;
/// Physical layer moduli in MPa.
pub type Moduli = LayerVector;
/// Per-point quantities (radii, deflections).
pub type PointVector = SVector<f64, N_POINTS>;
/// Surface deflections at the evaluation points.
pub type Deflections = PointVector;
/// Derivatives of the ten deflections with respect to the five moduli.
pub type ModulusJacobian = SMatrix<f64, N_POINTS, N_LAYERS>;
/// Packed array handed to table-driven forward solvers.
pub type InputTable = SMatrix<f64, INPUT_TABLE_ROWS, INPUT_TABLE_COLS>;

const LAYER_ROW_OFFSET: usize = 2;
const POINT_ROW_OFFSET: usize = 1;
const LOAD_ROW: usize = 10;
const COL_MODULUS: usize = 1;
const COL_POISSON: usize = 2;
const COL_THICKNESS: usize = 3;
const COL_POINT_INDEX: usize = 5;
const COL_RADIUS: usize = 6;
const COL_DEFLECTION: usize = 7;
const COL_STRESS: usize = 1;
const COL_LOAD_RADIUS: usize = 3;

/// Conversion factor from micrometres to millimetres.
pub const UM_TO_MM: f64 = 1e-3;

/// A layered pavement structure under a circular load, with measured deflections.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    /// Layer moduli [MPa], top to bottom. A zero entry marks an unknown modulus.
    pub moduli: Moduli,
    /// Layer Poisson ratios.
    pub poisson: LayerVector,
    /// Layer thicknesses [mm]; the last entry is `f64::INFINITY`.
    pub thickness: LayerVector,
    /// Radial offsets of the evaluation points from the load center [mm].
    pub radii: PointVector,
    /// Measured surface deflections [μm]. Zeros are allowed on the forward path.
    pub deflections_um: Deflections,
    /// Contact stress of the load [MPa].
    pub stress: f64,
    /// Radius of the loaded plate [mm].
    pub load_radius: f64,
}

impl Default for Scenario {
    /// A five-layer flexible pavement under a 0.95 MPa, 150 mm plate with a
    /// standard geophone layout.
    fn default() -> Self {
        Self {
            moduli: Moduli::from([4000.0, 400.0, 300.0, 200.0, 100.0]),
            poisson: LayerVector::from([0.30, 0.35, 0.35, 0.40, 0.40]),
            thickness: LayerVector::from([150.0, 240.0, 300.0, 500.0, f64::INFINITY]),
            radii: PointVector::from([
                0.0, 300.0, 600.0, 900.0, 1200.0, 1500.0, 1800.0, 2000.0, 3000.0, 4000.0,
            ]),
            deflections_um: Deflections::zeros(),
            stress: 0.95,
            load_radius: 150.0,
        }
    }
}

impl Scenario {
    /// Replace the layer moduli.
    pub fn with_moduli(mut self, moduli: Moduli) -> Self {
        self.moduli = moduli;
        self
    }

    /// Replace the measured deflections [μm].
    pub fn with_deflections_um(mut self, deflections_um: Deflections) -> Self {
        self.deflections_um = deflections_um;
        self
    }

    /// Replace the load definition.
    pub fn with_load(mut self, stress: f64, load_radius: f64) -> Self {
        self.stress = stress;
        self.load_radius = load_radius;
        self
    }

    /// Measured deflections converted to millimetres.
    pub fn deflections_mm(&self) -> Deflections {
        self.deflections_um * UM_TO_MM
    }

    /// Whether all five moduli are nonzero, i.e. usable as an initial guess.
    pub fn has_complete_moduli(&self) -> bool {
        self.moduli.iter().all(|&e| e != 0.0)
    }

    /// Check the structural and load definition.
    ///
    /// Moduli may be zero (unknown) but not negative; deflections are not checked here
    /// because zeros are legitimate on the forward path.
    pub fn validate(&self) -> CoreResult<()> {
        for (i, &e) in self.moduli.iter().enumerate() {
            if !e.is_finite() || e < 0.0 {
                return Err(CoreError::InvalidInput(format!(
                    "modulus of layer {} must be finite and non-negative, got {}",
                    i + 1,
                    e
                )));
            }
        }

        for (i, &nu) in self.poisson.iter().enumerate() {
            if !(nu > -1.0 && nu <= 0.5) {
                return Err(CoreError::InvalidInput(format!(
                    "Poisson ratio of layer {} must lie in (-1, 0.5], got {}",
                    i + 1,
                    nu
                )));
            }
        }

        for (i, &h) in self.thickness.iter().take(N_BOUNDED_LAYERS).enumerate() {
            if !h.is_finite() || h <= 0.0 {
                return Err(CoreError::InvalidInput(format!(
                    "thickness of layer {} must be positive and finite, got {}",
                    i + 1,
                    h
                )));
            }
        }

        for (j, &r) in self.radii.iter().enumerate() {
            if !r.is_finite() || r < 0.0 {
                return Err(CoreError::InvalidInput(format!(
                    "radius of point {} must be finite and non-negative, got {}",
                    j + 1,
                    r
                )));
            }
        }

        if !self.stress.is_finite() || self.stress <= 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "stress must be positive, got {}",
                self.stress
            )));
        }

        if !self.load_radius.is_finite() || self.load_radius <= 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "load radius must be positive, got {}",
                self.load_radius
            )));
        }

        Ok(())
    }

    /// Pack the scenario into the fixed row/column layout of table-driven solvers.
    pub fn to_input_table(&self) -> InputTable {
        let mut table = InputTable::zeros();

        for i in 0..N_LAYERS {
            let row = LAYER_ROW_OFFSET + i;
            table[(row, COL_MODULUS)] = self.moduli[i];
            table[(row, COL_POISSON)] = self.poisson[i];
            table[(row, COL_THICKNESS)] = if i < N_BOUNDED_LAYERS {
                self.thickness[i]
            } else {
                0.0
            };
        }

        for j in 0..N_POINTS {
            let row = POINT_ROW_OFFSET + j;
            table[(row, COL_POINT_INDEX)] = (j + 1) as f64;
            table[(row, COL_RADIUS)] = self.radii[j];
            table[(row, COL_DEFLECTION)] = self.deflections_um[j];
        }

        table[(LOAD_ROW, COL_STRESS)] = self.stress;
        table[(LOAD_ROW, COL_LOAD_RADIUS)] = self.load_radius;
        table
    }

    /// Unpack a scenario from the fixed row/column layout and validate it.
    ///
    /// A bottom-layer thickness that is zero, negative or non-finite decodes to the
    /// semi-infinite sentinel `f64::INFINITY`.
    pub fn from_input_table(table: &InputTable) -> CoreResult<Self> {
        let mut moduli = Moduli::zeros();
        let mut poisson = LayerVector::zeros();
        let mut thickness = LayerVector::zeros();

        for i in 0..N_LAYERS {
            let row = LAYER_ROW_OFFSET + i;
            moduli[i] = table[(row, COL_MODULUS)];
            poisson[i] = table[(row, COL_POISSON)];
            thickness[i] = table[(row, COL_THICKNESS)];
        }

        let bottom = thickness[N_LAYERS - 1];
        if !bottom.is_finite() || bottom <= 0.0 {
            thickness[N_LAYERS - 1] = f64::INFINITY;
        }

        let radii = PointVector::from_fn(|j, _| table[(POINT_ROW_OFFSET + j, COL_RADIUS)]);
        let deflections_um =
            Deflections::from_fn(|j, _| table[(POINT_ROW_OFFSET + j, COL_DEFLECTION)]);

        let scenario = Self {
            moduli,
            poisson,
            thickness,
            radii,
            deflections_um,
            stress: table[(LOAD_ROW, COL_STRESS)],
            load_radius: table[(LOAD_ROW, COL_LOAD_RADIUS)],
        };
        scenario.validate()?;
        Ok(scenario)
    }
}
