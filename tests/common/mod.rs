//! Analytic stand-in for a layered-elastic forward solver.
//!
//! Each layer contributes a bell-shaped deflection basin whose width grows with depth:
//!
//! ```text
//! u_j = k · Σ_i h_i / (1 + (r_j / ℓ_i)²) / E_i,   k = 0.2e-3 · σ · a
//! ```
//!
//! Deflections are linear in `1/E` with a full-rank kernel, so noiseless observations
//! identify all five moduli.

#![allow(dead_code)]

use pavement_backcalc::core::scenario::{
    Deflections, ModulusJacobian, Moduli, N_LAYERS, N_POINTS, Scenario,
};
use pavement_backcalc::forward::{ForwardModel, ForwardResponse, ForwardResult};
use std::cell::Cell;

/// Basin width per layer [mm].
const BASIN_WIDTH: [f64; N_LAYERS] = [150.0, 450.0, 900.0, 1800.0, 4000.0];

/// Effective thickness used for the semi-infinite subgrade [mm].
const SUBGRADE_DEPTH: f64 = 1000.0;

pub const TRUE_MODULI: [f64; N_LAYERS] = [4000.0, 400.0, 300.0, 200.0, 100.0];

#[derive(Debug, Default)]
pub struct BasinModel {
    pub calls: Cell<usize>,
    pub gradient_calls: Cell<usize>,
}

impl BasinModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn kernel(scenario: &Scenario) -> [[f64; N_LAYERS]; N_POINTS] {
        let mut kernel = [[0.0; N_LAYERS]; N_POINTS];
        for (j, row) in kernel.iter_mut().enumerate() {
            for (i, c) in row.iter_mut().enumerate() {
                let h = if scenario.thickness[i].is_finite() {
                    scenario.thickness[i]
                } else {
                    SUBGRADE_DEPTH
                };
                let s = scenario.radii[j] / BASIN_WIDTH[i];
                *c = 0.2e-3 * scenario.stress * scenario.load_radius * h / (1.0 + s * s);
            }
        }
        kernel
    }

    /// Noiseless deflections [mm] for `scenario`.
    pub fn deflections(scenario: &Scenario) -> Deflections {
        let kernel = Self::kernel(scenario);
        let e = scenario.moduli;
        Deflections::from_fn(|j, _| (0..N_LAYERS).map(|i| kernel[j][i] / e[i]).sum())
    }
}

impl ForwardModel for BasinModel {
    fn evaluate(
        &self,
        scenario: &Scenario,
        compute_jacobian: bool,
    ) -> ForwardResult<ForwardResponse> {
        self.calls.set(self.calls.get() + 1);
        let response = ForwardResponse::new(Self::deflections(scenario));
        if !compute_jacobian {
            return Ok(response);
        }

        self.gradient_calls.set(self.gradient_calls.get() + 1);
        let kernel = Self::kernel(scenario);
        let e = scenario.moduli;
        Ok(response.with_jacobian(ModulusJacobian::from_fn(|j, i| {
            -kernel[j][i] / (e[i] * e[i])
        })))
    }
}

/// Default scenario carrying the noiseless deflections [μm] of [`TRUE_MODULI`].
pub fn measured_scenario() -> Scenario {
    let truth = Scenario::default().with_moduli(Moduli::from(TRUE_MODULI));
    let observed_um = BasinModel::deflections(&truth) * 1e3;
    truth.with_deflections_um(observed_um)
}

pub fn max_relative_error(estimate: &Moduli, truth: &Moduli) -> f64 {
    (0..N_LAYERS)
        .map(|i| ((estimate[i] - truth[i]) / truth[i]).abs())
        .fold(0.0, f64::max)
}
