//! Human-readable reporting of back-calculation runs.
//!
//! Nothing here feeds back into the numbers: the functions format and log what the
//! noise injector and the driver produced.
//!
//! - [`NoiseReport`] and [`BackcalcOutcome`] implement `Display`
//! - [`log_noise_report`] / [`log_outcome`] emit them at INFO level
//! - [`IterationTraceObserver`] logs the physical moduli of every solver iteration at DEBUG

use crate::backcalc::BackcalcOutcome;
use crate::core::scenario::N_LAYERS;
use crate::noise::{NoiseReport, Perturbation};
use crate::observers::{ObserverError, OptObserver};
use nalgebra::DVector;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info};

fn write_perturbation<const N: usize>(
    f: &mut fmt::Formatter<'_>,
    title: &str,
    unit: &str,
    perturbation: &Perturbation<N>,
) -> fmt::Result {
    writeln!(f, "{} [{}]:", title, unit)?;
    writeln!(
        f,
        "  {:>3}  {:>14}  {:>14}  {:>14}",
        "#", "original", "noise", "modified"
    )?;
    for k in 0..N {
        writeln!(
            f,
            "  {:>3}  {:>14.6}  {:>+14.6}  {:>14.6}",
            k + 1,
            perturbation.original[k],
            perturbation.noise[k],
            perturbation.modified[k]
        )?;
    }
    Ok(())
}

impl fmt::Display for NoiseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Noise Report")?;
        write_perturbation(f, "Deflection", "mm", &self.deflection)?;
        write_perturbation(f, "Thickness", "mm", &self.thickness)?;
        write_perturbation(f, "Radius", "mm", &self.radius)?;
        write_perturbation(f, "Load", "MPa", &self.load)
    }
}

impl fmt::Display for BackcalcOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Back-Calculation Result")?;

        if self.converged {
            writeln!(f, "CONVERGED ({})", self.status)?;
        } else {
            writeln!(f, "NOT CONVERGED ({})", self.status)?;
        }

        writeln!(f)?;
        writeln!(f, "Moduli [MPa]:")?;
        for i in 0..N_LAYERS {
            writeln!(
                f,
                "  Layer {}: {:>12.3}  (initial {:>10.3})",
                i + 1,
                self.moduli[i],
                self.initial_moduli[i]
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial: {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:   {:.6e}", self.final_cost)?;
        writeln!(f)?;
        writeln!(f, "Evaluations:")?;
        writeln!(f, "  Iterations:            {}", self.iterations)?;
        writeln!(f, "  Function evaluations:  {}", self.function_evaluations)?;
        writeln!(f, "  Jacobian evaluations:  {}", self.jacobian_evaluations)?;
        writeln!(f, "  Forward calls:         {}", self.forward_calls)?;
        writeln!(f, "  Forward gradient calls: {}", self.forward_gradient_calls)?;
        writeln!(f)?;
        write!(
            f,
            "Elapsed: {:.2}ms",
            self.elapsed.as_secs_f64() * 1000.0
        )
    }
}

/// Log the perturbations of one injection at INFO level.
///
/// All four categories are printed, including those left untouched.
pub fn log_noise_report(report: &NoiseReport) {
    info!("{}", report);
}

/// Log the result of a back-calculation run at INFO level.
pub fn log_outcome(outcome: &BackcalcOutcome) {
    info!("{}", outcome);
}

#[derive(Debug, Clone, Copy)]
struct IterationMetrics {
    cost: f64,
    gradient_norm: f64,
    trust_region_radius: Option<f64>,
}

/// Observer logging the physical moduli `exp(x)` of every iteration at DEBUG level.
#[derive(Debug, Default)]
pub struct IterationTraceObserver {
    metrics: Mutex<Option<IterationMetrics>>,
}

impl IterationTraceObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OptObserver for IterationTraceObserver {
    fn on_step(&self, parameters: &DVector<f64>, iteration: usize) {
        let moduli: Vec<f64> = parameters.iter().map(|x| x.exp()).collect();
        let metrics = match self.metrics.lock() {
            Ok(guard) => *guard,
            Err(e) => {
                let _ = ObserverError::MutexPoisoned {
                    context: "IterationTraceObserver::on_step".to_string(),
                    reason: e.to_string(),
                }
                .log();
                None
            }
        };

        match metrics {
            Some(m) => debug!(
                "iter {:>3}  E = {:?} MPa  cost = {:.6e}  |v*g| = {:.2e}  radius = {:?}",
                iteration, moduli, m.cost, m.gradient_norm, m.trust_region_radius
            ),
            None => debug!("iter {:>3}  E = {:?} MPa", iteration, moduli),
        }
    }

    fn set_iteration_metrics(
        &self,
        cost: f64,
        gradient_norm: f64,
        trust_region_radius: Option<f64>,
        _step_norm: f64,
        _step_quality: Option<f64>,
    ) {
        if let Ok(mut guard) = self.metrics.lock() {
            *guard = Some(IterationMetrics {
                cost,
                gradient_norm,
                trust_region_radius,
            });
        }
    }
}
