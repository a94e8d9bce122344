//! Synthetic measurement-noise injection.
//!
//! Each scalar with a nonzero magnitude `m` receives one independent draw from the
//! symmetric triangular distribution on `[-m, m]` with mode 0. A magnitude of exactly
//! zero leaves the value bit-for-bit untouched.
//!
//! Four categories are perturbed, in this order:
//!
//! | category   | values                          | magnitude                          |
//! |------------|---------------------------------|------------------------------------|
//! | deflection | measured deflections, μm → mm   | `deflection_noise_um`, μm → mm     |
//! | thickness  | layers 1..4 (bottom excluded)   | `thickness_noise` [mm]             |
//! | radius     | evaluation point offsets [mm]   | `radius_noise` [mm]                |
//! | load       | contact stress [MPa]            | `stress_noise_fraction × stress`   |
//!
//! The generator is an explicit handle: seed it for reproducible studies, or draw from
//! OS entropy for run-to-run variation.

use crate::core::prior::NoisePrior;
use crate::core::scenario::{
    Deflections, N_BOUNDED_LAYERS, N_POINTS, Scenario, UM_TO_MM,
};
use crate::core::{CoreError, CoreResult};
use nalgebra::SVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Triangular};

/// Original, added noise and modified values of one perturbed category.
#[derive(Debug, Clone, PartialEq)]
pub struct Perturbation<const N: usize> {
    pub original: SVector<f64, N>,
    pub noise: SVector<f64, N>,
    pub modified: SVector<f64, N>,
}

impl<const N: usize> Perturbation<N> {
    /// Whether no entry was changed.
    pub fn is_unchanged(&self) -> bool {
        self.original == self.modified
    }
}

/// Record of every perturbation applied by one injection.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseReport {
    /// Deflections [mm].
    pub deflection: Perturbation<N_POINTS>,
    /// Thicknesses of the bounded layers [mm].
    pub thickness: Perturbation<N_BOUNDED_LAYERS>,
    /// Evaluation point radii [mm].
    pub radius: Perturbation<N_POINTS>,
    /// Contact stress [MPa].
    pub load: Perturbation<1>,
}

/// Output of [`NoiseInjector::inject`].
#[derive(Debug, Clone)]
pub struct NoisyObservation {
    /// Perturbed target deflections [mm].
    pub target_mm: Deflections,
    /// Copy of the input scenario with perturbed thicknesses, radii and stress.
    pub scenario: Scenario,
    /// What was applied.
    pub report: NoiseReport,
}

/// Triangular noise source over an explicit random generator.
pub struct NoiseInjector<R: Rng> {
    rng: R,
}

impl NoiseInjector<StdRng> {
    /// Reproducible injector: the same seed yields the same perturbations.
    pub fn from_seed(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    /// Injector seeded from operating-system entropy.
    pub fn from_os_entropy() -> Self {
        Self::new(StdRng::from_os_rng())
    }
}

impl<R: Rng> NoiseInjector<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Perturb a scenario's observations and geometry.
    ///
    /// The input scenario is not modified; the perturbed copy is returned in the
    /// observation together with the target deflections in millimetres.
    pub fn inject(
        &mut self,
        scenario: &Scenario,
        prior: &NoisePrior,
    ) -> CoreResult<NoisyObservation> {
        prior.validate().map_err(|e| e.log())?;

        let deflection = self.perturb(
            &scenario.deflections_mm(),
            &(prior.deflection_noise_um * UM_TO_MM),
            None,
        )?;

        let bounded_thickness: SVector<f64, N_BOUNDED_LAYERS> =
            scenario.thickness.fixed_rows::<N_BOUNDED_LAYERS>(0).into_owned();
        let thickness = self.perturb(&bounded_thickness, &prior.thickness_noise, None)?;

        let radius = self.perturb(&scenario.radii, &prior.radius_noise, Some(0.0))?;

        let load = self.perturb(
            &SVector::<f64, 1>::new(scenario.stress),
            &SVector::<f64, 1>::new(prior.stress_noise_fraction * scenario.stress),
            None,
        )?;

        let mut perturbed = scenario.clone();
        perturbed
            .thickness
            .fixed_rows_mut::<N_BOUNDED_LAYERS>(0)
            .copy_from(&thickness.modified);
        perturbed.radii = radius.modified;
        perturbed.stress = load.modified[0];

        Ok(NoisyObservation {
            target_mm: deflection.modified,
            scenario: perturbed,
            report: NoiseReport {
                deflection,
                thickness,
                radius,
                load,
            },
        })
    }

    /// One draw from Triangular(-m, 0, m); exactly zero for `m == 0`.
    pub fn draw(&mut self, magnitude: f64) -> CoreResult<f64> {
        if magnitude == 0.0 {
            return Ok(0.0);
        }
        let half_width = magnitude.abs();
        let distribution = Triangular::new(-half_width, half_width, 0.0).map_err(|e| {
            CoreError::InvalidInput(format!("invalid noise magnitude {}", magnitude))
                .log_with_source(e)
        })?;
        Ok(distribution.sample(&mut self.rng))
    }

    /// Perturb each entry with nonzero magnitude; perturbed entries are floored at
    /// `floor` when given, and the recorded noise is the shift actually applied.
    fn perturb<const N: usize>(
        &mut self,
        values: &SVector<f64, N>,
        magnitudes: &SVector<f64, N>,
        floor: Option<f64>,
    ) -> CoreResult<Perturbation<N>> {
        let mut noise = SVector::<f64, N>::zeros();
        let mut modified = *values;

        for k in 0..N {
            if magnitudes[k] == 0.0 {
                continue;
            }
            noise[k] = self.draw(magnitudes[k])?;
            modified[k] = values[k] + noise[k];
            if let Some(floor) = floor
                && modified[k] < floor
            {
                modified[k] = floor;
                noise[k] = floor - values[k];
            }
        }

        Ok(Perturbation {
            original: *values,
            noise,
            modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scenario::N_LAYERS;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn measured_scenario() -> Scenario {
        Scenario::default().with_deflections_um(Deflections::from([
            420.0, 300.0, 210.0, 150.0, 110.0, 85.0, 68.0, 60.0, 38.0, 27.0,
        ]))
    }

    #[test]
    fn test_zero_magnitudes_leave_everything_untouched() -> TestResult {
        let scenario = measured_scenario();
        let prior = NoisePrior::default().without_noise();
        let mut injector = NoiseInjector::from_seed(7);

        let observation = injector.inject(&scenario, &prior)?;

        assert_eq!(observation.target_mm, scenario.deflections_mm());
        assert_eq!(observation.scenario, scenario);
        assert!(observation.report.deflection.is_unchanged());
        assert!(observation.report.thickness.is_unchanged());
        assert!(observation.report.radius.is_unchanged());
        assert!(observation.report.load.is_unchanged());
        assert!(observation.report.deflection.noise.iter().all(|&n| n == 0.0));
        Ok(())
    }

    #[test]
    fn test_same_seed_same_perturbation() -> TestResult {
        let scenario = measured_scenario();
        let prior = NoisePrior::default();

        let a = NoiseInjector::from_seed(42).inject(&scenario, &prior)?;
        let b = NoiseInjector::from_seed(42).inject(&scenario, &prior)?;
        let c = NoiseInjector::from_seed(43).inject(&scenario, &prior)?;

        assert_eq!(a.report, b.report);
        assert_ne!(a.report.deflection.noise, c.report.deflection.noise);
        Ok(())
    }

    #[test]
    fn test_noise_stays_within_magnitude() -> TestResult {
        let scenario = measured_scenario();
        let prior = NoisePrior::default();
        let mut injector = NoiseInjector::from_seed(3);

        for _ in 0..200 {
            let observation = injector.inject(&scenario, &prior)?;
            let report = &observation.report;

            for k in 0..N_POINTS {
                assert!(report.deflection.noise[k].abs() <= prior.deflection_noise_um[k] * 1e-3);
                assert!(report.radius.noise[k].abs() <= prior.radius_noise[k]);
            }
            for k in 0..N_BOUNDED_LAYERS {
                assert!(report.thickness.noise[k].abs() <= prior.thickness_noise[k]);
            }
            assert!(report.load.noise[0].abs() <= prior.stress_noise_fraction * scenario.stress);
        }
        Ok(())
    }

    #[test]
    fn test_entries_with_zero_magnitude_are_skipped() -> TestResult {
        let scenario = measured_scenario();
        let prior = NoisePrior::default();
        let observation = NoiseInjector::from_seed(11).inject(&scenario, &prior)?;

        // Point 1 has zero radius noise by default.
        assert_eq!(observation.scenario.radii[0], scenario.radii[0]);
        assert_eq!(observation.report.radius.noise[0], 0.0);
        // The semi-infinite layer is never perturbed.
        assert!(observation.scenario.thickness[N_LAYERS - 1].is_infinite());
        Ok(())
    }

    #[test]
    fn test_report_is_consistent_with_observation() -> TestResult {
        let scenario = measured_scenario();
        let prior = NoisePrior::default();
        let observation = NoiseInjector::from_seed(5).inject(&scenario, &prior)?;
        let report = &observation.report;

        assert_eq!(report.deflection.original, scenario.deflections_mm());
        assert_eq!(report.deflection.modified, observation.target_mm);
        for k in 0..N_POINTS {
            let expected = report.deflection.original[k] + report.deflection.noise[k];
            assert_eq!(report.deflection.modified[k], expected);
        }
        for k in 0..N_BOUNDED_LAYERS {
            assert_eq!(observation.scenario.thickness[k], report.thickness.modified[k]);
        }
        assert_eq!(observation.scenario.stress, report.load.modified[0]);
        assert_eq!(report.load.original[0], scenario.stress);
        Ok(())
    }

    #[test]
    fn test_input_scenario_not_mutated() -> TestResult {
        let scenario = measured_scenario();
        let snapshot = scenario.clone();
        let _ = NoiseInjector::from_seed(9).inject(&scenario, &NoisePrior::default())?;
        assert_eq!(scenario, snapshot);
        Ok(())
    }

    #[test]
    fn test_radius_floored_at_zero() -> TestResult {
        let mut scenario = measured_scenario();
        scenario.radii[1] = 0.0;
        let mut prior = NoisePrior::default().without_noise();
        prior.radius_noise[1] = 50.0;

        let mut injector = NoiseInjector::from_seed(1);
        let mut floored = 0;
        for _ in 0..50 {
            let observation = injector.inject(&scenario, &prior)?;
            let radius = &observation.report.radius;
            assert!(observation.scenario.radii[1] >= 0.0);
            // The report records the shift actually applied, clipped or not.
            assert_eq!(radius.modified[1], radius.original[1] + radius.noise[1]);
            assert!(radius.noise[1] >= 0.0);
            if radius.modified[1] == 0.0 {
                floored += 1;
            }
        }
        assert!(floored > 0);
        Ok(())
    }

    #[test]
    fn test_negative_magnitude_rejected() {
        let mut prior = NoisePrior::default();
        prior.thickness_noise[0] = -1.0;
        let result = NoiseInjector::from_seed(0).inject(&measured_scenario(), &prior);
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_triangular_draws_are_centered() -> TestResult {
        let mut injector = NoiseInjector::from_seed(2024);
        let n = 20_000;
        let mut sum = 0.0;
        for _ in 0..n {
            sum += injector.draw(1.0)?;
        }
        // Var = 1/6 for Triangular(-1, 0, 1); the mean's std is ~0.003.
        assert!((sum / n as f64).abs() < 0.02);
        Ok(())
    }
}
