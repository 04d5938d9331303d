//! Noise injector: the Laplace mechanism over released counts.
//!
//! Scale is b = sensitivity / epsilon. The query's epsilon is a flat
//! price: every statistic a query releases gets independent noise at
//! that scale, and nothing here touches the budget ledger.
//!
//! Rounding to an integer and clamping at zero are post-processing and
//! carry no extra privacy cost.

use crate::{
    error::{EngineError, EngineResult},
    rng::{NoiseRng, NoiseSource},
};
use std::sync::Mutex;

pub struct NoiseInjector {
    source: Mutex<Box<dyn NoiseSource>>,
}

impl NoiseInjector {
    pub fn new(source: Box<dyn NoiseSource>) -> Self {
        Self { source: Mutex::new(source) }
    }

    /// ChaCha20 stream from OS entropy.
    pub fn secure() -> Self {
        Self::new(Box::new(NoiseRng::secure().with_name("noise")))
    }

    /// Reproducible PCG stream.
    pub fn seeded(seed: u64) -> Self {
        Self::new(Box::new(NoiseRng::seeded(seed).with_name("noise")))
    }

    pub fn laplace_scale(sensitivity: f64, epsilon: f64) -> EngineResult<f64> {
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(EngineError::Other(anyhow::anyhow!(
                "refusing to release with epsilon {epsilon}"
            )));
        }
        if !sensitivity.is_finite() || sensitivity < 0.0 {
            return Err(EngineError::Other(anyhow::anyhow!(
                "refusing to release with sensitivity {sensitivity}"
            )));
        }
        Ok(sensitivity / epsilon)
    }

    /// Perturb each count with independent Laplace(0, sensitivity/epsilon)
    /// noise. The source is locked once for the whole batch.
    pub fn noisy_counts(
        &self,
        counts: &[u64],
        sensitivity: f64,
        epsilon: f64,
    ) -> EngineResult<Vec<u64>> {
        let scale = Self::laplace_scale(sensitivity, epsilon)?;
        let mut source = self
            .source
            .lock()
            .map_err(|_| EngineError::Other(anyhow::anyhow!("noise source lock poisoned")))?;
        Ok(counts
            .iter()
            .map(|&c| {
                let noisy = c as f64 + sample_laplace(&mut **source, scale);
                noisy.round().max(0.0) as u64
            })
            .collect())
    }
}

/// Inverse-CDF sample from Laplace(0, scale).
/// The ln() argument is floored at the smallest positive f64, so an
/// endpoint draw gives a large but finite sample.
pub fn sample_laplace(source: &mut dyn NoiseSource, scale: f64) -> f64 {
    if scale == 0.0 {
        return 0.0;
    }
    let u = source.next_f64().clamp(0.0, 1.0) - 0.5;
    let inner = (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE);
    -scale * u.signum() * inner.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::ConstantSource;

    #[test]
    fn midpoint_draw_adds_no_noise() {
        let injector = NoiseInjector::new(Box::new(ConstantSource(0.5)));
        let out = injector.noisy_counts(&[7, 12, 40], 1.0, 0.05).unwrap();
        assert_eq!(out, vec![7, 12, 40]);
    }

    #[test]
    fn counts_never_go_negative() {
        // u close to 0 gives a large negative draw.
        let injector = NoiseInjector::new(Box::new(ConstantSource(1e-9)));
        let out = injector.noisy_counts(&[3], 1.0, 0.05).unwrap();
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn endpoint_draws_stay_finite() {
        for u in [0.0, 1.0, f64::MIN_POSITIVE] {
            let x = sample_laplace(&mut ConstantSource(u), 20.0);
            assert!(x.is_finite(), "u={u} gave {x}");
        }
        assert!(sample_laplace(&mut ConstantSource(0.0), 20.0) < 0.0);
    }

    #[test]
    fn invalid_epsilon_is_refused() {
        let injector = NoiseInjector::seeded(1);
        assert!(injector.noisy_counts(&[1], 1.0, 0.0).is_err());
        assert!(injector.noisy_counts(&[1], 1.0, f64::NAN).is_err());
    }

    #[test]
    fn empirical_scale_matches_laplace() {
        // E|X| = b for Laplace(0, b).
        let mut rng = NoiseRng::seeded(0x5EED);
        let b = 20.0;
        let n = 20_000;
        let mean_abs: f64 = (0..n).map(|_| sample_laplace(&mut rng, b).abs()).sum::<f64>() / n as f64;
        assert!((mean_abs - b).abs() < 1.0, "mean |noise| {mean_abs} far from {b}");

        let mean: f64 = (0..n).map(|_| sample_laplace(&mut rng, b)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 1.0, "noise mean {mean} not centred");
    }
}
