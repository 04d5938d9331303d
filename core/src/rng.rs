//! Random streams for noise injection.
//!
//! RULE: Nothing in the engine may call a platform RNG directly.
//! All randomness flows through a NoiseRng.
//!
//! Production streams are ChaCha20 seeded from OS entropy.
//! Seeded streams are PCG and exist so tests can reproduce a run;
//! the same seed always yields the same noise sequence.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_pcg::Pcg64Mcg;

/// Anything that can hand out uniform floats in [0.0, 1.0).
pub trait NoiseSource: Send {
    fn next_f64(&mut self) -> f64;
}

enum Stream {
    Seeded(Pcg64Mcg),
    Secure(ChaCha20Rng),
}

/// A named random stream backing the noise injector.
pub struct NoiseRng {
    pub name: &'static str,
    inner: Stream,
}

impl NoiseRng {
    /// Deterministic stream. Tests and replays only.
    pub fn seeded(seed: u64) -> Self {
        Self {
            name: "seeded",
            inner: Stream::Seeded(Pcg64Mcg::seed_from_u64(seed)),
        }
    }

    /// Cryptographically strong stream for released statistics.
    pub fn secure() -> Self {
        Self {
            name: "secure",
            inner: Stream::Secure(ChaCha20Rng::from_entropy()),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn is_seeded(&self) -> bool {
        matches!(self.inner, Stream::Seeded(_))
    }

    /// Draw a raw u64 (full range).
    pub fn next_u64(&mut self) -> u64 {
        match &mut self.inner {
            Stream::Seeded(r) => r.next_u64(),
            Stream::Secure(r) => r.next_u64(),
        }
    }

    /// Uniform in [0, n). Returns 0 when n is 0.
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        self.next_u64() % n
    }

    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }
}

impl NoiseSource for NoiseRng {
    /// Roll a float in [0.0, 1.0) from the top 53 bits.
    fn next_f64(&mut self) -> f64 {
        let bits = self.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }
}

/// Always returns the same value. With 0.5 the Laplace sampler yields
/// exactly zero noise, which makes exact-count assertions possible.
#[derive(Debug, Clone, Copy)]
pub struct ConstantSource(pub f64);

impl NoiseSource for ConstantSource {
    fn next_f64(&mut self) -> f64 {
        self.0
    }
}
