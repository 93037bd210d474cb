//! Additive secret sharing and noise primitives.

use dataroom_core::sample_laplace;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::MpcError;

/// Share generation and noise sampling over a single CSPRNG.
pub struct MpcEngine {
    rng: Mutex<ChaCha20Rng>,
}

impl Default for MpcEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MpcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpcEngine").finish_non_exhaustive()
    }
}

impl MpcEngine {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    /// Deterministic engine for tests and replayable simulations.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }

    /// Splits `value` into `parties` additive shares.
    ///
    /// The first `parties - 1` shares are uniform in `[-2|v|, 2|v|]` and the
    /// last one closes the sum, so `reconstruct` returns `value` up to
    /// floating-point rounding.
    pub fn generate_shares(&self, value: f64, parties: usize) -> Result<Vec<f64>, MpcError> {
        if parties < 2 {
            return Err(MpcError::NotEnoughParties {
                required: 2,
                actual: parties,
            });
        }
        if !value.is_finite() {
            return Err(MpcError::NonFinite(value));
        }
        let bound = 2.0 * value.abs();
        let mut rng = self.rng.lock();
        let mut shares: Vec<f64> = (0..parties - 1)
            .map(|_| uniform(&mut *rng, bound))
            .collect();
        let partial: f64 = shares.iter().sum();
        shares.push(value - partial);
        Ok(shares)
    }

    pub fn reconstruct(&self, shares: &[f64]) -> Result<f64, MpcError> {
        if shares.is_empty() {
            return Err(MpcError::NoShares);
        }
        Ok(shares.iter().sum())
    }

    /// Uniform mask in `[-magnitude, magnitude]`.
    pub fn generate_masking_noise(&self, magnitude: f64) -> f64 {
        uniform(&mut *self.rng.lock(), magnitude.abs())
    }

    /// Laplace mechanism with scale `sensitivity / epsilon`.
    pub fn add_noise(&self, value: f64, sensitivity: f64, epsilon: f64) -> Result<f64, MpcError> {
        positive("sensitivity", sensitivity)?;
        positive("epsilon", epsilon)?;
        let noise = sample_laplace(&mut *self.rng.lock(), sensitivity / epsilon);
        Ok(value + noise)
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, bound: f64) -> f64 {
    if bound > 0.0 && bound.is_finite() {
        rng.gen_range(-bound..=bound)
    } else {
        0.0
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), MpcError> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(MpcError::NonPositive { name, value })
    }
}
