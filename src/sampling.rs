//! Sampling decisions.
//!
//! One draw is made per invocation (or per manual tracking at start time).
//! Rates of exactly 0.0 and 1.0 never consume randomness.

use std::fmt::Debug;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Decides whether an invocation is recorded.
pub trait Sampler: Send + Sync + Debug {
    /// Returns true with probability `rate`; `rate` is already validated to [0, 1].
    fn should_sample(&self, rate: f64) -> bool;
}

/// Draws from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSampler;

impl Sampler for RandomSampler {
    fn should_sample(&self, rate: f64) -> bool {
        if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            rand::thread_rng().gen_bool(rate)
        }
    }
}

/// Deterministic sampler for reproducible runs.
#[derive(Debug)]
pub struct SeededSampler {
    rng: Mutex<StdRng>,
}

impl SeededSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Sampler for SeededSampler {
    fn should_sample(&self, rate: f64) -> bool {
        if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            self.rng.lock().gen_bool(rate)
        }
    }
}

/// Ignores the rate and always returns the same answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler(pub bool);

impl Sampler for FixedSampler {
    fn should_sample(&self, _rate: f64) -> bool {
        self.0
    }
}
