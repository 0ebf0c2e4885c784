//! Strategies for sampling indices from a dataset.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait Sampler: Send + Sync {
    /// Returns one pass worth of indices for a dataset of `len` items.
    fn sample(&self, len: usize) -> Vec<usize>;
}

/// Samples elements sequentially, always in the same order.
pub struct SequentialSampler;

impl Sampler for SequentialSampler {
    fn sample(&self, len: usize) -> Vec<usize> {
        (0..len).collect()
    }
}

/// Samples a fresh permutation on every pass.
///
/// Pass `n` is shuffled with seed `seed + n`, so two samplers with the same seed produce the
/// same sequence of passes on every client.
pub struct RandomSampler {
    seed: u64,
    pass: AtomicU64,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            pass: AtomicU64::new(0),
        }
    }
}

impl Sampler for RandomSampler {
    fn sample(&self, len: usize) -> Vec<usize> {
        let pass = self.pass.fetch_add(1, Ordering::Relaxed);
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(pass));
        let mut indices: Vec<usize> = (0..len).collect();
        indices.shuffle(&mut rng);
        indices
    }
}
