//! Deterministic bootstrap index generation.
//!
//! Each bootstrap draws `sample_count` sample positions with replacement from a
//! `StdRng` seeded by a per-bootstrap sub-seed. The sub-seed depends only on the
//! base seed and the bootstrap number, so every worker regenerates the same index
//! sets without talking to anyone else.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Deref;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResampleError {
    #[error("Invalid resampling parameter: {0}")]
    InvalidParameter(&'static str),
}

/// An ordered sequence of sample positions drawn with replacement.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapIndexSet(pub Vec<usize>);

impl Deref for BootstrapIndexSet {
    type Target = [usize];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Golden-ratio increment used to spread consecutive sub-seeds across the state space.
const SUB_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

#[inline]
fn sub_seed(seed: u64, bootstrap: usize) -> u64 {
    seed.wrapping_add((bootstrap as u64).wrapping_mul(SUB_SEED_STRIDE))
}

pub struct Resampler;

impl Resampler {
    pub fn generate(sample_count: usize, seed: u64) -> Result<BootstrapIndexSet, ResampleError> {
        if sample_count == 0 {
            return Err(ResampleError::InvalidParameter(
                "sample count must be positive",
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let indices = (0..sample_count)
            .map(|_| rng.gen_range(0..sample_count))
            .collect();
        Ok(BootstrapIndexSet(indices))
    }

    pub fn generate_many(
        sample_count: usize,
        bootstrap_count: usize,
        seed: u64,
    ) -> Result<Vec<BootstrapIndexSet>, ResampleError> {
        if bootstrap_count == 0 {
            return Err(ResampleError::InvalidParameter(
                "bootstrap count must be positive",
            ));
        }
        (0..bootstrap_count)
            .map(|bootstrap| Self::generate(sample_count, sub_seed(seed, bootstrap)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_deterministic_for_fixed_seed() {
        let first = Resampler::generate(37, 1).unwrap();
        let second = Resampler::generate(37, 1).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 37);
        assert!(first.iter().all(|&i| i < 37));
    }

    #[test]
    fn generate_many_yields_distinct_reproducible_sets() {
        let sets = Resampler::generate_many(50, 4, 42).unwrap();
        assert_eq!(sets.len(), 4);
        assert_eq!(sets, Resampler::generate_many(50, 4, 42).unwrap());
        assert_ne!(sets[0], sets[1]);
        // The first bootstrap uses the base seed itself.
        assert_eq!(sets[0], Resampler::generate(50, 42).unwrap());
    }

    #[test]
    fn zero_counts_are_rejected() {
        assert!(matches!(
            Resampler::generate(0, 1),
            Err(ResampleError::InvalidParameter(_))
        ));
        assert!(matches!(
            Resampler::generate_many(10, 0, 1),
            Err(ResampleError::InvalidParameter(_))
        ));
    }

    #[test]
    fn draws_are_with_replacement() {
        let set = Resampler::generate(200, 7).unwrap();
        let mut sorted = set.0.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert!(sorted.len() < 200);
    }
}
