//! Deterministic tie-break salts
//!
//! Choke ranking and candidate scoring both need a random-looking but
//! reproducible tie-breaker. A shaker is derived per pulse from the
//! manager's seedable generator, so two peers with identical metrics get a
//! fair shuffle each pulse without flaky tests.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

/// Per-pulse stream of tie-break salts.
#[derive(Debug)]
pub struct SaltShaker {
    rng: StdRng,
}

impl SaltShaker {
    /// Creates a shaker from a pulse seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Next salt byte.
    pub fn next_salt(&mut self) -> u8 {
        (self.rng.next_u32() & 0xff) as u8
    }

    /// Uniform index below `bound`.
    pub fn next_index(&mut self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        self.rng.gen_range(0..bound)
    }
}
