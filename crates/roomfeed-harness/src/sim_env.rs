//! Simulation environment.
//!
//! Time comes from the Tokio clock, so tests running under
//! `#[tokio::test(start_paused = true)]` get virtual time that auto-advances
//! whenever every task is idle. Randomness comes from a seeded ChaCha RNG, so
//! nonces and backoff jitter replay identically for a given seed.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rand::RngCore;
use rand_chacha::{ChaCha8Rng, rand_core::SeedableRng};
use roomfeed_core::Environment;

/// Wall clock reading at simulation start (2023-11-14T22:13:20Z).
pub const SIM_EPOCH_MILLIS: u64 = 1_700_000_000_000;

/// Deterministic environment for simulation.
#[derive(Clone, Debug)]
pub struct SimEnv {
    start: tokio::time::Instant,
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with a specific RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            start: tokio::time::Instant::now(),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    /// Virtual time since this environment was created.
    pub fn elapsed(&self) -> Duration {
        tokio::time::Instant::now() - self.start
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn wall_clock_millis(&self) -> u64 {
        SIM_EPOCH_MILLIS + self.elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}
