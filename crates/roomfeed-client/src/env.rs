//! Production Environment implementation using system time and RNG.
//!
//! `SystemEnv` is the production implementation of the Environment trait using
//! the Tokio clock and OS randomness.
//!
//! # Capabilities
//!
//! - Tokio time (`tokio::time::Instant`), which advances naturally in
//!   production and can be paused in tests
//! - OS cryptographic RNG (getrandom) for client nonces and backoff jitter
//! - Tokio async sleep for actual wall-clock delays

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use roomfeed_core::Environment;

/// Production environment using the Tokio clock and OS randomness.
///
/// # Panics
///
/// Panics if the OS RNG fails. Nonces drawn from a broken RNG would collide
/// and silently merge unrelated optimistic messages.
#[derive(Clone, Debug, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    #[allow(clippy::disallowed_methods)]
    fn wall_clock_millis(&self) -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}
