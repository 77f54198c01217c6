//! Environment abstraction for deterministic testing.
//!
//! Decouples synchronization logic from system resources (time, randomness).
//! Enables deterministic simulation (virtual clock, seeded RNG) and production
//! use with real system resources.

use std::time::Duration;

/// Abstract environment providing time, randomness, and async primitives.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `wall_clock_millis()` is comparable with server timestamps (Unix
///   milliseconds)
/// - Methods are infallible except in exceptional circumstances (e.g., OS
///   entropy exhaustion, incorrect simulation setup)
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use a real monotonic clock, while simulation
    /// environments use virtual time.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>
        + std::ops::Add<Duration, Output = Self::Instant>
        + std::fmt::Debug;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time in Unix milliseconds.
    ///
    /// Only used to place optimistic messages among server-stamped ones.
    fn wall_clock_millis(&self) -> u64;

    /// Sleeps for the specified duration.
    ///
    /// This is the ONLY async method in the trait, and it should only be used
    /// by driver code (not synchronization logic).
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// Given the same RNG seed, this produces the same sequence of bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`.
    ///
    /// Used for client nonces.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }

    /// Generates a uniform `f64` in `[0, 1)`.
    ///
    /// Used for backoff jitter.
    fn random_unit(&self) -> f64 {
        // 53 bits of mantissa
        (self.random_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}
