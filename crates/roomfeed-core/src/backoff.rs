//! Reconnect backoff policy.
//!
//! Exponential with a cap, plus symmetric jitter so that many clients dropped
//! by the same outage do not reconnect in lockstep.
//!
//! ```text
//! nominal(n) = min(base * factor^n, cap)
//! delay(n)   = nominal(n) * (1 + jitter * u),  u uniform in [-1, 1]
//! ```

use std::time::Duration;

/// Default first retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default growth factor between attempts.
pub const DEFAULT_FACTOR: u32 = 2;

/// Default ceiling for the nominal delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default jitter ratio (±20%).
pub const DEFAULT_JITTER: f64 = 0.2;

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: u32,
    /// Ceiling for the nominal delay.
    pub max_delay: Duration,
    /// Jitter ratio in `[0, 1)`. `0.0` gives exact nominal delays.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            factor: DEFAULT_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffConfig {
    /// Nominal (un-jittered) delay for the given zero-based attempt.
    ///
    /// Non-decreasing in `attempt` and never above `max_delay`.
    #[must_use]
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.max(1).checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.checked_mul(multiplier).map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Jittered delay for `attempt`.
    ///
    /// `unit` is a uniform sample in `[0, 1)`, mapped onto `[-jitter,
    /// +jitter]`.
    #[must_use]
    pub fn delay(&self, attempt: u32, unit: f64) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 0.99);
        if jitter == 0.0 {
            return nominal;
        }

        let spread = (unit.clamp(0.0, 1.0) * 2.0 - 1.0) * jitter;
        nominal.mul_f64(1.0 + spread)
    }
}
