//! Retry policy with exponential backoff and jitter.
//!
//! Applies only to failures classified transient by
//! [`AgentError::is_transient`](crate::agent::AgentError::is_transient);
//! permanent failures surface immediately.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff parameters for transient stage failures.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Additional attempts after the first (0 disables retrying).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay, pre-jitter.
    pub max_delay: Duration,
    /// Jitter fraction in `[0.0, 1.0]`; the final delay is scaled by a
    /// random factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total attempts allowed, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Deterministic delay before retry number `retry` (1-based), without
    /// jitter. Saturates at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = self.multiplier.max(1.0).powi(exponent.min(63) as i32);
        let raw = self.base_delay.as_millis() as f64 * factor;
        let capped = raw.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// `delay_for` with jitter applied.
    #[must_use]
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let base = self.delay_for(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    }
}
