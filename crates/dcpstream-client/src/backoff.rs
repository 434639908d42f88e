//! Reopen Backoff Policy
//!
//! Exponential backoff with jitter for stream reopen attempts.
//!
//! ```text
//! delay = min(min_delay * multiplier^attempt, max_delay)
//!
//! Defaults (100ms min, 2x multiplier, 30s max):
//! - Attempt 0: 100ms
//! - Attempt 1: 200ms
//! - Attempt 2: 400ms
//! - Attempt 3: 800ms
//! - ...capped at 30s
//! ```
//!
//! Jitter (±25%) prevents a thundering herd of reopen attempts when many
//! partitions lose their streams at once, e.g. after an upstream node
//! restart.

use std::time::Duration;

/// Backoff policy for per-partition stream reopen attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Upper bound for any retry delay.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Deterministic delay for a given attempt number (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let millis =
            self.min_delay.as_millis() as f64 * self.multiplier.powi(attempt.min(63) as i32);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Delay for a given attempt with ±25% jitter applied.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay(attempt);
        let jitter = 0.75 + (rand::random::<f64>() * 0.5); // 0.75-1.25x
        Duration::from_millis((base.as_millis() as f64 * jitter) as u64).min(self.max_delay)
    }
}
