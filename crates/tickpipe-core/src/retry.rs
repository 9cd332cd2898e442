//! Retry scheduling with capped exponential backoff and jitter.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff constants for retried jobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// A job is marked failed once its attempt count exceeds this.
    pub max_attempts: u32,
    #[serde(with = "crate::config::duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    #[serde(with = "crate::config::duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Fraction of the delay applied as symmetric random jitter, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based count of attempts made).
    ///
    /// `base * 2^(attempt - 1)`, capped at `max_delay`, jittered, and never
    /// shorter than `retry_after` when the provider suggested one.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let seconds = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        let capped = Duration::from_secs_f64(seconds.min(self.max_delay.as_secs_f64()));

        let jittered = apply_jitter(capped, self.jitter.clamp(0.0, 1.0));
        match retry_after {
            Some(suggested) => jittered.max(suggested),
            None => jittered,
        }
    }

    pub const fn exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_attempts
    }
}

fn apply_jitter(delay: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 {
        return delay;
    }

    let spread_ms = (delay.as_millis() as f64 * fraction) as u64;
    if spread_ms == 0 {
        return delay;
    }
    let offset = fastrand::u64(0..=spread_ms * 2);
    let total_ms = delay.as_millis() as i128 + i128::from(offset) - i128::from(spread_ms);
    Duration::from_millis(total_ms.max(0) as u64)
}
