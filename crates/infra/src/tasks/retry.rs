//! Broker-side retry backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(retry - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * retry
    Linear,
}

/// Delay schedule the broker applies before redelivering a failed task.
///
/// The retry *bound* is per task (`TaskMessage::max_retry`); the policy only
/// decides how long a task waits before its next attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0) to spread redeliveries
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15 * 60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Redeliver immediately. Useful for tests and local development.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Delay before the given redelivery (1-indexed: the first retry is 1).
    ///
    /// Jitter is a deterministic offset within `±jitter` of the raw delay, so
    /// tasks failing together on the same retry still spread out across
    /// retries. The result never exceeds `max(max_delay, base_delay)`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let doublings = (retry - 1).min(31);
                self.base_delay.saturating_mul(1 << doublings).min(self.max_delay)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry).min(self.max_delay),
        };

        let offset_ms = raw.as_millis() as f64 * self.jitter * spread(retry);
        let offset = Duration::from_millis(offset_ms.abs() as u64);
        let jittered = if offset_ms < 0.0 {
            raw.saturating_sub(offset)
        } else {
            raw.saturating_add(offset)
        };

        jittered.min(self.max_delay.max(self.base_delay))
    }
}

/// Low-discrepancy value in `[-1, 1)` for the given retry.
fn spread(retry: u32) -> f64 {
    const GOLDEN_FRACTION: f64 = 0.618_033_988_749_895;
    (f64::from(retry) * GOLDEN_FRACTION).fract() * 2.0 - 1.0
}
