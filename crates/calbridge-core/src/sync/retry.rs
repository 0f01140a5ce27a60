//! Exponential backoff for outbound jobs and token refreshes.

use rand::Rng;
use std::time::Duration;

use crate::storage::SyncConfig;

/// Doubling backoff with a cap and up to 25% random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max: max.max(base),
            max_attempts,
        }
    }

    /// Policy for outbound jobs.
    pub fn outbound(config: &SyncConfig) -> Self {
        Self::new(
            Duration::from_secs(config.retry_base_secs),
            Duration::from_secs(config.retry_max_secs),
            config.max_attempts,
        )
    }

    /// Policy for transient token refresh failures.
    pub fn refresh(config: &SyncConfig) -> Self {
        Self::new(
            Duration::from_secs(config.retry_base_secs),
            Duration::from_secs(config.retry_max_secs),
            config.refresh_max_attempts,
        )
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Delay before retry number `attempt`, jittered and still capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let spread = (base.as_millis() / 4) as u64;
        if spread == 0 {
            return base;
        }
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
        (base + jitter).min(self.max)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
