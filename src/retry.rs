use std::time::Duration;

use crate::config::{BackoffStrategy, PipelineConfig};

/// Retry envelope for broker commit failures.
///
/// Attempt `k` (1-based) sleeps `min(max_backoff, k * interval)` under the
/// linear curve and `min(max_backoff, interval * 2^(k-1))` under the
/// exponential one.
#[derive(Debug, Clone)]
pub struct CommitRetryPolicy {
    strategy: BackoffStrategy,
    interval: Duration,
    max_backoff: Duration,
    retries: u32,
}

impl CommitRetryPolicy {
    pub fn new(
        strategy: BackoffStrategy,
        interval: Duration,
        max_backoff: Duration,
        retries: u32,
    ) -> Self {
        Self {
            strategy,
            interval,
            max_backoff,
            retries,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.backoff_strategy,
            config.backoff_interval,
            config.max_backoff,
            config.commit_retries,
        )
    }

    /// Maximum number of retries after the initial attempt.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay before retry attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Linear => self.interval.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.interval.saturating_mul(factor)
            }
        };
        delay.min(self.max_backoff)
    }
}
