//! Tunables for the scheduler loop, worker pool and result handler.

use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

/// Default poll interval; matches cron's one-minute resolution.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Default deadline for a single store call.
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;

/// Default deadline for a single webhook call.
pub const DEFAULT_DELIVERY_TIMEOUT_SECS: u64 = 20;

/// Default number of concurrent deliveries.
pub const DEFAULT_DELIVERY_CONCURRENCY: usize = 8;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_RETRY_BASE_SECS: u64 = 30;

/// Default cap on the retry delay.
pub const DEFAULT_RETRY_MAX_SECS: u64 = 600;

/// Default number of consecutive failed occurrences before a task is disabled.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Scheduler loop configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on how long the loop sleeps between ticks.
    pub poll_interval: Duration,
    /// Deadline applied to every store call made by the loop.
    pub store_timeout: Duration,
    /// Timezone cron expressions are evaluated in.
    pub utc_offset: FixedOffset,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            store_timeout: Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS),
            utc_offset: Utc.fix(),
        }
    }
}

/// Delivery worker pool configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Deadline for one webhook call.
    pub timeout: Duration,
    /// Maximum deliveries in flight.
    pub concurrency: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_DELIVERY_TIMEOUT_SECS),
            concurrency: DEFAULT_DELIVERY_CONCURRENCY,
        }
    }
}

/// Retry and disable policy applied to failed deliveries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries per occurrence after the scheduled attempt fails.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry.
    pub base_delay: Duration,
    /// Cap on the retry delay.
    pub max_delay: Duration,
    /// Consecutive permanently-failed occurrences that disable a task.
    /// Zero disables the check.
    pub failure_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_secs(DEFAULT_RETRY_BASE_SECS),
            max_delay: Duration::from_secs(DEFAULT_RETRY_MAX_SECS),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

impl RetryPolicy {
    /// Whether an occurrence whose `attempt`-th try just failed gets another.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Delay before retrying after the `attempt`-th try failed.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        // Exponential backoff: base, 2*base, 4*base, ... capped at max_delay
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }

    /// Whether `consecutive_failures` crosses the disable threshold.
    pub fn should_disable(&self, consecutive_failures: u32) -> bool {
        self.failure_threshold > 0 && consecutive_failures >= self.failure_threshold
    }
}
