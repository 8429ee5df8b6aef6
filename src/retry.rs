//! Exponential backoff with jitter
//!
//! Shared by query retries, reconnect attempts and queue replays.

use rand::Rng;
use std::time::Duration;

use crate::config::{ExecutorConfig, SupervisorConfig};

/// Retry policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra delay, as a fraction of the computed delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Total attempts including the first one
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based), without jitter
    #[must_use]
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retry number `retry` (1-based), jittered and capped
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for(retry);
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = delay.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter));
        (delay + extra).min(self.max_delay)
    }
}

impl From<&ExecutorConfig> for RetryPolicy {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            ..Self::default()
        }
    }
}

impl From<&SupervisorConfig> for RetryPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_retries: config.max_reconnect_attempts,
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
            ..Self::default()
        }
    }
}
