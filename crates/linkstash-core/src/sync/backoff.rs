//! Retry policy for sync sessions
//!
//! `delay(n) = min(base * 2^n, max) + U[0, jitter)`

use std::time::Duration;

use uuid::Uuid;

use crate::config::Config;

/// Exponential backoff with a capped delay and bounded attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on the exponential part
    pub max_delay: Duration,
    /// Sessions attempted before giving up (including the first)
    pub max_attempts: u32,
    /// Random extra delay, uniformly below this bound
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_millis(config.retry_max_ms),
            max_attempts: config.retry_max_attempts.max(1),
            jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt` (0-based), jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff(attempt) + self.random_jitter()
    }

    fn random_jitter(&self) -> Duration {
        let bound = self.jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        let (random, _) = Uuid::new_v4().as_u64_pair();
        Duration::from_millis(random % bound)
    }
}
