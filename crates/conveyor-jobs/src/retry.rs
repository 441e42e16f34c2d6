//! Retry policy for failed jobs.

use crate::config::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with a cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Returns true if another attempt is allowed after `attempts_made`.
    ///
    /// A job-level limit overrides the policy limit.
    pub fn should_retry(&self, attempts_made: u32, job_max_attempts: Option<u32>) -> bool {
        attempts_made < job_max_attempts.unwrap_or(self.max_attempts)
    }

    /// Delay before retrying after the given (1-based) attempt failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exp = (attempt - 1).min(63) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);

        Duration::from_millis(capped as u64)
    }
}
