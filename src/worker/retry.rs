//! Bounded retry with capped exponential backoff

use crate::config::duration_millis;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total send attempts per envelope, including the first (default: 3)
    pub max_attempts: u32,
    /// Delay before the first retry (default: 100ms)
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    /// Upper bound for any single delay (default: 5s)
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    /// Growth factor between retries (default: 2.0)
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Fast retries for tests
    pub fn test() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        }
    }

    /// Send once, never retry
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts < 1 {
            return Err(ConfigError::RetryPolicy(format!(
                "max_attempts must be at least 1, got {}",
                self.max_attempts
            )));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::RetryPolicy(format!(
                "multiplier must be finite and at least 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(ConfigError::RetryPolicy(format!(
                "initial_backoff {:?} exceeds max_backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempts` have failed
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay after the `attempt`-th failure (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        debug_assert!(attempt >= 1, "Precondition: attempt is 1-based");
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
