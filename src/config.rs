//! Delivery Configuration
//!
//! All knobs of the delivery pipeline in one serde-friendly struct. Values
//! are validated once at construction time; invalid values are an error,
//! never silently clamped.
//!
//! ```toml
//! max_queue_items = 30
//! shutdown_timeout = 2000   # milliseconds, 0 = don't wait
//! cache_dir = "/var/cache/app/telemetry"
//!
//! [batch]
//! max_batch_size = 100
//! flush_interval = 5000
//!
//! [retry]
//! max_attempts = 3
//! ```

use crate::error::ConfigError;
use crate::worker::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Size/time batching parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Items per emitted envelope (default: 100)
    pub max_batch_size: usize,
    /// Maximum age of the first item in a batch (default: 5s)
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_batch_size: 100,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size < 1 {
            return Err(ConfigError::BatchSize(self.max_batch_size));
        }
        if self.flush_interval.is_zero() || self.flush_interval == Duration::MAX {
            return Err(ConfigError::FlushInterval(self.flush_interval));
        }
        Ok(())
    }
}

/// Adaptive downsampling parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Run the periodic health check (default: false)
    pub enabled: bool,
    /// Interval between health checks (default: 10s)
    #[serde(with = "duration_millis")]
    pub check_interval: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        BackpressureConfig {
            enabled: false,
            check_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration for the delivery workers and batch processors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Queue capacity, counting the item being sent (default: 30)
    pub max_queue_items: usize,
    /// Graceful drain budget at shutdown; zero abandons immediately (default: 2s)
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
    /// Default budget for `flush` (default: 2s)
    #[serde(with = "duration_millis")]
    pub flush_timeout: Duration,
    /// Attach discard accounting to outgoing envelopes (default: true)
    pub send_client_reports: bool,
    /// Directory for the durable worker's spill files; `None` disables caching
    pub cache_dir: Option<PathBuf>,
    /// Maximum spill files on disk (default: 30)
    pub max_cache_items: usize,
    pub retry: RetryPolicy,
    pub batch: BatchConfig,
    pub backpressure: BackpressureConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            max_queue_items: 30,
            shutdown_timeout: Duration::from_secs(2),
            flush_timeout: Duration::from_secs(2),
            send_client_reports: true,
            cache_dir: None,
            max_cache_items: 30,
            retry: RetryPolicy::default(),
            batch: BatchConfig::default(),
            backpressure: BackpressureConfig::default(),
        }
    }
}

impl DeliveryConfig {
    /// Configuration for testing (small queues, short timeouts)
    pub fn test() -> Self {
        DeliveryConfig {
            max_queue_items: 8,
            shutdown_timeout: Duration::from_millis(500),
            flush_timeout: Duration::from_millis(500),
            send_client_reports: true,
            cache_dir: None,
            max_cache_items: 8,
            retry: RetryPolicy::test(),
            batch: BatchConfig {
                max_batch_size: 4,
                flush_interval: Duration::from_millis(100),
            },
            backpressure: BackpressureConfig::default(),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: DeliveryConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_items < 1 {
            return Err(ConfigError::QueueCapacity(self.max_queue_items));
        }
        if self.max_cache_items < 1 {
            return Err(ConfigError::CacheCapacity(self.max_cache_items));
        }
        if self.backpressure.enabled && self.backpressure.check_interval.is_zero() {
            return Err(ConfigError::CheckInterval(self.backpressure.check_interval));
        }
        self.retry.validate()?;
        self.batch.validate()
    }
}

/// Serde helper for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeliveryConfig::default();
        assert_eq!(config.max_queue_items, 30);
        assert_eq!(config.max_cache_items, 30);
        assert!(config.send_client_reports);
        assert!(config.cache_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_test_config_is_valid() {
        let config = DeliveryConfig::test();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch.max_batch_size, 4);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = DeliveryConfig::from_toml_str(
            r#"
            max_queue_items = 5
            shutdown_timeout = 0
            cache_dir = "/tmp/telemetry-cache"

            [batch]
            flush_interval = 250

            [retry]
            max_attempts = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.max_queue_items, 5);
        assert_eq!(config.shutdown_timeout, Duration::ZERO);
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/telemetry-cache")));
        assert_eq!(config.batch.flush_interval, Duration::from_millis(250));
        assert_eq!(config.batch.max_batch_size, 100);
        assert_eq!(config.retry.max_attempts, 7);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = DeliveryConfig::default();
        config.max_queue_items = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::QueueCapacity(0))
        ));

        let mut config = DeliveryConfig::default();
        config.batch.flush_interval = Duration::ZERO;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FlushInterval(_))
        ));

        assert!(matches!(
            DeliveryConfig::from_toml_str("max_queue_items = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_config_serialization() {
        let config = DeliveryConfig::test();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: DeliveryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
