//! Logging setup
//!
//! The library only emits `tracing` events. Binaries and tests install a
//! subscriber here. Settings come from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | DELIVERY_LOG_LEVEL | telemetry_delivery=info | `EnvFilter` directive |
//! | DELIVERY_LOG_FORMAT | text | `text` or `json` |

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "telemetry_delivery=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub filter: String,
    pub format: LogFormat,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Text,
        }
    }
}

impl TracingConfig {
    pub fn from_env() -> Self {
        TracingConfig {
            filter: std::env::var("DELIVERY_LOG_LEVEL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            format: std::env::var("DELIVERY_LOG_FORMAT")
                .map(|s| LogFormat::parse(&s))
                .unwrap_or(LogFormat::Text),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Install the global subscriber. Returns false if one was already set.
pub fn init_tracing(config: &TracingConfig) -> bool {
    let builder = tracing_subscriber::fmt().with_env_filter(config.env_filter());
    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.is_ok()
}
