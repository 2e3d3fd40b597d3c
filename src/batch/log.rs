//! Structured log records

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const LOG_CONTENT_TYPE: &str = "application/vnd.sentry.items.log+json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[serde(rename = "warn")]
    Warning,
    Error,
    Fatal,
}

/// One structured log line as sent to the collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredLog {
    #[serde(with = "timestamp_secs")]
    pub timestamp: Timestamp,
    pub level: LogLevel,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl StructuredLog {
    pub fn new(timestamp: Timestamp, level: LogLevel, body: impl Into<String>) -> Self {
        StructuredLog {
            timestamp,
            level,
            body: body.into(),
            trace_id: None,
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Timestamp as fractional Unix seconds
mod timestamp_secs {
    use crate::clock::Timestamp;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(timestamp: &Timestamp, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        timestamp.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Timestamp::from_millis((secs.max(0.0) * 1000.0).round() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_log_wire_form() {
        let log = StructuredLog::new(Timestamp(1_700_000_000_250), LogLevel::Warning, "disk low")
            .with_attribute("free_mb", 12)
            .with_trace_id("abc");

        assert_eq!(
            serde_json::to_value(&log).unwrap(),
            json!({
                "timestamp": 1_700_000_000.25,
                "level": "warn",
                "body": "disk low",
                "trace_id": "abc",
                "attributes": {"free_mb": 12}
            })
        );
    }

    #[test]
    fn test_log_parses_back() {
        let log = StructuredLog::new(Timestamp(42_000), LogLevel::Info, "hi");
        let parsed: StructuredLog =
            serde_json::from_str(&serde_json::to_string(&log).unwrap()).unwrap();
        assert_eq!(parsed, log);
    }
}
