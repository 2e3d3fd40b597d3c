//! Discard taxonomy: why an item was dropped locally and what kind it was

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a telemetry item never reached the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    QueueOverflow,
    CacheOverflow,
    RatelimitBackoff,
    NetworkError,
    SampleRate,
    BeforeSend,
    EventProcessor,
    Backpressure,
    SendError,
    BufferOverflow,
}

impl DiscardReason {
    pub const ALL: [DiscardReason; 10] = [
        DiscardReason::QueueOverflow,
        DiscardReason::CacheOverflow,
        DiscardReason::RatelimitBackoff,
        DiscardReason::NetworkError,
        DiscardReason::SampleRate,
        DiscardReason::BeforeSend,
        DiscardReason::EventProcessor,
        DiscardReason::Backpressure,
        DiscardReason::SendError,
        DiscardReason::BufferOverflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::QueueOverflow => "queue_overflow",
            DiscardReason::CacheOverflow => "cache_overflow",
            DiscardReason::RatelimitBackoff => "ratelimit_backoff",
            DiscardReason::NetworkError => "network_error",
            DiscardReason::SampleRate => "sample_rate",
            DiscardReason::BeforeSend => "before_send",
            DiscardReason::EventProcessor => "event_processor",
            DiscardReason::Backpressure => "backpressure",
            DiscardReason::SendError => "send_error",
            DiscardReason::BufferOverflow => "buffer_overflow",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of telemetry, used for server-side volume reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    Default,
    Error,
    Transaction,
    Session,
    Attachment,
    Security,
    Profile,
    Span,
    LogItem,
}

impl DataCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::Default => "default",
            DataCategory::Error => "error",
            DataCategory::Transaction => "transaction",
            DataCategory::Session => "session",
            DataCategory::Attachment => "attachment",
            DataCategory::Security => "security",
            DataCategory::Profile => "profile",
            DataCategory::Span => "span",
            DataCategory::LogItem => "log_item",
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compound counter key. Equal fields mean the same counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiscardReasonWithCategory {
    pub reason: DiscardReason,
    pub category: DataCategory,
}

impl DiscardReasonWithCategory {
    pub fn new(reason: DiscardReason, category: DataCategory) -> Self {
        DiscardReasonWithCategory { reason, category }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_independent_keys_aggregate() {
        let mut counts = HashMap::new();
        let a = DiscardReasonWithCategory::new(DiscardReason::QueueOverflow, DataCategory::Error);
        let b = DiscardReasonWithCategory::new(DiscardReason::QueueOverflow, DataCategory::Error);
        *counts.entry(a).or_insert(0) += 1;
        *counts.entry(b).or_insert(0) += 1;
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[&a], 2);
    }

    #[test]
    fn test_wire_names_match_serde() {
        for reason in DiscardReason::ALL {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_str()));
        }
        assert_eq!(
            serde_json::to_string(&DataCategory::LogItem).unwrap(),
            "\"log_item\""
        );
    }
}
