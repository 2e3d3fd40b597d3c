//! Client report: a timestamped summary of locally discarded item counts
//!
//! Wire form:
//!
//! ```text
//! {"timestamp":1700000000.5,"discarded_events":[{"reason":"queue_overflow","category":"error","quantity":3}]}
//! ```

use super::discard::{DataCategory, DiscardReason, DiscardReasonWithCategory};
use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Discard counts at a point in time. Entries are always positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "ClientReportWire", try_from = "ClientReportWire")]
pub struct ClientReport {
    timestamp: Timestamp,
    discarded: BTreeMap<DiscardReasonWithCategory, u64>,
}

impl ClientReport {
    /// Build a report from counts, dropping zero entries.
    /// Returns `None` when nothing remains.
    pub fn new(
        timestamp: Timestamp,
        counts: impl IntoIterator<Item = (DiscardReasonWithCategory, u64)>,
    ) -> Option<Self> {
        let mut discarded = BTreeMap::new();
        for (key, quantity) in counts {
            if quantity > 0 {
                *discarded.entry(key).or_insert(0) += quantity;
            }
        }
        if discarded.is_empty() {
            return None;
        }
        Some(ClientReport {
            timestamp,
            discarded,
        })
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn discarded(&self) -> &BTreeMap<DiscardReasonWithCategory, u64> {
        &self.discarded
    }

    pub fn quantity(&self, reason: DiscardReason, category: DataCategory) -> u64 {
        self.discarded
            .get(&DiscardReasonWithCategory::new(reason, category))
            .copied()
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.discarded.values().sum()
    }
}

#[derive(Serialize, Deserialize)]
struct DiscardedEvent {
    reason: DiscardReason,
    category: DataCategory,
    quantity: u64,
}

#[derive(Serialize, Deserialize)]
struct ClientReportWire {
    timestamp: f64,
    #[serde(default)]
    discarded_events: Vec<DiscardedEvent>,
}

impl From<ClientReport> for ClientReportWire {
    fn from(report: ClientReport) -> Self {
        ClientReportWire {
            timestamp: report.timestamp.as_secs_f64(),
            discarded_events: report
                .discarded
                .into_iter()
                .map(|(key, quantity)| DiscardedEvent {
                    reason: key.reason,
                    category: key.category,
                    quantity,
                })
                .collect(),
        }
    }
}

impl TryFrom<ClientReportWire> for ClientReport {
    type Error = &'static str;

    fn try_from(wire: ClientReportWire) -> Result<Self, Self::Error> {
        let millis = if wire.timestamp.is_finite() && wire.timestamp > 0.0 {
            (wire.timestamp * 1000.0) as u64
        } else {
            0
        };
        let counts = wire.discarded_events.into_iter().map(|event| {
            (
                DiscardReasonWithCategory::new(event.reason, event.category),
                event.quantity,
            )
        });
        ClientReport::new(Timestamp::from_millis(millis), counts)
            .ok_or("client report has no positive discard counts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(reason: DiscardReason, category: DataCategory) -> DiscardReasonWithCategory {
        DiscardReasonWithCategory::new(reason, category)
    }

    #[test]
    fn test_never_constructed_empty() {
        assert!(ClientReport::new(Timestamp(1), Vec::new()).is_none());
        assert!(ClientReport::new(
            Timestamp(1),
            vec![(key(DiscardReason::SendError, DataCategory::Error), 0)]
        )
        .is_none());
    }

    #[test]
    fn test_wire_format() {
        let report = ClientReport::new(
            Timestamp(1_700_000_000_500),
            vec![
                (key(DiscardReason::QueueOverflow, DataCategory::Error), 3),
                (key(DiscardReason::Backpressure, DataCategory::LogItem), 7),
            ],
        )
        .unwrap();

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["timestamp"], serde_json::json!(1_700_000_000.5));
        let events = value["discarded_events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["reason"], "queue_overflow");
        assert_eq!(events[0]["category"], "error");
        assert_eq!(events[0]["quantity"], 3);
        assert_eq!(events[1]["reason"], "backpressure");
        assert_eq!(events[1]["category"], "log_item");
    }

    #[test]
    fn test_parse_merges_duplicates_and_skips_zero() {
        let json = r#"{"timestamp":12.0,"discarded_events":[
            {"reason":"network_error","category":"transaction","quantity":2},
            {"reason":"network_error","category":"transaction","quantity":5},
            {"reason":"sample_rate","category":"span","quantity":0}
        ]}"#;
        let report: ClientReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.timestamp(), Timestamp(12_000));
        assert_eq!(report.discarded().len(), 1);
        assert_eq!(
            report.quantity(DiscardReason::NetworkError, DataCategory::Transaction),
            7
        );
        assert_eq!(report.total(), 7);
    }

    #[test]
    fn test_parse_rejects_reports_without_counts() {
        let empty = r#"{"timestamp":1,"discarded_events":[]}"#;
        assert!(serde_json::from_str::<ClientReport>(empty).is_err());

        let zeros = r#"{"timestamp":1,"discarded_events":[
            {"reason":"send_error","category":"error","quantity":0}
        ]}"#;
        assert!(serde_json::from_str::<ClientReport>(zeros).is_err());
        assert!(serde_json::from_str::<ClientReport>(r#"{"timestamp":1}"#).is_err());
    }
}
