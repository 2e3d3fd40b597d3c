//! Discard accounting
//!
//! Every local drop goes through `ClientReportRecorder`, so the collector can
//! reconcile what the application produced against what arrived.

use super::client_report::ClientReport;
use super::discard::{DataCategory, DiscardReason, DiscardReasonWithCategory};
use crate::clock::Clock;
use crate::counter::CounterMap;
use crate::envelope::{Envelope, ItemType};
use std::sync::Arc;
use tracing::debug;

/// Counts discarded items by reason and category
pub struct ClientReportRecorder {
    enabled: bool,
    clock: Arc<dyn Clock>,
    counts: CounterMap<DiscardReasonWithCategory>,
}

impl std::fmt::Debug for ClientReportRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientReportRecorder")
            .field("enabled", &self.enabled)
            .field("pending", &self.counts.total())
            .finish()
    }
}

impl ClientReportRecorder {
    /// A disabled recorder ignores every call and never produces a report.
    pub fn new(enabled: bool, clock: Arc<dyn Clock>) -> Self {
        ClientReportRecorder {
            enabled,
            clock,
            counts: CounterMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_discarded(&self, reason: DiscardReason, category: DataCategory) {
        self.record_discarded_n(reason, category, 1);
    }

    pub fn record_discarded_n(&self, reason: DiscardReason, category: DataCategory, quantity: u64) {
        if !self.enabled || quantity == 0 {
            return;
        }
        debug!(
            reason = reason.as_str(),
            category = category.as_str(),
            quantity,
            "Recording discarded telemetry"
        );
        self.counts
            .add(&DiscardReasonWithCategory::new(reason, category), quantity);
    }

    /// Account every telemetry item in a dropped envelope.
    ///
    /// Client report items are skipped: their counts are restored through
    /// `load` by whoever attached them, not discarded.
    pub fn record_discarded_envelope(&self, reason: DiscardReason, envelope: &Envelope) {
        for item in envelope.items() {
            if item.item_type() == ItemType::ClientReport {
                continue;
            }
            self.record_discarded_n(reason, item.data_category(), item.item_count());
        }
    }

    /// Snapshot and zero all counters.
    ///
    /// Returns `None` when disabled or when nothing was discarded since the
    /// previous report; an immediately following call also returns `None`.
    pub fn generate_report(&self) -> Option<ClientReport> {
        if !self.enabled {
            return None;
        }
        let snapshot = self.counts.read_all_and_reset();
        ClientReport::new(self.clock.now(), snapshot)
    }

    /// Add the counts of an undelivered report back into the live counters
    pub fn load(&self, report: &ClientReport) {
        for (key, quantity) in report.discarded() {
            self.record_discarded_n(key.reason, key.category, *quantity);
        }
    }

    /// Discards recorded but not yet reported
    pub fn pending(&self, reason: DiscardReason, category: DataCategory) -> u64 {
        self.counts
            .get(&DiscardReasonWithCategory::new(reason, category))
    }

    pub fn pending_total(&self) -> u64 {
        self.counts.total()
    }
}
