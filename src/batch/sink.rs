//! Destination for flushed batches

use crate::envelope::Envelope;
use parking_lot::Mutex;

/// Receives each flushed batch.
///
/// Implementations must not block and must account for any envelope they
/// cannot accept, since the processor has already let go of it.
pub trait EnvelopeSink: Send + Sync {
    fn capture(&self, envelope: Envelope);
}

/// Keeps every captured envelope in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    envelopes: Mutex<Vec<Envelope>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.envelopes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical items across all captured envelopes
    pub fn telemetry_count(&self) -> u64 {
        self.envelopes
            .lock()
            .iter()
            .map(Envelope::telemetry_count)
            .sum()
    }
}

impl EnvelopeSink for CollectingSink {
    fn capture(&self, envelope: Envelope) {
        self.envelopes.lock().push(envelope);
    }
}
