//! Batching Deterministic Simulation Testing Harness
//!
//! Hammers a batch processor from several producer threads while the main
//! thread fires flush timers at random, then checks:
//!
//! - **Conservation**: every item appears in exactly one emitted envelope or
//!   was accounted as `backpressure`
//! - **Batch bound**: no envelope carries more than `max_batch_size` items
//! - **Count header**: `item_count` matches the payload length
//!
//! Thread interleaving is up to the OS; the seed drives the item mix, the
//! producer yields, and the timer schedule.

use crate::batch::{
    BatchProcessor, CollectingSink, EnvelopeSink, LogBatchProcessor, LogLevel, ManualTimerFactory,
    StructuredLog, LOG_CONTENT_TYPE,
};
use crate::clock::{Clock, SimulatedClock, Timestamp};
use crate::config::BatchConfig;
use crate::envelope::item::CONTENT_TYPE_KEY;
use crate::envelope::{Envelope, ItemType};
use crate::report::{ClientReportRecorder, DataCategory, DiscardReason};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Which processor the harness drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchTarget {
    /// `BatchProcessor<u64>` emitting `span` envelopes
    Items,
    /// Double-buffered `LogBatchProcessor`
    Logs,
}

/// Result of a single DST run
#[derive(Debug)]
pub struct BatchDSTResult {
    pub seed: u64,
    pub produced: u64,
    pub emitted: u64,
    pub dropped: u64,
    pub envelopes: usize,
    pub duplicates: usize,
    pub oversized: usize,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// Configuration for the batching DST harness
#[derive(Debug, Clone)]
pub struct BatchDSTConfig {
    pub target: BatchTarget,
    pub producers: usize,
    pub items_per_producer: usize,
    pub max_batch_size: usize,
    /// Chance per main-thread step that every armed timer fires
    pub timer_fire_prob: f64,
    /// Chance a producer yields its time slice after an item
    pub yield_prob: f64,
}

impl Default for BatchDSTConfig {
    fn default() -> Self {
        BatchDSTConfig {
            target: BatchTarget::Items,
            producers: 4,
            items_per_producer: 250,
            max_batch_size: 8,
            timer_fire_prob: 0.3,
            yield_prob: 0.1,
        }
    }
}

impl BatchDSTConfig {
    pub fn items() -> Self {
        Self::default()
    }

    pub fn logs() -> Self {
        BatchDSTConfig {
            target: BatchTarget::Logs,
            ..Default::default()
        }
    }

    /// Smallest legal buffers, many producers, timers firing constantly
    pub fn contention(target: BatchTarget) -> Self {
        BatchDSTConfig {
            target,
            producers: 8,
            items_per_producer: 200,
            max_batch_size: 2,
            timer_fire_prob: 0.8,
            yield_prob: 0.3,
        }
    }
}

enum Processor {
    Items(BatchProcessor<u64>),
    Logs(LogBatchProcessor),
}

impl Processor {
    fn enqueue(&self, id: u64, at: Timestamp) -> bool {
        let result = match self {
            Processor::Items(p) => p.enqueue(id),
            Processor::Logs(p) => p.enqueue(StructuredLog::new(at, LogLevel::Info, id.to_string())),
        };
        matches!(result, Ok(true))
    }

    fn flush(&self) -> usize {
        match self {
            Processor::Items(p) => p.flush(),
            Processor::Logs(p) => p.flush(),
        }
    }

    fn pending(&self) -> usize {
        match self {
            Processor::Items(p) => p.pending(),
            Processor::Logs(p) => p.pending(),
        }
    }
}

/// Batching DST Harness
pub struct BatchDSTHarness {
    seed: u64,
    rng: ChaCha8Rng,
    config: BatchDSTConfig,
}

impl BatchDSTHarness {
    pub fn new(seed: u64, config: BatchDSTConfig) -> Self {
        BatchDSTHarness {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        }
    }

    fn failed(&self, message: String) -> BatchDSTResult {
        BatchDSTResult {
            seed: self.seed,
            produced: 0,
            emitted: 0,
            dropped: 0,
            envelopes: 0,
            duplicates: 0,
            oversized: 0,
            passed: false,
            error_message: Some(message),
        }
    }

    pub fn run(&mut self) -> BatchDSTResult {
        let clock: Arc<dyn Clock> = Arc::new(SimulatedClock::new(1_700_000_000_000));
        let sink = Arc::new(CollectingSink::new());
        let recorder = Arc::new(ClientReportRecorder::new(true, Arc::clone(&clock)));
        let timers = ManualTimerFactory::new();
        let batch = BatchConfig {
            max_batch_size: self.config.max_batch_size,
            flush_interval: Duration::from_millis(100),
        };

        let sink_dyn: Arc<dyn EnvelopeSink> = sink.clone();
        let built = match self.config.target {
            BatchTarget::Items => BatchProcessor::new(
                &batch,
                ItemType::Span,
                None,
                sink_dyn,
                Arc::clone(&recorder),
                &timers,
            )
            .map(Processor::Items),
            BatchTarget::Logs => {
                LogBatchProcessor::new(&batch, sink_dyn, Arc::clone(&recorder), &timers)
                    .map(Processor::Logs)
            }
        };
        let processor = match built {
            Ok(p) => p,
            Err(e) => return self.failed(format!("Failed to build processor: {}", e)),
        };

        // Phase 1: concurrent producers, timers fired from this thread
        let producers = self.config.producers;
        let per_producer = self.config.items_per_producer;
        let yield_prob = self.config.yield_prob;
        let producer_seeds: Vec<u64> = (0..producers).map(|_| self.rng.gen()).collect();
        let finished = AtomicUsize::new(0);
        let accepted = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for (index, seed) in producer_seeds.iter().enumerate() {
                let processor = &processor;
                let finished = &finished;
                let accepted = &accepted;
                let clock = &clock;
                scope.spawn(move || {
                    let mut rng = ChaCha8Rng::seed_from_u64(*seed);
                    for n in 0..per_producer {
                        let id = (index * per_producer + n) as u64;
                        if processor.enqueue(id, clock.now()) {
                            accepted.fetch_add(1, Ordering::Relaxed);
                        }
                        if rng.gen_bool(yield_prob) {
                            std::thread::yield_now();
                        }
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                });
            }

            while finished.load(Ordering::SeqCst) < producers {
                if self.rng.gen_bool(self.config.timer_fire_prob) {
                    timers.fire_all();
                }
                std::thread::yield_now();
            }
        });

        // Phase 2: final flush
        processor.flush();
        let leftover = processor.pending();

        // Phase 3: verify
        let produced = (producers * per_producer) as u64;
        let category = match self.config.target {
            BatchTarget::Items => DataCategory::Span,
            BatchTarget::Logs => DataCategory::LogItem,
        };
        let dropped = recorder.pending(DiscardReason::Backpressure, category);

        let mut seen = HashSet::new();
        let mut duplicates = 0usize;
        let mut oversized = 0usize;
        let mut emitted = 0u64;
        let envelopes = sink.envelopes();
        for envelope in &envelopes {
            let ids = match self.batch_ids(envelope) {
                Ok(ids) => ids,
                Err(e) => return self.failed(e),
            };
            if ids.len() > self.config.max_batch_size {
                oversized += 1;
            }
            if ids.len() as u64 != envelope.telemetry_count() {
                return self.failed(format!(
                    "item_count {} does not match payload length {}",
                    envelope.telemetry_count(),
                    ids.len()
                ));
            }
            for id in ids {
                emitted += 1;
                if !seen.insert(id) {
                    duplicates += 1;
                }
            }
        }

        let accepted = accepted.load(Ordering::SeqCst) as u64;
        let mut violations = Vec::new();
        if emitted + dropped != produced {
            violations.push(format!(
                "produced {} != emitted {} + dropped {}",
                produced, emitted, dropped
            ));
        }
        if accepted != emitted {
            violations.push(format!("accepted {} != emitted {}", accepted, emitted));
        }
        if duplicates > 0 {
            violations.push(format!("{} duplicate items", duplicates));
        }
        if oversized > 0 {
            violations.push(format!("{} oversized batches", oversized));
        }
        if leftover > 0 {
            violations.push(format!("{} items left after flush", leftover));
        }

        let passed = violations.is_empty();
        BatchDSTResult {
            seed: self.seed,
            produced,
            emitted,
            dropped,
            envelopes: envelopes.len(),
            duplicates,
            oversized,
            passed,
            error_message: (!passed)
                .then(|| format!("INVARIANT VIOLATION: {}", violations.join("; "))),
        }
    }

    /// Item ids carried by one emitted envelope
    fn batch_ids(&self, envelope: &Envelope) -> Result<Vec<u64>, String> {
        let item = envelope
            .items()
            .first()
            .ok_or_else(|| "emitted envelope has no items".to_string())?;
        if self.config.target == BatchTarget::Logs
            && item.header().get(CONTENT_TYPE_KEY).and_then(Value::as_str) != Some(LOG_CONTENT_TYPE)
        {
            return Err("log batch without log content type".to_string());
        }

        let payload = item
            .payload_json()
            .map_err(|e| format!("unreadable batch payload: {}", e))?;
        let items = payload
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| "batch payload has no items array".to_string())?;

        items
            .iter()
            .map(|value| {
                let id = match self.config.target {
                    BatchTarget::Items => value.as_u64(),
                    BatchTarget::Logs => value
                        .get("body")
                        .and_then(Value::as_str)
                        .and_then(|body| body.parse().ok()),
                };
                id.ok_or_else(|| format!("unrecognized batch entry {}", value))
            })
            .collect()
    }
}

/// Run a batch of DST tests across multiple seeds
pub fn run_batch_dst_batch(
    seeds: std::ops::Range<u64>,
    config: BatchDSTConfig,
) -> Vec<BatchDSTResult> {
    seeds
        .map(|seed| BatchDSTHarness::new(seed, config.clone()).run())
        .collect()
}

/// Summarize batch results
pub fn summarize_batch_dst_batch(results: &[BatchDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let produced: u64 = results.iter().map(|r| r.produced).sum();
    let emitted: u64 = results.iter().map(|r| r.emitted).sum();
    let dropped: u64 = results.iter().map(|r| r.dropped).sum();
    let envelopes: usize = results.iter().map(|r| r.envelopes).sum();

    let mut summary = format!(
        "Batch DST Batch: {}/{} passed ({} failed)\n\
         Produced: {}, Emitted: {}, Dropped: {}, Envelopes: {}",
        passed, total, failed, produced, emitted, dropped, envelopes
    );

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.passed) {
            summary.push_str(&format!(
                "\n  Seed {}: {}",
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_dst_items() {
        let results = run_batch_dst_batch(0..5, BatchDSTConfig::items());
        for r in &results {
            assert!(r.passed, "Seed {} failed: {:?}", r.seed, r.error_message);
            assert!(r.envelopes > 0);
        }
    }

    #[test]
    fn test_batch_dst_logs() {
        let results = run_batch_dst_batch(0..5, BatchDSTConfig::logs());
        for r in &results {
            assert!(r.passed, "Seed {} failed: {:?}", r.seed, r.error_message);
        }
    }

    #[test]
    fn test_single_producer_never_drops() {
        let config = BatchDSTConfig {
            producers: 1,
            timer_fire_prob: 0.0,
            ..BatchDSTConfig::items()
        };
        let results = run_batch_dst_batch(0..3, config);
        for r in &results {
            assert!(r.passed, "Seed {} failed: {:?}", r.seed, r.error_message);
            assert_eq!(r.dropped, 0);
            assert_eq!(r.emitted, r.produced);
        }
    }
}
