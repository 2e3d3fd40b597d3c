//! Delivery Deterministic Simulation Testing Harness
//!
//! Verifies the accounting guarantee of the delivery workers under transport
//! faults, queue overflow, and crash/restart:
//!
//! - **Conservation**: every produced telemetry item is delivered, reported
//!   as discarded (in a delivered client report or still pending), or sitting
//!   in the spill directory. Nothing disappears silently.
//! - **At most once**: no envelope reaches the collector twice.
//!
//! ## DST Methodology
//!
//! 1. Drive a worker against a seeded `SimulatedTransport`
//! 2. Interleave producer bursts, cooperative yields, and flushes
//! 3. Optionally crash mid-run (zero-timeout shutdown) and restart on the
//!    same in-memory file system
//! 4. Drain, shut down, and balance the books

use crate::batch::LOG_CONTENT_TYPE;
use crate::cache::{FileSystem, InMemoryFileSystem};
use crate::clock::{Clock, SimulatedClock};
use crate::config::DeliveryConfig;
use crate::envelope::{Envelope, EnvelopeItem, ItemType};
use crate::error::WorkerError;
use crate::report::{ClientReport, DiscardReason};
use crate::worker::{
    DeliveryContext, DeliveryWorker, DurableDeliveryWorker, RetryPolicy, SimulatedTransport,
    SimulatedTransportConfig, SimulatedTransportStats, ENVELOPE_EXTENSION,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Envelope header carrying the harness sequence number
const SEQ_HEADER: &str = "dst_seq";
const CACHE_DIR: &str = "/dst/cache/telemetry";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a single DST run
#[derive(Debug)]
pub struct DeliveryDSTResult {
    pub seed: u64,
    pub produced: u64,
    pub delivered: u64,
    pub discarded: u64,
    pub cached: u64,
    pub duplicates: usize,
    pub restarts: usize,
    pub transport_stats: SimulatedTransportStats,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// Configuration for the delivery DST harness
#[derive(Debug, Clone)]
pub struct DeliveryDSTConfig {
    /// Envelopes produced per run
    pub num_envelopes: usize,
    pub max_queue_items: usize,
    pub max_cache_items: usize,
    /// Use the durable worker instead of the in-memory one
    pub durable: bool,
    /// Crash and restart at a random point mid-run
    pub simulate_crash: bool,
    /// Chance the producer yields to the worker after an envelope
    pub yield_prob: f64,
    /// Chance the producer flushes after an envelope
    pub flush_prob: f64,
    pub transport_config: SimulatedTransportConfig,
}

impl Default for DeliveryDSTConfig {
    fn default() -> Self {
        DeliveryDSTConfig {
            num_envelopes: 100,
            max_queue_items: 16,
            max_cache_items: 30,
            durable: false,
            simulate_crash: false,
            yield_prob: 0.5,
            flush_prob: 0.05,
            transport_config: SimulatedTransportConfig::default(),
        }
    }
}

impl DeliveryDSTConfig {
    /// Reliable transport, no crash - baseline correctness
    pub fn calm() -> Self {
        DeliveryDSTConfig {
            transport_config: SimulatedTransportConfig::reliable(),
            ..Default::default()
        }
    }

    /// Retryable failures against the durable worker, with a crash
    pub fn flaky_transport() -> Self {
        DeliveryDSTConfig {
            durable: true,
            simulate_crash: true,
            transport_config: SimulatedTransportConfig::flaky(),
            ..Default::default()
        }
    }

    /// Every fault kind, tiny queue and cache, rare yields
    pub fn chaos() -> Self {
        DeliveryDSTConfig {
            num_envelopes: 200,
            max_queue_items: 4,
            max_cache_items: 3,
            durable: true,
            simulate_crash: true,
            yield_prob: 0.2,
            flush_prob: 0.02,
            transport_config: SimulatedTransportConfig::high_chaos(),
        }
    }
}

enum HarnessWorker {
    Memory(DeliveryWorker),
    Durable(DurableDeliveryWorker),
}

impl HarnessWorker {
    fn enqueue(&self, envelope: Envelope) -> Result<bool, WorkerError> {
        match self {
            HarnessWorker::Memory(w) => w.enqueue(envelope),
            HarnessWorker::Durable(w) => w.enqueue(envelope),
        }
    }

    async fn flush(&self, timeout: Duration) -> bool {
        match self {
            HarnessWorker::Memory(w) => w.flush(timeout).await,
            HarnessWorker::Durable(w) => w.flush(timeout).await,
        }
    }

    async fn stop(&self) {
        match self {
            HarnessWorker::Memory(w) => {
                w.shutdown().await;
                w.wait_stopped().await;
            }
            HarnessWorker::Durable(w) => {
                w.shutdown().await;
                w.wait_stopped().await;
            }
        }
    }
}

/// Delivery DST Harness
pub struct DeliveryDSTHarness {
    seed: u64,
    rng: ChaCha8Rng,
    config: DeliveryDSTConfig,
}

impl DeliveryDSTHarness {
    pub fn new(seed: u64, config: DeliveryDSTConfig) -> Self {
        DeliveryDSTHarness {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        }
    }

    /// Run a single DST scenario on a fresh single-threaded runtime
    pub fn run(&mut self) -> DeliveryDSTResult {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => return self.failed(format!("Failed to build runtime: {}", e)),
        };
        runtime.block_on(self.simulate())
    }

    fn failed(&self, message: String) -> DeliveryDSTResult {
        DeliveryDSTResult {
            seed: self.seed,
            produced: 0,
            delivered: 0,
            discarded: 0,
            cached: 0,
            duplicates: 0,
            restarts: 0,
            transport_stats: SimulatedTransportStats::default(),
            passed: false,
            error_message: Some(message),
        }
    }

    fn delivery_config(&self, shutdown_timeout: Duration) -> DeliveryConfig {
        DeliveryConfig {
            max_queue_items: self.config.max_queue_items,
            max_cache_items: self.config.max_cache_items,
            shutdown_timeout,
            cache_dir: Some(PathBuf::from(CACHE_DIR)),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
                multiplier: 2.0,
            },
            ..DeliveryConfig::test()
        }
    }

    fn start_worker(
        &self,
        config: &DeliveryConfig,
        ctx: &DeliveryContext,
        fs: &Arc<InMemoryFileSystem>,
    ) -> Result<HarnessWorker, WorkerError> {
        if self.config.durable {
            let fs: Arc<dyn FileSystem> = fs.clone();
            DurableDeliveryWorker::new(config, ctx.clone(), fs).map(HarnessWorker::Durable)
        } else {
            DeliveryWorker::new(config, ctx.clone()).map(HarnessWorker::Memory)
        }
    }

    fn make_envelope(&mut self, seq: usize) -> Envelope {
        let envelope = if self.rng.gen_bool(0.7) {
            Envelope::from_event(&format!("evt-{:06}", seq), json!({ "message": "dst" }))
        } else {
            let count = self.rng.gen_range(1..=5usize);
            let logs: Vec<_> = (0..count).map(|n| json!({ "body": n })).collect();
            let mut envelope = Envelope::from_batch(
                ItemType::Log,
                Some(LOG_CONTENT_TYPE),
                json!({ "items": logs }),
                count,
            );
            if self.rng.gen_bool(0.2) {
                envelope.push_item(EnvelopeItem::json(ItemType::Attachment, json!("blob")));
            }
            envelope
        };
        envelope.with_header(SEQ_HEADER, seq as u64)
    }

    async fn simulate(&mut self) -> DeliveryDSTResult {
        let clock = Arc::new(SimulatedClock::new(1_700_000_000_000));
        let clock_dyn: Arc<dyn Clock> = clock.clone();
        let transport = Arc::new(SimulatedTransport::new(
            self.rng.gen(),
            self.config.transport_config.clone(),
        ));
        let fs = Arc::new(InMemoryFileSystem::new());
        let ctx = DeliveryContext::from_config(
            &self.delivery_config(DRAIN_TIMEOUT),
            transport.clone(),
            clock_dyn,
        );
        let recorder = Arc::clone(&ctx.recorder);

        let num = self.config.num_envelopes;
        let crash_at = if self.config.simulate_crash && num > 1 {
            self.rng.gen_range(1..num)
        } else {
            usize::MAX
        };
        let first_timeout = if crash_at < num {
            Duration::ZERO
        } else {
            DRAIN_TIMEOUT
        };

        let mut worker = match self.start_worker(&self.delivery_config(first_timeout), &ctx, &fs) {
            Ok(w) => w,
            Err(e) => return self.failed(format!("Failed to start worker: {}", e)),
        };

        // Phase 1: produce, possibly crashing mid-sequence
        let mut produced = 0u64;
        let mut restarts = 0usize;
        for seq in 0..num {
            if seq == crash_at {
                worker.stop().await;
                drop(worker);
                fs.simulate_crash();
                restarts += 1;
                worker = match self.start_worker(&self.delivery_config(DRAIN_TIMEOUT), &ctx, &fs) {
                    Ok(w) => w,
                    Err(e) => return self.failed(format!("Failed to restart worker: {}", e)),
                };
            }

            clock.advance_ms(self.rng.gen_range(0..50));
            let envelope = self.make_envelope(seq);
            produced += envelope.telemetry_count();
            match worker.enqueue(envelope.clone()) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    recorder.record_discarded_envelope(DiscardReason::QueueOverflow, &envelope)
                }
            }

            if self.rng.gen_bool(self.config.yield_prob) {
                for _ in 0..self.rng.gen_range(1..4) {
                    tokio::task::yield_now().await;
                }
            }
            if self.rng.gen_bool(self.config.flush_prob) {
                worker.flush(DRAIN_TIMEOUT).await;
            }
        }

        // Phase 2: drain and stop
        if !worker.flush(DRAIN_TIMEOUT).await {
            return self.failed("Final flush timed out".to_string());
        }
        worker.stop().await;
        drop(worker);

        // Phase 3: balance the books
        let delivered_envelopes = transport.delivered();
        let mut delivered = 0u64;
        let mut reported = 0u64;
        let mut seen = HashSet::new();
        let mut duplicates = 0usize;
        for envelope in &delivered_envelopes {
            delivered += envelope.telemetry_count();
            if let Some(seq) = envelope.header().get(SEQ_HEADER).and_then(|v| v.as_u64()) {
                if !seen.insert(seq) {
                    duplicates += 1;
                }
            }
            match reported_in(envelope) {
                Ok(n) => reported += n,
                Err(e) => return self.failed(e),
            }
        }
        let discarded = reported + recorder.pending_total();
        let cached = match cached_telemetry(fs.as_ref()) {
            Ok(n) => n,
            Err(e) => return self.failed(e),
        };

        let balanced = produced == delivered + discarded + cached;
        let passed = balanced && duplicates == 0;
        let error_message = if !passed {
            Some(format!(
                "INVARIANT VIOLATION: produced {} != delivered {} + discarded {} + cached {}, \
                 duplicates {}",
                produced, delivered, discarded, cached, duplicates
            ))
        } else {
            None
        };

        DeliveryDSTResult {
            seed: self.seed,
            produced,
            delivered,
            discarded,
            cached,
            duplicates,
            restarts,
            transport_stats: transport.stats(),
            passed,
            error_message,
        }
    }
}

/// Discards carried by client reports inside a delivered envelope
fn reported_in(envelope: &Envelope) -> Result<u64, String> {
    let mut total = 0;
    for item in envelope.items() {
        if item.item_type() != ItemType::ClientReport {
            continue;
        }
        let value = item
            .payload_json()
            .map_err(|e| format!("Unreadable client report: {}", e))?;
        let report: ClientReport = serde_json::from_value(value)
            .map_err(|e| format!("Malformed client report: {}", e))?;
        total += report.total();
    }
    Ok(total)
}

/// Telemetry still waiting in the spill directory
fn cached_telemetry(fs: &InMemoryFileSystem) -> Result<u64, String> {
    let files = fs
        .list_files(Path::new(CACHE_DIR), ENVELOPE_EXTENSION)
        .map_err(|e| format!("Failed to list cache: {}", e))?;
    let mut total = 0;
    for path in files {
        let bytes = fs
            .read(&path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let envelope = Envelope::from_bytes(bytes)
            .map_err(|e| format!("Corrupt cache file {}: {}", path.display(), e))?;
        total += envelope.telemetry_count();
    }
    Ok(total)
}

/// Run a batch of DST tests across multiple seeds
pub fn run_delivery_dst_batch(
    seeds: std::ops::Range<u64>,
    config: DeliveryDSTConfig,
) -> Vec<DeliveryDSTResult> {
    seeds
        .map(|seed| DeliveryDSTHarness::new(seed, config.clone()).run())
        .collect()
}

/// Summarize batch results
pub fn summarize_delivery_dst_batch(results: &[DeliveryDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let produced: u64 = results.iter().map(|r| r.produced).sum();
    let delivered: u64 = results.iter().map(|r| r.delivered).sum();
    let discarded: u64 = results.iter().map(|r| r.discarded).sum();
    let cached: u64 = results.iter().map(|r| r.cached).sum();
    let restarts: usize = results.iter().map(|r| r.restarts).sum();

    let mut summary = format!(
        "Delivery DST Batch: {}/{} passed ({} failed)\n\
         Produced: {}, Delivered: {}, Discarded: {}, Cached: {}, Restarts: {}",
        passed, total, failed, produced, delivered, discarded, cached, restarts
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
    fn test_delivery_dst_calm() {
        let results = run_delivery_dst_batch(0..5, DeliveryDSTConfig::calm());
        for r in &results {
            assert!(r.passed, "Seed {} failed: {:?}", r.seed, r.error_message);
            assert!(r.delivered > 0);
            assert_eq!(r.cached, 0);
        }
    }

    #[test]
    fn test_delivery_dst_same_seed_same_production() {
        let a = DeliveryDSTHarness::new(42, DeliveryDSTConfig::calm()).run();
        let b = DeliveryDSTHarness::new(42, DeliveryDSTConfig::calm()).run();
        assert_eq!(a.produced, b.produced);
    }

    #[test]
    fn test_delivery_dst_crash_restart() {
        let results = run_delivery_dst_batch(0..5, DeliveryDSTConfig::flaky_transport());
        for r in &results {
            assert!(r.passed, "Seed {} failed: {:?}", r.seed, r.error_message);
            assert_eq!(r.restarts, 1);
        }
        let summary = summarize_delivery_dst_batch(&results);
        assert!(summary.contains("5/5 passed"));
    }
}
