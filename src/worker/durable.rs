//! Durable delivery worker
//!
//! Same queue and loop as `DeliveryWorker`, but every envelope is spilled to
//! the cache directory before its first send attempt and only removed once
//! it is delivered or finally dropped. Transient failures are retried per
//! `RetryPolicy`.
//!
//! ## Cache layout
//!
//! ```text
//! <cache_dir>.lock                           exclusive lock, one process
//! <cache_dir>/<ms:013>-<seq:06>.envelope     one serialized envelope
//! ```
//!
//! File names sort by write time, so recovery replays oldest first. Recovery
//! also resumes the sequence after the highest one on disk, so a restart
//! within the same millisecond never reuses a name. If the lock is held by
//! another instance, caching is disabled and the worker behaves like the
//! in-memory one plus retries.

use super::core::{
    discard_reason, DeliveryContext, EnvelopeHandler, EnvelopeSender, HandleFuture,
    QueuedEnvelope, WorkerCore, WorkerState,
};
use super::retry::RetryPolicy;
use crate::batch::EnvelopeSink;
use crate::cache::{CacheCoordinator, FileSystem};
use crate::config::DeliveryConfig;
use crate::envelope::Envelope;
use crate::error::{ConfigError, TransportError, WorkerError};
use crate::report::DiscardReason;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Extension of spill files
pub const ENVELOPE_EXTENSION: &str = "envelope";

const SEQ_MODULUS: u64 = 1_000_000;

/// Sequence part of a `<ms>-<seq>.envelope` name
fn spill_seq(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let (_, seq) = stem.split_once('-')?;
    seq.parse().ok()
}

/// Why an envelope did not reach the disk
#[derive(Debug)]
enum Spill {
    Written(PathBuf),
    Disabled,
    CacheFull,
    Failed,
}

struct SpillCache {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    enabled: bool,
    max_items: usize,
    seq: AtomicU64,
}

impl SpillCache {
    fn file_name(&self, millis: u64) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % SEQ_MODULUS;
        format!("{:013}-{:06}.{}", millis, seq, ENVELOPE_EXTENSION)
    }

    fn write(&self, envelope: &Envelope, millis: u64) -> Spill {
        if !self.enabled || envelope.is_empty() {
            return Spill::Disabled;
        }
        let count = match self.fs.list_files(&self.dir, ENVELOPE_EXTENSION) {
            Ok(files) => files.len(),
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list cache directory");
                return Spill::Failed;
            }
        };
        if count >= self.max_items {
            debug!(count, max = self.max_items, "Cache full, keeping envelope in memory");
            return Spill::CacheFull;
        }

        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to serialize envelope for cache");
                return Spill::Failed;
            }
        };
        let path = self.dir.join(self.file_name(millis));
        match self.fs.write(&path, &bytes) {
            Ok(()) => Spill::Written(path),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write cache file");
                Spill::Failed
            }
        }
    }

    fn remove(&self, path: Option<&Path>) {
        if let Some(path) = path {
            if let Err(e) = self.fs.remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove cache file");
            }
        }
    }

    /// Parse every spill file, oldest first. Unreadable files are deleted.
    /// New names continue after the highest sequence found.
    fn recover(&self) -> Vec<QueuedEnvelope> {
        let files = match self.fs.list_files(&self.dir, ENVELOPE_EXTENSION) {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list cache directory");
                return Vec::new();
            }
        };

        if let Some(last) = files.iter().filter_map(|path| spill_seq(path)).max() {
            self.seq.store((last + 1) % SEQ_MODULUS, Ordering::Relaxed);
        }

        let mut recovered = Vec::with_capacity(files.len());
        for path in files {
            let parsed = self
                .fs
                .read(&path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| Envelope::from_bytes(bytes).map_err(|e| e.to_string()));
            match parsed {
                Ok(envelope) if !envelope.is_empty() => {
                    recovered.push(QueuedEnvelope::recovered(envelope, path))
                }
                Ok(_) => self.remove(Some(&path)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Deleting corrupt cache file");
                    self.remove(Some(&path));
                }
            }
        }
        recovered
    }
}

struct SendWithRetry {
    sender: Arc<EnvelopeSender>,
    cache: SpillCache,
    retry: RetryPolicy,
    coordinator: Arc<CacheCoordinator>,
}

impl SendWithRetry {
    fn spill(&self, envelope: &Envelope) -> Spill {
        self.cache
            .write(envelope, self.sender.clock().now().as_millis())
    }

    /// Lost to shutdown: a spilled envelope waits for the next start
    fn interrupted(&self, envelope: &Envelope, cache_file: Option<&Path>) {
        match cache_file {
            Some(path) => debug!(path = %path.display(), "Send interrupted, kept in cache"),
            None => self.sender.account(envelope, DiscardReason::SendError),
        }
    }
}

impl EnvelopeHandler for SendWithRetry {
    fn handle<'a>(&'a self, item: QueuedEnvelope, abort: &'a CancellationToken) -> HandleFuture<'a> {
        Box::pin(async move {
            let QueuedEnvelope {
                envelope,
                cache_file,
                ..
            } = item;
            let cache_file = match cache_file {
                Some(path) => Some(path),
                None => match self.spill(&envelope) {
                    Spill::Written(path) => Some(path),
                    _ => None,
                },
            };

            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match self.sender.send_once(&envelope, abort).await {
                    Ok(()) => {
                        debug!(attempt, items = envelope.telemetry_count(), "Envelope delivered");
                        self.cache.remove(cache_file.as_deref());
                        return;
                    }
                    Err(TransportError::Cancelled) => {
                        self.interrupted(&envelope, cache_file.as_deref());
                        return;
                    }
                    Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                        let delay = self.retry.backoff(attempt);
                        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Send failed, retrying");
                        tokio::select! {
                            biased;
                            _ = abort.cancelled() => {
                                self.interrupted(&envelope, cache_file.as_deref());
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "Dropping envelope");
                        self.sender.account(&envelope, discard_reason(&e));
                        self.cache.remove(cache_file.as_deref());
                        return;
                    }
                }
            }
        })
    }

    fn abandon(&self, item: QueuedEnvelope) {
        if item.cache_file.is_some() {
            return;
        }
        match self.spill(&item.envelope) {
            Spill::Written(path) => debug!(path = %path.display(), "Persisted queued envelope at shutdown"),
            Spill::CacheFull => self
                .sender
                .account(&item.envelope, DiscardReason::CacheOverflow),
            Spill::Disabled | Spill::Failed => self
                .sender
                .account(&item.envelope, DiscardReason::SendError),
        }
    }

    fn on_stopped(&self) {
        self.coordinator.dispose();
    }
}

/// Delivery worker backed by a spill directory
pub struct DurableDeliveryWorker {
    core: WorkerCore,
    coordinator: Arc<CacheCoordinator>,
    caching: bool,
    recovered: usize,
    flush_timeout: Duration,
    ctx: DeliveryContext,
}

impl DurableDeliveryWorker {
    /// Acquire the cache directory, queue any spilled envelopes ahead of new
    /// work, and start the loop. Must be called inside a tokio runtime.
    ///
    /// Lock contention disables caching; other I/O errors are returned.
    pub fn new(
        config: &DeliveryConfig,
        ctx: DeliveryContext,
        fs: Arc<dyn FileSystem>,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        let dir = config
            .cache_dir
            .clone()
            .ok_or(ConfigError::MissingCacheDir)?;

        let coordinator = Arc::new(CacheCoordinator::new(dir.clone(), Arc::clone(&fs)));
        let caching = coordinator.try_acquire()?;
        if !caching {
            warn!(dir = %dir.display(), "Cache directory in use by another instance, caching disabled");
        }

        let cache = SpillCache {
            fs,
            dir,
            enabled: caching,
            max_items: config.max_cache_items,
            seq: AtomicU64::new(0),
        };
        let backlog = if caching { cache.recover() } else { Vec::new() };
        let recovered = backlog.len();
        if recovered > 0 {
            info!(recovered, "Recovered cached envelopes");
        }

        let sender = Arc::new(EnvelopeSender::new(ctx.clone(), config.send_client_reports));
        let handler = Arc::new(SendWithRetry {
            sender: Arc::clone(&sender),
            cache,
            retry: config.retry.clone(),
            coordinator: Arc::clone(&coordinator),
        });
        let core = WorkerCore::spawn(
            "durable",
            handler,
            sender,
            config.max_queue_items,
            config.shutdown_timeout,
            config.send_client_reports,
            backlog,
        );

        Ok(DurableDeliveryWorker {
            core,
            coordinator,
            caching,
            recovered,
            flush_timeout: config.flush_timeout,
            ctx,
        })
    }

    pub fn enqueue(&self, envelope: Envelope) -> Result<bool, WorkerError> {
        self.core.enqueue(envelope)
    }

    pub async fn flush(&self, timeout: Duration) -> bool {
        self.core.flush(timeout).await
    }

    pub async fn flush_default(&self) -> bool {
        self.core.flush(self.flush_timeout).await
    }

    /// Drain, then persist whatever could not be sent in time
    pub async fn shutdown(&self) {
        self.core.shutdown().await
    }

    pub async fn wait_stopped(&self) {
        self.core.wait_stopped().await
    }

    pub fn state(&self) -> WorkerState {
        self.core.state()
    }

    pub fn queued_count(&self) -> usize {
        self.core.queued_count()
    }

    /// Whether this instance owns the cache directory
    pub fn is_caching(&self) -> bool {
        self.caching
    }

    /// Envelopes replayed from disk at startup
    pub fn recovered_count(&self) -> usize {
        self.recovered
    }

    pub fn cache_dir(&self) -> &Path {
        self.coordinator.cache_dir()
    }
}

impl EnvelopeSink for DurableDeliveryWorker {
    fn capture(&self, envelope: Envelope) {
        match self.enqueue(envelope.clone()) {
            Ok(true) => {}
            Ok(false) | Err(_) => self
                .ctx
                .recorder
                .record_discarded_envelope(DiscardReason::QueueOverflow, &envelope),
        }
    }
}
