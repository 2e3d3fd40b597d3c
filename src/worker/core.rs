//! Worker Core - bounded queue + single consumer loop
//!
//! Producers call `enqueue`, which never blocks and never does I/O. One tokio
//! task per worker dequeues strictly FIFO and hands each envelope to an
//! `EnvelopeHandler`, one at a time.
//!
//! ## Lifecycle
//!
//! ```text
//! Running ──shutdown()──► ShuttingDown ──drain done / aborted──► Stopped
//! ```
//!
//! - `shutdown` stops accepting, lets the loop drain for up to the shutdown
//!   timeout, then fires the abort token which cancels the in-flight send.
//! - A zero timeout fires the abort token immediately and returns at once.
//! - Whatever is still queued when the loop stops goes to
//!   `EnvelopeHandler::abandon`.
//! - The loop publishes `stopped` on a watch channel as it exits, so any
//!   number of callers can wait for it and the shutdown deadline never
//!   depends on who else is waiting.
//!
//! ## Capacity
//!
//! `max_queue_items` bounds what producers may reserve through `enqueue`,
//! counting the item in flight. Recovered backlog and the report-only
//! envelope pushed by `flush` are internal and never take a reservation.
//!
//! ## Flush watermark
//!
//! `accepted` counts items handed to the channel and `processed` counts items
//! the loop finished, both monotonic. `flush` snapshots `accepted` and waits
//! until `processed` catches up. `accepted` is bumped before the channel send,
//! so every enqueue that returned before the snapshot is covered.

use super::transport::Transport;
use crate::backpressure::BackpressureMonitor;
use crate::clock::Clock;
use crate::config::DeliveryConfig;
use crate::envelope::Envelope;
use crate::error::{TransportError, WorkerError};
use crate::report::{ClientReportRecorder, DiscardReason};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Running = 0,
    ShuttingDown = 1,
    Stopped = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Running,
            1 => WorkerState::ShuttingDown,
            _ => WorkerState::Stopped,
        }
    }
}

/// Collaborators shared by every worker flavour
#[derive(Clone)]
pub struct DeliveryContext {
    pub transport: Arc<dyn Transport>,
    pub recorder: Arc<ClientReportRecorder>,
    pub clock: Arc<dyn Clock>,
    pub monitor: Option<Arc<BackpressureMonitor>>,
}

impl DeliveryContext {
    /// Build the collaborators `config` asks for: a recorder honouring
    /// `send_client_reports`, and a periodically checked backpressure
    /// monitor when `backpressure.enabled` is set.
    ///
    /// Must be called inside a tokio runtime when backpressure is enabled.
    pub fn from_config(
        config: &DeliveryConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let recorder = Arc::new(ClientReportRecorder::new(
            config.send_client_reports,
            Arc::clone(&clock),
        ));
        let monitor = config.backpressure.enabled.then(|| {
            debug!(
                check_interval_ms = config.backpressure.check_interval.as_millis() as u64,
                "Backpressure monitoring enabled"
            );
            BackpressureMonitor::start(Arc::clone(&clock), &config.backpressure)
        });
        DeliveryContext {
            transport,
            recorder,
            clock,
            monitor,
        }
    }
}

/// One queued unit of work
#[derive(Debug)]
pub(crate) struct QueuedEnvelope {
    pub envelope: Envelope,
    /// Spill file already holding this envelope, if any
    pub cache_file: Option<PathBuf>,
    /// Holds one of the `max_queue_items` reservations
    reserved: bool,
}

impl QueuedEnvelope {
    /// Producer envelope admitted by `enqueue`
    fn admitted(envelope: Envelope) -> Self {
        QueuedEnvelope {
            envelope,
            cache_file: None,
            reserved: true,
        }
    }

    /// Envelope replayed from a spill file at startup
    pub fn recovered(envelope: Envelope, cache_file: PathBuf) -> Self {
        QueuedEnvelope {
            envelope,
            cache_file: Some(cache_file),
            reserved: false,
        }
    }

    /// Empty envelope; sent as a standalone client report
    fn report_only() -> Self {
        QueuedEnvelope {
            envelope: Envelope::new(),
            cache_file: None,
            reserved: false,
        }
    }
}

pub(crate) type HandleFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// What the loop does with each item
pub(crate) trait EnvelopeHandler: Send + Sync + 'static {
    /// Deliver one item. Must return promptly once `abort` fires.
    fn handle<'a>(&'a self, item: QueuedEnvelope, abort: &'a CancellationToken) -> HandleFuture<'a>;
    /// Item still queued when the loop stopped
    fn abandon(&self, item: QueuedEnvelope);
    /// Runs once, after the last item
    fn on_stopped(&self) {}
}

// ============================================================================
// Sending
// ============================================================================

/// Single send attempt with client report piggyback and failure accounting
pub(crate) struct EnvelopeSender {
    ctx: DeliveryContext,
    send_client_reports: bool,
}

impl EnvelopeSender {
    pub fn new(ctx: DeliveryContext, send_client_reports: bool) -> Self {
        EnvelopeSender {
            ctx,
            send_client_reports,
        }
    }

    pub fn recorder(&self) -> &ClientReportRecorder {
        &self.ctx.recorder
    }

    pub fn clock(&self) -> &dyn Clock {
        self.ctx.clock.as_ref()
    }

    /// Send once. A pending client report rides along and is restored into
    /// the recorder if the send does not succeed.
    pub async fn send_once(
        &self,
        envelope: &Envelope,
        abort: &CancellationToken,
    ) -> Result<(), TransportError> {
        if abort.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let mut outgoing = envelope.clone();
        let report = if self.send_client_reports {
            self.ctx.recorder.generate_report()
        } else {
            None
        };
        if let Some(report) = &report {
            if let Err(e) = outgoing.attach_client_report(report) {
                error!(error = %e, "Failed to attach client report");
                self.ctx.recorder.load(report);
            }
        }
        if outgoing.is_empty() {
            return Ok(());
        }

        let result = tokio::select! {
            biased;
            _ = abort.cancelled() => Err(TransportError::Cancelled),
            result = self.ctx.transport.send(&outgoing, abort) => result,
        };

        if result.is_err() {
            if let Some(report) = &report {
                self.ctx.recorder.load(report);
            }
        }
        if let Err(TransportError::RateLimited { retry_after }) = &result {
            debug!(?retry_after, "Collector rate limited the client");
            if let Some(monitor) = &self.ctx.monitor {
                monitor.record_rate_limit_hit(self.ctx.clock.now());
            }
        }
        result
    }

    /// Record every telemetry item of a dropped envelope
    pub fn account(&self, envelope: &Envelope, reason: DiscardReason) {
        self.ctx.recorder.record_discarded_envelope(reason, envelope);
    }

    pub fn record_queue_overflow(&self) {
        if let Some(monitor) = &self.ctx.monitor {
            monitor.record_queue_overflow();
        }
    }
}

/// Discard reason for a final send failure
pub(crate) fn discard_reason(error: &TransportError) -> DiscardReason {
    match error {
        TransportError::Transient(_) => DiscardReason::NetworkError,
        TransportError::RateLimited { .. } => DiscardReason::RatelimitBackoff,
        TransportError::Rejected { .. } | TransportError::Cancelled => DiscardReason::SendError,
    }
}

// ============================================================================
// Core
// ============================================================================

struct LoopShared {
    state: AtomicU8,
    /// Reserved items, queued or in flight
    queued: AtomicUsize,
    /// Backlog and report-only items, queued or in flight
    unreserved: AtomicUsize,
    accepted: AtomicU64,
    processed: watch::Sender<u64>,
    stopped: watch::Sender<bool>,
}

impl LoopShared {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn release(&self, reserved: bool) {
        if reserved {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.unreserved.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn finish_one(&self, reserved: bool) {
        self.release(reserved);
        self.processed.send_modify(|n| *n += 1);
    }

    async fn wait_stopped(&self) {
        let mut rx = self.stopped.subscribe();
        // The sender lives as long as `self`, so this only returns once set.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Marks the loop stopped however it exits, including a panicking handler
struct StoppedGuard(Arc<LoopShared>);

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        self.0
            .state
            .store(WorkerState::Stopped as u8, Ordering::SeqCst);
        self.0.stopped.send_replace(true);
    }
}

pub(crate) struct WorkerCore {
    shared: Arc<LoopShared>,
    tx: mpsc::UnboundedSender<QueuedEnvelope>,
    capacity: usize,
    shutdown_timeout: Duration,
    shutdown: CancellationToken,
    abort: CancellationToken,
    sender: Arc<EnvelopeSender>,
    send_client_reports: bool,
    name: &'static str,
}

impl WorkerCore {
    /// Start the loop. `backlog` is queued ahead of any new work and does
    /// not count against `capacity`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn<H: EnvelopeHandler>(
        name: &'static str,
        handler: Arc<H>,
        sender: Arc<EnvelopeSender>,
        capacity: usize,
        shutdown_timeout: Duration,
        send_client_reports: bool,
        backlog: Vec<QueuedEnvelope>,
    ) -> Self {
        debug_assert!(capacity >= 1, "Precondition: capacity validated by config");

        let (tx, rx) = mpsc::unbounded_channel();
        let (processed, _) = watch::channel(0u64);
        let (stopped, _) = watch::channel(false);
        let shared = Arc::new(LoopShared {
            state: AtomicU8::new(WorkerState::Running as u8),
            queued: AtomicUsize::new(0),
            unreserved: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            processed,
            stopped,
        });

        for item in backlog {
            debug_assert!(!item.reserved, "Precondition: backlog holds no reservations");
            shared.unreserved.fetch_add(1, Ordering::SeqCst);
            shared.accepted.fetch_add(1, Ordering::SeqCst);
            // The receiver is alive until the loop below starts.
            let _ = tx.send(item);
        }

        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        tokio::spawn(run_loop(
            name,
            handler,
            rx,
            Arc::clone(&shared),
            shutdown.clone(),
            abort.clone(),
        ));

        WorkerCore {
            shared,
            tx,
            capacity,
            shutdown_timeout,
            shutdown,
            abort,
            sender,
            send_client_reports,
            name,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Items queued or in flight, recovered backlog included
    pub fn queued_count(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst) + self.shared.unreserved.load(Ordering::SeqCst)
    }

    /// Never blocks. `Ok(false)` when full or the envelope is empty; the
    /// caller accounts the drop.
    pub fn enqueue(&self, envelope: Envelope) -> Result<bool, WorkerError> {
        if self.state() != WorkerState::Running {
            return Err(WorkerError::Disposed);
        }
        if envelope.is_empty() {
            return Ok(false);
        }

        let capacity = self.capacity;
        let reserved = self
            .shared
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued < capacity).then_some(queued + 1)
            });
        if reserved.is_err() {
            debug!(worker = self.name, capacity, "Queue full, rejecting envelope");
            self.sender.record_queue_overflow();
            return Ok(false);
        }

        self.push(QueuedEnvelope::admitted(envelope))?;
        Ok(true)
    }

    /// Hand an item to the loop; returns its watermark. A reserved item
    /// must already hold its slot in `queued`.
    fn push(&self, item: QueuedEnvelope) -> Result<u64, WorkerError> {
        let reserved = item.reserved;
        if !reserved {
            self.shared.unreserved.fetch_add(1, Ordering::SeqCst);
        }
        let mark = self.shared.accepted.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(item).is_err() {
            self.shared.accepted.fetch_sub(1, Ordering::SeqCst);
            self.shared.release(reserved);
            return Err(WorkerError::Disposed);
        }
        Ok(mark)
    }

    /// Wait until everything enqueued before the call is processed, then
    /// send a standalone client report if discards are pending.
    ///
    /// Returns false on timeout. A no-op on a worker that is not running.
    pub async fn flush(&self, timeout: Duration) -> bool {
        if self.state() != WorkerState::Running {
            return true;
        }
        let deadline = Instant::now() + timeout;

        let target = self.shared.accepted.load(Ordering::SeqCst);
        if !self.wait_processed(target, deadline).await {
            debug!(worker = self.name, "Flush timed out");
            return false;
        }

        if self.send_client_reports && self.sender.recorder().pending_total() > 0 {
            match self.push(QueuedEnvelope::report_only()) {
                Ok(mark) => return self.wait_processed(mark, deadline).await,
                Err(_) => return true,
            }
        }
        true
    }

    async fn wait_processed(&self, target: u64, deadline: Instant) -> bool {
        let mut rx = self.shared.processed.subscribe();
        let waited = tokio::time::timeout_at(deadline, rx.wait_for(|n| *n >= target))
            .await
            .map(|reached| reached.is_ok());
        waited.unwrap_or(false)
    }

    /// Stop accepting, drain for up to the shutdown timeout, then abort.
    pub async fn shutdown(&self) {
        let transitioned = self.shared.state.compare_exchange(
            WorkerState::Running as u8,
            WorkerState::ShuttingDown as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if transitioned.is_err() {
            return;
        }
        info!(
            worker = self.name,
            queued = self.queued_count(),
            timeout_ms = self.shutdown_timeout.as_millis() as u64,
            "Shutting down delivery worker"
        );
        self.shutdown.cancel();

        if self.shutdown_timeout.is_zero() {
            self.abort.cancel();
            return;
        }

        if tokio::time::timeout(self.shutdown_timeout, self.shared.wait_stopped())
            .await
            .is_err()
        {
            warn!(worker = self.name, "Shutdown timeout elapsed, aborting in-flight work");
            self.abort.cancel();
            self.shared.wait_stopped().await;
        }
    }

    /// Resolve once the loop has fully stopped. Any number of callers may
    /// wait concurrently.
    pub async fn wait_stopped(&self) {
        self.shared.wait_stopped().await
    }
}

impl Drop for WorkerCore {
    fn drop(&mut self) {
        if self.state() != WorkerState::Running {
            return;
        }
        self.shared
            .state
            .store(WorkerState::ShuttingDown as u8, Ordering::SeqCst);
        self.shutdown.cancel();

        let abort = self.abort.clone();
        let timeout = self.shutdown_timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) if !timeout.is_zero() => {
                runtime.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    abort.cancel();
                });
            }
            _ => abort.cancel(),
        }
    }
}

async fn run_loop<H: EnvelopeHandler>(
    name: &'static str,
    handler: Arc<H>,
    mut rx: mpsc::UnboundedReceiver<QueuedEnvelope>,
    shared: Arc<LoopShared>,
    shutdown: CancellationToken,
    abort: CancellationToken,
) {
    debug!(worker = name, "Delivery loop started");
    let _stopped = StoppedGuard(Arc::clone(&shared));

    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let reserved = item.reserved;
        handler.handle(item, &abort).await;
        shared.finish_one(reserved);
    }

    let mut drained = 0usize;
    while !abort.is_cancelled() {
        match rx.try_recv() {
            Ok(item) => {
                let reserved = item.reserved;
                handler.handle(item, &abort).await;
                shared.finish_one(reserved);
                drained += 1;
            }
            Err(_) => break,
        }
    }

    rx.close();
    let mut abandoned = 0usize;
    while let Ok(item) = rx.try_recv() {
        let reserved = item.reserved;
        handler.abandon(item);
        shared.finish_one(reserved);
        abandoned += 1;
    }

    handler.on_stopped();
    info!(worker = name, drained, abandoned, "Delivery loop stopped");
}
