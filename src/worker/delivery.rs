//! In-memory delivery worker
//!
//! Sends each envelope once. Failures are accounted in the client report
//! recorder and the loop moves on.

use super::core::{
    discard_reason, DeliveryContext, EnvelopeHandler, EnvelopeSender, HandleFuture,
    QueuedEnvelope, WorkerCore, WorkerState,
};
use crate::batch::EnvelopeSink;
use crate::config::DeliveryConfig;
use crate::envelope::Envelope;
use crate::error::WorkerError;
use crate::report::DiscardReason;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct SendOnce {
    sender: Arc<EnvelopeSender>,
}

impl EnvelopeHandler for SendOnce {
    fn handle<'a>(&'a self, item: QueuedEnvelope, abort: &'a CancellationToken) -> HandleFuture<'a> {
        Box::pin(async move {
            let envelope = item.envelope;
            match self.sender.send_once(&envelope, abort).await {
                Ok(()) => debug!(items = envelope.telemetry_count(), "Envelope delivered"),
                Err(e) => {
                    warn!(error = %e, items = envelope.telemetry_count(), "Envelope send failed");
                    self.sender.account(&envelope, discard_reason(&e));
                }
            }
        })
    }

    fn abandon(&self, item: QueuedEnvelope) {
        self.sender.account(&item.envelope, DiscardReason::SendError);
    }
}

/// Bounded queue plus one background sender
pub struct DeliveryWorker {
    core: WorkerCore,
    flush_timeout: Duration,
    ctx: DeliveryContext,
}

impl DeliveryWorker {
    /// Validate `config` and start the loop. Must be called inside a tokio
    /// runtime.
    pub fn new(config: &DeliveryConfig, ctx: DeliveryContext) -> Result<Self, WorkerError> {
        config.validate()?;

        let sender = Arc::new(EnvelopeSender::new(ctx.clone(), config.send_client_reports));
        let handler = Arc::new(SendOnce {
            sender: Arc::clone(&sender),
        });
        let core = WorkerCore::spawn(
            "memory",
            handler,
            sender,
            config.max_queue_items,
            config.shutdown_timeout,
            config.send_client_reports,
            Vec::new(),
        );

        Ok(DeliveryWorker {
            core,
            flush_timeout: config.flush_timeout,
            ctx,
        })
    }

    /// Never blocks. `Ok(false)` when the queue is full or the envelope is
    /// empty; `Err(Disposed)` once shutdown has begun.
    pub fn enqueue(&self, envelope: Envelope) -> Result<bool, WorkerError> {
        self.core.enqueue(envelope)
    }

    /// Wait for everything enqueued so far, bounded by `timeout`
    pub async fn flush(&self, timeout: Duration) -> bool {
        self.core.flush(timeout).await
    }

    /// Flush with the configured timeout
    pub async fn flush_default(&self) -> bool {
        self.core.flush(self.flush_timeout).await
    }

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
}

impl EnvelopeSink for DeliveryWorker {
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
