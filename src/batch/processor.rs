//! Size/time batching
//!
//! Items accumulate in a `BatchBuffer`. A batch is emitted as one envelope
//! when the buffer fills or when the flush interval elapses after the first
//! item of the batch, whichever comes first. The flush scope makes sure only
//! one trigger drains; the others find an empty buffer and emit nothing.
//!
//! ## Trigger protocol
//!
//! - claim of slot 1: arm the timer
//! - claim of slot N: disarm the timer, flush, re-arm if a new batch started
//! - timer elapsed: flush whatever is buffered
//! - claim past N: drop the item and account it as `backpressure`

use super::buffer::BatchBuffer;
use super::scope::{FlushEntry, FlushScope};
use super::sink::EnvelopeSink;
use super::timer::{FlushTimer, TimerFactory};
use crate::config::BatchConfig;
use crate::envelope::{Envelope, ItemType};
use crate::error::{ConfigError, WorkerError};
use crate::report::{ClientReportRecorder, DiscardReason};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

pub struct BatchProcessor<T>
where
    T: Serialize + Send + Sync + 'static,
{
    inner: Arc<ProcessorInner<T>>,
}

struct ProcessorInner<T> {
    /// `None` when every item is its own batch
    buffer: Option<BatchBuffer<T>>,
    flush_interval: Duration,
    scope: FlushScope,
    timer: Arc<dyn FlushTimer>,
    sink: Arc<dyn EnvelopeSink>,
    recorder: Arc<ClientReportRecorder>,
    item_type: ItemType,
    content_type: Option<String>,
    disposed: AtomicBool,
}

impl<T> BatchProcessor<T>
where
    T: Serialize + Send + Sync + 'static,
{
    pub fn new(
        config: &BatchConfig,
        item_type: ItemType,
        content_type: Option<&str>,
        sink: Arc<dyn EnvelopeSink>,
        recorder: Arc<ClientReportRecorder>,
        timers: &dyn TimerFactory,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let buffer = match config.max_batch_size {
            1 => None,
            size => Some(BatchBuffer::new(size)?),
        };

        Ok(BatchProcessor {
            inner: Arc::new(ProcessorInner {
                buffer,
                flush_interval: config.flush_interval,
                scope: FlushScope::new(),
                timer: timers.create_timer(),
                sink,
                recorder,
                item_type,
                content_type: content_type.map(str::to_string),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Add one item.
    ///
    /// `Ok(false)` means the item was dropped and already accounted.
    pub fn enqueue(&self, item: T) -> Result<bool, WorkerError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(WorkerError::Disposed);
        }

        let Some(buffer) = &inner.buffer else {
            inner.emit(vec![item]);
            return Ok(true);
        };

        let result = buffer.try_add(item);
        if result.slot == 1 {
            inner.arm_timer();
        }
        if result.slot == buffer.capacity() {
            inner.timer.disarm();
            inner.flush();
            if !buffer.is_empty() {
                inner.arm_timer();
            }
        }

        if !result.added() {
            debug!(item_type = %inner.item_type, "Batch buffer full, dropping item");
            inner.recorder.record_discarded(
                DiscardReason::Backpressure,
                inner.item_type.data_category(),
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Emit whatever is buffered now. Returns the number of items emitted,
    /// zero when another flush is already running.
    pub fn flush(&self) -> usize {
        self.inner.flush()
    }

    pub fn pending(&self) -> usize {
        self.inner.buffer.as_ref().map_or(0, BatchBuffer::count)
    }

    /// Stop the timer and make one non-blocking flush attempt
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl<T> Drop for BatchProcessor<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl<T> ProcessorInner<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn arm_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.timer.arm(
            self.flush_interval,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.flush();
                }
            }),
        );
    }

    fn flush(&self) -> usize {
        let Some(buffer) = &self.buffer else {
            return 0;
        };

        let mut emitted = 0;
        loop {
            match self.scope.try_enter() {
                FlushEntry::AlreadyFlushing => return emitted,
                FlushEntry::Entered(_guard) => {
                    let items = buffer.drain();
                    emitted += items.len();
                    self.emit(items);
                }
            }
            // A producer may have filled the buffer while we held the scope
            // and lost the race to flush it.
            if !buffer.is_full() {
                return emitted;
            }
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timer.disarm();

        let Some(buffer) = &self.buffer else {
            return;
        };
        if let FlushEntry::Entered(_guard) = self.scope.try_enter() {
            self.emit(buffer.drain());
        }
    }

    fn emit(&self, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        let count = items.len();
        match serde_json::to_value(&items) {
            Ok(value) => {
                debug!(count, item_type = %self.item_type, "Flushing batch");
                self.sink.capture(Envelope::from_batch(
                    self.item_type.clone(),
                    self.content_type.as_deref(),
                    json!({ "items": value }),
                    count,
                ));
            }
            Err(e) => {
                error!(error = %e, count, "Failed to serialize batch");
                self.recorder.record_discarded_n(
                    DiscardReason::SendError,
                    self.item_type.data_category(),
                    count as u64,
                );
            }
        }
    }
}
