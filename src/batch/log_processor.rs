//! Structured-log batch processor
//!
//! Two buffers take turns. Producers write to the active one; when it fills,
//! the producer that took the last slot swaps the active index and captures
//! the full buffer while new logs flow into the other. A log refused by the
//! active buffer (full or flushing) gets one try in the other buffer before
//! it is dropped and accounted as `backpressure`.

use super::log::{StructuredLog, LOG_CONTENT_TYPE};
use super::log_buffer::{LogAddStatus, LogBatchBuffer};
use super::sink::EnvelopeSink;
use super::timer::{FlushTimer, TimerFactory};
use crate::config::BatchConfig;
use crate::envelope::{Envelope, ItemType};
use crate::error::{ConfigError, WorkerError};
use crate::report::{ClientReportRecorder, DataCategory, DiscardReason};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

pub struct LogBatchProcessor {
    inner: Arc<LogProcessorInner>,
}

struct LogProcessorInner {
    buffers: [LogBatchBuffer; 2],
    timers: [Arc<dyn FlushTimer>; 2],
    active: AtomicUsize,
    sink: Arc<dyn EnvelopeSink>,
    recorder: Arc<ClientReportRecorder>,
    disposed: AtomicBool,
}

impl LogBatchProcessor {
    /// `config.max_batch_size` is per buffer and must be at least 2.
    pub fn new(
        config: &BatchConfig,
        sink: Arc<dyn EnvelopeSink>,
        recorder: Arc<ClientReportRecorder>,
        timers: &dyn TimerFactory,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let buffers = [
            LogBatchBuffer::new(config.max_batch_size, config.flush_interval)?,
            LogBatchBuffer::new(config.max_batch_size, config.flush_interval)?,
        ];
        Ok(LogBatchProcessor {
            inner: Arc::new(LogProcessorInner {
                buffers,
                timers: [timers.create_timer(), timers.create_timer()],
                active: AtomicUsize::new(0),
                sink,
                recorder,
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Add one log. `Ok(false)` means it was dropped and already accounted.
    pub fn enqueue(&self, log: StructuredLog) -> Result<bool, WorkerError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(WorkerError::Disposed);
        }

        let active = inner.active.load(Ordering::SeqCst);
        let first = inner.buffers[active].add(log);
        let Some(log) = first.rejected else {
            inner.on_added(active, first.status);
            return Ok(true);
        };

        let other = 1 - active;
        let second = inner.buffers[other].add(log);
        if second.rejected.is_none() {
            inner.on_added(other, second.status);
            return Ok(true);
        }

        debug!(
            first = ?first.status,
            second = ?second.status,
            "Both log buffers refused, dropping log"
        );
        inner
            .recorder
            .record_discarded(DiscardReason::Backpressure, DataCategory::LogItem);
        Ok(false)
    }

    /// Capture both buffers now
    pub fn flush(&self) -> usize {
        self.inner.capture(0) + self.inner.capture(1)
    }

    pub fn active_buffer(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.inner.buffers.iter().map(LogBatchBuffer::count).sum()
    }

    /// Stop both timers, refuse new logs, and make one non-blocking flush
    /// attempt per buffer
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl Drop for LogBatchProcessor {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl LogProcessorInner {
    fn on_added(self: &Arc<Self>, index: usize, status: LogAddStatus) {
        match status {
            LogAddStatus::AddedFirst => self.arm_timer(index),
            LogAddStatus::AddedLast => {
                self.timers[index].disarm();
                self.swap_active_from(index);
                self.capture(index);
                if !self.buffers[index].is_empty() {
                    self.arm_timer(index);
                }
            }
            _ => {}
        }
    }

    fn arm_timer(self: &Arc<Self>, index: usize) {
        let weak = Arc::downgrade(self);
        self.timers[index].arm(
            self.buffers[index].timeout(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_timeout(index);
                }
            }),
        );
    }

    fn on_timeout(&self, index: usize) {
        if self.buffers[index].is_empty() {
            return;
        }
        self.swap_active_from(index);
        self.capture(index);
    }

    fn swap_active_from(&self, index: usize) {
        // Losing the race means someone else already swapped.
        let _ = self
            .active
            .compare_exchange(index, 1 - index, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn capture(&self, index: usize) -> usize {
        let buffer = &self.buffers[index];
        let mut captured = 0;
        loop {
            let Some(scope) = buffer.try_flush() else {
                return captured;
            };
            let logs = scope.drain();
            captured += logs.len();
            self.emit(logs);
            drop(scope);

            if !buffer.is_full() {
                return captured;
            }
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (buffer, timer) in self.buffers.iter().zip(self.timers.iter()) {
            timer.disarm();
            buffer.dispose();
            if let Some(scope) = buffer.try_flush() {
                self.emit(scope.drain());
            }
        }
    }

    fn emit(&self, logs: Vec<StructuredLog>) {
        if logs.is_empty() {
            return;
        }
        let count = logs.len();
        match serde_json::to_value(&logs) {
            Ok(items) => {
                debug!(count, "Flushing log batch");
                self.sink.capture(Envelope::from_batch(
                    ItemType::Log,
                    Some(LOG_CONTENT_TYPE),
                    json!({ "items": items }),
                    count,
                ));
            }
            Err(e) => {
                error!(error = %e, count, "Failed to serialize log batch");
                self.recorder.record_discarded_n(
                    DiscardReason::SendError,
                    DataCategory::LogItem,
                    count as u64,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::log::LogLevel;
    use crate::batch::sink::CollectingSink;
    use crate::batch::timer::ManualTimerFactory;
    use crate::clock::{SimulatedClock, Timestamp};
    use std::thread;
    use std::time::Duration;

    struct Fixture {
        processor: LogBatchProcessor,
        sink: Arc<CollectingSink>,
        recorder: Arc<ClientReportRecorder>,
        timers: ManualTimerFactory,
    }

    fn fixture(capacity: usize) -> Fixture {
        let sink = Arc::new(CollectingSink::new());
        let recorder = Arc::new(ClientReportRecorder::new(
            true,
            Arc::new(SimulatedClock::new(0)),
        ));
        let timers = ManualTimerFactory::new();
        let config = BatchConfig {
            max_batch_size: capacity,
            flush_interval: Duration::from_secs(5),
        };
        let processor =
            LogBatchProcessor::new(&config, sink.clone(), recorder.clone(), &timers).unwrap();
        Fixture {
            processor,
            sink,
            recorder,
            timers,
        }
    }

    fn log(body: &str) -> StructuredLog {
        StructuredLog::new(Timestamp(1_000), LogLevel::Info, body)
    }

    fn bodies(envelope: &Envelope) -> Vec<String> {
        envelope.items()[0].payload_json().unwrap()["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["body"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_capacity_below_two_rejected() {
        let timers = ManualTimerFactory::new();
        let config = BatchConfig {
            max_batch_size: 1,
            flush_interval: Duration::from_secs(1),
        };
        let result = LogBatchProcessor::new(
            &config,
            Arc::new(CollectingSink::new()),
            Arc::new(ClientReportRecorder::new(true, Arc::new(SimulatedClock::new(0)))),
            &timers,
        );
        assert!(matches!(result, Err(ConfigError::BufferCapacity(1))));
    }

    #[test]
    fn test_full_buffer_swaps_and_captures() {
        let f = fixture(2);
        f.processor.enqueue(log("one")).unwrap();
        assert_eq!(f.processor.active_buffer(), 0);
        f.processor.enqueue(log("two")).unwrap();

        assert_eq!(f.processor.active_buffer(), 1);
        let envelopes = f.sink.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(bodies(&envelopes[0]), vec!["one", "two"]);

        let item = &envelopes[0].items()[0];
        assert_eq!(item.item_type(), ItemType::Log);
        assert_eq!(item.item_count(), 2);
        assert_eq!(item.header()["content_type"], LOG_CONTENT_TYPE);
    }

    #[test]
    fn test_timeout_captures_partial_buffer() {
        let f = fixture(3);
        f.processor.enqueue(log("one")).unwrap();
        let timer = f.timers.timer(0).unwrap();
        assert_eq!(timer.armed_delay(), Some(Duration::from_secs(5)));

        assert!(timer.fire());
        assert_eq!(f.processor.active_buffer(), 1);
        assert_eq!(bodies(&f.sink.envelopes()[0]), vec!["one"]);

        f.processor.enqueue(log("two")).unwrap();
        assert!(f.timers.timer(1).unwrap().is_armed());
    }

    #[test]
    fn test_timeout_after_capture_is_noop() {
        let f = fixture(2);
        f.processor.enqueue(log("one")).unwrap();
        f.processor.enqueue(log("two")).unwrap();
        assert!(!f.timers.timer(0).unwrap().fire());
        assert_eq!(f.processor.flush(), 0);
        assert_eq!(f.sink.len(), 1);
    }

    #[test]
    fn test_dispose_flushes_both_buffers() {
        let f = fixture(4);
        f.processor.enqueue(log("a")).unwrap();
        f.timers.timer(0).unwrap().disarm();
        // Force the next log into the second buffer.
        f.inner_swap();
        f.processor.enqueue(log("b")).unwrap();

        f.processor.dispose();
        assert_eq!(f.sink.telemetry_count(), 2);
        assert!(matches!(
            f.processor.enqueue(log("late")),
            Err(WorkerError::Disposed)
        ));
    }

    impl Fixture {
        fn inner_swap(&self) {
            let active = self.processor.active_buffer();
            self.processor.inner.swap_active_from(active);
        }
    }

    #[test]
    fn test_concurrent_producers_conserve_logs() {
        for _ in 0..10 {
            let f = Arc::new(fixture(16));
            let threads = 8;
            let per_thread = 400;

            let handles: Vec<_> = (0..threads)
                .map(|t| {
                    let f = Arc::clone(&f);
                    thread::spawn(move || {
                        for i in 0..per_thread {
                            f.processor.enqueue(log(&format!("{t}-{i}"))).unwrap();
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            f.processor.flush();

            let dropped = f
                .recorder
                .pending(DiscardReason::Backpressure, DataCategory::LogItem);
            assert_eq!(
                f.sink.telemetry_count() + dropped,
                (threads * per_thread) as u64
            );
        }
    }
}
