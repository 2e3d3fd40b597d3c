//! Structured-log batch buffer
//!
//! A `BatchBuffer` with a flush scope and a disposed flag. Adds report which
//! position they took so the owning processor knows when to arm the timer
//! (first) and when to capture (last). While a flush is in progress the
//! buffer refuses new logs so the processor can route them to its other
//! buffer.

use super::buffer::BatchBuffer;
use super::log::StructuredLog;
use super::scope::{FlushEntry, FlushGuard, FlushScope};
use crate::error::ConfigError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAddStatus {
    AddedFirst,
    Added,
    AddedLast,
    IgnoredCapacityExceeded,
    IgnoredIsFlushing,
    IgnoredIsDisposed,
}

impl LogAddStatus {
    pub fn is_added(&self) -> bool {
        matches!(
            self,
            LogAddStatus::AddedFirst | LogAddStatus::Added | LogAddStatus::AddedLast
        )
    }
}

/// Result of `LogBatchBuffer::add`
#[derive(Debug)]
pub struct LogAddOutcome {
    pub status: LogAddStatus,
    /// The log handed back when it was not stored
    pub rejected: Option<StructuredLog>,
}

pub struct LogBatchBuffer {
    buffer: BatchBuffer<StructuredLog>,
    timeout: Duration,
    scope: FlushScope,
    disposed: AtomicBool,
}

impl std::fmt::Debug for LogBatchBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBatchBuffer")
            .field("capacity", &self.buffer.capacity())
            .field("count", &self.buffer.count())
            .field("flushing", &self.scope.is_flushing())
            .finish()
    }
}

impl LogBatchBuffer {
    pub fn new(capacity: usize, timeout: Duration) -> Result<Self, ConfigError> {
        if timeout.is_zero() {
            return Err(ConfigError::FlushInterval(timeout));
        }
        Ok(LogBatchBuffer {
            buffer: BatchBuffer::new(capacity)?,
            timeout,
            scope: FlushScope::new(),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.is_full()
    }

    pub fn count(&self) -> usize {
        self.buffer.count()
    }

    pub fn add(&self, log: StructuredLog) -> LogAddOutcome {
        if self.disposed.load(Ordering::SeqCst) {
            return LogAddOutcome {
                status: LogAddStatus::IgnoredIsDisposed,
                rejected: Some(log),
            };
        }
        if self.scope.is_flushing() {
            return LogAddOutcome {
                status: LogAddStatus::IgnoredIsFlushing,
                rejected: Some(log),
            };
        }

        let result = self.buffer.try_add(log);
        let status = match result.slot {
            _ if !result.added() => LogAddStatus::IgnoredCapacityExceeded,
            1 => LogAddStatus::AddedFirst,
            slot if slot == self.buffer.capacity() => LogAddStatus::AddedLast,
            _ => LogAddStatus::Added,
        };
        LogAddOutcome {
            status,
            rejected: result.rejected,
        }
    }

    /// Enter the flush scope; `None` when another flush holds it
    pub fn try_flush(&self) -> Option<LogFlushScope<'_>> {
        match self.scope.try_enter() {
            FlushEntry::Entered(guard) => Some(LogFlushScope {
                buffer: self,
                _guard: guard,
            }),
            FlushEntry::AlreadyFlushing => None,
        }
    }

    /// Refuse all further adds
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Exclusive right to drain a `LogBatchBuffer`
pub struct LogFlushScope<'a> {
    buffer: &'a LogBatchBuffer,
    _guard: FlushGuard<'a>,
}

impl LogFlushScope<'_> {
    pub fn drain(&self) -> Vec<StructuredLog> {
        self.buffer.buffer.drain()
    }
}
