//! Batching engine
//!
//! - `BatchBuffer`: lock-free-on-append slot array
//! - `BatchProcessor`: size/time batching of any serializable item
//! - `LogBatchProcessor`: double-buffered batching of structured logs
//!
//! Both processors hand finished batches to an `EnvelopeSink`, usually a
//! delivery worker.

pub mod buffer;
pub mod log;
pub mod log_buffer;
pub mod log_processor;
pub mod processor;
pub mod scope;
pub mod sink;
pub mod timer;

pub use buffer::{AddResult, BatchBuffer};
pub use log::{LogLevel, StructuredLog, LOG_CONTENT_TYPE};
pub use log_buffer::{LogAddOutcome, LogAddStatus, LogBatchBuffer};
pub use log_processor::LogBatchProcessor;
pub use processor::BatchProcessor;
pub use scope::{FlushEntry, FlushGuard, FlushScope};
pub use sink::{CollectingSink, EnvelopeSink};
pub use timer::{
    FlushTimer, ManualFlushTimer, ManualTimerFactory, TimerCallback, TimerFactory,
    TokioFlushTimer, TokioTimerFactory,
};
