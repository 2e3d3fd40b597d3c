//! Error types for the delivery engine
//!
//! Capacity drops, downsampling and lock contention are never errors. They
//! surface as boolean or status results and are accounted as discards. The
//! enums here cover configuration mistakes, misuse after disposal, malformed
//! wire data, and I/O failures unrelated to contention.

use std::io::Error as IoError;
use std::time::Duration;
use thiserror::Error;

/// Invalid construction parameters. Raised at construction, never clamped.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("batch capacity must be at least 2, got {0}")]
    BufferCapacity(usize),
    #[error("max batch size must be at least 1, got {0}")]
    BatchSize(usize),
    #[error("flush interval must be a positive finite duration, got {0:?}")]
    FlushInterval(Duration),
    #[error("queue capacity must be at least 1, got {0}")]
    QueueCapacity(usize),
    #[error("cache capacity must be at least 1, got {0}")]
    CacheCapacity(usize),
    #[error("invalid retry policy: {0}")]
    RetryPolicy(String),
    #[error("invalid backpressure check interval: {0:?}")]
    CheckInterval(Duration),
    #[error("durable delivery requires a cache directory")]
    MissingCacheDir,
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Malformed or unserializable envelope data
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope is empty")]
    Empty,
    #[error("invalid header on line {line}: {source}")]
    Header {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("header on line {0} is not a JSON object")]
    HeaderNotObject(usize),
    #[error("item header on line {0} has no type")]
    MissingType(usize),
    #[error("item payload truncated: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("invalid item length {0}")]
    InvalidLength(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope I/O error: {0}")]
    Io(#[from] IoError),
}

/// Cache directory I/O failures that are not lock contention
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: IoError,
    },
}

impl CacheError {
    pub fn io(path: impl Into<String>, source: IoError) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Producer-side misuse of a worker or processor
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker is disposed")]
    Disposed,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Outcome of a failed transport send
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Network-level failure; the same envelope may succeed later
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// The collector refused the envelope; retrying will not help
    #[error("envelope rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    /// The collector asked the client to back off
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    /// The send was aborted by its cancellation token
    #[error("send cancelled")]
    Cancelled,
}

impl TransportError {
    /// Whether a durable worker should try the same envelope again
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}
