//! Local delivery engine for a telemetry SDK.
//!
//! Producers hand envelopes to a delivery worker or items to a batch
//! processor and never block or touch I/O. A single background task per
//! worker owns the network side. Every item dropped locally is counted and
//! reported upstream in a client report.

pub mod backpressure;
pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod counter;
pub mod dst;
pub mod envelope;
pub mod error;
pub mod observability;
pub mod report;
pub mod worker;

pub use backpressure::BackpressureMonitor;
pub use batch::{BatchProcessor, EnvelopeSink, LogBatchProcessor};
pub use cache::CacheCoordinator;
pub use clock::{Clock, ProductionClock, SimulatedClock, Timestamp};
pub use config::DeliveryConfig;
pub use envelope::Envelope;
pub use report::{ClientReport, ClientReportRecorder, DataCategory, DiscardReason};
pub use worker::{DeliveryContext, DeliveryWorker, DurableDeliveryWorker, Transport};
