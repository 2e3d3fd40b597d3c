//! Delivery workers
//!
//! A worker owns a bounded FIFO of envelopes and a single background task
//! that hands them to a `Transport`.
//!
//! - `DeliveryWorker`: send once, account failures
//! - `DurableDeliveryWorker`: spill to disk first, retry transient failures,
//!   replay the spill directory on the next start

mod core;
pub mod delivery;
pub mod durable;
pub mod retry;
pub mod transport;

pub use self::core::{DeliveryContext, WorkerState};
pub use delivery::DeliveryWorker;
pub use durable::{DurableDeliveryWorker, ENVELOPE_EXTENSION};
pub use retry::RetryPolicy;
pub use transport::{
    RecordingTransport, SendFuture, SimulatedTransport, SimulatedTransportConfig,
    SimulatedTransportStats, Transport,
};
