//! Deterministic simulation harnesses
//!
//! - `delivery_dst`: worker accounting under transport faults and crashes
//! - `batch_dst`: batch processor conservation under concurrent producers

pub mod batch_dst;
pub mod delivery_dst;

pub use batch_dst::{
    run_batch_dst_batch, summarize_batch_dst_batch, BatchDSTConfig, BatchDSTHarness,
    BatchDSTResult, BatchTarget,
};
pub use delivery_dst::{
    run_delivery_dst_batch, summarize_delivery_dst_batch, DeliveryDSTConfig, DeliveryDSTHarness,
    DeliveryDSTResult,
};
