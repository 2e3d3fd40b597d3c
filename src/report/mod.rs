//! Discard accounting and client reports

pub mod client_report;
pub mod discard;
pub mod recorder;

pub use client_report::ClientReport;
pub use discard::{DataCategory, DiscardReason, DiscardReasonWithCategory};
pub use recorder::ClientReportRecorder;
