//! Batching DST Integration Tests
//!
//! Concurrent producers against both batch processors. Every run must
//! account for every item exactly once: emitted or dropped as backpressure.

use telemetry_delivery::dst::{
    run_batch_dst_batch, summarize_batch_dst_batch, BatchDSTConfig, BatchTarget,
};

#[test]
fn test_batch_dst_30_seeds_items() {
    let results = run_batch_dst_batch(0..30, BatchDSTConfig::items());
    let summary = summarize_batch_dst_batch(&results);

    for r in &results {
        assert!(
            r.passed,
            "Seed {} failed: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        );
        assert_eq!(r.emitted + r.dropped, r.produced);
    }

    println!("{}", summary);
}

#[test]
fn test_batch_dst_30_seeds_logs() {
    let results = run_batch_dst_batch(0..30, BatchDSTConfig::logs());
    let summary = summarize_batch_dst_batch(&results);

    for r in &results {
        assert!(
            r.passed,
            "Seed {} failed: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        );
    }

    println!("{}", summary);
}

#[test]
fn test_batch_dst_contention() {
    for target in [BatchTarget::Items, BatchTarget::Logs] {
        let results = run_batch_dst_batch(0..20, BatchDSTConfig::contention(target));
        let summary = summarize_batch_dst_batch(&results);

        for r in &results {
            assert!(
                r.passed,
                "{:?} seed {} failed: {}",
                target,
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown")
            );
            assert_eq!(r.oversized, 0);
            assert_eq!(r.duplicates, 0);
        }

        println!("{}", summary);
    }
}
