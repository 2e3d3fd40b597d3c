//! Delivery DST Integration Tests
//!
//! Multi-seed deterministic simulation of the delivery workers. Every run
//! must balance: produced == delivered + discarded + cached.

use telemetry_delivery::dst::{
    run_delivery_dst_batch, summarize_delivery_dst_batch, DeliveryDSTConfig,
};
use telemetry_delivery::worker::SimulatedTransportConfig;

#[test]
fn test_delivery_dst_50_seeds_calm() {
    let results = run_delivery_dst_batch(0..50, DeliveryDSTConfig::calm());
    let summary = summarize_delivery_dst_batch(&results);

    for r in &results {
        assert!(
            r.passed,
            "Seed {} failed: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        );
        assert_eq!(r.cached, 0, "Seed {}: nothing should be cached", r.seed);
        assert_eq!(r.transport_stats.transient_failures, 0);
    }

    println!("{}", summary);
}

#[test]
fn test_delivery_dst_50_seeds_default_faults() {
    // In-memory worker, no retries: every fault becomes an accounted discard.
    let config = DeliveryDSTConfig {
        transport_config: SimulatedTransportConfig::default(),
        ..Default::default()
    };

    let results = run_delivery_dst_batch(0..50, config);
    let summary = summarize_delivery_dst_batch(&results);

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
fn test_delivery_dst_50_seeds_flaky_durable() {
    // Durable worker with a crash mid-run: interrupted envelopes must come
    // back from disk, never twice.
    let results = run_delivery_dst_batch(0..50, DeliveryDSTConfig::flaky_transport());
    let summary = summarize_delivery_dst_batch(&results);

    for r in &results {
        assert!(
            r.passed,
            "Seed {} failed: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        );
        assert_eq!(r.duplicates, 0);
    }

    println!("{}", summary);
}

#[test]
fn test_delivery_dst_100_seeds_chaos() {
    let results = run_delivery_dst_batch(0..100, DeliveryDSTConfig::chaos());
    let summary = summarize_delivery_dst_batch(&results);

    for r in &results {
        assert!(
            r.passed,
            "Seed {} failed: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        );
    }

    // Tiny queue and rare yields: some runs must have dropped on overflow.
    assert!(results.iter().any(|r| r.discarded > 0));
    println!("{}", summary);
}

#[test]
fn test_delivery_dst_memory_worker_crash() {
    let config = DeliveryDSTConfig {
        durable: false,
        simulate_crash: true,
        ..DeliveryDSTConfig::calm()
    };

    let results = run_delivery_dst_batch(0..30, config);
    for r in &results {
        assert!(
            r.passed,
            "Seed {} failed: {}",
            r.seed,
            r.error_message.as_deref().unwrap_or("unknown")
        );
        assert_eq!(r.cached, 0, "in-memory worker never spills");
        assert_eq!(r.restarts, 1);
    }
}
