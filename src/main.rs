//! Delivery Simulator
//!
//! Runs the deterministic simulation batches and prints their summaries.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | DST_SEEDS | 20 | Seeds per scenario |
//! | DST_SEED_START | 0 | First seed |
//! | DELIVERY_LOG_LEVEL | telemetry_delivery=info | Log filter |
//! | DELIVERY_LOG_FORMAT | text | `text` or `json` |

use std::process::ExitCode;
use telemetry_delivery::dst::{
    run_batch_dst_batch, run_delivery_dst_batch, summarize_batch_dst_batch,
    summarize_delivery_dst_batch, BatchDSTConfig, BatchTarget, DeliveryDSTConfig,
};
use telemetry_delivery::observability::{init_tracing, TracingConfig};

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn main() -> ExitCode {
    init_tracing(&TracingConfig::from_env());

    let start = env_u64("DST_SEED_START", 0);
    let seeds = start..start.saturating_add(env_u64("DST_SEEDS", 20));

    println!("=== Telemetry Delivery Simulator ===\n");
    println!("Seeds: {:?}\n", seeds);

    let mut failed = 0;

    for (name, config) in [
        ("calm", DeliveryDSTConfig::calm()),
        ("flaky transport", DeliveryDSTConfig::flaky_transport()),
        ("chaos", DeliveryDSTConfig::chaos()),
    ] {
        println!("--- Delivery: {} ---", name);
        let results = run_delivery_dst_batch(seeds.clone(), config);
        failed += results.iter().filter(|r| !r.passed).count();
        println!("{}\n", summarize_delivery_dst_batch(&results));
    }

    for (name, config) in [
        ("items", BatchDSTConfig::items()),
        ("logs", BatchDSTConfig::logs()),
        ("items contention", BatchDSTConfig::contention(BatchTarget::Items)),
        ("logs contention", BatchDSTConfig::contention(BatchTarget::Logs)),
    ] {
        println!("--- Batching: {} ---", name);
        let results = run_batch_dst_batch(seeds.clone(), config);
        failed += results.iter().filter(|r| !r.passed).count();
        println!("{}\n", summarize_batch_dst_batch(&results));
    }

    if failed > 0 {
        println!("=== {} runs violated an invariant ===", failed);
        ExitCode::FAILURE
    } else {
        println!("=== All scenarios passed ===");
        ExitCode::SUCCESS
    }
}
