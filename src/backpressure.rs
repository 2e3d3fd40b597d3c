//! Adaptive Backpressure
//!
//! Tracks the most recent rate-limit response and queue overflow. While either
//! is recent, each health check halves the downsample factor (down to
//! 1/1024); the first healthy check restores it to 1.0 in one step.
//!
//! ## Health Windows
//!
//! - queue overflow within the last 2 seconds
//! - rate-limit response within the last 10 seconds
//!
//! The monitor can run its own periodic check on the tokio runtime
//! (`start`) or be driven by hand (`new` + `do_health_check`) for
//! deterministic tests.

use crate::clock::{Clock, Timestamp};
use crate::config::BackpressureConfig;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MAX_DOWNSAMPLES: u32 = 10;
pub const RECENT_OVERFLOW_WINDOW: Duration = Duration::from_secs(2);
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);

/// Sentinel for "never happened" in the timestamp cells
const NEVER: u64 = 0;

pub struct BackpressureMonitor {
    clock: Arc<dyn Clock>,
    /// Stored as millis + 1 so that time zero stays distinguishable from NEVER
    last_rate_limit: AtomicU64,
    last_queue_overflow: AtomicU64,
    downsample_level: AtomicU32,
    checker: CancellationToken,
}

impl std::fmt::Debug for BackpressureMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureMonitor")
            .field("downsample_level", &self.downsample_level())
            .finish()
    }
}

impl BackpressureMonitor {
    /// Monitor without a periodic check. Starts healthy at factor 1.0.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        BackpressureMonitor {
            clock,
            last_rate_limit: AtomicU64::new(NEVER),
            last_queue_overflow: AtomicU64::new(NEVER),
            downsample_level: AtomicU32::new(0),
            checker: CancellationToken::new(),
        }
    }

    /// Monitor with a health check every `config.check_interval`.
    ///
    /// Must be called inside a tokio runtime. The task stops on `dispose`
    /// or once the last `Arc` is dropped.
    pub fn start(clock: Arc<dyn Clock>, config: &BackpressureConfig) -> Arc<Self> {
        let monitor = Arc::new(Self::new(clock));
        let weak = Arc::downgrade(&monitor);
        let token = monitor.checker.clone();
        tokio::spawn(run_health_checks(weak, token, config.check_interval));
        monitor
    }

    pub fn record_rate_limit_hit(&self, at: Timestamp) {
        self.last_rate_limit
            .store(at.as_millis().saturating_add(1), Ordering::Relaxed);
    }

    pub fn record_queue_overflow(&self) {
        let now = self.clock.now();
        self.last_queue_overflow
            .store(now.as_millis().saturating_add(1), Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        let now = self.clock.now();
        !occurred_within(&self.last_queue_overflow, now, RECENT_OVERFLOW_WINDOW)
            && !occurred_within(&self.last_rate_limit, now, RATE_LIMIT_WINDOW)
    }

    /// One step of the adaptive loop
    pub fn do_health_check(&self) {
        if self.is_healthy() {
            let previous = self.downsample_level.swap(0, Ordering::Relaxed);
            if previous > 0 {
                info!(previous_level = previous, "Backpressure recovered, downsampling reset");
            }
            return;
        }

        let result = self
            .downsample_level
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |level| {
                (level < MAX_DOWNSAMPLES).then_some(level + 1)
            });
        match result {
            Ok(previous) => warn!(
                level = previous + 1,
                factor = factor_for_level(previous + 1),
                "Backpressure detected, downsampling"
            ),
            Err(_) => debug!(level = MAX_DOWNSAMPLES, "Backpressure persists at maximum downsampling"),
        }
    }

    pub fn downsample_level(&self) -> u32 {
        self.downsample_level.load(Ordering::Relaxed)
    }

    pub fn downsample_factor(&self) -> f64 {
        factor_for_level(self.downsample_level())
    }

    /// Scale a configured sample rate by the current factor
    pub fn adjusted_sample_rate(&self, sample_rate: f64) -> f64 {
        sample_rate * self.downsample_factor()
    }

    /// Stop the periodic check; idempotent
    pub fn dispose(&self) {
        self.checker.cancel();
    }
}

impl Drop for BackpressureMonitor {
    fn drop(&mut self) {
        self.checker.cancel();
    }
}

/// 2^(-level)
pub fn factor_for_level(level: u32) -> f64 {
    debug_assert!(level <= MAX_DOWNSAMPLES, "Precondition: level within cap");
    1.0 / (1u64 << level) as f64
}

fn occurred_within(cell: &AtomicU64, now: Timestamp, window: Duration) -> bool {
    let stored = cell.load(Ordering::Relaxed);
    if stored == NEVER {
        return false;
    }
    let at = Timestamp(stored - 1);
    now.saturating_sub(at) < window
}

async fn run_health_checks(
    monitor: Weak<BackpressureMonitor>,
    token: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                match monitor.upgrade() {
                    Some(monitor) => monitor.do_health_check(),
                    None => break,
                }
            }
        }
    }
    debug!("Backpressure health checks stopped");
}
