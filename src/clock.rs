//! Wall-clock time for the delivery engine
//!
//! Backpressure windows, client report timestamps and spill file names all
//! read `Clock::now`. Nothing in the crate calls `SystemTime` directly, so a
//! `SimulatedClock` fully determines what those components observe.
//!
//! Sleeping and timeouts are not part of this trait; they use tokio time,
//! which tests pause separately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp in milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Seconds since the epoch, as used by the client report wire form
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn saturating_sub(&self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }

    /// Timestamp `duration` before this one, floored at zero
    pub fn checked_back(&self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(duration.as_millis() as u64))
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

/// Source of `Timestamp`s, shared as `Arc<dyn Clock>`
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;

    /// Zero if `since` lies in the future
    fn elapsed(&self, since: Timestamp) -> Duration {
        self.now().saturating_sub(since)
    }

    fn has_elapsed(&self, since: Timestamp, duration: Duration) -> bool {
        self.elapsed(since) >= duration
    }
}

/// Epoch millis read once at construction, then advanced by a monotonic
/// `Instant`. Host clock adjustments after startup are not observed.
#[derive(Debug, Clone)]
pub struct ProductionClock {
    start: Instant,
    start_millis: u64,
}

impl Default for ProductionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionClock {
    pub fn new() -> Self {
        // A host clock set before 1970 reads as the epoch.
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ProductionClock {
            start: Instant::now(),
            start_millis,
        }
    }
}

impl Clock for ProductionClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.start.elapsed().as_millis() as u64;
        Timestamp(self.start_millis.saturating_add(elapsed))
    }
}

/// Manually driven clock. Clones read and move the same instant.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicU64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Jump to `time_ms`; may move backwards
    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn current_ms(&self) -> u64 {
        self.time_ms.load(Ordering::SeqCst)
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.time_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_clock_is_monotonic_and_after_epoch() {
        let clock = ProductionClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.now();

        assert!(t1.0 > 1_500_000_000_000);
        assert!(t2.0 - t1.0 >= 10);
    }

    #[test]
    fn test_simulated_clock_only_moves_when_told() {
        let clock = SimulatedClock::new(1000);
        assert_eq!(clock.now(), clock.now());

        clock.advance_ms(100);
        assert_eq!(clock.now().0, 1100);

        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now().0, 3100);

        clock.set(5000);
        assert_eq!(clock.current_ms(), 5000);
    }

    #[test]
    fn test_simulated_clock_shared_through_dyn() {
        let clock = SimulatedClock::new(0);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());

        clock.advance_ms(100);
        assert_eq!(shared.now().0, 100);
    }

    #[test]
    fn test_elapsed_since_past_and_future() {
        let clock = SimulatedClock::new(1000);
        let start = clock.now();
        clock.advance_ms(250);

        assert_eq!(clock.elapsed(start), Duration::from_millis(250));
        assert!(clock.has_elapsed(start, Duration::from_millis(200)));
        assert!(!clock.has_elapsed(start, Duration::from_millis(300)));

        clock.set(900);
        assert_eq!(clock.elapsed(start), Duration::ZERO);
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp::from_millis(1500);
        assert_eq!((ts + Duration::from_millis(500)).0, 2000);
        assert_eq!(ts.checked_back(Duration::from_secs(2)), Timestamp::ZERO);
        assert_eq!(ts.checked_back(Duration::from_millis(500)).0, 1000);
        assert!((ts.as_secs_f64() - 1.5).abs() < f64::EPSILON);
    }
}
