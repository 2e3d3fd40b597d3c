//! Transport Abstraction
//!
//! The worker hands one envelope at a time to a `Transport`. Network code
//! lives outside this crate; here we have the seam plus two test doubles.
//!
//! ## Implementations
//!
//! - `RecordingTransport`: Records deliveries, scripted failures, optional delay
//! - `SimulatedTransport`: Seeded random failures for DST

use crate::envelope::Envelope;
use crate::error::TransportError;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// Opaque network delivery of one envelope
pub trait Transport: Send + Sync + 'static {
    /// Deliver `envelope`. Implementations should return
    /// `TransportError::Cancelled` promptly once `cancel` fires.
    fn send<'a>(&'a self, envelope: &'a Envelope, cancel: &'a CancellationToken) -> SendFuture<'a>;
}

// ============================================================================
// RecordingTransport - For unit tests
// ============================================================================

#[derive(Default)]
pub struct RecordingTransport {
    delivered: Mutex<Vec<Envelope>>,
    scripted: Mutex<VecDeque<TransportError>>,
    delay: Mutex<Option<Duration>>,
    attempts: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send waits `delay` (cancellable) before completing
    pub fn with_delay(delay: Duration) -> Self {
        let transport = Self::new();
        *transport.delay.lock() = Some(delay);
        transport
    }

    /// Fail the next send with `error`; queued failures apply in order
    pub fn fail_next(&self, error: TransportError) {
        self.scripted.lock().push_back(error);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn delivered(&self) -> Vec<Envelope> {
        self.delivered.lock().clone()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    fn send<'a>(&'a self, envelope: &'a Envelope, cancel: &'a CancellationToken) -> SendFuture<'a> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if let Some(error) = self.scripted.lock().pop_front() {
                return Err(error);
            }
            self.delivered.lock().push(envelope.clone());
            Ok(())
        })
    }
}

// ============================================================================
// SimulatedTransport - For DST
// ============================================================================

/// Failure probabilities per send
#[derive(Debug, Clone)]
pub struct SimulatedTransportConfig {
    pub transient_prob: f64,
    pub reject_prob: f64,
    pub rate_limit_prob: f64,
}

impl Default for SimulatedTransportConfig {
    fn default() -> Self {
        SimulatedTransportConfig {
            transient_prob: 0.05,
            reject_prob: 0.01,
            rate_limit_prob: 0.01,
        }
    }
}

impl SimulatedTransportConfig {
    /// No faults - for baseline testing
    pub fn reliable() -> Self {
        SimulatedTransportConfig {
            transient_prob: 0.0,
            reject_prob: 0.0,
            rate_limit_prob: 0.0,
        }
    }

    /// Mostly transient failures, the retryable kind
    pub fn flaky() -> Self {
        SimulatedTransportConfig {
            transient_prob: 0.3,
            reject_prob: 0.0,
            rate_limit_prob: 0.0,
        }
    }

    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedTransportConfig {
            transient_prob: 0.25,
            reject_prob: 0.05,
            rate_limit_prob: 0.05,
        }
    }
}

/// Statistics for transport fault injection
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransportStats {
    pub attempts: u64,
    pub delivered: u64,
    pub transient_failures: u64,
    pub rejections: u64,
    pub rate_limits: u64,
}

struct SimulatedTransportInner {
    rng: ChaCha8Rng,
    stats: SimulatedTransportStats,
    delivered: Vec<Envelope>,
}

pub struct SimulatedTransport {
    config: SimulatedTransportConfig,
    inner: Mutex<SimulatedTransportInner>,
}

impl SimulatedTransport {
    pub fn new(seed: u64, config: SimulatedTransportConfig) -> Self {
        SimulatedTransport {
            config,
            inner: Mutex::new(SimulatedTransportInner {
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: SimulatedTransportStats::default(),
                delivered: Vec::new(),
            }),
        }
    }

    pub fn stats(&self) -> SimulatedTransportStats {
        self.inner.lock().stats.clone()
    }

    pub fn delivered(&self) -> Vec<Envelope> {
        self.inner.lock().delivered.clone()
    }

    fn roll(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.stats.attempts += 1;
        let draw: f64 = inner.rng.gen();

        let mut threshold = self.config.transient_prob;
        if draw < threshold {
            inner.stats.transient_failures += 1;
            return Err(TransportError::Transient("simulated connection reset".into()));
        }
        threshold += self.config.reject_prob;
        if draw < threshold {
            inner.stats.rejections += 1;
            return Err(TransportError::Rejected {
                status: 400,
                message: "simulated rejection".into(),
            });
        }
        threshold += self.config.rate_limit_prob;
        if draw < threshold {
            inner.stats.rate_limits += 1;
            return Err(TransportError::RateLimited {
                retry_after: Duration::from_secs(60),
            });
        }

        inner.stats.delivered += 1;
        inner.delivered.push(envelope.clone());
        Ok(())
    }
}

impl Transport for SimulatedTransport {
    fn send<'a>(&'a self, envelope: &'a Envelope, cancel: &'a CancellationToken) -> SendFuture<'a> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            self.roll(envelope)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_recording_transport_scripted_failures() {
        let transport = RecordingTransport::new();
        let token = CancellationToken::new();
        let envelope = Envelope::from_event("a", json!({}));

        transport.fail_next(TransportError::Transient("reset".into()));
        assert!(transport.send(&envelope, &token).await.is_err());
        assert!(transport.send(&envelope, &token).await.is_ok());
        assert_eq!(transport.attempts(), 2);
        assert_eq!(transport.delivered_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_transport_delay_is_cancellable() {
        let transport = RecordingTransport::with_delay(Duration::from_secs(60));
        let token = CancellationToken::new();
        let envelope = Envelope::from_event("a", json!({}));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        assert_eq!(
            transport.send(&envelope, &token).await,
            Err(TransportError::Cancelled)
        );
        assert_eq!(transport.delivered_count(), 0);
    }

    #[tokio::test]
    async fn test_simulated_transport_is_deterministic() {
        let envelope = Envelope::from_event("a", json!({}));
        let token = CancellationToken::new();

        let mut runs = Vec::new();
        for _ in 0..2 {
            let transport = SimulatedTransport::new(7, SimulatedTransportConfig::high_chaos());
            let mut outcomes = Vec::new();
            for _ in 0..50 {
                outcomes.push(transport.send(&envelope, &token).await.is_ok());
            }
            runs.push(outcomes);
        }
        assert_eq!(runs[0], runs[1]);
    }

    #[tokio::test]
    async fn test_reliable_simulated_transport_always_delivers() {
        let transport = SimulatedTransport::new(1, SimulatedTransportConfig::reliable());
        let token = CancellationToken::new();
        for _ in 0..20 {
            transport
                .send(&Envelope::from_event("a", json!({})), &token)
                .await
                .unwrap();
        }
        assert_eq!(transport.stats().delivered, 20);
    }
}
