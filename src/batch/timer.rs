//! One-shot flush timers
//!
//! Processors never sleep themselves; they arm an injected timer with a
//! callback. `TokioFlushTimer` runs the callback on the runtime after the
//! delay, `ManualFlushTimer` runs it only when a test calls `fire()`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// One-shot timer. Arming again replaces the pending callback.
pub trait FlushTimer: Send + Sync {
    fn arm(&self, delay: Duration, callback: TimerCallback);
    fn disarm(&self);
}

/// Creates one timer per buffer
pub trait TimerFactory: Send + Sync {
    fn create_timer(&self) -> Arc<dyn FlushTimer>;
}

// ============================================================================
// Tokio timers
// ============================================================================

pub struct TokioFlushTimer {
    handle: Handle,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl TokioFlushTimer {
    pub fn new(handle: Handle) -> Self {
        TokioFlushTimer {
            handle,
            pending: Mutex::new(None),
        }
    }
}

impl FlushTimer for TokioFlushTimer {
    fn arm(&self, delay: Duration, callback: TimerCallback) {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        if let Some(previous) = self.pending.lock().replace(task) {
            previous.abort();
        }
    }

    fn disarm(&self) {
        if let Some(previous) = self.pending.lock().take() {
            previous.abort();
        }
    }
}

impl Drop for TokioFlushTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[derive(Clone)]
pub struct TokioTimerFactory {
    handle: Handle,
}

impl TokioTimerFactory {
    pub fn new(handle: Handle) -> Self {
        TokioTimerFactory { handle }
    }

    /// Factory bound to the runtime of the caller.
    ///
    /// Panics outside a tokio runtime, like `tokio::spawn`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl TimerFactory for TokioTimerFactory {
    fn create_timer(&self) -> Arc<dyn FlushTimer> {
        Arc::new(TokioFlushTimer::new(self.handle.clone()))
    }
}

// ============================================================================
// Manual timers - For deterministic tests
// ============================================================================

struct Pending {
    delay: Duration,
    callback: TimerCallback,
}

#[derive(Default)]
pub struct ManualFlushTimer {
    pending: Mutex<Option<Pending>>,
    arm_count: AtomicUsize,
}

impl ManualFlushTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the pending callback as if the delay elapsed
    pub fn fire(&self) -> bool {
        let pending = self.pending.lock().take();
        match pending {
            Some(pending) => {
                (pending.callback)();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub fn armed_delay(&self) -> Option<Duration> {
        self.pending.lock().as_ref().map(|p| p.delay)
    }

    pub fn arm_count(&self) -> usize {
        self.arm_count.load(Ordering::SeqCst)
    }
}

impl FlushTimer for ManualFlushTimer {
    fn arm(&self, delay: Duration, callback: TimerCallback) {
        self.arm_count.fetch_add(1, Ordering::SeqCst);
        *self.pending.lock() = Some(Pending { delay, callback });
    }

    fn disarm(&self) {
        self.pending.lock().take();
    }
}

/// Hands out `ManualFlushTimer`s and keeps them for the test to fire
#[derive(Default)]
pub struct ManualTimerFactory {
    timers: Mutex<Vec<Arc<ManualFlushTimer>>>,
}

impl ManualTimerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timer created `index`-th by this factory
    pub fn timer(&self, index: usize) -> Option<Arc<ManualFlushTimer>> {
        self.timers.lock().get(index).cloned()
    }

    /// Fire every armed timer, returning how many ran
    pub fn fire_all(&self) -> usize {
        let timers: Vec<_> = self.timers.lock().clone();
        timers.iter().filter(|timer| timer.fire()).count()
    }
}

impl TimerFactory for ManualTimerFactory {
    fn create_timer(&self) -> Arc<dyn FlushTimer> {
        let timer = Arc::new(ManualFlushTimer::new());
        self.timers.lock().push(Arc::clone(&timer));
        timer
    }
}
