//! Single-entry flush scope
//!
//! At most one caller drains a buffer at a time. Entering is a compare-and-swap
//! on a flag; the returned guard clears it on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct FlushScope {
    flushing: AtomicBool,
}

/// Outcome of `FlushScope::try_enter`
#[derive(Debug)]
pub enum FlushEntry<'a> {
    Entered(FlushGuard<'a>),
    AlreadyFlushing,
}

/// Holds the scope until dropped
#[derive(Debug)]
pub struct FlushGuard<'a> {
    scope: &'a FlushScope,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.scope.flushing.store(false, Ordering::SeqCst);
    }
}

impl FlushScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> FlushEntry<'_> {
        match self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => FlushEntry::Entered(FlushGuard { scope: self }),
            Err(_) => FlushEntry::AlreadyFlushing,
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_entrant() {
        let scope = FlushScope::new();
        let guard = match scope.try_enter() {
            FlushEntry::Entered(guard) => guard,
            FlushEntry::AlreadyFlushing => panic!("first entry must succeed"),
        };
        assert!(scope.is_flushing());
        assert!(matches!(scope.try_enter(), FlushEntry::AlreadyFlushing));

        drop(guard);
        assert!(!scope.is_flushing());
        assert!(matches!(scope.try_enter(), FlushEntry::Entered(_)));
    }

    #[test]
    fn test_released_on_panic() {
        let scope = FlushScope::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = scope.try_enter();
            panic!("drain failed");
        }));
        assert!(result.is_err());
        assert!(!scope.is_flushing());
    }
}
