//! Fixed-capacity, concurrently appendable slot array
//!
//! Producers claim a slot with a capped atomic increment and write their item
//! into that slot, all under a shared read lock. `drain` takes the write lock,
//! which waits out in-flight writers, and swaps in a fresh backing store.
//!
//! Slot numbers are 1-based. A claim of `capacity + 1` means "full"; the
//! counter never goes past it.

use crate::error::ConfigError;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Result of `BatchBuffer::try_add`
#[derive(Debug)]
pub struct AddResult<T> {
    /// Raw claimed slot, `capacity + 1` when the buffer was full
    pub slot: usize,
    /// The item handed back when it was not stored
    pub rejected: Option<T>,
}

impl<T> AddResult<T> {
    pub fn added(&self) -> bool {
        self.rejected.is_none()
    }
}

struct Slots<T> {
    claimed: AtomicUsize,
    cells: Box<[OnceLock<T>]>,
}

impl<T> Slots<T> {
    fn new(capacity: usize) -> Self {
        Slots {
            claimed: AtomicUsize::new(0),
            cells: (0..capacity).map(|_| OnceLock::new()).collect(),
        }
    }
}

pub struct BatchBuffer<T> {
    capacity: usize,
    slots: RwLock<Slots<T>>,
}

impl<T> std::fmt::Debug for BatchBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchBuffer")
            .field("capacity", &self.capacity)
            .field("count", &self.count())
            .finish()
    }
}

impl<T> BatchBuffer<T> {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity < 2 {
            return Err(ConfigError::BufferCapacity(capacity));
        }
        Ok(BatchBuffer {
            capacity,
            slots: RwLock::new(Slots::new(capacity)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim the next slot and store `item` in it if the slot is in range.
    pub fn try_add(&self, item: T) -> AddResult<T> {
        let slots = self.slots.read();
        let capacity = self.capacity;
        let claim = slots
            .claimed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |claimed| {
                (claimed <= capacity).then_some(claimed + 1)
            });

        let slot = match claim {
            Ok(previous) => previous + 1,
            Err(_) => capacity + 1,
        };
        if slot > capacity {
            return AddResult {
                slot,
                rejected: Some(item),
            };
        }

        let stored = slots.cells[slot - 1].set(item);
        debug_assert!(stored.is_ok(), "Invariant: each slot is claimed once per epoch");
        AddResult {
            slot,
            rejected: stored.err(),
        }
    }

    /// Items currently stored
    pub fn count(&self) -> usize {
        self.slots
            .read()
            .claimed
            .load(Ordering::SeqCst)
            .min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().claimed.load(Ordering::SeqCst) == 0
    }

    pub fn is_full(&self) -> bool {
        self.slots.read().claimed.load(Ordering::SeqCst) >= self.capacity
    }

    /// Swap in a fresh store and return what was added, in insertion order.
    pub fn drain(&self) -> Vec<T> {
        self.drain_up_to(self.capacity)
    }

    /// Like `drain`, but returns at most `len` items. Items past `len` are
    /// dropped with the old store, so callers pass the count they observed.
    pub fn drain_up_to(&self, len: usize) -> Vec<T> {
        let old = {
            let mut slots = self.slots.write();
            std::mem::replace(&mut *slots, Slots::new(self.capacity))
        };

        let count = old
            .claimed
            .load(Ordering::SeqCst)
            .min(self.capacity)
            .min(len);
        let items: Vec<T> = old
            .cells
            .into_vec()
            .into_iter()
            .take(count)
            .filter_map(OnceLock::into_inner)
            .collect();

        debug_assert_eq!(items.len(), count, "Postcondition: every claimed slot was written");
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_below_two_rejected() {
        assert!(matches!(
            BatchBuffer::<u32>::new(1),
            Err(ConfigError::BufferCapacity(1))
        ));
        assert!(BatchBuffer::<u32>::new(2).is_ok());
    }

    #[test]
    fn test_slots_and_full_detection() {
        let buffer = BatchBuffer::new(2).unwrap();
        assert!(buffer.is_empty());

        let first = buffer.try_add("one");
        assert!(first.added());
        assert_eq!(first.slot, 1);

        let second = buffer.try_add("two");
        assert!(second.added());
        assert_eq!(second.slot, 2);
        assert!(buffer.is_full());

        let third = buffer.try_add("three");
        assert!(!third.added());
        assert_eq!(third.slot, 3);
        assert_eq!(third.rejected, Some("three"));

        let fourth = buffer.try_add("four");
        assert_eq!(fourth.slot, 3, "counter is capped at capacity + 1");
    }

    #[test]
    fn test_drain_returns_insertion_order_then_empty() {
        let buffer = BatchBuffer::new(3).unwrap();
        buffer.try_add(1);
        buffer.try_add(2);

        assert_eq!(buffer.drain(), vec![1, 2]);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());

        buffer.try_add(3);
        assert_eq!(buffer.drain(), vec![3]);
    }

    #[test]
    fn test_drain_clamps_to_capacity_after_overflow() {
        let buffer = BatchBuffer::new(2).unwrap();
        for i in 0..5 {
            buffer.try_add(i);
        }
        assert_eq!(buffer.count(), 2);
        assert_eq!(buffer.drain(), vec![0, 1]);
    }

    #[test]
    fn test_drain_up_to() {
        let buffer = BatchBuffer::new(4).unwrap();
        for i in 0..4 {
            buffer.try_add(i);
        }
        assert_eq!(buffer.drain_up_to(2), vec![0, 1]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_concurrent_adds_exactly_capacity_succeed() {
        for capacity in [2usize, 7, 64] {
            let buffer = Arc::new(BatchBuffer::new(capacity).unwrap());
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    let buffer = Arc::clone(&buffer);
                    thread::spawn(move || {
                        (0..50)
                            .filter(|i| buffer.try_add(t * 1000 + i).added())
                            .count()
                    })
                })
                .collect();

            let added: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(added, capacity);
            assert_eq!(buffer.drain().len(), capacity);
        }
    }
}
