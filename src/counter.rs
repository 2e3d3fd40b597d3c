//! Concurrent per-key counters
//!
//! Each key owns an independent `AtomicU64` cell. The map lock is only taken
//! for writing the first time a key is seen; every later increment runs under
//! a shared read lock, so producers touching different keys never contend.
//!
//! Snapshots swap each cell to zero atomically, so a count can never show up
//! in two consecutive snapshots or fall between them.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Map from key to an atomic counter cell
#[derive(Debug)]
pub struct CounterMap<K> {
    cells: RwLock<HashMap<K, AtomicU64>>,
}

impl<K> Default for CounterMap<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> CounterMap<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        CounterMap {
            cells: RwLock::new(HashMap::new()),
        }
    }

    pub fn increment(&self, key: &K) {
        self.add(key, 1);
    }

    /// Add `n` to the counter for `key`, creating the cell on first use
    pub fn add(&self, key: &K, n: u64) {
        if n == 0 {
            return;
        }

        {
            let cells = self.cells.read();
            if let Some(cell) = cells.get(key) {
                cell.fetch_add(n, Ordering::Relaxed);
                return;
            }
        }

        let mut cells = self.cells.write();
        cells
            .entry(key.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Current count; an untouched key reads as zero
    pub fn get(&self, key: &K) -> u64 {
        self.cells
            .read()
            .get(key)
            .map(|cell| cell.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Atomically read and zero a single counter
    pub fn read_and_reset(&self, key: &K) -> u64 {
        self.cells
            .read()
            .get(key)
            .map(|cell| cell.swap(0, Ordering::AcqRel))
            .unwrap_or(0)
    }

    /// Atomically read and zero every counter.
    ///
    /// Only non-zero counts are returned. Cells stay allocated so later
    /// increments keep using the read-lock fast path.
    pub fn read_all_and_reset(&self) -> HashMap<K, u64> {
        let cells = self.cells.read();
        let mut snapshot = HashMap::with_capacity(cells.len());
        for (key, cell) in cells.iter() {
            let value = cell.swap(0, Ordering::AcqRel);
            if value > 0 {
                snapshot.insert(key.clone(), value);
            }
        }
        snapshot
    }

    /// True when every counter reads zero
    pub fn is_zero(&self) -> bool {
        self.cells
            .read()
            .values()
            .all(|cell| cell.load(Ordering::Relaxed) == 0)
    }

    /// Sum across all counters
    pub fn total(&self) -> u64 {
        self.cells
            .read()
            .values()
            .map(|cell| cell.load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_untouched_key_reads_zero() {
        let map: CounterMap<&'static str> = CounterMap::new();
        assert_eq!(map.get(&"missing"), 0);
        assert_eq!(map.read_and_reset(&"missing"), 0);
        assert!(map.is_zero());
    }

    #[test]
    fn test_increment_and_add() {
        let map = CounterMap::new();
        map.increment(&"a");
        map.increment(&"a");
        map.add(&"b", 5);
        map.add(&"c", 0);

        assert_eq!(map.get(&"a"), 2);
        assert_eq!(map.get(&"b"), 5);
        assert_eq!(map.get(&"c"), 0);
        assert_eq!(map.total(), 7);
    }

    #[test]
    fn test_read_and_reset_zeros_one_key() {
        let map = CounterMap::new();
        map.add(&"a", 3);
        map.add(&"b", 4);

        assert_eq!(map.read_and_reset(&"a"), 3);
        assert_eq!(map.read_and_reset(&"a"), 0);
        assert_eq!(map.get(&"b"), 4);
    }

    #[test]
    fn test_read_all_and_reset_skips_zero_entries() {
        let map = CounterMap::new();
        map.add(&"a", 3);
        map.add(&"b", 4);
        map.read_and_reset(&"b");

        let snapshot = map.read_all_and_reset();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&"a"), Some(&3));
        assert!(map.read_all_and_reset().is_empty());
    }

    #[test]
    fn test_concurrent_increments_with_snapshots_lose_nothing() {
        let map = Arc::new(CounterMap::new());
        let threads = 8;
        let per_thread = 5_000u64;

        let writers: Vec<_> = (0..threads)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        map.increment(&((t + i as usize) % 4));
                    }
                })
            })
            .collect();

        let mut collected = 0u64;
        while writers.iter().any(|w| !w.is_finished()) {
            collected += map.read_all_and_reset().values().sum::<u64>();
        }
        for w in writers {
            w.join().unwrap();
        }
        collected += map.read_all_and_reset().values().sum::<u64>();

        assert_eq!(collected, threads as u64 * per_thread);
    }
}
