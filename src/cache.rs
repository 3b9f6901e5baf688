//! Cache primitives for opened Segments.
//!
//! [`Lazy`] is a single-value cell holding one lazily computed result, such
//! as a parsed footer or a block header. It offers two concurrency modes:
//! cooperative synchronisation, where one caller computes under a lock and
//! the rest observe the same result, and single-flight reservation, where a
//! losing caller receives a recoverable [`Error::Busy`] instead of blocking
//! on I/O another caller is already performing.
//!
//! [`BlockCache`] holds decompressed block bodies keyed by their file offset,
//! with a small probation queue in front of the main queue so one-shot scans
//! cannot evict hot blocks.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::error::Result;
use crate::Error;

/// Concurrency discipline for a [`Lazy`] cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// One caller computes under the cell lock; others wait and observe.
    Synchronised,
    /// One caller takes the reservation and computes; others get `Busy`.
    Reserved,
}

/// A single-value lazy cell.
pub struct Lazy<T: Clone> {
    strategy: Strategy,
    cell: Mutex<Option<T>>,
    reservation: AtomicBool,
}

impl<T: Clone> Lazy<T> {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cell: Mutex::new(None),
            reservation: AtomicBool::new(false),
        }
    }

    pub fn synchronised() -> Self {
        Self::new(Strategy::Synchronised)
    }

    pub fn reserved() -> Self {
        Self::new(Strategy::Reserved)
    }

    /// Picks the strategy for the given input at construction time.
    pub fn for_input<I>(input: &I, strategy: impl Fn(&I) -> Strategy) -> Self {
        Self::new(strategy(input))
    }

    /// Returns the cached value, computing it with `init` on first use.
    ///
    /// In reserved mode a caller that loses the reservation race re-checks
    /// the cell once and then fails with [`Error::Busy`]; the computation is
    /// never duplicated.
    pub fn value(&self, init: impl FnOnce() -> Result<T>) -> Result<T> {
        match self.strategy {
            Strategy::Synchronised => {
                let mut slot = self.cell.lock()?;
                if let Some(value) = slot.as_ref() {
                    return Ok(value.clone());
                }
                let value = init()?;
                *slot = Some(value.clone());
                Ok(value)
            }
            Strategy::Reserved => {
                if let Some(value) = self.cell.lock()?.as_ref() {
                    return Ok(value.clone());
                }
                if self
                    .reservation
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // The winner may have published between our check and the
                    // failed reservation.
                    if let Some(value) = self.cell.lock()?.as_ref() {
                        return Ok(value.clone());
                    }
                    return Err(Error::Busy);
                }
                let result = init();
                if let Ok(value) = &result {
                    *self.cell.lock()? = Some(value.clone());
                }
                self.reservation.store(false, Ordering::Release);
                result
            }
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cell.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub fn get(&self) -> Option<T> {
        self.cell.lock().ok().and_then(|slot| slot.clone())
    }

    /// The cached value, or `fallback` when nothing is cached yet.
    pub fn get_or_else(&self, fallback: impl FnOnce() -> T) -> T {
        self.get().unwrap_or_else(fallback)
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.cell.lock() {
            *slot = None;
        }
    }

    /// Applies `f` to the cached value without storing the mapped result.
    pub fn map<U>(&self, f: impl FnOnce(&T) -> U) -> Option<U> {
        self.get().map(|value| f(&value))
    }

    /// Computes a derived value and stores it in `child`, not in `self`.
    pub fn flat_map<U: Clone>(
        &self,
        child: &Lazy<U>,
        init: impl FnOnce() -> Result<T>,
        f: impl FnOnce(&T) -> Result<U>,
    ) -> Result<U> {
        let value = self.value(init)?;
        child.value(|| f(&value))
    }
}

const MAX_FREQUENCY: u8 = 3;

struct CacheEntry<K, V> {
    key: K,
    value: V,
    freq: AtomicU8,
}

/// A bounded cache for decompressed block bodies.
///
/// New entries enter a small probation queue; entries touched more than once
/// graduate to the main queue on eviction, everything else is dropped.
pub struct BlockCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    capacity: usize,
    probation_capacity: usize,
    probation: VecDeque<CacheEntry<K, V>>,
    main: VecDeque<CacheEntry<K, V>>,
    index: HashMap<K, V>,
}

impl<K, V> BlockCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        let probation_capacity = (capacity / 10).max(1);
        Self {
            capacity: capacity.max(1),
            probation_capacity,
            probation: VecDeque::new(),
            main: VecDeque::new(),
            index: HashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.index.get(key)?;
        for entry in self.probation.iter().chain(self.main.iter()) {
            if &entry.key == key {
                let freq = entry.freq.load(Ordering::Relaxed).saturating_add(1);
                entry.freq.store(freq.min(MAX_FREQUENCY), Ordering::Relaxed);
                break;
            }
        }
        Some(value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        if self.index.contains_key(&key) {
            return;
        }
        self.evict();
        self.index.insert(key.clone(), value.clone());
        self.probation.push_back(CacheEntry {
            key,
            value,
            freq: AtomicU8::new(0),
        });
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn evict(&mut self) {
        while self.probation.len() + self.main.len() >= self.capacity {
            if self.probation.len() > self.probation_capacity || self.main.is_empty() {
                match self.probation.pop_front() {
                    Some(entry) if entry.freq.load(Ordering::Relaxed) > 1 => {
                        self.main.push_back(entry);
                    }
                    Some(entry) => {
                        self.index.remove(&entry.key);
                    }
                    None => break,
                }
            } else if let Some(entry) = self.main.pop_front() {
                let freq = entry.freq.load(Ordering::Relaxed);
                if freq > 0 {
                    entry.freq.store(freq - 1, Ordering::Relaxed);
                    self.main.push_back(entry);
                } else {
                    self.index.remove(&entry.key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_lazy_computes_once() {
        let calls = AtomicUsize::new(0);
        let lazy = Lazy::synchronised();

        for _ in 0..3 {
            let value = lazy
                .value(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(lazy.is_cached());

        lazy.clear();
        assert!(!lazy.is_cached());
        assert_eq!(lazy.get_or_else(|| 7), 7);
    }

    #[test]
    fn test_lazy_error_is_not_cached() {
        let lazy: Lazy<u32> = Lazy::synchronised();
        assert!(lazy.value(|| Err(Error::ReadOnly)).is_err());
        assert!(!lazy.is_cached());
        assert_eq!(lazy.value(|| Ok(1)).unwrap(), 1);
    }

    #[test]
    fn test_reserved_losers_get_busy() {
        let lazy = Lazy::reserved();
        // Simulate a held reservation: losers must see Busy, not block.
        lazy.reservation.store(true, Ordering::Release);
        assert_eq!(lazy.value(|| Ok(1)), Err(Error::Busy));

        // Once released, the next caller computes and publishes.
        lazy.reservation.store(false, Ordering::Release);
        assert_eq!(lazy.value(|| Ok(1)).unwrap(), 1);
        // A held reservation no longer matters for cached reads.
        lazy.reservation.store(true, Ordering::Release);
        assert_eq!(lazy.value(|| Ok(2)).unwrap(), 1);
    }

    #[test]
    fn test_lazy_map_and_flat_map() {
        let lazy = Lazy::synchronised();
        assert_eq!(lazy.map(|v: &u32| v + 1), None);
        lazy.value(|| Ok(10u32)).unwrap();
        // map is not stored.
        assert_eq!(lazy.map(|v| v + 1), Some(11));
        assert_eq!(lazy.get(), Some(10));

        // flat_map lands in the child cell.
        let child = Lazy::synchronised();
        let derived = lazy.flat_map(&child, || Ok(10), |v| Ok(v * 2)).unwrap();
        assert_eq!(derived, 20);
        assert_eq!(child.get(), Some(20));
    }

    #[test]
    fn test_strategy_per_input() {
        let on_disk = Lazy::<u32>::for_input(&true, |is_io_backed| {
            if *is_io_backed {
                Strategy::Reserved
            } else {
                Strategy::Synchronised
            }
        });
        assert_eq!(on_disk.strategy, Strategy::Reserved);
    }

    #[test]
    fn test_block_cache_insert_and_get() {
        let mut cache = BlockCache::new(4);
        cache.insert(1u64, vec![1u8]);
        cache.insert(2u64, vec![2u8]);
        assert_eq!(cache.get(&1), Some(vec![1u8]));
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_block_cache_evicts_cold_entries() {
        let mut cache = BlockCache::new(2);
        cache.insert(1u64, vec![1u8]);
        cache.insert(2u64, vec![2u8]);
        cache.insert(3u64, vec![3u8]);
        assert!(cache.len() <= 2);
        assert_eq!(cache.get(&3), Some(vec![3u8]));
    }
}
