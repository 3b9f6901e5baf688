//! The level-zero memtable: a concurrent sorted map holding the key-value
//! variants before they flush into Segments.
//!
//! Every write merges against the resident entry under the merge algebra, so
//! the table always holds the per-key winner. Reads are lock-free through
//! the skiplist; writes are serialised by the caller, matching the
//! one-writer-per-level discipline of the engine.
//!
//! The segment writer consumes the table through [`LevelZero::key_values`],
//! the ascending, finite, non-restartable iterator contract.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};

use crossbeam_skiplist::SkipMap;

use crate::config::SegmentConfig;
use crate::error::Result;
use crate::kv::merge::merge;
use crate::kv::registry::FunctionRegistry;
use crate::kv::{Deadline, KeyValue, Time};
use crate::order::{KeyOrder, TimeOrder};
use crate::segment::writer::{ClosedSegment, SegmentWriter};
use crate::Error;

/// A key ordered by the caller-supplied comparator instead of `Vec<u8>`'s
/// derived order.
#[derive(Clone)]
struct OrderedKey {
    key: Vec<u8>,
    order: KeyOrder,
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.order.eq(&self.key, &other.key)
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order.cmp(&self.key, &other.key)
    }
}

/// The mutable in-memory table at level zero.
pub struct LevelZero {
    data: SkipMap<OrderedKey, KeyValue>,
    key_order: KeyOrder,
    time_order: TimeOrder,
    registry: FunctionRegistry,
    size: AtomicUsize,
    is_frozen: AtomicBool,
}

impl LevelZero {
    pub fn new(key_order: KeyOrder, time_order: TimeOrder, registry: FunctionRegistry) -> Self {
        Self {
            data: SkipMap::new(),
            key_order,
            time_order,
            registry,
            size: AtomicUsize::new(0),
            is_frozen: AtomicBool::new(false),
        }
    }

    /// Commits a value.
    pub fn put(
        &self,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        deadline: Option<Deadline>,
        time: Time,
    ) -> Result<()> {
        self.merge_insert(KeyValue::Put {
            key,
            time,
            deadline,
            value,
        })
    }

    /// Overwrites the current value where a Put exists underneath.
    pub fn update(
        &self,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        deadline: Option<Deadline>,
        time: Time,
    ) -> Result<()> {
        self.merge_insert(KeyValue::Update {
            key,
            time,
            deadline,
            value,
        })
    }

    /// Removes a key immediately.
    pub fn remove(&self, key: Vec<u8>, time: Time) -> Result<()> {
        self.merge_insert(KeyValue::Remove {
            key,
            time,
            deadline: None,
        })
    }

    /// Expires a key at the given deadline.
    pub fn expire(&self, key: Vec<u8>, deadline: Deadline, time: Time) -> Result<()> {
        self.merge_insert(KeyValue::Remove {
            key,
            time,
            deadline: Some(deadline),
        })
    }

    /// Queues a registered function application on a key.
    pub fn apply_function(&self, key: Vec<u8>, id: Vec<u8>, time: Time) -> Result<()> {
        self.merge_insert(KeyValue::Function {
            key,
            time,
            deadline: None,
            id,
        })
    }

    fn merge_insert(&self, kv: KeyValue) -> Result<()> {
        if self.is_frozen.load(AtomicOrdering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        let map_key = self.map_key(kv.key().to_vec());
        let merged = match self.data.get(&map_key) {
            Some(existing) => merge(
                kv,
                existing.value().clone(),
                &self.registry,
                &self.time_order,
            )?,
            None => kv,
        };
        self.size
            .fetch_add(entry_size(&merged), AtomicOrdering::SeqCst);
        self.data.insert(map_key, merged);
        Ok(())
    }

    /// The raw resident entry for a key.
    pub fn get(&self, key: &[u8]) -> Option<KeyValue> {
        self.data
            .get(&self.map_key(key.to_vec()))
            .map(|entry| entry.value().clone())
    }

    /// The visible value for a key at `now_nanos`: a committed, unexpired
    /// Put. Everything else, including an expired Put, reads as absent.
    pub fn visible_value(&self, key: &[u8], now_nanos: u64) -> Option<Option<Vec<u8>>> {
        match self.get(key)? {
            KeyValue::Put {
                deadline, value, ..
            } => {
                if deadline.is_some_and(|d| d.has_passed(now_nanos)) {
                    None
                } else {
                    Some(value)
                }
            }
            _ => None,
        }
    }

    pub fn contains(&self, key: &[u8], now_nanos: u64) -> bool {
        self.visible_value(key, now_nanos).is_some()
    }

    pub fn head(&self) -> Option<KeyValue> {
        self.data.front().map(|entry| entry.value().clone())
    }

    pub fn last(&self) -> Option<KeyValue> {
        self.data.back().map(|entry| entry.value().clone())
    }

    /// The least entry with key strictly greater than `key`.
    pub fn higher(&self, key: &[u8]) -> Option<KeyValue> {
        self.data
            .lower_bound(std::ops::Bound::Excluded(&self.map_key(key.to_vec())))
            .map(|entry| entry.value().clone())
    }

    /// The greatest entry with key strictly less than `key`.
    pub fn lower(&self, key: &[u8]) -> Option<KeyValue> {
        self.data
            .upper_bound(std::ops::Bound::Excluded(&self.map_key(key.to_vec())))
            .map(|entry| entry.value().clone())
    }

    pub fn ceiling(&self, key: &[u8]) -> Option<KeyValue> {
        self.get(key).or_else(|| self.higher(key))
    }

    pub fn floor(&self, key: &[u8]) -> Option<KeyValue> {
        self.get(key).or_else(|| self.lower(key))
    }

    /// Approximate resident bytes.
    pub fn size(&self) -> usize {
        self.size.load(AtomicOrdering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Stops further writes. Freezing twice is an error.
    pub fn freeze(&self) -> Result<()> {
        if self.is_frozen.swap(true, AtomicOrdering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Every resident entry in ascending key order.
    pub fn key_values(&self) -> Vec<KeyValue> {
        self.data
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Freezes the table and streams it into bounded Segments.
    pub fn flush(&self, config: SegmentConfig) -> Result<Vec<ClosedSegment>> {
        self.freeze()?;
        let mut writer = SegmentWriter::new(config, self.key_order.clone());
        for kv in self.key_values() {
            writer.add(&kv)?;
        }
        writer.close()
    }

    fn map_key(&self, key: Vec<u8>) -> OrderedKey {
        OrderedKey {
            key,
            order: self.key_order.clone(),
        }
    }
}

fn entry_size(kv: &KeyValue) -> usize {
    let value_len = match kv {
        KeyValue::Put { value, .. } | KeyValue::Update { value, .. } => {
            value.as_ref().map_or(0, Vec::len)
        }
        KeyValue::Function { id, .. } => id.len(),
        _ => 0,
    };
    kv.key().len() + value_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;
    use crate::segment::Segment;
    use std::sync::Arc;

    fn table() -> LevelZero {
        let mut registry = FunctionRegistry::new();
        registry.register(b"reverse".to_vec(), |_: &[u8], value: Option<&[u8]>, _| {
            crate::kv::registry::FunctionOutput::Update(
                value.map(|v| v.iter().rev().copied().collect()),
            )
        });
        LevelZero::new(KeyOrder::default(), TimeOrder::default(), registry)
    }

    fn time(t: u8) -> Time {
        Time::new(vec![t])
    }

    #[test]
    fn test_put_update_remove_resolve_on_insert() {
        let table = table();
        table
            .put(b"a".to_vec(), Some(b"1".to_vec()), None, time(1))
            .unwrap();
        table
            .update(b"a".to_vec(), Some(b"2".to_vec()), None, time(2))
            .unwrap();

        // The Update merged onto the Put stays a committed Put.
        assert_eq!(
            table.get(b"a"),
            Some(KeyValue::Put {
                key: b"a".to_vec(),
                time: time(2),
                deadline: None,
                value: Some(b"2".to_vec()),
            })
        );
        assert_eq!(table.visible_value(b"a", 0), Some(Some(b"2".to_vec())));

        table.remove(b"a".to_vec(), time(3)).unwrap();
        assert_eq!(
            table.get(b"a"),
            Some(KeyValue::Remove {
                key: b"a".to_vec(),
                time: time(3),
                deadline: None,
            })
        );
        assert_eq!(table.visible_value(b"a", 0), None);
    }

    #[test]
    fn test_expired_put_reads_as_absent() {
        let table = table();
        table
            .put(b"k".to_vec(), Some(b"v".to_vec()), None, time(1))
            .unwrap();
        table
            .expire(b"k".to_vec(), Deadline::from_nanos(100), time(2))
            .unwrap();

        assert!(table.contains(b"k", 99));
        assert!(!table.contains(b"k", 100));
    }

    #[test]
    fn test_function_application_on_insert() {
        let table = table();
        table
            .put(b"k".to_vec(), Some(b"abc".to_vec()), None, time(1))
            .unwrap();
        table
            .apply_function(b"k".to_vec(), b"reverse".to_vec(), time(2))
            .unwrap();
        assert_eq!(table.visible_value(b"k", 0), Some(Some(b"cba".to_vec())));
    }

    #[test]
    fn test_unresolved_function_stays_pending() {
        let table = table();
        table
            .apply_function(b"k".to_vec(), b"reverse".to_vec(), time(1))
            .unwrap();
        table
            .apply_function(b"k".to_vec(), b"reverse".to_vec(), time(2))
            .unwrap();
        assert!(matches!(
            table.get(b"k"),
            Some(KeyValue::PendingApply { applies, .. }) if applies.len() == 2
        ));
        // No committed base, nothing visible.
        assert_eq!(table.visible_value(b"k", 0), None);
    }

    #[test]
    fn test_ordered_traversal() {
        let table = table();
        for key in [b"m".to_vec(), b"a".to_vec(), b"z".to_vec()] {
            table.put(key, Some(b"v".to_vec()), None, time(1)).unwrap();
        }

        assert_eq!(table.head().unwrap().key(), b"a");
        assert_eq!(table.last().unwrap().key(), b"z");
        assert_eq!(table.higher(b"a").unwrap().key(), b"m");
        assert_eq!(table.lower(b"z").unwrap().key(), b"m");
        assert_eq!(table.ceiling(b"m").unwrap().key(), b"m");
        assert_eq!(table.ceiling(b"n").unwrap().key(), b"z");
        assert_eq!(table.floor(b"n").unwrap().key(), b"m");
        assert_eq!(table.higher(b"z"), None);
        assert_eq!(table.lower(b"a"), None);

        let keys: Vec<Vec<u8>> = table
            .key_values()
            .into_iter()
            .map(|kv| kv.key().to_vec())
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"m".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn test_custom_key_order() {
        let reversed = KeyOrder::new(|a, b| b.cmp(a));
        let table = LevelZero::new(reversed, TimeOrder::default(), FunctionRegistry::new());
        for key in [b"a".to_vec(), b"z".to_vec()] {
            table.put(key, None, None, time(1)).unwrap();
        }
        assert_eq!(table.head().unwrap().key(), b"z");
        assert_eq!(table.last().unwrap().key(), b"a");
    }

    #[test]
    fn test_frozen_rejects_writes() {
        let table = table();
        table.freeze().unwrap();
        assert!(matches!(
            table.put(b"k".to_vec(), None, None, time(1)),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(table.freeze(), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_flush_into_segments_roundtrip() {
        let table = table();
        for i in 0..100u32 {
            table
                .put(
                    format!("flush-{i:04}").into_bytes(),
                    Some(format!("value-{i}").into_bytes()),
                    None,
                    time(1),
                )
                .unwrap();
        }
        let config = SegmentConfig::default().min_segment_size(1024);
        let segments = table.flush(config).unwrap();
        assert!(!segments.is_empty());

        let mut restored = Vec::new();
        for closed in &segments {
            let segment = Segment::open(
                Arc::new(MemoryFile::new(closed.bytes.clone())),
                KeyOrder::default(),
                16,
            );
            restored.extend(segment.key_values().unwrap());
        }
        assert_eq!(restored, table.key_values());
    }
}
