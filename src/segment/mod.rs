//! The Segment: the immutable on-disk unit of sorted key-values and its
//! index blocks.
//!
//! ## File layout
//!
//! ```text
//! +---------------------------+
//! | values block              |  optional
//! +---------------------------+
//! | sorted-index block        |  required
//! +---------------------------+
//! | hash-index block          |  optional
//! +---------------------------+
//! | binary-search-index block |  optional
//! +---------------------------+
//! | bloom-filter block        |  optional
//! +---------------------------+
//! | footer block              |  required, ends with magic 0x01
//! +---------------------------+
//! ```
//!
//! A Segment is created once by the [`writer::SegmentWriter`], opened lazily
//! on first read, and never mutated. The footer lives in a single-value lazy
//! cell; decompressed block bodies are cached per block offset.

pub mod binary_search;
pub mod block;
pub mod bloom;
pub mod footer;
pub mod hash_index;
pub mod many;
pub mod matcher;
pub mod reader;
pub mod sorted_index;
pub mod values;
pub mod writer;

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::cache::{BlockCache, Lazy};
use crate::error::Result;
use crate::file::FileHandle;
use crate::kv::KeyValue;
use crate::order::KeyOrder;
use crate::segment::binary_search::BinarySearchHeader;
use crate::segment::block::{read_framed, BlockOffset, FramedBlock};
use crate::segment::bloom::BloomHeader;
use crate::segment::footer::{Footer, MaxKey};
use crate::segment::hash_index::HashIndexHeader;
use crate::segment::reader::SegmentSearcher;
use crate::segment::sorted_index::SortedIndexHeader;
use crate::segment::values::ValuesReader;

/// An opened, read-only Segment.
pub struct Segment {
    file: Arc<dyn FileHandle>,
    key_order: KeyOrder,
    footer: Lazy<Footer>,
    blocks: Mutex<BlockCache<u64, Arc<FramedBlock>>>,
}

impl Segment {
    /// Wraps a file handle without touching it; the footer and blocks are
    /// read on first use.
    pub fn open(file: Arc<dyn FileHandle>, key_order: KeyOrder, cache_capacity: usize) -> Self {
        Self {
            file,
            key_order,
            footer: Lazy::synchronised(),
            blocks: Mutex::new(BlockCache::new(cache_capacity)),
        }
    }

    /// The footer, read from the file tail once and cached.
    pub fn footer(&self) -> Result<Footer> {
        self.footer.value(|| {
            let footer = Footer::read(self.file.as_ref())?;
            trace!(
                key_values = footer.key_value_count,
                level = footer.created_in_level,
                "opened segment"
            );
            Ok(footer)
        })
    }

    pub fn key_value_count(&self) -> Result<u64> {
        Ok(self.footer()?.key_value_count)
    }

    pub fn min_key(&self) -> Result<Vec<u8>> {
        Ok(self.footer()?.min_key)
    }

    pub fn max_key(&self) -> Result<MaxKey> {
        Ok(self.footer()?.max_key)
    }

    /// Point lookup: the stored entry for `key`, or the range containing it.
    pub fn get(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        self.search(|searcher| searcher.get(key))
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Negative filter only: `false` is definitive, `true` says nothing.
    pub fn might_contain(&self, key: &[u8]) -> Result<bool> {
        self.search(|searcher| match searcher.bloom {
            Some((header, body)) => Ok(bloom::might_contain(header, body, key)),
            None => Ok(true),
        })
    }

    /// The least entry strictly greater than `key`.
    pub fn higher(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        self.search(|searcher| searcher.higher(key))
    }

    /// The greatest entry strictly less than `key`.
    pub fn lower(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        self.search(|searcher| searcher.lower(key))
    }

    /// The least entry at or above `key`.
    pub fn ceiling(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        match self.get(key)? {
            Some(found) => Ok(Some(found)),
            None => self.higher(key),
        }
    }

    /// The greatest entry at or below `key`.
    pub fn floor(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        match self.get(key)? {
            Some(found) => Ok(Some(found)),
            None => self.lower(key),
        }
    }

    /// The first entry in key order.
    pub fn head(&self) -> Result<Option<KeyValue>> {
        self.search(|searcher| searcher.head())
    }

    /// The last entry in key order.
    pub fn last(&self) -> Result<Option<KeyValue>> {
        let footer = self.footer()?;
        if footer.key_value_count == 0 {
            return Ok(None);
        }
        let key = match &footer.max_key {
            MaxKey::Fixed(key) => key.clone(),
            MaxKey::Range { min_key, .. } => min_key.clone(),
        };
        self.get(&key)
    }

    /// Every key-value in ascending key order.
    pub fn key_values(&self) -> Result<Vec<KeyValue>> {
        self.search(|searcher| searcher.key_values())
    }

    /// Loads the blocks a lookup needs and runs it.
    fn search<T>(&self, lookup: impl FnOnce(&SegmentSearcher) -> Result<T>) -> Result<T> {
        let footer = self.footer()?;
        let sorted_block = self.block(footer.sorted_index)?;
        let values_block = footer.values.map(|o| self.block(o)).transpose()?;
        let hash_block = footer.hash_index.map(|o| self.block(o)).transpose()?;
        let binary_block = footer.binary_search.map(|o| self.block(o)).transpose()?;
        let bloom_block = footer.bloom_filter.map(|o| self.block(o)).transpose()?;

        let sorted_header = SortedIndexHeader::decode(&sorted_block.header)?;
        let hash_header = hash_block
            .as_ref()
            .map(|block| HashIndexHeader::decode(&block.body))
            .transpose()?;
        let binary_header = binary_block
            .as_ref()
            .map(|block| BinarySearchHeader::decode(&block.header))
            .transpose()?;
        let bloom_header = bloom_block
            .as_ref()
            .map(|block| BloomHeader::decode(&block.header))
            .transpose()?;

        let searcher = SegmentSearcher {
            key_order: &self.key_order,
            footer: &footer,
            sorted_header: &sorted_header,
            sorted_body: &sorted_block.body,
            values: match &values_block {
                Some(block) => ValuesReader::new(&block.body),
                None => ValuesReader::empty(),
            },
            hash: match (&hash_header, &hash_block) {
                (Some(header), Some(block)) => Some((header, block.body.as_slice())),
                _ => None,
            },
            binary: match (&binary_header, &binary_block) {
                (Some(header), Some(block)) => Some((header, block.body.as_slice())),
                _ => None,
            },
            bloom: match (&bloom_header, &bloom_block) {
                (Some(header), Some(block)) => Some((header, block.body.as_slice())),
                _ => None,
            },
        };
        lookup(&searcher)
    }

    /// One decompressed block, cached by its offset.
    fn block(&self, offset: BlockOffset) -> Result<Arc<FramedBlock>> {
        if let Some(block) = self.blocks.lock()?.get(&offset.start) {
            return Ok(block);
        }
        let bytes = self.file.read(offset.start, offset.size as usize)?;
        let block = Arc::new(read_framed(&bytes)?);
        self.blocks.lock()?.insert(offset.start, block.clone());
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::writer::{ClosedSegment, SegmentWriter};
    use super::*;
    use crate::config::{HashIndexConfig, SegmentConfig, SortedIndexConfig};
    use crate::file::MemoryFile;
    use crate::kv::{Apply, Deadline, Time};

    fn time(t: u8) -> Time {
        Time::new(vec![t])
    }

    fn open(closed: &ClosedSegment) -> Segment {
        Segment::open(
            Arc::new(MemoryFile::new(closed.bytes.clone())),
            KeyOrder::default(),
            16,
        )
    }

    fn build(config: SegmentConfig, kvs: &[KeyValue]) -> Segment {
        let mut writer = SegmentWriter::new(config, KeyOrder::default());
        for kv in kvs {
            writer.add(kv).unwrap();
        }
        let mut segments = writer.close().unwrap();
        assert_eq!(segments.len(), 1);
        open(&segments.remove(0))
    }

    fn mixed_kvs() -> Vec<KeyValue> {
        (0u32..300)
            .map(|i| {
                let key = format!("key-{i:05}").into_bytes();
                match i % 5 {
                    0 => KeyValue::Put {
                        key,
                        time: time(1),
                        deadline: None,
                        value: Some(format!("value-{i}").into_bytes()),
                    },
                    1 => KeyValue::Remove {
                        key,
                        time: time(2),
                        deadline: Some(Deadline::from_nanos(i as u64 + 1)),
                    },
                    2 => KeyValue::Update {
                        key,
                        time: time(3),
                        deadline: None,
                        value: Some(b"updated".to_vec()),
                    },
                    3 => KeyValue::Function {
                        key,
                        time: time(4),
                        deadline: None,
                        id: b"touch".to_vec(),
                    },
                    _ => KeyValue::PendingApply {
                        key,
                        applies: vec![
                            Apply::Function {
                                time: time(5),
                                deadline: None,
                                id: b"f".to_vec(),
                            },
                            Apply::Update {
                                time: time(6),
                                deadline: None,
                                value: Some(b"pending".to_vec()),
                            },
                        ],
                    },
                }
            })
            .collect()
    }

    #[test]
    fn test_get_finds_every_entry() {
        let kvs = mixed_kvs();
        let segment = build(SegmentConfig::default(), &kvs);
        assert_eq!(segment.key_value_count().unwrap(), kvs.len() as u64);

        for kv in &kvs {
            assert_eq!(segment.get(kv.key()).unwrap().as_ref(), Some(kv));
        }
        assert_eq!(segment.get(b"missing").unwrap(), None);
        assert!(!segment.contains(b"missing").unwrap());
    }

    #[test]
    fn test_get_with_all_indexes_disabled() {
        let config = SegmentConfig::default()
            .hash_index(HashIndexConfig::default().enabled(false))
            .bloom(crate::config::BloomConfig {
                enabled: false,
                ..Default::default()
            });
        let kvs = mixed_kvs();
        let segment = build(config, &kvs);
        for kv in kvs.iter().step_by(17) {
            assert_eq!(segment.get(kv.key()).unwrap().as_ref(), Some(kv));
        }
        assert_eq!(segment.get(b"zzz").unwrap(), None);
    }

    #[test]
    fn test_get_with_compressed_blocks() {
        let config =
            SegmentConfig::default().compression(Some(crate::segment::block::Codec::zstd()));
        let kvs = mixed_kvs();
        let segment = build(config, &kvs);
        for kv in kvs.iter().step_by(11) {
            assert_eq!(segment.get(kv.key()).unwrap().as_ref(), Some(kv));
        }
        assert_eq!(segment.key_values().unwrap(), kvs);
    }

    #[test]
    fn test_get_with_normalised_index() {
        let config = SegmentConfig::default().sorted_index(
            SortedIndexConfig::default()
                .prefix_compression(false)
                .normalise_for_binary_search(true),
        );
        let kvs = mixed_kvs();
        let segment = build(config, &kvs);
        for kv in kvs.iter().step_by(13) {
            assert_eq!(segment.get(kv.key()).unwrap().as_ref(), Some(kv));
        }
        assert_eq!(segment.get(b"key-99999x").unwrap(), None);
    }

    #[test]
    fn test_copied_hash_index_end_to_end() {
        // Every key resolvable through the hash index alone: generous
        // allocation, no prefix compression, inlined entries.
        let config = SegmentConfig::default()
            .sorted_index(SortedIndexConfig::default().prefix_compression(false))
            .hash_index(
                HashIndexConfig::default()
                    .copy_index(true)
                    .max_probe(1000)
                    .allocate_space_factor(5.0),
            );
        let mut writer = SegmentWriter::new(config, KeyOrder::default());
        let kvs: Vec<KeyValue> = (0u32..1000)
            .map(|i| KeyValue::Put {
                key: format!("copied-{i:04}").into_bytes(),
                // Random-ish value sizes.
                value: Some(vec![b'v'; (i % 37) as usize + 1]),
                time: time(1),
                deadline: None,
            })
            .collect();
        for kv in &kvs {
            writer.add(kv).unwrap();
        }
        let mut segments = writer.close().unwrap();
        assert_eq!(segments.len(), 1);
        let closed = segments.remove(0);

        // The index is perfect: every insert was placed.
        let segment = open(&closed);
        let footer = segment.footer().unwrap();
        let hash_offset = footer.hash_index.expect("hash index present");
        let hash_block = read_framed(
            &closed.bytes[hash_offset.start as usize..(hash_offset.start + hash_offset.size) as usize],
        )
        .unwrap();
        let hash_header = HashIndexHeader::decode(&hash_block.body).unwrap();
        assert!(hash_header.copy_index);
        assert_eq!(hash_header.hit, 1000);
        assert_eq!(hash_header.miss, 0);

        for kv in &kvs {
            assert_eq!(segment.get(kv.key()).unwrap().as_ref(), Some(kv));
        }
    }

    #[test]
    fn test_random_keys_and_sizes_roundtrip() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut keys: Vec<Vec<u8>> = (0..500)
            .map(|_| {
                let len = rng.gen_range(1..40);
                (0..len).map(|_| rng.gen::<u8>()).collect()
            })
            .collect();
        keys.sort();
        keys.dedup();

        let kvs: Vec<KeyValue> = keys
            .iter()
            .map(|key| {
                let len = rng.gen_range(1..200);
                KeyValue::Put {
                    key: key.clone(),
                    time: time(1),
                    deadline: None,
                    value: Some((0..len).map(|_| rng.gen::<u8>()).collect()),
                }
            })
            .collect();

        let segment = build(SegmentConfig::default(), &kvs);
        assert_eq!(segment.key_values().unwrap(), kvs);
        for kv in &kvs {
            assert_eq!(segment.get(kv.key()).unwrap().as_ref(), Some(kv));
        }
    }

    #[test]
    fn test_higher_lower_consistency() {
        let kvs = mixed_kvs();
        let segment = build(SegmentConfig::default(), &kvs);

        for (i, kv) in kvs.iter().enumerate() {
            let higher = segment.higher(kv.key()).unwrap();
            match kvs.get(i + 1) {
                Some(next) => assert_eq!(higher.as_ref(), Some(next)),
                None => assert_eq!(higher, None),
            }

            let lower = segment.lower(kv.key()).unwrap();
            if i == 0 {
                assert_eq!(lower, None);
            } else {
                assert_eq!(lower.as_ref(), Some(&kvs[i - 1]));
            }
        }

        // Before the first and past the last.
        assert_eq!(segment.higher(b"key-").unwrap().as_ref(), Some(&kvs[0]));
        assert_eq!(segment.lower(b"zzz").unwrap().as_ref(), kvs.last());
        assert_eq!(segment.head().unwrap().as_ref(), Some(&kvs[0]));
        assert_eq!(segment.last().unwrap().as_ref(), kvs.last());
    }

    #[test]
    fn test_ceiling_and_floor() {
        let kvs = mixed_kvs();
        let segment = build(SegmentConfig::default(), &kvs);

        // Exact hits.
        assert_eq!(segment.ceiling(kvs[3].key()).unwrap().as_ref(), Some(&kvs[3]));
        assert_eq!(segment.floor(kvs[3].key()).unwrap().as_ref(), Some(&kvs[3]));
        // Between keys.
        assert_eq!(
            segment.ceiling(b"key-00000x").unwrap().as_ref(),
            Some(&kvs[1])
        );
        assert_eq!(segment.floor(b"key-00000x").unwrap().as_ref(), Some(&kvs[0]));
    }

    #[test]
    fn test_key_values_reads_everything_in_order() {
        let kvs = mixed_kvs();
        let segment = build(SegmentConfig::default(), &kvs);
        assert_eq!(segment.key_values().unwrap(), kvs);
    }

    #[test]
    fn test_ranges_resolve_on_reads() {
        let kvs = vec![
            KeyValue::Put {
                key: vec![1],
                time: time(1),
                deadline: None,
                value: Some(b"one".to_vec()),
            },
            KeyValue::Range {
                from_key: vec![11],
                to_key: vec![20],
                value: Apply::Remove {
                    time: time(2),
                    deadline: None,
                },
            },
            KeyValue::Put {
                key: vec![30],
                time: time(3),
                deadline: None,
                value: Some(b"thirty".to_vec()),
            },
        ];
        let segment = build(SegmentConfig::default(), &kvs);

        // A get inside the range returns the range itself.
        assert_eq!(segment.get(&[15]).unwrap().as_ref(), Some(&kvs[1]));
        assert_eq!(segment.get(&[20]).unwrap(), None);
        assert_eq!(segment.higher(&[10]).unwrap().as_ref(), Some(&kvs[1]));
        assert_eq!(segment.higher(&[19]).unwrap().as_ref(), Some(&kvs[1]));
        assert_eq!(segment.lower(&[25]).unwrap().as_ref(), Some(&kvs[1]));

        // A Remove range suppresses the bloom filter.
        assert!(segment.footer().unwrap().bloom_filter.is_none());
        assert!(segment.might_contain(&[15]).unwrap());
    }

    #[test]
    fn test_metadata_accessors() {
        let kvs = mixed_kvs();
        let segment = build(SegmentConfig::default().created_in_level(4), &kvs);
        let footer = segment.footer().unwrap();
        assert_eq!(footer.created_in_level, 4);
        assert_eq!(segment.min_key().unwrap(), kvs[0].key());
        assert_eq!(
            segment.max_key().unwrap(),
            MaxKey::Fixed(kvs.last().unwrap().key().to_vec())
        );
    }
}
