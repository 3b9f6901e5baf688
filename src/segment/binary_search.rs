//! The binary-search-index block: a packed array of fixed-width sorted-index
//! offsets, searched through a [`BinarySearchContext`].
//!
//! The search itself is shape-agnostic: the context ranks whatever record an
//! offset leads to, and the search narrows to a match or to the closest
//! (lower, higher) neighbours it probed, which seed the sequential scan
//! fall-through.

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::segment::block::{self, Codec};
use crate::segment::matcher::Standing;
use crate::segment::sorted_index::IndexEntry;
use crate::slice::SliceReader;
use crate::varint;

/// The block-specific header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinarySearchHeader {
    pub bytes_per_value: u8,
    pub values_count: u64,
    /// Whether every sorted-index entry is represented, or only the ones the
    /// hash index did not take.
    pub is_full_index: bool,
}

impl BinarySearchHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.bytes_per_value);
        varint::encode_unsigned(self.values_count, buf);
        buf.push(self.is_full_index as u8);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(bytes);
        Ok(Self {
            bytes_per_value: reader.read_u8()?,
            values_count: reader.read_unsigned()?,
            is_full_index: reader.read_u8()? != 0,
        })
    }
}

/// Collects sorted-index offsets and packs them at close.
pub struct BinarySearchIndexBuilder {
    offsets: Vec<u64>,
    is_full_index: bool,
}

impl BinarySearchIndexBuilder {
    pub fn new(is_full_index: bool) -> Self {
        Self {
            offsets: Vec::new(),
            is_full_index,
        }
    }

    pub fn push(&mut self, index_offset: u64) {
        self.offsets.push(index_offset);
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Packs offsets at the smallest width that fits the largest one.
    pub fn close(self, codec: Option<Codec>) -> Result<Option<Vec<u8>>> {
        if self.offsets.is_empty() {
            return Ok(None);
        }
        let largest = *self.offsets.iter().max().expect("offsets are non-empty");
        let bytes_per_value = (((64 - largest.leading_zeros()) as usize).div_ceil(8)).max(1) as u8;

        let header = BinarySearchHeader {
            bytes_per_value,
            values_count: self.offsets.len() as u64,
            is_full_index: self.is_full_index,
        };
        let mut header_bytes = Vec::new();
        header.encode(&mut header_bytes);

        let width = bytes_per_value as usize;
        let mut body = vec![0u8; width * self.offsets.len()];
        for (i, offset) in self.offsets.iter().enumerate() {
            BigEndian::write_uint(&mut body[i * width..(i + 1) * width], *offset, width);
        }
        block::write_framed(&header_bytes, &body, codec).map(Some)
    }
}

/// Reads packed offsets back by ordinal.
pub struct OffsetsReader<'a> {
    header: &'a BinarySearchHeader,
    body: &'a [u8],
}

impl<'a> OffsetsReader<'a> {
    pub fn new(header: &'a BinarySearchHeader, body: &'a [u8]) -> Self {
        Self { header, body }
    }

    pub fn offset_at(&self, ordinal: u64) -> Result<u64> {
        let width = self.header.bytes_per_value as usize;
        let start = ordinal as usize * width;
        let end = start + width;
        if ordinal >= self.header.values_count || end > self.body.len() {
            return crate::errcorrupt!("binary search ordinal {ordinal} out of bounds");
        }
        Ok(BigEndian::read_uint(&self.body[start..end], width))
    }
}

/// What a context's `seek` learned about one probed position.
pub struct Seeked {
    pub standing: Standing,
    pub entry: IndexEntry,
}

/// The abstraction the search runs against: how many positions there are,
/// how an ordinal becomes a sorted-index offset, and how an offset ranks
/// against the target.
pub trait BinarySearchContext {
    fn values_count(&self) -> u64;
    fn is_full_index(&self) -> bool;
    /// Ordinal hint to start below, from hash-index collisions.
    fn lowest(&self) -> Option<u64>;
    /// Ordinal hint to start above.
    fn highest(&self) -> Option<u64>;
    fn index_offset_at(&self, ordinal: u64) -> Result<u64>;
    fn seek(&self, index_offset: u64) -> Result<Seeked>;
}

/// Result of a binary search: a match, or the nearest probed neighbours.
#[derive(Debug)]
pub enum BinarySearchResult {
    Matched(IndexEntry),
    None {
        lower: Option<IndexEntry>,
        higher: Option<IndexEntry>,
    },
}

/// Classic binary search over the context's positions.
pub fn binary_search(context: &impl BinarySearchContext) -> Result<BinarySearchResult> {
    let count = context.values_count();
    if count == 0 {
        return Ok(BinarySearchResult::None {
            lower: None,
            higher: None,
        });
    }
    let mut low = context.lowest().unwrap_or(0).min(count - 1) as i64;
    let mut high = context.highest().unwrap_or(count - 1).min(count - 1) as i64;
    let mut lower: Option<IndexEntry> = None;
    let mut higher: Option<IndexEntry> = None;

    while low <= high {
        let mid = low + (high - low) / 2;
        let offset = context.index_offset_at(mid as u64)?;
        let seeked = context.seek(offset)?;
        match seeked.standing {
            Standing::Match => return Ok(BinarySearchResult::Matched(seeked.entry)),
            Standing::Behind => {
                lower = Some(seeked.entry);
                low = mid + 1;
            }
            Standing::Ahead => {
                higher = Some(seeked.entry);
                high = mid - 1;
            }
        }
    }
    Ok(BinarySearchResult::None { lower, higher })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Time;
    use crate::order::KeyOrder;
    use crate::segment::block::read_framed;
    use crate::segment::matcher::{standing, Op};
    use crate::segment::sorted_index::EntryKind;

    #[test]
    fn test_offsets_roundtrip() {
        let mut builder = BinarySearchIndexBuilder::new(true);
        for offset in [0u64, 5, 300, 70_000, 16_777_215] {
            builder.push(offset);
        }
        let framed = builder.close(None).unwrap().unwrap();
        let parsed = read_framed(&framed).unwrap();
        let header = BinarySearchHeader::decode(&parsed.header).unwrap();
        assert_eq!(header.bytes_per_value, 3);
        assert_eq!(header.values_count, 5);
        assert!(header.is_full_index);

        let offsets = OffsetsReader::new(&header, &parsed.body);
        for (i, expected) in [0u64, 5, 300, 70_000, 16_777_215].iter().enumerate() {
            assert_eq!(offsets.offset_at(i as u64).unwrap(), *expected);
        }
        assert!(offsets.offset_at(5).is_err());
    }

    #[test]
    fn test_empty_builder_writes_no_block() {
        assert!(BinarySearchIndexBuilder::new(true)
            .close(None)
            .unwrap()
            .is_none());
    }

    /// A context over an in-memory list of fixed keys.
    struct ListContext {
        keys: Vec<Vec<u8>>,
        target: Vec<u8>,
        key_order: KeyOrder,
    }

    impl ListContext {
        fn entry(&self, ordinal: u64) -> IndexEntry {
            IndexEntry {
                kind: EntryKind::Put,
                key: self.keys[ordinal as usize].clone(),
                to_key: None,
                deadline: None,
                value_slot: Some((0, 0)),
                time: Time::empty(),
                access_index: None,
                index_offset: ordinal,
                next_index_offset: -1,
                next_index_size: 0,
            }
        }
    }

    impl BinarySearchContext for ListContext {
        fn values_count(&self) -> u64 {
            self.keys.len() as u64
        }
        fn is_full_index(&self) -> bool {
            true
        }
        fn lowest(&self) -> Option<u64> {
            None
        }
        fn highest(&self) -> Option<u64> {
            None
        }
        fn index_offset_at(&self, ordinal: u64) -> Result<u64> {
            Ok(ordinal)
        }
        fn seek(&self, index_offset: u64) -> Result<Seeked> {
            let entry = self.entry(index_offset);
            Ok(Seeked {
                standing: standing(&entry, &self.target, Op::Get, &self.key_order),
                entry,
            })
        }
    }

    fn context(target: &[u8]) -> ListContext {
        ListContext {
            keys: vec![
                b"banana".to_vec(),
                b"cherry".to_vec(),
                b"fig".to_vec(),
                b"grape".to_vec(),
                b"mango".to_vec(),
            ],
            target: target.to_vec(),
            key_order: KeyOrder::default(),
        }
    }

    #[test]
    fn test_search_finds_every_key() {
        for key in [b"banana".as_slice(), b"cherry", b"fig", b"grape", b"mango"] {
            match binary_search(&context(key)).unwrap() {
                BinarySearchResult::Matched(entry) => assert_eq!(entry.key, key),
                other => panic!("expected match for {key:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_search_misses_yield_neighbours() {
        match binary_search(&context(b"date")).unwrap() {
            BinarySearchResult::None { lower, higher } => {
                assert_eq!(lower.unwrap().key, b"cherry");
                assert_eq!(higher.unwrap().key, b"fig");
            }
            other => panic!("expected a miss, got {other:?}"),
        }

        // Before the first key only a higher neighbour exists.
        match binary_search(&context(b"apple")).unwrap() {
            BinarySearchResult::None { lower, higher } => {
                assert!(lower.is_none());
                assert_eq!(higher.unwrap().key, b"banana");
            }
            other => panic!("expected a miss, got {other:?}"),
        }

        // Past the last key only a lower neighbour exists.
        match binary_search(&context(b"zebra")).unwrap() {
            BinarySearchResult::None { lower, higher } => {
                assert_eq!(lower.unwrap().key, b"mango");
                assert!(higher.is_none());
            }
            other => panic!("expected a miss, got {other:?}"),
        }
    }
}
