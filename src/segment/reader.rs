//! Lookup orchestration for an opened Segment.
//!
//! A get consults the bloom filter, then the hash index, then binary search
//! seeded with the hash probe's collision hints, and finally a bounded
//! sequential scan of the sorted index. Higher and lower skip the positive
//! filters and drive binary search with operation-specific rankings, then
//! confirm with a scan from the nearest probed neighbour.

use crate::error::Result;
use crate::kv::KeyValue;
use crate::order::KeyOrder;
use crate::segment::binary_search::{
    binary_search, BinarySearchContext, BinarySearchHeader, BinarySearchResult, OffsetsReader,
    Seeked,
};
use crate::segment::bloom::{self, BloomHeader};
use crate::segment::footer::Footer;
use crate::segment::hash_index::{self, entry_crc, HashIndexHeader, SlotCandidate};
use crate::segment::matcher::{match_or_seek, standing, Matcher, Op, SeekOutcome, Standing};
use crate::segment::sorted_index::{
    read_inline, IndexEntry, SortedIndexHeader, SortedIndexReader,
};
use crate::segment::values::ValuesReader;

/// A Segment's blocks, decompressed and borrowed for the duration of one
/// lookup.
pub struct SegmentSearcher<'a> {
    pub key_order: &'a KeyOrder,
    pub footer: &'a Footer,
    pub sorted_header: &'a SortedIndexHeader,
    pub sorted_body: &'a [u8],
    pub values: ValuesReader<'a>,
    pub hash: Option<(&'a HashIndexHeader, &'a [u8])>,
    pub binary: Option<(&'a BinarySearchHeader, &'a [u8])>,
    pub bloom: Option<(&'a BloomHeader, &'a [u8])>,
}

/// Ordinal bounds learned from hash-probe collisions, usable only when the
/// binary-search positions line up with access ordinals.
#[derive(Default)]
struct CollisionHints {
    lowest: Option<u64>,
    highest: Option<u64>,
}

impl CollisionHints {
    fn observe(&mut self, entry: &IndexEntry, standing: Standing) {
        let Some(ordinal) = entry.access_index else {
            return;
        };
        match standing {
            Standing::Behind => {
                self.lowest = Some(self.lowest.map_or(ordinal, |low| low.max(ordinal)));
            }
            Standing::Ahead => {
                self.highest = Some(self.highest.map_or(ordinal, |high| high.min(ordinal)));
            }
            Standing::Match => {}
        }
    }
}

impl<'a> SegmentSearcher<'a> {
    fn index_reader(&self) -> SortedIndexReader<'a> {
        SortedIndexReader::new(self.sorted_header, self.sorted_body)
    }

    /// Point lookup. Returns the stored entry for `key`, or the range
    /// containing it.
    pub fn get(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        // The bloom filter only answers for fixed keys; with ranges present
        // a negative cannot rule the key out.
        if self.footer.range_count == 0 {
            if let Some((header, body)) = self.bloom {
                if !bloom::might_contain(header, body, key) {
                    return Ok(None);
                }
            }
        }

        let mut hints = CollisionHints::default();
        if let Some((header, body)) = self.hash {
            if let Some(entry) = self.search_hash(header, body, key, &mut hints)? {
                return Ok(Some(entry.to_key_value(&self.values)?));
            }
        }

        let context = self.context(key, Op::Get, hints);
        match binary_search(&context)? {
            BinarySearchResult::Matched(entry) => Ok(Some(entry.to_key_value(&self.values)?)),
            BinarySearchResult::None { lower, .. } => {
                if context.is_full_index() {
                    return Ok(None);
                }
                // Entries invisible to the indexes may hide between the
                // probed neighbours; scan from the nearest one.
                let start = match lower {
                    Some(entry) => entry,
                    None => match self.index_reader().first()? {
                        Some(entry) => entry,
                        None => return Ok(None),
                    },
                };
                let matcher = Matcher::new(Op::Get, key, self.key_order);
                match match_or_seek(&matcher, start, &self.index_reader())? {
                    SeekOutcome::Matched(entry) => Ok(Some(entry.to_key_value(&self.values)?)),
                    _ => Ok(None),
                }
            }
        }
    }

    /// The first entry in key order.
    pub fn head(&self) -> Result<Option<KeyValue>> {
        match self.index_reader().first()? {
            Some(entry) => entry.to_key_value(&self.values).map(Some),
            None => Ok(None),
        }
    }

    /// Every key-value in ascending key order.
    pub fn key_values(&self) -> Result<Vec<KeyValue>> {
        let reader = self.index_reader();
        reader
            .iter()
            .map(|entry| entry?.to_key_value(&self.values))
            .collect()
    }

    /// The least entry strictly greater than `key`, ranges included.
    pub fn higher(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        self.directional(key, Op::Higher)
    }

    /// The greatest entry strictly less than `key`, ranges included.
    pub fn lower(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        self.directional(key, Op::Lower)
    }

    fn directional(&self, key: &[u8], op: Op) -> Result<Option<KeyValue>> {
        let context = self.context(key, op, CollisionHints::default());
        let narrowed = binary_search(&context)?;
        let start = match narrowed {
            BinarySearchResult::Matched(entry) => {
                unreachable!("directional standings never match, got {:?}", entry.key)
            }
            BinarySearchResult::None { lower, .. } => lower,
        };
        let start = match start {
            Some(entry) => entry,
            None => match self.index_reader().first()? {
                Some(entry) => entry,
                None => return Ok(None),
            },
        };
        let matcher = Matcher::new(op, key, self.key_order);
        match match_or_seek(&matcher, start, &self.index_reader())? {
            SeekOutcome::Matched(entry) => Ok(Some(entry.to_key_value(&self.values)?)),
            _ => Ok(None),
        }
    }

    /// Probes the hash index for an exact standing match, collecting
    /// collision hints for the fall-through on the way.
    fn search_hash(
        &self,
        header: &HashIndexHeader,
        body: &[u8],
        key: &[u8],
        hints: &mut CollisionHints,
    ) -> Result<Option<IndexEntry>> {
        let reader = self.index_reader();
        let matcher = Matcher::match_only(Op::Get, key, self.key_order);
        hash_index::search(header, body, key, |candidate| {
            let entry = match candidate {
                SlotCandidate::Offset(offset) => match reader.read_at(offset, None) {
                    Ok(entry) => entry,
                    // A mis-probed slot decodes garbage; that is a miss.
                    Err(_) => return Ok(None),
                },
                SlotCandidate::Copied {
                    crc,
                    index_offset,
                    bytes,
                } => {
                    let (mut entry, consumed) = match read_inline(self.sorted_header, bytes) {
                        Ok(parsed) => parsed,
                        Err(_) => return Ok(None),
                    };
                    if entry_crc(&bytes[..consumed]) != crc {
                        return Ok(None);
                    }
                    entry.index_offset = index_offset;
                    entry
                }
            };
            match matcher.stand(&entry) {
                Standing::Match => Ok(Some(entry)),
                other => {
                    hints.observe(&entry, other);
                    Ok(None)
                }
            }
        })
    }

    fn context<'s>(
        &'s self,
        target: &'s [u8],
        op: Op,
        hints: CollisionHints,
    ) -> SearchContext<'s, 'a> {
        let offsets = self
            .binary
            .map(|(header, body)| OffsetsReader::new(header, body));
        // Hints address ordinals, which line up with binary-search positions
        // only when every entry is indexed.
        let full = match (&self.binary, self.sorted_header.segment_max_index_entry_size) {
            (Some((header, _)), _) => header.is_full_index,
            (None, width) if width > 0 => true,
            (None, _) => false,
        };
        let (lowest, highest) = if full {
            (hints.lowest, hints.highest)
        } else {
            (None, None)
        };
        SearchContext {
            searcher: self,
            offsets,
            op,
            target,
            full,
            lowest,
            highest,
        }
    }
}

/// Binary-search context over the offsets block, or over normalised entries
/// addressed by ordinal.
struct SearchContext<'s, 'a> {
    searcher: &'s SegmentSearcher<'a>,
    offsets: Option<OffsetsReader<'a>>,
    op: Op,
    target: &'s [u8],
    full: bool,
    lowest: Option<u64>,
    highest: Option<u64>,
}

impl BinarySearchContext for SearchContext<'_, '_> {
    fn values_count(&self) -> u64 {
        match &self.offsets {
            Some(_) => self
                .searcher
                .binary
                .map(|(header, _)| header.values_count)
                .unwrap_or(0),
            None if self.searcher.sorted_header.segment_max_index_entry_size > 0 => {
                self.searcher.footer.key_value_count
            }
            None => 0,
        }
    }

    fn is_full_index(&self) -> bool {
        self.full
    }

    fn lowest(&self) -> Option<u64> {
        self.lowest
    }

    fn highest(&self) -> Option<u64> {
        self.highest
    }

    fn index_offset_at(&self, ordinal: u64) -> Result<u64> {
        match &self.offsets {
            Some(offsets) => offsets.offset_at(ordinal),
            None => Ok(ordinal * self.searcher.sorted_header.segment_max_index_entry_size),
        }
    }

    fn seek(&self, index_offset: u64) -> Result<Seeked> {
        let entry = self
            .searcher
            .index_reader()
            .read_at(index_offset, None)?;
        let ranked = standing(&entry, self.target, self.op, self.searcher.key_order);
        // Get narrows toward an exact standing; higher and lower narrow
        // toward the boundary between qualifying and non-qualifying entries,
        // so a qualifying entry steers the search inward instead of ending
        // it.
        let standing = match (self.op, ranked) {
            (Op::Get, ranked) => ranked,
            (Op::Higher, Standing::Match) => Standing::Ahead,
            (Op::Higher, _) => Standing::Behind,
            (Op::Lower, Standing::Match) => Standing::Behind,
            (Op::Lower, _) => Standing::Ahead,
        };
        Ok(Seeked { standing, entry })
    }
}
