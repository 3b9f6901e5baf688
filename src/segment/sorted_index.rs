//! The sorted-index block: the ordered sequence of entry records at the core
//! of every Segment.
//!
//! ## Entry layout
//!
//! ```text
//! +---------------------------+
//! | entrySize    : varuint    |  size of the payload that follows
//! | keyValueId   : varint     |  variant + prefix/dedup flags
//! | accessIndex? : varuint    |  iff enableAccessPositionIndex
//! | key          : see below  |
//! | deadline     : varuint    |  0 = absent, else nanoseconds
//! | valueOffset? : varuint    |  iff the variant has value bytes, not dedup
//! | valueLength? : varuint    |  0 = no value
//! | timeLength   : i32        |
//! | time         : bytes      |
//! +---------------------------+
//! ```
//!
//! A full key is `keySize: varuint` + bytes; a prefix-compressed key is
//! `commonPrefixLen: varuint` + `suffixSize: varuint` + suffix, resolved
//! against the previous entry. A zero byte where the next entry's size would
//! start terminates the block.
//!
//! When normalised for binary search every record is padded to
//! `segmentMaxIndexEntrySize` with leading zeroes and a `0x01` separator so
//! entry `i` starts at `i * entrySize`.
//!
//! `keyValueId` uses disjoint integer ranges of four ids per variant: the low
//! bit marks a prefix-compressed key, the second bit a value slot reused from
//! the previous entry (in which case the slot fields are omitted).

use byteorder::{BigEndian, ByteOrder};

use crate::config::SortedIndexConfig;
use crate::error::Result;
use crate::kv::{self, Apply, Deadline, KeyValue, Time};
use crate::segment::block::{self, Codec};
use crate::segment::values::ValuesReader;
use crate::slice::{self, SliceReader};
use crate::varint;
use crate::Error;

/// The six persisted entry kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Put,
    Remove,
    Update,
    Function,
    PendingApply,
    Range,
}

impl EntryKind {
    fn base_id(self) -> i64 {
        match self {
            EntryKind::Put => 0,
            EntryKind::Remove => 4,
            EntryKind::Update => 8,
            EntryKind::Function => 12,
            EntryKind::PendingApply => 16,
            EntryKind::Range => 20,
        }
    }

    fn from_base_id(base: i64) -> Result<Self> {
        match base {
            0 => Ok(EntryKind::Put),
            4 => Ok(EntryKind::Remove),
            8 => Ok(EntryKind::Update),
            12 => Ok(EntryKind::Function),
            16 => Ok(EntryKind::PendingApply),
            20 => Ok(EntryKind::Range),
            other => crate::errcorrupt!("unknown keyValueId base {other}"),
        }
    }

    /// Whether entries of this kind carry value bytes in the values block.
    fn has_value_slot(self) -> bool {
        !matches!(self, EntryKind::Remove)
    }
}

const FLAG_PREFIX_COMPRESSED: i64 = 1;
const FLAG_VALUE_REUSED: i64 = 2;

/// The sorted-index body header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortedIndexHeader {
    pub enable_access_position_index: bool,
    pub has_prefix_compression: bool,
    pub normalise_for_binary_search: bool,
    pub is_pre_normalised: bool,
    pub disable_key_prefix_compression: bool,
    pub enable_partial_read: bool,
    /// Fixed entry width when normalised, zero otherwise.
    pub segment_max_index_entry_size: u64,
}

impl SortedIndexHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.enable_access_position_index as u8);
        buf.push(self.has_prefix_compression as u8);
        buf.push(self.normalise_for_binary_search as u8);
        buf.push(self.is_pre_normalised as u8);
        buf.push(self.disable_key_prefix_compression as u8);
        buf.push(self.enable_partial_read as u8);
        varint::encode_unsigned(self.segment_max_index_entry_size, buf);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(bytes);
        Ok(Self {
            enable_access_position_index: reader.read_u8()? != 0,
            has_prefix_compression: reader.read_u8()? != 0,
            normalise_for_binary_search: reader.read_u8()? != 0,
            is_pre_normalised: reader.read_u8()? != 0,
            disable_key_prefix_compression: reader.read_u8()? != 0,
            enable_partial_read: reader.read_u8()? != 0,
            segment_max_index_entry_size: reader.read_unsigned()?,
        })
    }
}

/// A parsed sorted-index entry.
///
/// `key` is the decoded key; for a Range it is the inclusive start key with
/// the exclusive end in `to_key`. `next_index_offset` is `-1` past the final
/// entry.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntry {
    pub kind: EntryKind,
    pub key: Vec<u8>,
    pub to_key: Option<Vec<u8>>,
    pub deadline: Option<Deadline>,
    pub value_slot: Option<(u64, u64)>,
    pub time: Time,
    pub access_index: Option<u64>,
    pub index_offset: u64,
    pub next_index_offset: i64,
    pub next_index_size: u64,
}

impl IndexEntry {
    /// Materialises the full key-value, pulling value bytes out of the
    /// values block where the entry has a slot.
    pub fn to_key_value(&self, values: &ValuesReader<'_>) -> Result<KeyValue> {
        match self.kind {
            EntryKind::Put => Ok(KeyValue::Put {
                key: self.key.clone(),
                time: self.time.clone(),
                deadline: self.deadline,
                value: self.read_value(values)?,
            }),
            EntryKind::Remove => Ok(KeyValue::Remove {
                key: self.key.clone(),
                time: self.time.clone(),
                deadline: self.deadline,
            }),
            EntryKind::Update => Ok(KeyValue::Update {
                key: self.key.clone(),
                time: self.time.clone(),
                deadline: self.deadline,
                value: self.read_value(values)?,
            }),
            EntryKind::Function => {
                let id = self.read_value(values)?.ok_or_else(|| {
                    Error::Corruption("function entry without an id".to_string())
                })?;
                Ok(KeyValue::Function {
                    key: self.key.clone(),
                    time: self.time.clone(),
                    deadline: self.deadline,
                    id,
                })
            }
            EntryKind::PendingApply => {
                let bytes = self.read_value(values)?.ok_or_else(|| {
                    Error::Corruption("pending apply entry without applies".to_string())
                })?;
                let mut reader = SliceReader::new(&bytes);
                let applies = kv::decode_applies(&mut reader)?;
                if applies.is_empty() {
                    return crate::errcorrupt!("pending apply entry with empty chain");
                }
                Ok(KeyValue::PendingApply {
                    key: self.key.clone(),
                    applies,
                })
            }
            EntryKind::Range => {
                let bytes = self.read_value(values)?.ok_or_else(|| {
                    Error::Corruption("range entry without a range value".to_string())
                })?;
                let mut reader = SliceReader::new(&bytes);
                let value = Apply::decode(&mut reader)?;
                Ok(KeyValue::Range {
                    from_key: self.key.clone(),
                    to_key: self
                        .to_key
                        .clone()
                        .ok_or_else(|| Error::Corruption("range entry without end key".to_string()))?,
                    value,
                })
            }
        }
    }

    fn read_value(&self, values: &ValuesReader<'_>) -> Result<Option<Vec<u8>>> {
        match self.value_slot {
            None | Some((_, 0)) => Ok(None),
            Some((offset, length)) => values.read(offset, length).map(|bytes| Some(bytes.to_vec())),
        }
    }
}

/// An entry queued into the hash and binary-search indexes at close.
///
/// Only entries written with a full key and their own value slot are
/// addressable without sequential context, so only those are collected.
#[derive(Clone, Debug)]
pub struct SecondaryEntry {
    pub key: Vec<u8>,
    pub index_offset: u64,
    pub access_index: u64,
    /// The self-delimiting record bytes (size prefix included, no padding),
    /// inlined verbatim by the copied hash index.
    pub entry_bytes: Vec<u8>,
}

struct PendingRecord {
    payload: Vec<u8>,
    key: Vec<u8>,
    addressable: bool,
    ordinal: u64,
}

/// Streams entries in key order and closes into a framed block plus the
/// secondary-index feed.
pub struct SortedIndexBuilder {
    config: SortedIndexConfig,
    records: Vec<PendingRecord>,
    previous_stored_key: Option<Vec<u8>>,
    entries_since_reset: usize,
    prefix_compressed_any: bool,
    payload_bytes: usize,
}

impl SortedIndexBuilder {
    pub fn new(config: SortedIndexConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
            previous_stored_key: None,
            entries_since_reset: 0,
            prefix_compressed_any: false,
            payload_bytes: 0,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.records.len()
    }

    /// Bytes accumulated so far, before padding and framing.
    pub fn current_size(&self) -> usize {
        self.payload_bytes
    }

    /// Appends a fixed entry. `value_slot` is `Some` for every kind with
    /// value bytes; a zero length means "no value". `reused` marks a slot
    /// shared with the previous entry, which omits the slot fields.
    pub fn add(
        &mut self,
        kind: EntryKind,
        key: &[u8],
        deadline: Option<Deadline>,
        value_slot: Option<(u64, u64)>,
        reused: bool,
        time: &Time,
    ) -> Result<()> {
        debug_assert_eq!(kind.has_value_slot(), value_slot.is_some());
        if kind == EntryKind::Range {
            return crate::errcorrupt!("range entries go through add_range");
        }
        self.push_record(kind, key, key, deadline, value_slot, reused, time)
    }

    /// Appends a Range entry. The stored key is the joined `[from, to)`
    /// pair; range entries always carry a full key and reset the prefix
    /// chain so readers never resolve a prefix against a joined key.
    pub fn add_range(
        &mut self,
        from_key: &[u8],
        to_key: &[u8],
        value_slot: (u64, u64),
        reused: bool,
        time: &Time,
    ) -> Result<()> {
        let joined = slice::compress_join(from_key, to_key);
        self.previous_stored_key = None;
        self.push_record(
            EntryKind::Range,
            &joined,
            from_key,
            None,
            Some(value_slot),
            reused,
            time,
        )?;
        self.previous_stored_key = None;
        Ok(())
    }

    fn push_record(
        &mut self,
        kind: EntryKind,
        stored_key: &[u8],
        logical_key: &[u8],
        deadline: Option<Deadline>,
        value_slot: Option<(u64, u64)>,
        reused: bool,
        time: &Time,
    ) -> Result<()> {
        let ordinal = self.records.len() as u64;

        // Normalised entries are addressed by ordinal, so they can never
        // lean on a previous entry for their key or value slot.
        let normalise = self.config.normalise_for_binary_search;
        let common = match &self.previous_stored_key {
            Some(previous)
                if self.config.prefix_compression
                    && !normalise
                    && self.entries_since_reset < self.config.prefix_compression_reset_count =>
            {
                slice::common_prefix_len(previous, stored_key)
            }
            _ => 0,
        };
        let prefix_compressed = common > 0;
        let reused = reused && kind.has_value_slot() && !normalise;

        let mut payload = Vec::with_capacity(stored_key.len() + time.as_slice().len() + 24);
        let id = kind.base_id()
            + if prefix_compressed { FLAG_PREFIX_COMPRESSED } else { 0 }
            + if reused { FLAG_VALUE_REUSED } else { 0 };
        varint::encode_signed(id, &mut payload);

        if self.config.enable_access_position_index {
            varint::encode_unsigned(ordinal, &mut payload);
        }

        if prefix_compressed {
            varint::encode_unsigned(common as u64, &mut payload);
            varint::encode_unsigned((stored_key.len() - common) as u64, &mut payload);
            payload.extend_from_slice(&stored_key[common..]);
        } else {
            varint::encode_unsigned(stored_key.len() as u64, &mut payload);
            payload.extend_from_slice(stored_key);
        }

        kv::encode_deadline(deadline, &mut payload);

        if let Some((offset, length)) = value_slot {
            if !reused {
                varint::encode_unsigned(offset, &mut payload);
                varint::encode_unsigned(length, &mut payload);
            }
        }

        let time_bytes = time.as_slice();
        let mut time_len = [0u8; 4];
        BigEndian::write_i32(&mut time_len, time_bytes.len() as i32);
        payload.extend_from_slice(&time_len);
        payload.extend_from_slice(time_bytes);

        if prefix_compressed {
            self.entries_since_reset += 1;
            self.prefix_compressed_any = true;
        } else {
            self.entries_since_reset = 0;
        }
        self.previous_stored_key = Some(stored_key.to_vec());
        self.payload_bytes += varint::size_of_unsigned(payload.len() as u64) + payload.len();

        self.records.push(PendingRecord {
            payload,
            key: logical_key.to_vec(),
            addressable: !prefix_compressed && !reused,
            ordinal,
        });
        Ok(())
    }

    /// Lays the records out (padding them when normalising), frames the
    /// block, and returns the final entry offsets for the other indexes.
    pub fn close(self, codec: Option<Codec>) -> Result<ClosedSortedIndex> {
        let record_len = |payload: &Vec<u8>| -> usize {
            varint::size_of_unsigned(payload.len() as u64) + payload.len()
        };

        let normalise = self.config.normalise_for_binary_search;
        let max_record = self
            .records
            .iter()
            .map(|r| record_len(&r.payload))
            .max()
            .unwrap_or(0);
        let is_pre_normalised = normalise
            && self
                .records
                .iter()
                .all(|r| record_len(&r.payload) == max_record);
        let entry_width = if !normalise {
            0
        } else if is_pre_normalised {
            max_record as u64
        } else {
            // One leading byte reserved for the 0x01 separator.
            (max_record + 1) as u64
        };

        let mut body = Vec::with_capacity(self.payload_bytes + self.records.len() + 1);
        let mut secondary = Vec::new();
        for record in &self.records {
            let offset = body.len() as u64;
            let mut entry_bytes =
                Vec::with_capacity(record_len(&record.payload));
            varint::encode_unsigned(record.payload.len() as u64, &mut entry_bytes);
            entry_bytes.extend_from_slice(&record.payload);

            if normalise && !is_pre_normalised {
                let padding = entry_width as usize - 1 - entry_bytes.len();
                body.extend(std::iter::repeat(0u8).take(padding));
                body.push(0x01);
            }
            body.extend_from_slice(&entry_bytes);

            if record.addressable {
                secondary.push(SecondaryEntry {
                    key: record.key.clone(),
                    index_offset: offset,
                    access_index: record.ordinal,
                    entry_bytes,
                });
            }
        }
        // End-of-block sentinel where the next entry's size would start.
        body.push(0);

        let header = SortedIndexHeader {
            enable_access_position_index: self.config.enable_access_position_index,
            has_prefix_compression: self.prefix_compressed_any,
            normalise_for_binary_search: normalise,
            is_pre_normalised,
            disable_key_prefix_compression: !self.config.prefix_compression,
            enable_partial_read: self.config.enable_partial_read,
            segment_max_index_entry_size: entry_width,
        };
        let mut header_bytes = Vec::new();
        header.encode(&mut header_bytes);

        Ok(ClosedSortedIndex {
            framed: block::write_framed(&header_bytes, &body, codec)?,
            header,
            entry_count: self.records.len(),
            secondary,
        })
    }
}

/// A closed sorted-index block with its secondary-index feed.
pub struct ClosedSortedIndex {
    pub framed: Vec<u8>,
    pub header: SortedIndexHeader,
    pub entry_count: usize,
    pub secondary: Vec<SecondaryEntry>,
}

/// Parses entries out of a decompressed sorted-index body.
pub struct SortedIndexReader<'a> {
    header: &'a SortedIndexHeader,
    body: &'a [u8],
}

impl<'a> SortedIndexReader<'a> {
    pub fn new(header: &'a SortedIndexHeader, body: &'a [u8]) -> Self {
        Self { header, body }
    }

    /// Width of a normalised entry slot, zero when entries are packed.
    pub fn entry_width(&self) -> u64 {
        self.header.segment_max_index_entry_size
    }

    /// Sequentially reads the entry starting at `offset`.
    ///
    /// `previous` supplies the context for prefix-compressed keys and reused
    /// value slots; a random read of an entry that needs context fails with
    /// `Corruption`, which probe loops treat as a miss.
    pub fn read_at(&self, offset: u64, previous: Option<&IndexEntry>) -> Result<IndexEntry> {
        let slot_start = offset as usize;
        let record_start = self.skip_padding(slot_start)?;
        let (mut entry, payload_end) =
            parse_record(self.header, self.body, record_start, previous)?;
        entry.index_offset = slot_start as u64;

        // Learn the successor by peeking where the next record starts.
        let next_slot = if self.entry_width() > 0 {
            slot_start as u64 + self.entry_width()
        } else {
            payload_end as u64
        };
        if let Some(size) = self.peek_size(next_slot as usize)? {
            entry.next_index_offset = next_slot as i64;
            entry.next_index_size = size;
        }
        Ok(entry)
    }

    /// The first entry, or `None` for an empty block.
    pub fn first(&self) -> Result<Option<IndexEntry>> {
        if self.peek_size(0)?.is_none() {
            return Ok(None);
        }
        self.read_at(0, None).map(Some)
    }

    /// Iterates every entry in key order.
    pub fn iter(&self) -> Entries<'_, 'a> {
        Entries {
            reader: self,
            previous: None,
            done: false,
        }
    }

    fn skip_padding(&self, slot_start: usize) -> Result<usize> {
        if self.entry_width() == 0 || self.header.is_pre_normalised {
            return Ok(slot_start);
        }
        let slot_end = (slot_start + self.entry_width() as usize).min(self.body.len());
        let mut pos = slot_start;
        while pos < slot_end && self.body[pos] == 0 {
            pos += 1;
        }
        if pos >= slot_end || self.body[pos] != 0x01 {
            return crate::errcorrupt!("normalised entry at {slot_start} has no separator");
        }
        Ok(pos + 1)
    }

    /// The payload size of the entry at `slot`, or `None` at end-of-block.
    fn peek_size(&self, slot: usize) -> Result<Option<u64>> {
        if slot >= self.body.len() {
            return Ok(None);
        }
        let record_start = if self.entry_width() > 0 && !self.header.is_pre_normalised {
            // All-zero tail means the block ended; a separator means an entry.
            let slot_end = (slot + self.entry_width() as usize).min(self.body.len());
            let mut pos = slot;
            while pos < slot_end && self.body[pos] == 0 {
                pos += 1;
            }
            match self.body.get(pos) {
                Some(0x01) => pos + 1,
                _ => return Ok(None),
            }
        } else {
            slot
        };
        let (size, _) = varint::decode_unsigned(&self.body[record_start.min(self.body.len())..])?;
        Ok((size > 0).then_some(size))
    }
}

/// Parses one record starting at `record_start`, returning the entry (with
/// its successor fields unset) and the payload end position.
fn parse_record(
    header: &SortedIndexHeader,
    body: &[u8],
    record_start: usize,
    previous: Option<&IndexEntry>,
) -> Result<(IndexEntry, usize)> {
    let mut reader = SliceReader::at(body, record_start);

    let payload_size = reader.read_unsigned()? as usize;
    if payload_size == 0 {
        return crate::errcorrupt!("read past final sorted-index entry");
    }
    let payload_end = reader
        .position()
        .checked_add(payload_size)
        .filter(|&end| end <= body.len())
        .ok_or_else(|| Error::Corruption(format!("entry size {payload_size} overflows block")))?;

    let id = reader.read_signed()?;
    let prefix_compressed = id & FLAG_PREFIX_COMPRESSED != 0;
    let reused = id & FLAG_VALUE_REUSED != 0;
    let kind = EntryKind::from_base_id(id & !(FLAG_PREFIX_COMPRESSED | FLAG_VALUE_REUSED))?;

    let access_index = if header.enable_access_position_index {
        Some(reader.read_unsigned()?)
    } else {
        None
    };

    let stored_key = if prefix_compressed {
        let common = reader.read_unsigned()? as usize;
        let suffix_len = reader.read_unsigned()? as usize;
        let suffix = reader.read_bytes(suffix_len)?;
        let previous = previous.ok_or_else(|| {
            Error::Corruption("prefix-compressed entry read without context".to_string())
        })?;
        slice::decompress_prefix(&previous.key, suffix, common)?
    } else {
        let key_len = reader.read_unsigned()? as usize;
        reader.read_bytes(key_len)?.to_vec()
    };

    let deadline = kv::decode_deadline(&mut reader)?;

    let value_slot = if !kind.has_value_slot() {
        None
    } else if reused {
        let previous = previous.ok_or_else(|| {
            Error::Corruption("reused value slot read without context".to_string())
        })?;
        Some(previous.value_slot.ok_or_else(|| {
            Error::Corruption("reused value slot but previous entry has none".to_string())
        })?)
    } else {
        Some((reader.read_unsigned()?, reader.read_unsigned()?))
    };

    let time_len = reader.read_u32()? as usize;
    let time = Time::new(reader.read_bytes(time_len)?.to_vec());

    if reader.position() != payload_end {
        return crate::errcorrupt!(
            "entry payload ends at {} but size declared {payload_end}",
            reader.position()
        );
    }

    let (key, to_key) = if kind == EntryKind::Range {
        let (from, to) = slice::decompress_join(&stored_key)?;
        (from, Some(to))
    } else {
        (stored_key, None)
    };

    Ok((
        IndexEntry {
            kind,
            key,
            to_key,
            deadline,
            value_slot,
            time,
            access_index,
            index_offset: record_start as u64,
            next_index_offset: -1,
            next_index_size: 0,
        },
        payload_end,
    ))
}

/// Parses a record inlined outside the block, such as a copied hash-index
/// slot. Returns the entry and the record's byte length, which delimits the
/// CRC coverage.
pub fn read_inline(header: &SortedIndexHeader, bytes: &[u8]) -> Result<(IndexEntry, usize)> {
    let (entry, consumed) = parse_record(header, bytes, 0, None)?;
    Ok((entry, consumed))
}

/// Sequential iterator over all entries.
pub struct Entries<'r, 'a> {
    reader: &'r SortedIndexReader<'a>,
    previous: Option<IndexEntry>,
    done: bool,
}

impl Iterator for Entries<'_, '_> {
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let offset = match &self.previous {
            None => match self.reader.peek_size(0) {
                Ok(Some(_)) => 0,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            },
            Some(previous) if previous.next_index_offset >= 0 => {
                previous.next_index_offset as u64
            }
            Some(_) => {
                self.done = true;
                return None;
            }
        };
        match self.reader.read_at(offset, self.previous.as_ref()) {
            Ok(entry) => {
                self.previous = Some(entry.clone());
                Some(Ok(entry))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
