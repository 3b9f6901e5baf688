//! The values block: raw value bytes appended in write order.
//!
//! Sorted-index entries address values by `(offset, length)` slots. A value
//! identical to the immediately preceding one reuses the previous slot
//! instead of growing the block.

use crate::error::Result;
use crate::segment::block::{self, Codec};
use crate::Error;

/// Streams value bytes and hands out the slot each value landed in.
pub struct ValuesBuilder {
    bytes: Vec<u8>,
    last_slot: Option<(u64, u64)>,
}

/// Where a value landed, and whether it reused the previous slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueSlot {
    pub offset: u64,
    pub length: u64,
    pub reused: bool,
}

impl ValuesBuilder {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            last_slot: None,
        }
    }

    /// Appends `value`, deduplicating against the immediately prior value.
    pub fn add(&mut self, value: &[u8]) -> ValueSlot {
        if let Some((offset, length)) = self.last_slot {
            let start = offset as usize;
            let end = start + length as usize;
            if &self.bytes[start..end] == value {
                return ValueSlot {
                    offset,
                    length,
                    reused: true,
                };
            }
        }
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(value);
        self.last_slot = Some((offset, value.len() as u64));
        ValueSlot {
            offset,
            length: value.len() as u64,
            reused: false,
        }
    }

    /// Bytes accumulated so far, before framing.
    pub fn current_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Frames the block, or yields nothing when no value was ever written.
    pub fn close(self, codec: Option<Codec>) -> Result<Option<Vec<u8>>> {
        if self.bytes.is_empty() {
            return Ok(None);
        }
        block::write_framed(&[], &self.bytes, codec).map(Some)
    }
}

impl Default for ValuesBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads value slots out of a decompressed values body.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValuesReader<'a> {
    body: &'a [u8],
}

impl<'a> ValuesReader<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { body }
    }

    /// An always-empty reader for Segments without a values block.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn read(&self, offset: u64, length: u64) -> Result<&'a [u8]> {
        let start = offset as usize;
        let end = start
            .checked_add(length as usize)
            .filter(|&end| end <= self.body.len())
            .ok_or_else(|| {
                Error::Corruption(format!(
                    "value slot ({offset}, {length}) out of bounds of {} byte values body",
                    self.body.len()
                ))
            })?;
        Ok(&self.body[start..end])
    }
}
