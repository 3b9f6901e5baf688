//! Byte-slice helpers shared by the Segment blocks: a bounds-checked cursor
//! for decoding entry records, key prefix compression, and the joined byte
//! pair used to persist range keys.

use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;
use crate::{varint, Error};

/// A forward-only cursor over a byte slice with bounds-checked reads.
///
/// Decode failures surface as `Error::Corruption` so that probe loops can
/// treat them as misses without special-casing panics.
pub struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Cursor starting at `pos` within `buf`.
    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::Corruption("read past end of slice".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(BigEndian::read_u32(bytes))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::Corruption(format!("read of {len} bytes past end of slice")))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn read_unsigned(&mut self) -> Result<u64> {
        let (value, read) = varint::decode_unsigned(&self.buf[self.pos.min(self.buf.len())..])?;
        self.pos += read;
        Ok(value)
    }

    pub fn read_signed(&mut self) -> Result<i64> {
        let (value, read) = varint::decode_signed(&self.buf[self.pos.min(self.buf.len())..])?;
        self.pos += read;
        Ok(value)
    }

    pub fn read_non_zero(&mut self) -> Result<u64> {
        let (value, read) = varint::decode_non_zero(&self.buf[self.pos.min(self.buf.len())..])?;
        self.pos += read;
        Ok(value)
    }
}

/// Length of the longest common prefix of `a` and `b`.
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Rebuilds a key from the previous key's shared prefix and the stored suffix.
pub fn decompress_prefix(previous: &[u8], suffix: &[u8], common: usize) -> Result<Vec<u8>> {
    if common > previous.len() {
        return Err(Error::Corruption(format!(
            "common prefix {common} exceeds previous key of {} bytes",
            previous.len()
        )));
    }
    let mut key = Vec::with_capacity(common + suffix.len());
    key.extend_from_slice(&previous[..common]);
    key.extend_from_slice(suffix);
    Ok(key)
}

/// Joins two byte strings so both can be recovered from the joined form alone.
///
/// Layout: `left ++ right ++ reversed-varint(left.len())`. The decoder reads
/// the left size from the tail, which is why the varint is reversed.
pub fn compress_join(left: &[u8], right: &[u8]) -> Vec<u8> {
    let mut joined =
        Vec::with_capacity(left.len() + right.len() + varint::size_of_unsigned(left.len() as u64));
    joined.extend_from_slice(left);
    joined.extend_from_slice(right);
    varint::encode_reversed(left.len() as u64, &mut joined);
    joined
}

/// Recovers the pair joined by [`compress_join`].
pub fn decompress_join(joined: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let (left_size, varint_len) = varint::decode_reversed(joined)?;
    let body_len = joined.len() - varint_len;
    let left_size = usize::try_from(left_size)
        .ok()
        .filter(|&size| size <= body_len)
        .ok_or_else(|| Error::Corruption("joined pair left size out of bounds".to_string()))?;
    Ok((
        joined[..left_size].to_vec(),
        joined[left_size..body_len].to_vec(),
    ))
}
