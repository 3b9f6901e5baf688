//! The footer block: the last bytes of a Segment file, holding the counts
//! and the offsets of every other block.
//!
//! ```text
//! +--------------------------+
//! | footer body              |
//! +--------------------------+
//! | body size : u32          |
//! | magic     : 0x01         |  last byte of the file
//! +--------------------------+
//! ```
//!
//! Readers seek to the end, take the bounded five-byte tail, then read the
//! body and verify its CRC.

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::file::FileHandle;
use crate::kv::{self, Deadline};
use crate::segment::block::BlockOffset;
use crate::slice::SliceReader;
use crate::varint;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Magic byte closing every single-Segment file.
pub const SEGMENT_MAGIC: u8 = 0x01;
/// Magic byte opening a multi-segment container file.
pub const MANY_SEGMENT_MAGIC: u8 = 0x02;

const FORMAT_VERSION: u8 = 1;

/// The Segment's largest key: a plain key, or the span of a trailing range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MaxKey {
    Fixed(Vec<u8>),
    /// `[min_key, excluded_max_key)` of a trailing Range entry.
    Range {
        min_key: Vec<u8>,
        excluded_max_key: Vec<u8>,
    },
}

impl MaxKey {
    /// The inclusive upper-bound comparison key.
    pub fn max_key(&self) -> &[u8] {
        match self {
            MaxKey::Fixed(key) => key,
            MaxKey::Range {
                excluded_max_key, ..
            } => excluded_max_key,
        }
    }
}

/// The decoded footer.
#[derive(Clone, Debug, PartialEq)]
pub struct Footer {
    pub key_value_count: u64,
    pub range_count: u64,
    pub has_put: bool,
    pub created_in_level: u32,
    pub nearest_deadline: Option<Deadline>,
    pub min_key: Vec<u8>,
    pub max_key: MaxKey,
    /// Lexicographic bounds of every function id the Segment references.
    pub function_id_range: Option<(Vec<u8>, Vec<u8>)>,
    pub values: Option<BlockOffset>,
    pub sorted_index: BlockOffset,
    pub hash_index: Option<BlockOffset>,
    pub binary_search: Option<BlockOffset>,
    pub bloom_filter: Option<BlockOffset>,
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    varint::encode_unsigned(bytes.len() as u64, buf);
    buf.extend_from_slice(bytes);
}

fn decode_bytes(reader: &mut SliceReader) -> Result<Vec<u8>> {
    let len = reader.read_unsigned()? as usize;
    Ok(reader.read_bytes(len)?.to_vec())
}

fn encode_optional_offset(offset: &Option<BlockOffset>, buf: &mut Vec<u8>) {
    match offset {
        None => buf.push(0),
        Some(offset) => {
            buf.push(1);
            offset.encode(buf);
        }
    }
}

fn decode_optional_offset(reader: &mut SliceReader) -> Result<Option<BlockOffset>> {
    match reader.read_u8()? {
        0 => Ok(None),
        _ => BlockOffset::decode(reader).map(Some),
    }
}

impl Footer {
    /// Serialises the footer, its CRC, the body size and the magic byte.
    pub fn write(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(64 + self.min_key.len());
        body.push(FORMAT_VERSION);
        varint::encode_unsigned(self.created_in_level as u64, &mut body);
        varint::encode_unsigned(self.key_value_count, &mut body);
        varint::encode_unsigned(self.range_count, &mut body);
        body.push(self.has_put as u8);
        kv::encode_deadline(self.nearest_deadline, &mut body);
        encode_bytes(&self.min_key, &mut body);
        match &self.max_key {
            MaxKey::Fixed(key) => {
                body.push(0);
                encode_bytes(key, &mut body);
            }
            MaxKey::Range {
                min_key,
                excluded_max_key,
            } => {
                body.push(1);
                encode_bytes(min_key, &mut body);
                encode_bytes(excluded_max_key, &mut body);
            }
        }
        match &self.function_id_range {
            None => body.push(0),
            Some((min, max)) => {
                body.push(1);
                encode_bytes(min, &mut body);
                encode_bytes(max, &mut body);
            }
        }
        encode_optional_offset(&self.values, &mut body);
        self.sorted_index.encode(&mut body);
        encode_optional_offset(&self.hash_index, &mut body);
        encode_optional_offset(&self.binary_search, &mut body);
        encode_optional_offset(&self.bloom_filter, &mut body);

        let crc = CRC32.checksum(&body);
        let mut crc_bytes = [0u8; 4];
        BigEndian::write_u32(&mut crc_bytes, crc);
        body.extend_from_slice(&crc_bytes);

        let mut size_bytes = [0u8; 4];
        BigEndian::write_u32(&mut size_bytes, body.len() as u32);
        body.extend_from_slice(&size_bytes);
        body.push(SEGMENT_MAGIC);
        body
    }

    /// Reads the footer from the tail of `file`.
    pub fn read(file: &dyn FileHandle) -> Result<Self> {
        let file_size = file.size()?;
        if file_size < 6 {
            return crate::errcorrupt!("file of {file_size} bytes cannot hold a footer");
        }
        let tail = file.read(file_size - 5, 5)?;
        if tail[4] != SEGMENT_MAGIC {
            return crate::errcorrupt!("footer magic byte is {:#04x}", tail[4]);
        }
        let body_size = BigEndian::read_u32(&tail[..4]) as u64;
        if body_size + 5 > file_size {
            return crate::errcorrupt!("footer size {body_size} exceeds the file");
        }
        let body = file.read(file_size - 5 - body_size, body_size as usize)?;
        Self::decode(&body)
    }

    fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return crate::errcorrupt!("footer body of {} bytes is truncated", body.len());
        }
        let (fields, crc_bytes) = body.split_at(body.len() - 4);
        let declared_crc = BigEndian::read_u32(crc_bytes);
        let actual_crc = CRC32.checksum(fields);
        if declared_crc != actual_crc {
            return crate::errcorrupt!("footer crc {actual_crc:#x} does not match {declared_crc:#x}");
        }

        let mut reader = SliceReader::new(fields);
        let version = reader.read_u8()?;
        if version != FORMAT_VERSION {
            return crate::errcorrupt!("unknown footer format version {version}");
        }
        let created_in_level = reader.read_unsigned()? as u32;
        let key_value_count = reader.read_unsigned()?;
        let range_count = reader.read_unsigned()?;
        let has_put = reader.read_u8()? != 0;
        let nearest_deadline = kv::decode_deadline(&mut reader)?;
        let min_key = decode_bytes(&mut reader)?;
        let max_key = match reader.read_u8()? {
            0 => MaxKey::Fixed(decode_bytes(&mut reader)?),
            _ => MaxKey::Range {
                min_key: decode_bytes(&mut reader)?,
                excluded_max_key: decode_bytes(&mut reader)?,
            },
        };
        let function_id_range = match reader.read_u8()? {
            0 => None,
            _ => Some((decode_bytes(&mut reader)?, decode_bytes(&mut reader)?)),
        };
        Ok(Self {
            key_value_count,
            range_count,
            has_put,
            created_in_level,
            nearest_deadline,
            min_key,
            max_key,
            function_id_range,
            values: decode_optional_offset(&mut reader)?,
            sorted_index: BlockOffset::decode(&mut reader)?,
            hash_index: decode_optional_offset(&mut reader)?,
            binary_search: decode_optional_offset(&mut reader)?,
            bloom_filter: decode_optional_offset(&mut reader)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;
    use crate::Error;

    fn sample() -> Footer {
        Footer {
            key_value_count: 1234,
            range_count: 3,
            has_put: true,
            created_in_level: 2,
            nearest_deadline: Some(Deadline::from_nanos(987_654_321)),
            min_key: b"aardvark".to_vec(),
            max_key: MaxKey::Range {
                min_key: b"yak".to_vec(),
                excluded_max_key: b"zebra".to_vec(),
            },
            function_id_range: Some((b"fn-a".to_vec(), b"fn-z".to_vec())),
            values: Some(BlockOffset::new(0, 100)),
            sorted_index: BlockOffset::new(100, 400),
            hash_index: Some(BlockOffset::new(500, 90)),
            binary_search: None,
            bloom_filter: Some(BlockOffset::new(590, 64)),
        }
    }

    #[test]
    fn test_roundtrip() {
        let footer = sample();
        // The footer sits at the end of a file with other bytes before it.
        let mut file_bytes = vec![0xaau8; 700];
        file_bytes.extend_from_slice(&footer.write());
        let file = MemoryFile::new(file_bytes);

        assert_eq!(Footer::read(&file).unwrap(), footer);
    }

    #[test]
    fn test_magic_mismatch() {
        let mut bytes = sample().write();
        *bytes.last_mut().unwrap() = 0x7f;
        let file = MemoryFile::new(bytes);
        assert!(matches!(Footer::read(&file), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_crc_detects_corruption() {
        let mut bytes = sample().write();
        // Flip a byte inside the body.
        bytes[3] ^= 0xff;
        let file = MemoryFile::new(bytes);
        assert!(matches!(Footer::read(&file), Err(Error::Corruption(_))));
    }
}
