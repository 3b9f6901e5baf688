//! Block framing shared by every Segment block.
//!
//! On disk a block is:
//!
//! ```text
//! +---------------------------+
//! | header_size   : varuint   |
//! +---------------------------+
//! | compression marker : u8   |  0 = uncompressed, else codec id
//! | decompressed_size : varuint  (only when marker > 0)
//! +---------------------------+
//! | block-specific header     |
//! +---------------------------+
//! | body                      |  compressed when marker > 0
//! +---------------------------+
//! ```
//!
//! `header_size` counts everything between its own last byte and the body,
//! so a reader can find the body without understanding the block kind.

use crate::error::Result;
use crate::slice::SliceReader;
use crate::varint;
use crate::Error;

/// Position and size of a block within its Segment file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockOffset {
    pub start: u64,
    pub size: u64,
}

impl BlockOffset {
    pub fn new(start: u64, size: u64) -> Self {
        Self { start, size }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        varint::encode_unsigned(self.start, buf);
        varint::encode_unsigned(self.size, buf);
    }

    pub fn decode(reader: &mut SliceReader) -> Result<Self> {
        Ok(Self {
            start: reader.read_unsigned()?,
            size: reader.read_unsigned()?,
        })
    }
}

/// Registered block compression codecs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Zstd { level: i32 },
}

impl Codec {
    pub fn zstd() -> Self {
        Codec::Zstd { level: 3 }
    }

    pub fn id(&self) -> u8 {
        match self {
            Codec::Zstd { .. } => 1,
        }
    }

    fn compress(&self, body: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Zstd { level } => zstd::bulk::compress(body, *level)
                .map_err(|err| Error::IO(format!("zstd compression failed: {err}"))),
        }
    }

    fn decompress(id: u8, body: &[u8], decompressed_size: usize) -> Result<Vec<u8>> {
        match id {
            1 => {
                let bytes = zstd::bulk::decompress(body, decompressed_size)
                    .map_err(|err| Error::Corruption(format!("zstd body: {err}")))?;
                if bytes.len() != decompressed_size {
                    return crate::errcorrupt!(
                        "decompressed {} bytes, header declared {decompressed_size}",
                        bytes.len()
                    );
                }
                Ok(bytes)
            }
            other => crate::errcorrupt!("unknown compression codec id {other}"),
        }
    }
}

/// Frames a block: compresses the body when a codec is given, prefixes the
/// compression marker and the block-specific header, and validates that the
/// header region never exceeds its declared size.
pub fn write_framed(header: &[u8], body: &[u8], codec: Option<Codec>) -> Result<Vec<u8>> {
    let mut region = Vec::with_capacity(header.len() + 8);
    let compressed;
    let body = match codec {
        None => {
            region.push(0);
            body
        }
        Some(codec) => {
            compressed = codec.compress(body)?;
            region.push(codec.id());
            varint::encode_unsigned(body.len() as u64, &mut region);
            &compressed
        }
    };
    region.extend_from_slice(header);

    let declared = region.len();
    let mut framed =
        Vec::with_capacity(varint::size_of_unsigned(declared as u64) + declared + body.len());
    varint::encode_unsigned(declared as u64, &mut framed);
    framed.extend_from_slice(&region);
    if framed.len() - varint::size_of_unsigned(declared as u64) > declared {
        return crate::errcorrupt!("block header write position exceeds declared size {declared}");
    }
    framed.extend_from_slice(body);
    Ok(framed)
}

/// A block pulled apart into its block-specific header and decompressed body.
#[derive(Clone, Debug, PartialEq)]
pub struct FramedBlock {
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

/// Reads a framed block back from its raw Segment bytes.
pub fn read_framed(bytes: &[u8]) -> Result<FramedBlock> {
    let mut reader = SliceReader::new(bytes);
    let header_size = reader.read_unsigned()? as usize;
    let region_start = reader.position();
    let marker = reader.read_u8()?;

    let decompressed_size = if marker > 0 {
        Some(reader.read_unsigned()? as usize)
    } else {
        None
    };

    let header_end = region_start
        .checked_add(header_size)
        .filter(|&end| end <= bytes.len() && end >= reader.position())
        .ok_or_else(|| Error::Corruption(format!("block header size {header_size} out of bounds")))?;
    let header = bytes[reader.position()..header_end].to_vec();

    let body = match decompressed_size {
        None => bytes[header_end..].to_vec(),
        Some(size) => Codec::decompress(marker, &bytes[header_end..], size)?,
    };
    Ok(FramedBlock { header, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncompressed_roundtrip() {
        let framed = write_framed(b"hdr", b"body bytes", None).unwrap();
        let block = read_framed(&framed).unwrap();
        assert_eq!(block.header, b"hdr");
        assert_eq!(block.body, b"body bytes");
    }

    #[test]
    fn test_compressed_roundtrip() {
        let body: Vec<u8> = b"repetition ".repeat(100).to_vec();
        let framed = write_framed(b"h", &body, Some(Codec::zstd())).unwrap();
        assert!(framed.len() < body.len());
        let block = read_framed(&framed).unwrap();
        assert_eq!(block.header, b"h");
        assert_eq!(block.body, body);
    }

    #[test]
    fn test_empty_header_and_body() {
        let framed = write_framed(&[], &[], None).unwrap();
        let block = read_framed(&framed).unwrap();
        assert!(block.header.is_empty());
        assert!(block.body.is_empty());
    }

    #[test]
    fn test_unknown_codec_is_corruption() {
        let mut framed = write_framed(b"h", b"body", None).unwrap();
        // Flip the marker byte to an unregistered codec id.
        let marker_at = varint::size_of_unsigned((b"h".len() + 1) as u64);
        framed[marker_at] = 9;
        assert!(matches!(
            read_framed(&framed),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_block_offset_roundtrip() {
        let offset = BlockOffset::new(12_345, 678);
        let mut buf = Vec::new();
        offset.encode(&mut buf);
        let mut reader = SliceReader::new(&buf);
        assert_eq!(BlockOffset::decode(&mut reader).unwrap(), offset);
    }
}
