//! The hash-index block: an open-addressed, double-hashed table mapping keys
//! to sorted-index entries.
//!
//! Slots hold either the varint-encoded sorted-index offset of an entry
//! ("offset mode") or the whole entry inlined with a CRC ("copied mode"):
//!
//! ```text
//! empty   : consecutive zero bytes, at least one record long
//! offset  : 0x00 marker, non-zero varint of (sortedIndexOffset + 1)
//! copied  : crc32 : varulong, indexOffset : varuint, entry bytes,
//!           0x01 trailer iff the entry's last byte is 0x00
//! ```
//!
//! The inlined entry is self-delimiting (it starts with its own size), which
//! is what makes the trailer unambiguous. A probe landing mid-record decodes
//! garbage; such decode failures are treated as probe misses, never as
//! errors, and the probe walks on.

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI, CRC_64_ECMA_182};

use crate::config::HashIndexConfig;
use crate::error::Result;
use crate::segment::block::{self, Codec};
use crate::segment::sorted_index::SecondaryEntry;
use crate::slice::SliceReader;
use crate::varint;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Reserved room at the start of the body for the header written at close.
pub const HEADER_RESERVE: usize = 40;

/// 64-bit key hash split into the two probe halves.
fn probe_halves(key: &[u8]) -> (u64, u64) {
    let hash = CRC64.checksum(key);
    (hash >> 32, hash & 0xffff_ffff)
}

fn slot_position(h1: u64, h2: u64, probe: u64, usable: u64) -> usize {
    let target = (h1.wrapping_add(probe.wrapping_mul(h2))) & 0x7fff_ffff;
    (target % usable) as usize + HEADER_RESERVE
}

/// The hash-index body header, persisted at close into the reserved region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashIndexHeader {
    pub allocated_bytes: u32,
    pub max_probe: u32,
    pub copy_index: bool,
    pub hit: u64,
    pub miss: u64,
    /// Smallest CRC of any inlined entry; zero when offsets are stored.
    pub minimum_crc: u64,
    pub writeable_largest_value_size: u64,
}

impl HashIndexHeader {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_RESERVE);
        let mut allocated = [0u8; 4];
        BigEndian::write_i32(&mut allocated, self.allocated_bytes as i32);
        buf.extend_from_slice(&allocated);
        varint::encode_unsigned(self.max_probe as u64, &mut buf);
        buf.push(self.copy_index as u8);
        varint::encode_unsigned(self.hit, &mut buf);
        varint::encode_unsigned(self.miss, &mut buf);
        varint::encode_unsigned(self.minimum_crc, &mut buf);
        varint::encode_unsigned(self.writeable_largest_value_size, &mut buf);
        if buf.len() > HEADER_RESERVE {
            return crate::errcorrupt!(
                "hash index header of {} bytes exceeds its declared {HEADER_RESERVE} byte region",
                buf.len()
            );
        }
        buf.resize(HEADER_RESERVE, 0);
        Ok(buf)
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.len() < HEADER_RESERVE {
            return crate::errcorrupt!("hash index body shorter than its header");
        }
        let mut reader = SliceReader::new(&body[..HEADER_RESERVE]);
        let allocated_bytes = reader.read_u32()?;
        Ok(Self {
            allocated_bytes,
            max_probe: reader.read_unsigned()? as u32,
            copy_index: reader.read_u8()? != 0,
            hit: reader.read_unsigned()?,
            miss: reader.read_unsigned()?,
            minimum_crc: reader.read_unsigned()?,
            writeable_largest_value_size: reader.read_unsigned()?,
        })
    }

    fn usable(&self) -> u64 {
        self.allocated_bytes as u64 - self.writeable_largest_value_size - HEADER_RESERVE as u64
    }
}

/// Builds the table over the secondary entries collected by the sorted
/// index.
pub struct HashIndexBuilder {
    config: HashIndexConfig,
    bytes: Vec<u8>,
    occupied: Vec<bool>,
    largest_value_size: u64,
    hit: u64,
    miss: u64,
    minimum_crc: u64,
}

impl HashIndexBuilder {
    /// Sizes the table for `entries` and the configured allocation factor.
    /// Returns `None` when the index is disabled or there is nothing to
    /// index.
    pub fn new(config: &HashIndexConfig, entries: &[SecondaryEntry]) -> Option<Self> {
        if !config.enabled || entries.is_empty() {
            return None;
        }
        let record_size = |entry: &SecondaryEntry| -> u64 {
            if config.copy_index {
                let crc = CRC32.checksum(&entry.entry_bytes) as u64;
                varint::size_of_unsigned(crc) as u64
                    + varint::size_of_unsigned(entry.index_offset) as u64
                    + entry.entry_bytes.len() as u64
                    + 1
            } else {
                1 + varint::size_of_non_zero(entry.index_offset) as u64
            }
        };
        let required: u64 = entries.iter().map(record_size).sum();
        let largest = entries.iter().map(record_size).max().unwrap_or(0);
        let table = ((required as f64 * config.allocate_space_factor.max(1.0)) as u64).max(largest + 1);
        let allocated = table + largest + HEADER_RESERVE as u64;
        Some(Self {
            config: config.clone(),
            bytes: vec![0u8; allocated as usize],
            occupied: vec![false; allocated as usize],
            largest_value_size: largest,
            hit: 0,
            miss: 0,
            minimum_crc: u64::MAX,
        })
    }

    fn usable(&self) -> u64 {
        self.bytes.len() as u64 - self.largest_value_size - HEADER_RESERVE as u64
    }

    /// Probes for a free slot and writes the entry's record, reporting
    /// whether the entry was placed. A failure to place within the probe
    /// ceiling is counted, not raised.
    pub fn write(&mut self, entry: &SecondaryEntry) -> bool {
        let record = if self.config.copy_index {
            let crc = CRC32.checksum(&entry.entry_bytes) as u64;
            self.minimum_crc = self.minimum_crc.min(crc);
            let mut record = Vec::with_capacity(entry.entry_bytes.len() + 12);
            varint::encode_unsigned(crc, &mut record);
            varint::encode_unsigned(entry.index_offset, &mut record);
            record.extend_from_slice(&entry.entry_bytes);
            if record.last() == Some(&0) {
                record.push(0x01);
            }
            record
        } else {
            let mut record = Vec::with_capacity(7);
            record.push(0);
            varint::encode_non_zero(entry.index_offset, &mut record);
            record
        };

        let (h1, h2) = probe_halves(&entry.key);
        let usable = self.usable();
        for probe in 0..=self.config.max_probe as u64 {
            let position = slot_position(h1, h2, probe, usable);
            let end = position + record.len();
            let free = self.bytes[position..end].iter().all(|&b| b == 0)
                && !self.occupied[position..end].iter().any(|&taken| taken);
            if free {
                self.bytes[position..end].copy_from_slice(&record);
                self.occupied[position..end].fill(true);
                self.hit += 1;
                return true;
            }
        }
        self.miss += 1;
        false
    }

    pub fn hit(&self) -> u64 {
        self.hit
    }

    pub fn miss(&self) -> u64 {
        self.miss
    }

    /// Frames the block, or refuses when too few keys were placed for the
    /// index to pay for itself.
    pub fn close(self, codec: Option<Codec>) -> Result<Option<Vec<u8>>> {
        if (self.hit as usize) < self.config.minimum_number_of_hits {
            return Ok(None);
        }
        let header = HashIndexHeader {
            allocated_bytes: self.bytes.len() as u32,
            max_probe: self.config.max_probe,
            copy_index: self.config.copy_index,
            hit: self.hit,
            miss: self.miss,
            minimum_crc: if self.config.copy_index { self.minimum_crc } else { 0 },
            writeable_largest_value_size: self.largest_value_size,
        };
        let mut body = self.bytes;
        body[..HEADER_RESERVE].copy_from_slice(&header.encode()?);
        block::write_framed(&[], &body, codec).map(Some)
    }
}

/// One probe candidate handed to the caller's assert function.
pub enum SlotCandidate<'a> {
    /// Offset mode: the sorted-index offset the slot points at.
    Offset(u64),
    /// Copied mode: the inlined record. `bytes` starts at the entry and runs
    /// to the end of the writable region; the entry delimits itself.
    Copied {
        crc: u64,
        index_offset: u64,
        bytes: &'a [u8],
    },
}

/// Probes the table for `key`, invoking `assert_value` on every decodable
/// candidate until it returns a result or the probe ceiling is reached.
///
/// Decode failures and CRC mismatches inside `assert_value` must surface as
/// `Ok(None)` so the probe continues; only I/O-level failures should be
/// raised.
pub fn search<T>(
    header: &HashIndexHeader,
    body: &[u8],
    key: &[u8],
    mut assert_value: impl FnMut(SlotCandidate) -> Result<Option<T>>,
) -> Result<Option<T>> {
    let (h1, h2) = probe_halves(key);
    let usable = header.usable();
    for probe in 0..=header.max_probe as u64 {
        let position = slot_position(h1, h2, probe, usable);
        if position >= body.len() {
            continue;
        }
        let candidate = if header.copy_index {
            decode_copied(header, &body[position..])
        } else {
            decode_offset(&body[position..])
        };
        let Some(candidate) = candidate else {
            continue;
        };
        if let Some(found) = assert_value(candidate)? {
            return Ok(Some(found));
        }
    }
    Ok(None)
}

fn decode_offset(slot: &[u8]) -> Option<SlotCandidate<'_>> {
    // Occupied offset slots carry a zero marker, then a zero-free varint.
    if slot.first() != Some(&0) {
        return None;
    }
    let (offset, _) = varint::decode_non_zero(&slot[1..]).ok()?;
    Some(SlotCandidate::Offset(offset))
}

fn decode_copied<'a>(header: &HashIndexHeader, slot: &'a [u8]) -> Option<SlotCandidate<'a>> {
    let mut reader = SliceReader::new(slot);
    let crc = reader.read_unsigned().ok()?;
    if crc < header.minimum_crc {
        return None;
    }
    let index_offset = reader.read_unsigned().ok()?;
    Some(SlotCandidate::Copied {
        crc,
        index_offset,
        bytes: &slot[reader.position()..],
    })
}

/// CRC of an inlined entry, compared against the slot's stored CRC.
pub fn entry_crc(entry_bytes: &[u8]) -> u64 {
    CRC32.checksum(entry_bytes) as u64
}

/// The 64-bit key hash, shared with the bloom filter.
pub fn key_hash(key: &[u8]) -> u64 {
    CRC64.checksum(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::block::read_framed;

    fn secondary(key: &[u8], index_offset: u64, entry_bytes: Vec<u8>) -> SecondaryEntry {
        SecondaryEntry {
            key: key.to_vec(),
            index_offset,
            access_index: 0,
            entry_bytes,
        }
    }

    fn entry_bytes_for(key: &[u8]) -> Vec<u8> {
        // Stand-in for a real sorted-index record: self-describing enough
        // for the tests' assert functions.
        let mut bytes = Vec::new();
        varint::encode_unsigned(key.len() as u64, &mut bytes);
        bytes.extend_from_slice(key);
        bytes
    }

    fn build(config: &HashIndexConfig, entries: &[SecondaryEntry]) -> (HashIndexHeader, Vec<u8>) {
        let mut builder = HashIndexBuilder::new(config, entries).unwrap();
        for entry in entries {
            builder.write(entry);
        }
        let framed = builder.close(None).unwrap().unwrap();
        let body = read_framed(&framed).unwrap().body;
        let header = HashIndexHeader::decode(&body).unwrap();
        (header, body)
    }

    fn offset_config() -> HashIndexConfig {
        HashIndexConfig {
            enabled: true,
            max_probe: 100,
            allocate_space_factor: 4.0,
            copy_index: false,
            minimum_number_of_hits: 2,
        }
    }

    #[test]
    fn test_offset_mode_every_key_findable() {
        let entries: Vec<SecondaryEntry> = (0u32..200)
            .map(|i| secondary(format!("key-{i:04}").as_bytes(), i as u64 * 37, Vec::new()))
            .collect();
        let (header, body) = build(&offset_config(), &entries);
        assert_eq!(header.hit, 200);
        assert_eq!(header.miss, 0);
        assert!(!header.copy_index);

        for entry in &entries {
            let found = search(&header, &body, &entry.key, |candidate| match candidate {
                SlotCandidate::Offset(offset) if offset == entry.index_offset => {
                    Ok(Some(offset))
                }
                _ => Ok(None),
            })
            .unwrap();
            assert_eq!(found, Some(entry.index_offset), "key {:?}", entry.key);
        }
    }

    #[test]
    fn test_absent_key_misses() {
        let entries: Vec<SecondaryEntry> = (0u32..50)
            .map(|i| secondary(format!("key-{i}").as_bytes(), i as u64, Vec::new()))
            .collect();
        let (header, body) = build(&offset_config(), &entries);

        let found = search(&header, &body, b"not-there", |candidate| match candidate {
            // Assert functions reject candidates whose entry does not match.
            SlotCandidate::Offset(_) => Ok(None::<u64>),
            _ => Ok(None),
        })
        .unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn test_copied_mode_recovers_entries() {
        let config = HashIndexConfig {
            copy_index: true,
            max_probe: 1000,
            allocate_space_factor: 5.0,
            ..offset_config()
        };
        let entries: Vec<SecondaryEntry> = (0u32..100)
            .map(|i| {
                let key = format!("copied-{i:03}");
                secondary(key.as_bytes(), i as u64 * 13, entry_bytes_for(key.as_bytes()))
            })
            .collect();
        let (header, body) = build(&config, &entries);
        assert_eq!(header.hit, 100);
        assert_eq!(header.miss, 0);
        assert!(header.minimum_crc > 0);

        for entry in &entries {
            let found = search(&header, &body, &entry.key, |candidate| match candidate {
                SlotCandidate::Copied { crc, index_offset, bytes } => {
                    let len = entry.entry_bytes.len();
                    if bytes.len() < len || bytes[..len] != entry.entry_bytes[..] {
                        return Ok(None);
                    }
                    if crc != entry_crc(&bytes[..len]) {
                        return Ok(None);
                    }
                    Ok(Some(index_offset))
                }
                _ => Ok(None),
            })
            .unwrap();
            assert_eq!(found, Some(entry.index_offset), "key {:?}", entry.key);
        }
    }

    #[test]
    fn test_copied_entry_ending_in_zero_gets_trailer() {
        let config = HashIndexConfig {
            copy_index: true,
            minimum_number_of_hits: 1,
            ..offset_config()
        };
        // A record whose final byte is zero must not extend an empty run.
        let entry = secondary(b"zero-tail", 5, vec![3, 7, 0]);
        let mut builder = HashIndexBuilder::new(&config, std::slice::from_ref(&entry)).unwrap();
        builder.write(&entry);
        let framed = builder.close(None).unwrap().unwrap();
        let body = read_framed(&framed).unwrap().body;
        let header = HashIndexHeader::decode(&body).unwrap();

        let found = search(&header, &body, b"zero-tail", |candidate| match candidate {
            SlotCandidate::Copied { bytes, .. } if bytes.starts_with(&[3, 7, 0, 1]) => {
                Ok(Some(()))
            }
            _ => Ok(None),
        })
        .unwrap();
        assert_eq!(found, Some(()));
    }

    #[test]
    fn test_flipped_byte_fails_crc() {
        let config = HashIndexConfig {
            copy_index: true,
            minimum_number_of_hits: 1,
            ..offset_config()
        };
        let entry = secondary(b"fragile", 9, entry_bytes_for(b"fragile"));
        let mut builder = HashIndexBuilder::new(&config, std::slice::from_ref(&entry)).unwrap();
        builder.write(&entry);
        let framed = builder.close(None).unwrap().unwrap();
        let mut body = read_framed(&framed).unwrap().body;
        let header = HashIndexHeader::decode(&body).unwrap();

        // Find the slot and flip one byte of the inlined entry.
        let slot = body[HEADER_RESERVE..]
            .iter()
            .position(|&b| b != 0)
            .unwrap()
            + HEADER_RESERVE;
        let tail = body.len() - 1;
        for position in slot..=tail {
            if body[position] == b'f' {
                body[position] ^= 0xff;
                break;
            }
        }

        let found = search(&header, &body, b"fragile", |candidate| match candidate {
            SlotCandidate::Copied { crc, bytes, .. } => {
                let len = entry_bytes_for(b"fragile").len();
                if bytes.len() < len || crc != entry_crc(&bytes[..len]) {
                    // Corrupted slot reads as a miss and the probe goes on.
                    return Ok(None);
                }
                Ok(Some(()))
            }
            _ => Ok(None),
        })
        .unwrap();
        assert_eq!(found, None);
    }

    #[test]
    fn test_too_few_hits_drops_block() {
        let config = HashIndexConfig {
            minimum_number_of_hits: 5,
            ..offset_config()
        };
        let entries = vec![secondary(b"only", 0, Vec::new())];
        let mut builder = HashIndexBuilder::new(&config, &entries).unwrap();
        builder.write(&entries[0]);
        assert!(builder.close(None).unwrap().is_none());
    }

    #[test]
    fn test_disabled_or_empty_builds_nothing() {
        let disabled = HashIndexConfig {
            enabled: false,
            ..offset_config()
        };
        assert!(HashIndexBuilder::new(&disabled, &[secondary(b"k", 0, Vec::new())]).is_none());
        assert!(HashIndexBuilder::new(&offset_config(), &[]).is_none());
    }
}
