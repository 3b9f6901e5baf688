//! The bloom-filter block: a negative membership filter consulted before any
//! other index on the get path.
//!
//! Sizing follows the standard optimum for a target false positive rate `p`
//! over `n` keys: `bits = ceil(-n * ln(p) / ln(2)^2)` and
//! `probes = ceil(bits / n * ln(2))`. Probing reuses the segment's 64-bit
//! key hash split into two halves, stepped as `h1 + i * h2`.
//!
//! A Segment holding a Remove range gets no filter: a positive-only bitset
//! cannot answer for an interval of removed keys.

use crate::config::BloomConfig;
use crate::error::Result;
use crate::segment::block::{self, Codec};
use crate::segment::hash_index::key_hash;
use crate::slice::SliceReader;
use crate::varint;

/// The block-specific header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomHeader {
    pub number_of_bits: u64,
    pub max_probe: u32,
}

impl BloomHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        varint::encode_unsigned(self.number_of_bits, buf);
        varint::encode_unsigned(self.max_probe as u64, buf);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = SliceReader::new(bytes);
        Ok(Self {
            number_of_bits: reader.read_unsigned()?,
            max_probe: reader.read_unsigned()? as u32,
        })
    }
}

/// Builds the bitset over the keys of one Segment.
pub struct BloomFilterBuilder {
    bits: Vec<u8>,
    header: BloomHeader,
}

impl BloomFilterBuilder {
    /// Sizes the filter for `number_of_keys` at the configured rate. Returns
    /// `None` when disabled or when the Segment is too small to benefit.
    pub fn new(config: &BloomConfig, number_of_keys: usize) -> Option<Self> {
        if !config.enabled || number_of_keys < config.minimum_number_of_keys {
            return None;
        }
        let n = number_of_keys as f64;
        let p = config.false_positive_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let number_of_bits = (-n * p.ln() / (ln2 * ln2)).ceil() as u64;
        let max_probe = ((number_of_bits as f64 / n) * ln2).ceil() as u32;
        Some(Self {
            bits: vec![0u8; number_of_bits.div_ceil(8) as usize],
            header: BloomHeader {
                number_of_bits,
                max_probe: max_probe.max(1),
            },
        })
    }

    pub fn add(&mut self, key: &[u8]) {
        let hash = key_hash(key);
        let (h1, h2) = (hash >> 32, hash & 0xffff_ffff);
        for probe in 0..self.header.max_probe as u64 {
            let bit = (h1.wrapping_add(probe.wrapping_mul(h2)) & 0x7fff_ffff)
                % self.header.number_of_bits;
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    pub fn close(self, codec: Option<Codec>) -> Result<Option<Vec<u8>>> {
        let mut header_bytes = Vec::new();
        self.header.encode(&mut header_bytes);
        block::write_framed(&header_bytes, &self.bits, codec).map(Some)
    }
}

/// Whether `key` might be present. `false` is definitive.
pub fn might_contain(header: &BloomHeader, body: &[u8], key: &[u8]) -> bool {
    let hash = key_hash(key);
    let (h1, h2) = (hash >> 32, hash & 0xffff_ffff);
    for probe in 0..header.max_probe as u64 {
        let bit = (h1.wrapping_add(probe.wrapping_mul(h2)) & 0x7fff_ffff) % header.number_of_bits;
        let byte = match body.get((bit / 8) as usize) {
            Some(byte) => *byte,
            None => return true,
        };
        if byte & (1 << (bit % 8)) == 0 {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::block::read_framed;

    fn config() -> BloomConfig {
        BloomConfig {
            enabled: true,
            false_positive_rate: 0.01,
            minimum_number_of_keys: 1,
        }
    }

    #[test]
    fn test_sizing_formulas() {
        let filter = BloomFilterBuilder::new(&config(), 1000).unwrap();
        // 1000 keys at 1%: 9586 bits, 7 probes.
        assert_eq!(filter.header.number_of_bits, 9586);
        assert_eq!(filter.header.max_probe, 7);
    }

    #[test]
    fn test_no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..500)
            .map(|i| format!("bloom-key-{i}").into_bytes())
            .collect();
        let mut builder = BloomFilterBuilder::new(&config(), keys.len()).unwrap();
        for key in &keys {
            builder.add(key);
        }
        let framed = builder.close(None).unwrap().unwrap();
        let parsed = read_framed(&framed).unwrap();
        let header = BloomHeader::decode(&parsed.header).unwrap();

        for key in &keys {
            assert!(might_contain(&header, &parsed.body, key));
        }
    }

    #[test]
    fn test_absent_keys_mostly_filtered() {
        let mut builder = BloomFilterBuilder::new(&config(), 1000).unwrap();
        for i in 0..1000 {
            builder.add(format!("present-{i}").as_bytes());
        }
        let framed = builder.close(None).unwrap().unwrap();
        let parsed = read_framed(&framed).unwrap();
        let header = BloomHeader::decode(&parsed.header).unwrap();

        let false_positives = (0..1000)
            .filter(|i| might_contain(&header, &parsed.body, format!("absent-{i}").as_bytes()))
            .count();
        // Allow generous slack over the configured 1% target.
        assert!(false_positives < 100, "{false_positives} false positives");
    }

    #[test]
    fn test_disabled_or_tiny_builds_nothing() {
        let disabled = BloomConfig {
            enabled: false,
            ..config()
        };
        assert!(BloomFilterBuilder::new(&disabled, 100).is_none());

        let floor = BloomConfig {
            minimum_number_of_keys: 10,
            ..config()
        };
        assert!(BloomFilterBuilder::new(&floor, 5).is_none());
    }
}
