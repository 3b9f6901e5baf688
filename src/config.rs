use crate::segment::block::Codec;

/// Configuration for building and opening Segments.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Minimum byte size of a closed Segment (default: 4MB)
    pub min_segment_size: usize,

    /// Per-block compression codec; `None` writes raw bodies (default: None)
    pub compression: Option<Codec>,

    /// Level this Segment is created in, recorded in the footer (default: 0)
    pub created_in_level: u32,

    /// Capacity of the decompressed block body cache (default: 128)
    pub block_cache_capacity: usize,

    /// Feed every addressable entry to the binary-search index, not just the
    /// ones the hash index failed to place (default: true)
    pub binary_search_full_index: bool,

    /// Sorted-index block configuration
    pub sorted_index: SortedIndexConfig,

    /// Hash-index block configuration
    pub hash_index: HashIndexConfig,

    /// Bloom-filter block configuration
    pub bloom: BloomConfig,
}

#[derive(Debug, Clone)]
pub struct SortedIndexConfig {
    /// Prefix-compress keys against the previous entry (default: true)
    pub prefix_compression: bool,

    /// Force a full key every N entries so a seek never walks back more than
    /// N entries to rebuild a key (default: 10)
    pub prefix_compression_reset_count: usize,

    /// Write per-entry access ordinals (default: false)
    pub enable_access_position_index: bool,

    /// Pad entries to a fixed width so binary search can address them by
    /// ordinal (default: false)
    pub normalise_for_binary_search: bool,

    /// Allow readers to parse the key and skip the value fields (default: false)
    pub enable_partial_read: bool,
}

#[derive(Debug, Clone)]
pub struct HashIndexConfig {
    /// Build a hash index at all (default: true)
    pub enabled: bool,

    /// Probe ceiling for both writes and reads (default: 10)
    pub max_probe: u32,

    /// Allocated table size as a multiple of the minimum required space;
    /// values of 2 or more make a perfect index likely (default: 2.0)
    pub allocate_space_factor: f64,

    /// Inline whole entries with a CRC instead of sorted-index offsets
    /// (default: false)
    pub copy_index: bool,

    /// Below this many successful placements close() drops the block
    /// (default: 2)
    pub minimum_number_of_hits: usize,
}

#[derive(Debug, Clone)]
pub struct BloomConfig {
    /// Build a bloom filter at all (default: true)
    pub enabled: bool,

    /// Target false positive probability (default: 0.01)
    pub false_positive_rate: f64,

    /// Below this many keys the filter is not worth its block (default: 10)
    pub minimum_number_of_keys: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            min_segment_size: 4 * 1024 * 1024, // 4MB
            compression: None,
            created_in_level: 0,
            block_cache_capacity: 128,
            binary_search_full_index: true,
            sorted_index: SortedIndexConfig::default(),
            hash_index: HashIndexConfig::default(),
            bloom: BloomConfig::default(),
        }
    }
}

impl Default for SortedIndexConfig {
    fn default() -> Self {
        Self {
            prefix_compression: true,
            prefix_compression_reset_count: 10,
            enable_access_position_index: false,
            normalise_for_binary_search: false,
            enable_partial_read: false,
        }
    }
}

impl Default for HashIndexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_probe: 10,
            allocate_space_factor: 2.0,
            copy_index: false,
            minimum_number_of_hits: 2,
        }
    }
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            false_positive_rate: 0.01,
            minimum_number_of_keys: 10,
        }
    }
}

impl SegmentConfig {
    /// Set minimum Segment size
    pub fn min_segment_size(mut self, size: usize) -> Self {
        self.min_segment_size = size;
        self
    }

    /// Set the block compression codec
    pub fn compression(mut self, codec: Option<Codec>) -> Self {
        self.compression = codec;
        self
    }

    /// Set the level recorded in emitted Segments
    pub fn created_in_level(mut self, level: u32) -> Self {
        self.created_in_level = level;
        self
    }

    /// Choose between a full and a hash-miss-only binary-search index
    pub fn binary_search_full_index(mut self, full: bool) -> Self {
        self.binary_search_full_index = full;
        self
    }

    /// Configure the sorted index
    pub fn sorted_index(mut self, config: SortedIndexConfig) -> Self {
        self.sorted_index = config;
        self
    }

    /// Configure the hash index
    pub fn hash_index(mut self, config: HashIndexConfig) -> Self {
        self.hash_index = config;
        self
    }

    /// Configure the bloom filter
    pub fn bloom(mut self, config: BloomConfig) -> Self {
        self.bloom = config;
        self
    }
}

impl SortedIndexConfig {
    pub fn prefix_compression(mut self, enabled: bool) -> Self {
        self.prefix_compression = enabled;
        self
    }

    pub fn prefix_compression_reset_count(mut self, count: usize) -> Self {
        self.prefix_compression_reset_count = count;
        self
    }

    pub fn enable_access_position_index(mut self, enabled: bool) -> Self {
        self.enable_access_position_index = enabled;
        self
    }

    pub fn normalise_for_binary_search(mut self, enabled: bool) -> Self {
        self.normalise_for_binary_search = enabled;
        self
    }
}

impl HashIndexConfig {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn max_probe(mut self, max_probe: u32) -> Self {
        self.max_probe = max_probe;
        self
    }

    pub fn allocate_space_factor(mut self, factor: f64) -> Self {
        self.allocate_space_factor = factor;
        self
    }

    pub fn copy_index(mut self, copy: bool) -> Self {
        self.copy_index = copy;
        self
    }
}

impl BloomConfig {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn false_positive_rate(mut self, rate: f64) -> Self {
        self.false_positive_rate = rate;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SegmentConfig::default();
        assert_eq!(config.min_segment_size, 4 * 1024 * 1024);
        assert!(config.compression.is_none());
        assert!(config.sorted_index.prefix_compression);
        assert!(!config.hash_index.copy_index);
        assert_eq!(config.bloom.false_positive_rate, 0.01);
    }

    #[test]
    fn test_builder() {
        let config = SegmentConfig::default()
            .min_segment_size(1024)
            .created_in_level(3)
            .hash_index(HashIndexConfig::default().copy_index(true).max_probe(100))
            .sorted_index(SortedIndexConfig::default().normalise_for_binary_search(true));

        assert_eq!(config.min_segment_size, 1024);
        assert_eq!(config.created_in_level, 3);
        assert!(config.hash_index.copy_index);
        assert_eq!(config.hash_index.max_probe, 100);
        assert!(config.sorted_index.normalise_for_binary_search);
    }
}
