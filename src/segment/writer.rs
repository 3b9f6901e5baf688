//! The segment writer: consumes key-values in ascending key order and emits
//! a sequence of closed Segments bounded by the configured size.
//!
//! Every incoming key-value streams into the sorted-index and values
//! builders. When the accumulated size crosses `min_segment_size` the
//! in-progress Segment closes: the hash index, binary-search index, bloom
//! filter and footer are computed over the collected entries, the blocks are
//! laid out in file order, and the builders reinitialise for the next
//! Segment.

use tracing::debug;

use crate::config::SegmentConfig;
use crate::error::Result;
use crate::kv::{Apply, Deadline, KeyValue};
use crate::order::KeyOrder;
use crate::segment::binary_search::BinarySearchIndexBuilder;
use crate::segment::block::BlockOffset;
use crate::segment::bloom::BloomFilterBuilder;
use crate::segment::footer::{Footer, MaxKey};
use crate::segment::hash_index::HashIndexBuilder;
use crate::segment::sorted_index::{EntryKind, SortedIndexBuilder};
use crate::segment::values::ValuesBuilder;

/// Encodes one key-value into the values and sorted-index builders.
///
/// Empty values normalise to "no value": a zero-length slot means absent.
pub fn write_entry(
    index: &mut SortedIndexBuilder,
    values: &mut ValuesBuilder,
    kv: &KeyValue,
) -> Result<()> {
    match kv {
        KeyValue::Put {
            key,
            time,
            deadline,
            value,
        } => {
            let (slot, reused) = add_optional_value(values, value.as_deref());
            index.add(EntryKind::Put, key, *deadline, Some(slot), reused, time)
        }
        KeyValue::Remove {
            key,
            time,
            deadline,
        } => index.add(EntryKind::Remove, key, *deadline, None, false, time),
        KeyValue::Update {
            key,
            time,
            deadline,
            value,
        } => {
            let (slot, reused) = add_optional_value(values, value.as_deref());
            index.add(EntryKind::Update, key, *deadline, Some(slot), reused, time)
        }
        KeyValue::Function {
            key,
            time,
            deadline,
            id,
        } => {
            let slot = values.add(id);
            index.add(
                EntryKind::Function,
                key,
                *deadline,
                Some((slot.offset, slot.length)),
                slot.reused,
                time,
            )
        }
        KeyValue::PendingApply { key, applies } => {
            let mut bytes = Vec::new();
            crate::kv::encode_applies(applies, &mut bytes);
            let slot = values.add(&bytes);
            index.add(
                EntryKind::PendingApply,
                key,
                kv.deadline(),
                Some((slot.offset, slot.length)),
                slot.reused,
                kv.time(),
            )
        }
        KeyValue::Range {
            from_key,
            to_key,
            value,
        } => {
            let mut bytes = Vec::new();
            value.encode(&mut bytes);
            let slot = values.add(&bytes);
            index.add_range(
                from_key,
                to_key,
                (slot.offset, slot.length),
                slot.reused,
                value.time(),
            )
        }
    }
}

fn add_optional_value(values: &mut ValuesBuilder, value: Option<&[u8]>) -> ((u64, u64), bool) {
    match value {
        None | Some([]) => ((0, 0), false),
        Some(bytes) => {
            let slot = values.add(bytes);
            ((slot.offset, slot.length), slot.reused)
        }
    }
}

/// A finished Segment: its file bytes and the footer summarising it.
#[derive(Clone, Debug)]
pub struct ClosedSegment {
    pub bytes: Vec<u8>,
    pub footer: Footer,
}

struct InProgress {
    values: ValuesBuilder,
    index: SortedIndexBuilder,
    bloom_keys: Vec<Vec<u8>>,
    min_key: Option<Vec<u8>>,
    max_key: Option<MaxKey>,
    key_value_count: u64,
    range_count: u64,
    has_put: bool,
    has_remove_range: bool,
    nearest_deadline: Option<Deadline>,
    function_id_range: Option<(Vec<u8>, Vec<u8>)>,
}

impl InProgress {
    fn new(config: &SegmentConfig) -> Self {
        Self {
            values: ValuesBuilder::new(),
            index: SortedIndexBuilder::new(config.sorted_index.clone()),
            bloom_keys: Vec::new(),
            min_key: None,
            max_key: None,
            key_value_count: 0,
            range_count: 0,
            has_put: false,
            has_remove_range: false,
            nearest_deadline: None,
            function_id_range: None,
        }
    }

    fn observe(&mut self, kv: &KeyValue) {
        self.key_value_count += 1;
        if self.min_key.is_none() {
            self.min_key = Some(kv.key().to_vec());
        }
        match kv {
            KeyValue::Range {
                from_key,
                to_key,
                value,
            } => {
                self.range_count += 1;
                if matches!(value, Apply::Remove { .. }) {
                    self.has_remove_range = true;
                }
                self.max_key = Some(MaxKey::Range {
                    min_key: from_key.clone(),
                    excluded_max_key: to_key.clone(),
                });
                self.observe_apply(value);
            }
            fixed => {
                self.has_put |= fixed.is_put();
                self.bloom_keys.push(fixed.key().to_vec());
                self.max_key = Some(MaxKey::Fixed(fixed.key().to_vec()));
                self.observe_deadline(fixed.deadline());
                match fixed {
                    KeyValue::Function { id, .. } => self.observe_function(id),
                    KeyValue::PendingApply { applies, .. } => {
                        for apply in applies {
                            self.observe_apply(apply);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn observe_apply(&mut self, apply: &Apply) {
        self.observe_deadline(apply.deadline());
        if let Apply::Function { id, .. } = apply {
            self.observe_function(id);
        }
    }

    fn observe_deadline(&mut self, deadline: Option<Deadline>) {
        if let Some(deadline) = deadline {
            self.nearest_deadline = Some(match self.nearest_deadline {
                Some(nearest) => nearest.min(deadline),
                None => deadline,
            });
        }
    }

    fn observe_function(&mut self, id: &[u8]) {
        self.function_id_range = Some(match self.function_id_range.take() {
            None => (id.to_vec(), id.to_vec()),
            Some((min, max)) => (
                if id < min.as_slice() { id.to_vec() } else { min },
                if id > max.as_slice() { id.to_vec() } else { max },
            ),
        });
    }

    fn current_size(&self) -> usize {
        self.values.current_size() + self.index.current_size()
    }

    fn close(self, config: &SegmentConfig) -> Result<ClosedSegment> {
        let entry_count = self.index.entry_count();
        let values_framed = self.values.close(config.compression)?;
        let closed_index = self.index.close(config.compression)?;
        let normalised = closed_index.header.segment_max_index_entry_size > 0;

        // Populate the hash index and feed the binary-search index with
        // everything, or only the hash misses when a partial index is
        // configured.
        let mut hash_builder = HashIndexBuilder::new(&config.hash_index, &closed_index.secondary);
        let mut hash_missed = Vec::new();
        for entry in &closed_index.secondary {
            match &mut hash_builder {
                Some(builder) => {
                    if !builder.write(entry) {
                        hash_missed.push(entry);
                    }
                }
                None => hash_missed.push(entry),
            }
        }
        let hash_framed = match hash_builder {
            Some(builder) => builder.close(config.compression)?,
            None => None,
        };

        let binary_framed = if normalised {
            // Normalised entries are addressed by ordinal; no offset array.
            None
        } else {
            let full_feed = config.binary_search_full_index || hash_framed.is_none();
            let mut builder = BinarySearchIndexBuilder::new(
                full_feed && closed_index.secondary.len() == entry_count,
            );
            if full_feed {
                for entry in &closed_index.secondary {
                    builder.push(entry.index_offset);
                }
            } else {
                for entry in hash_missed {
                    builder.push(entry.index_offset);
                }
            }
            builder.close(config.compression)?
        };

        let bloom_framed = match BloomFilterBuilder::new(&config.bloom, self.bloom_keys.len()) {
            Some(mut builder) if !self.has_remove_range => {
                for key in &self.bloom_keys {
                    builder.add(key);
                }
                builder.close(config.compression)?
            }
            _ => None,
        };

        // Lay the blocks out in file order and point the footer at them.
        let mut bytes = Vec::new();
        let place = |block: &Option<Vec<u8>>, bytes: &mut Vec<u8>| -> Option<BlockOffset> {
            block.as_ref().map(|framed| {
                let offset = BlockOffset::new(bytes.len() as u64, framed.len() as u64);
                bytes.extend_from_slice(framed);
                offset
            })
        };
        let values_offset = place(&values_framed, &mut bytes);
        let sorted_offset = place(&Some(closed_index.framed), &mut bytes)
            .expect("sorted index block is always written");
        let hash_offset = place(&hash_framed, &mut bytes);
        let binary_offset = place(&binary_framed, &mut bytes);
        let bloom_offset = place(&bloom_framed, &mut bytes);

        let footer = Footer {
            key_value_count: self.key_value_count,
            range_count: self.range_count,
            has_put: self.has_put,
            created_in_level: config.created_in_level,
            nearest_deadline: self.nearest_deadline,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key.unwrap_or(MaxKey::Fixed(Vec::new())),
            function_id_range: self.function_id_range,
            values: values_offset,
            sorted_index: sorted_offset,
            hash_index: hash_offset,
            binary_search: binary_offset,
            bloom_filter: bloom_offset,
        };
        bytes.extend_from_slice(&footer.write());
        Ok(ClosedSegment { bytes, footer })
    }
}

/// Streams sorted key-values into a sequence of bounded Segments.
pub struct SegmentWriter {
    config: SegmentConfig,
    key_order: KeyOrder,
    state: InProgress,
    finished: Vec<ClosedSegment>,
}

impl SegmentWriter {
    pub fn new(config: SegmentConfig, key_order: KeyOrder) -> Self {
        let state = InProgress::new(&config);
        Self {
            config,
            key_order,
            state,
            finished: Vec::new(),
        }
    }

    /// Appends the next key-value. Keys must arrive in strictly ascending
    /// order under the writer's key order; a key equal to the previous
    /// range's excluded end is legal.
    pub fn add(&mut self, kv: &KeyValue) -> Result<()> {
        if let Some(max_key) = &self.state.max_key {
            let ascending = match max_key {
                MaxKey::Fixed(_) => {
                    self.key_order.cmp(kv.key(), max_key.max_key()) == std::cmp::Ordering::Greater
                }
                MaxKey::Range { .. } => {
                    self.key_order.cmp(kv.key(), max_key.max_key()) != std::cmp::Ordering::Less
                }
            };
            debug_assert!(ascending, "keys must arrive in ascending order");
        }
        write_entry(&mut self.state.index, &mut self.state.values, kv)?;
        self.state.observe(kv);

        if self.state.current_size() >= self.config.min_segment_size {
            self.flush_current()?;
        }
        Ok(())
    }

    /// Closes the in-progress Segment and starts a fresh one.
    fn flush_current(&mut self) -> Result<()> {
        if self.state.index.entry_count() == 0 {
            return Ok(());
        }
        let state = std::mem::replace(&mut self.state, InProgress::new(&self.config));
        let closed = state.close(&self.config)?;
        debug!(
            key_values = closed.footer.key_value_count,
            ranges = closed.footer.range_count,
            bytes = closed.bytes.len(),
            level = closed.footer.created_in_level,
            min_key = %crate::fmt::bytes(&closed.footer.min_key),
            "closed segment"
        );
        self.finished.push(closed);
        Ok(())
    }

    /// Flushes the tail and returns every emitted Segment in write order.
    pub fn close(mut self) -> Result<Vec<ClosedSegment>> {
        self.flush_current()?;
        Ok(self.finished)
    }
}
