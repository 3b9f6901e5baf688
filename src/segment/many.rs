//! The multi-segment container: several Segments concatenated into one file
//! behind a list Segment that maps child min-keys to their position.
//!
//! ```text
//! +---------------------------+
//! | 0x02 magic                |
//! | listSegmentSize : varuint |
//! +---------------------------+
//! | list Segment              |  one Put per child:
//! |                           |  key = child min-key,
//! |                           |  value = (offset, size) varuints
//! +---------------------------+
//! | child Segment 0           |
//! | child Segment 1           |
//! | ...                       |
//! +---------------------------+
//! ```
//!
//! Child offsets are relative to the start of the children region, so the
//! list Segment can be built before its own size is known. Children open
//! lazily over a bounded window of the container's file handle.

use std::sync::Arc;

use crate::config::SegmentConfig;
use crate::error::Result;
use crate::file::{FileHandle, SlicedFile};
use crate::kv::{KeyValue, Time};
use crate::order::KeyOrder;
use crate::segment::footer::MANY_SEGMENT_MAGIC;
use crate::segment::writer::{ClosedSegment, SegmentWriter};
use crate::segment::Segment;
use crate::slice::SliceReader;
use crate::varint;

/// Serialises closed Segments into one container file.
pub fn write_many(segments: &[ClosedSegment], key_order: &KeyOrder) -> Result<Vec<u8>> {
    // The list is a single Segment, so its writer never auto-flushes.
    let list_config = SegmentConfig::default().min_segment_size(usize::MAX);
    let mut list_writer = SegmentWriter::new(list_config, key_order.clone());
    let mut relative_offset = 0u64;
    for segment in segments {
        let mut position = Vec::new();
        varint::encode_unsigned(relative_offset, &mut position);
        varint::encode_unsigned(segment.bytes.len() as u64, &mut position);
        list_writer.add(&KeyValue::Put {
            key: segment.footer.min_key.clone(),
            time: Time::empty(),
            deadline: None,
            value: Some(position),
        })?;
        relative_offset += segment.bytes.len() as u64;
    }
    let mut list_segments = list_writer.close()?;
    if list_segments.len() != 1 {
        return crate::errcorrupt!(
            "list segment writer produced {} segments",
            list_segments.len()
        );
    }
    let list_bytes = list_segments.remove(0).bytes;

    let mut container = Vec::with_capacity(1 + 10 + list_bytes.len() + relative_offset as usize);
    container.push(MANY_SEGMENT_MAGIC);
    varint::encode_unsigned(list_bytes.len() as u64, &mut container);
    container.extend_from_slice(&list_bytes);
    for segment in segments {
        container.extend_from_slice(&segment.bytes);
    }
    Ok(container)
}

/// Opens every child Segment of a container file.
pub fn read_many(
    file: Arc<dyn FileHandle>,
    key_order: &KeyOrder,
    cache_capacity: usize,
) -> Result<Vec<Segment>> {
    let file_size = file.size()?;
    let prefix = file.read(0, (file_size.min(11)) as usize)?;
    let mut reader = SliceReader::new(&prefix);
    let magic = reader.read_u8()?;
    if magic != MANY_SEGMENT_MAGIC {
        return crate::errcorrupt!("container magic byte is {magic:#04x}");
    }
    let list_size = reader.read_unsigned()?;
    let list_start = reader.position() as u64;
    let children_start = list_start + list_size;

    let list_file = SlicedFile::new(file.clone(), list_start, list_size);
    let list = Segment::open(Arc::new(list_file), key_order.clone(), cache_capacity);

    let mut children = Vec::new();
    for kv in list.key_values()? {
        let KeyValue::Put {
            value: Some(position),
            ..
        } = kv
        else {
            return crate::errcorrupt!("list segment holds a non-Put entry");
        };
        let mut position = SliceReader::new(&position);
        let relative_offset = position.read_unsigned()?;
        let size = position.read_unsigned()?;
        let child_file = SlicedFile::new(file.clone(), children_start + relative_offset, size);
        children.push(Segment::open(
            Arc::new(child_file),
            key_order.clone(),
            cache_capacity,
        ));
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;
    use crate::Error;

    fn put(i: u32) -> KeyValue {
        KeyValue::Put {
            key: format!("many-{i:05}").into_bytes(),
            time: Time::new(vec![1]),
            deadline: None,
            value: Some(format!("value-{i}").into_bytes()),
        }
    }

    #[test]
    fn test_container_roundtrip() {
        let key_order = KeyOrder::default();
        let config = SegmentConfig::default().min_segment_size(2 * 1024);
        let mut writer = SegmentWriter::new(config, key_order.clone());
        let kvs: Vec<KeyValue> = (0..400).map(put).collect();
        for kv in &kvs {
            writer.add(kv).unwrap();
        }
        let segments = writer.close().unwrap();
        assert!(segments.len() > 1);

        let container = write_many(&segments, &key_order).unwrap();
        assert_eq!(container[0], MANY_SEGMENT_MAGIC);

        let file = Arc::new(MemoryFile::new(container));
        let children = read_many(file, &key_order, 16).unwrap();
        assert_eq!(children.len(), segments.len());

        // Every key resolves in exactly the child that owns its key range.
        let mut seen = 0;
        for child in &children {
            let child_kvs = child.key_values().unwrap();
            for kv in &child_kvs {
                assert_eq!(child.get(kv.key()).unwrap().as_ref(), Some(kv));
            }
            seen += child_kvs.len();
        }
        assert_eq!(seen, kvs.len());

        // Children preserve global key order.
        for pair in children.windows(2) {
            assert!(
                pair[0].max_key().unwrap().max_key() < pair[1].min_key().unwrap().as_slice()
            );
        }
    }

    #[test]
    fn test_wrong_magic_is_corruption() {
        let file = Arc::new(MemoryFile::new(vec![0x07, 0, 0, 0, 0, 0]));
        assert!(matches!(
            read_many(file, &KeyOrder::default(), 4),
            Err(Error::Corruption(_))
        ));
    }
}
