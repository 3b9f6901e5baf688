//! Positional file handles backing opened Segments.
//!
//! Reads are positional: there is no shared cursor, and a handle may be read
//! from multiple threads. Segment bytes are immutable once published, so no
//! read ever observes a partial write.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::Error;

/// A read-only handle over Segment bytes.
pub trait FileHandle: Send + Sync {
    /// Reads exactly `len` bytes starting at `offset`.
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Total byte size of the underlying region.
    fn size(&self) -> Result<u64>;
}

/// An on-disk file.
pub struct DiskFile {
    file: Mutex<File>,
    size: u64,
}

impl DiskFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl FileHandle for DiskFile {
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

/// Fully in-memory bytes: freshly written Segments before persist, and tests.
pub struct MemoryFile {
    bytes: Vec<u8>,
}

impl MemoryFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl FileHandle for MemoryFile {
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::IO(format!("offset {offset} out of range")))?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                Error::IO(format!(
                    "read of {len} bytes at {offset} past end of {} byte region",
                    self.bytes.len()
                ))
            })?;
        Ok(self.bytes[start..end].to_vec())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.bytes.len() as u64)
    }
}

/// A bounded window into another handle, used to address a child Segment
/// inside a multi-segment file.
pub struct SlicedFile {
    inner: Arc<dyn FileHandle>,
    offset: u64,
    len: u64,
}

impl SlicedFile {
    pub fn new(inner: Arc<dyn FileHandle>, offset: u64, len: u64) -> Self {
        Self { inner, offset, len }
    }
}

impl FileHandle for SlicedFile {
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.len {
            return Err(Error::IO(format!(
                "read of {len} bytes at {offset} past end of {} byte window",
                self.len
            )));
        }
        self.inner.read(self.offset + offset, len)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.len)
    }
}
