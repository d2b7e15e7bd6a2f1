//! In-memory file backend for testing.

use crate::error::{StorageError, StorageResult};
use crate::raf::RandomAccessFile;
use parking_lot::RwLock;

/// An in-memory file backend.
///
/// Stores all bytes in a `Vec` and is suitable for unit tests, torn-write
/// simulations, and ephemeral tables that never touch disk.
///
/// # Example
///
/// ```rust
/// use keeldb_storage::{RandomAccessFile, MemoryFile};
///
/// let mut file = MemoryFile::new();
/// let offset = file.append(b"test data").unwrap();
/// assert_eq!(offset, 0);
/// assert_eq!(file.size().unwrap(), 9);
/// ```
#[derive(Debug, Default)]
pub struct MemoryFile {
    data: RwLock<Vec<u8>>,
}

impl MemoryFile {
    /// Creates a new empty in-memory file.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an in-memory file with pre-existing contents.
    ///
    /// Useful for crash-recovery tests that start from a fixed byte image.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of the full contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl RandomAccessFile for MemoryFile {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(data[start..end].to_vec())
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> StorageResult<()> {
        let mut data = self.data.write();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(bytes.len());

        if end > data.len() {
            return Err(StorageError::WritePastEnd {
                offset,
                len: bytes.len(),
                size,
            });
        }

        data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.data.write();
        let current = data.len() as u64;

        if new_size > current {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot truncate {current}-byte file to {new_size}"),
            )));
        }

        data.truncate(new_size as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_empty() {
        let file = MemoryFile::new();
        assert_eq!(file.size().unwrap(), 0);
        assert!(file.data().is_empty());
    }

    #[test]
    fn append_returns_offsets() {
        let mut file = MemoryFile::new();
        assert_eq!(file.append(b"hello").unwrap(), 0);
        assert_eq!(file.append(b" world").unwrap(), 5);
        assert_eq!(file.size().unwrap(), 11);
    }

    #[test]
    fn read_at_returns_written_bytes() {
        let mut file = MemoryFile::new();
        file.append(b"hello world").unwrap();
        assert_eq!(file.read_at(0, 5).unwrap(), b"hello");
        assert_eq!(file.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn read_past_end_fails() {
        let mut file = MemoryFile::new();
        file.append(b"hello").unwrap();
        assert!(matches!(
            file.read_at(10, 5),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            file.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn write_at_overwrites_in_place() {
        let mut file = MemoryFile::new();
        file.append(b"hello world").unwrap();
        file.write_at(6, b"earth").unwrap();
        assert_eq!(file.read_at(0, 11).unwrap(), b"hello earth");
        assert_eq!(file.size().unwrap(), 11);
    }

    #[test]
    fn write_at_past_end_fails() {
        let mut file = MemoryFile::new();
        file.append(b"hello").unwrap();
        assert!(matches!(
            file.write_at(3, b"xxxx"),
            Err(StorageError::WritePastEnd { .. })
        ));
    }

    #[test]
    fn truncate_discards_tail() {
        let mut file = MemoryFile::new();
        file.append(b"hello world").unwrap();
        file.truncate(5).unwrap();
        assert_eq!(file.size().unwrap(), 5);
        assert_eq!(file.read_at(0, 5).unwrap(), b"hello");
    }

    #[test]
    fn truncate_cannot_grow() {
        let mut file = MemoryFile::new();
        file.append(b"hello").unwrap();
        assert!(file.truncate(100).is_err());
    }

    #[test]
    fn with_data_preloads() {
        let file = MemoryFile::with_data(b"preloaded".to_vec());
        assert_eq!(file.size().unwrap(), 9);
        assert_eq!(file.read_at(0, 9).unwrap(), b"preloaded");
    }
}
