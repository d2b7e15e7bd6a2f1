//! Random-access file trait definition.

use crate::error::StorageResult;

/// A low-level random-access file for KeelDB.
///
/// Backends are **opaque byte stores**. They provide simple operations for
/// reading, overwriting, appending, and flushing bytes. KeelDB owns all
/// file-format interpretation - backends do not understand segment blocks,
/// log records, or closure markers.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - `write_at` only overwrites existing bytes, never extends the file
/// - `flush` ensures all writes are durable
/// - Implementations must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemoryFile`] - For testing
/// - [`super::OsFile`] - For persistent storage
pub trait RandomAccessFile: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read would extend beyond the current size,
    /// or if an I/O error occurs.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Overwrites existing bytes starting at `offset`.
    ///
    /// The closure marker and summary-epoch stamps in IRT files are written
    /// in place over previously appended bytes, which is the only reason
    /// this exists; ordinary data flows through `append`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write would extend beyond the current size,
    /// or if an I/O error occurs.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Appends data to the end of the file.
    ///
    /// Returns the offset where the data was written.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Flushes all pending writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Returns the current size of the file in bytes.
    ///
    /// This is the offset where the next `append` will write.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Syncs data and metadata to durable storage.
    ///
    /// A stronger guarantee than `flush`: file metadata (size, timestamps)
    /// is also durable afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Truncates the file to the given size.
    ///
    /// Used when a torn write is detected at the tail of an IRT or LRT
    /// file: everything after the last validated block is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncation fails or `new_size` exceeds the
    /// current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
