//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the file.
    #[error("read beyond end of file: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current file size.
        size: u64,
    },

    /// Attempted an in-place write beyond the end of the file.
    ///
    /// `write_at` may only overwrite existing bytes; growth goes through
    /// `append` so that the size bookkeeping stays exact.
    #[error("write beyond end of file: offset {offset}, len {len}, size {size}")]
    WritePastEnd {
        /// The requested write offset.
        offset: u64,
        /// The requested write length.
        len: usize,
        /// The current file size.
        size: u64,
    },

    /// The underlying file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The file has been closed.
    #[error("file is closed")]
    Closed,
}
