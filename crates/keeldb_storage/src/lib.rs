//! # KeelDB Storage
//!
//! Random-access byte-store abstraction for the KeelDB storage core.
//!
//! This crate provides the lowest-level storage abstraction for KeelDB.
//! Backends are **opaque byte stores** - they do not interpret the data
//! they hold. All file-format knowledge (IRT segment blocks, LRT log
//! records, VRT value payloads) lives in `keeldb_core`.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (read, write, append, flush, truncate)
//! - No knowledge of KeelDB file formats, segments, or log records
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Backends
//!
//! - [`MemoryFile`] - For testing and ephemeral tables
//! - [`OsFile`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use keeldb_storage::{RandomAccessFile, MemoryFile};
//!
//! let mut file = MemoryFile::new();
//! let offset = file.append(b"hello world").unwrap();
//! let data = file.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod raf;

pub use error::{StorageError, StorageResult};
pub use file::OsFile;
pub use memory::MemoryFile;
pub use raf::RandomAccessFile;
