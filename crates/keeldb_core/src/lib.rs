//! # KeelDB Core
//!
//! The KeelDB storage core: a segmented, paged index over append-only log
//! files with multi-version concurrency control, checkpointing, and crash
//! recovery.
//!
//! This crate provides:
//! - The versioned binary paging protocol (IRT segment blocks, LRT log
//!   records, VRT value payloads, the TRT atomic-commit ledger, and XRT
//!   side statistics)
//! - The segment eviction and reorganization policy
//! - The checkpoint and recovery engine
//! - The process-wide resource governor and file-set registry
//!
//! The crate is format-owning: the [`keeldb_storage`] backends underneath
//! are opaque byte stores, and everything written to them is interpreted
//! here.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod eviction;
pub mod governor;
pub mod log;
pub mod paging;
pub mod recovery;
pub mod registry;
pub mod stats;
pub mod table;
pub mod types;

pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use governor::{EngineContext, PressureLevel, ResourceGovernor};
pub use paging::locality::Locality;
pub use table::TableStore;
pub use types::{FileIndex, FileKind, ProtocolVersion, TransactionId, Viewpoint};
