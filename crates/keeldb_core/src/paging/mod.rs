//! The paging protocol: segments, their on-disk delta encoding, and the
//! localities that tie entries back to log positions.

pub mod codec;
pub mod header;
pub mod locality;
pub mod segment;
pub mod version;

pub use codec::{KeyPagingValidation, SegmentHeader, StreamRefs};
pub use header::FileVersionHeader;
pub use locality::{Locality, FILE_HEADER_SIZE};
pub use segment::{Segment, SegmentState, StreamRef};
pub use version::{OpenGate, TransactionGate, VersionEntry, VersionLevel};
