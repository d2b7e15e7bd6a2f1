//! Log-stream position identifiers.

use crate::types::{FileIndex, Viewpoint};
use std::fmt;

/// Size of the version header at the start of every paged file, in bytes.
///
/// Any locality with a non-zero length points past this header; see
/// [`Locality::is_none`].
pub const FILE_HEADER_SIZE: u32 = 32;

/// A position in the log stream.
///
/// A locality is an immutable value created whenever a log write boundary
/// is crossed. It is compared transitively for checkpoint-position math -
/// but never by raw `file_index`, which wraps; ordering goes through the
/// file-set registry's creation times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locality {
    /// Index of the log file.
    pub file_index: FileIndex,
    /// Byte length/offset within the file.
    pub length: u32,
    /// Checkpoint viewpoint active when the locality was minted, if any.
    pub viewpoint: Viewpoint,
    /// Wall-clock microseconds when the locality was minted.
    pub timestamp: i64,
}

impl Locality {
    /// The "no position" sentinel (`length == 0`).
    pub const NONE: Self = Self {
        file_index: FileIndex(0),
        length: 0,
        viewpoint: Viewpoint::NONE,
        timestamp: 0,
    };

    /// Creates a locality at a position in a file.
    ///
    /// `length` must be at least [`FILE_HEADER_SIZE`] - positions inside
    /// the version header cannot be addressed.
    #[must_use]
    pub fn new(file_index: FileIndex, length: u32, viewpoint: Viewpoint, timestamp: i64) -> Self {
        debug_assert!(
            length >= FILE_HEADER_SIZE,
            "locality length {length} inside the file header"
        );
        Self {
            file_index,
            length,
            viewpoint,
            timestamp,
        }
    }

    /// True when this is the "no position" sentinel.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        self.length == 0
    }

    /// True when this locality addresses a real position.
    #[must_use]
    pub const fn is_some(&self) -> bool {
        self.length != 0
    }
}

impl Default for Locality {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("locality:none")
        } else {
            write!(f, "locality:{}@{}", self.file_index.as_u16(), self.length)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_sentinel() {
        assert!(Locality::NONE.is_none());
        assert!(!Locality::NONE.is_some());
        assert_eq!(Locality::default(), Locality::NONE);
    }

    #[test]
    fn real_locality() {
        let loc = Locality::new(FileIndex::new(3), 128, Viewpoint::NONE, 1_000);
        assert!(loc.is_some());
        assert_eq!(loc.file_index.as_u16(), 3);
    }

    #[test]
    #[should_panic(expected = "inside the file header")]
    #[cfg(debug_assertions)]
    fn header_positions_rejected() {
        let _ = Locality::new(FileIndex::new(0), 16, Viewpoint::NONE, 0);
    }
}
