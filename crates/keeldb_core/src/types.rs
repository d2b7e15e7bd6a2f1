//! Core type definitions for the KeelDB storage engine.

use std::fmt;

/// Index of an on-disk file within its file kind.
///
/// File indices are 16-bit and **wrap**: after `u16::MAX` the next file is
/// index 0 again. Raw index comparison is therefore meaningless across a
/// wrap; ordering questions go through the file-set registry, which orders
/// by file creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIndex(pub u16);

impl FileIndex {
    /// Creates a new file index.
    #[must_use]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// Returns the raw index value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns the next index, wrapping at `u16::MAX`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Signed wrapping distance from `other` to `self`.
    ///
    /// Only a tie-break, never a true ordering: a distance of `1` may mean
    /// "one file newer" or "65535 files older" depending on wrap history.
    #[must_use]
    pub const fn distance(self, other: Self) -> i32 {
        self.0.wrapping_sub(other.0) as i16 as i32
    }
}

impl fmt::Display for FileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file:{}", self.0)
    }
}

/// A checkpoint snapshot generation counter.
///
/// Viewpoints are minted once per active checkpoint cycle and are totally
/// ordered by assignment time. Zero means "not under checkpoint".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Viewpoint(pub u32);

impl Viewpoint {
    /// The "not under checkpoint" sentinel.
    pub const NONE: Self = Self(0);

    /// Creates a new viewpoint.
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    /// Returns the raw counter value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// True when this is the "not under checkpoint" sentinel.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Viewpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view:{}", self.0)
    }
}

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing and never reused. They only
/// appear on disk when the cross-table atomic-commit protocol is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// The kinds of on-disk files the engine manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// IRT: index real-time files holding serialized key segments.
    Index,
    /// LRT: log real-time files, the write-ahead log of value commits.
    Log,
    /// VRT: value real-time files holding raw value payloads.
    Value,
    /// Summary files holding rebuilt-keyspace snapshot segments.
    Summary,
    /// TRT: the cross-table atomic-commit completion ledger.
    Transaction,
}

impl FileKind {
    /// Returns the file extension used on disk.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Index => "irt",
            Self::Log => "lrt",
            Self::Value => "vrt",
            Self::Summary => "srt",
            Self::Transaction => "trt",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// On-disk protocol generations.
///
/// A file's stamped protocol must match the engine's current protocol for
/// writes; reads support the two most recent generations so databases can
/// be upgraded in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    /// Protocol 1.0. Recognized on disk but no longer readable.
    V1_0,
    /// Protocol 1.1. Recognized on disk but no longer readable.
    V1_1,
    /// Protocol 1.2, the previous generation (compact stream references).
    V1_2,
    /// Protocol 1.3, the current generation (overflow stream references,
    /// key compression, cross-table atomic commit).
    V1_3,
}

impl ProtocolVersion {
    /// The protocol stamped on all newly written files.
    pub const CURRENT: Self = Self::V1_3;

    /// Returns the on-disk protocol code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::V1_0 => 10,
            Self::V1_1 => 12,
            Self::V1_2 => 13,
            Self::V1_3 => 14,
        }
    }

    /// Resolves an on-disk protocol code.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            10 => Some(Self::V1_0),
            12 => Some(Self::V1_1),
            13 => Some(Self::V1_2),
            14 => Some(Self::V1_3),
            _ => None,
        }
    }

    /// True when this generation can still be decoded.
    ///
    /// Only the two most recent generations are readable; 1.0 and 1.1
    /// files are identified but rejected with an explicit error.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        matches!(self, Self::V1_2 | Self::V1_3)
    }

    /// True when this generation carries the cross-table atomic-commit
    /// extension.
    #[must_use]
    pub const fn supports_atomic_commit(self) -> bool {
        matches!(self, Self::V1_3)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::V1_0 => "1.0",
            Self::V1_1 => "1.1",
            Self::V1_2 => "1.2",
            Self::V1_3 => "1.3",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_index_defaults_to_zero() {
        assert_eq!(FileIndex::default(), FileIndex::new(0));
    }

    #[test]
    fn file_index_wraps() {
        let last = FileIndex::new(u16::MAX);
        assert_eq!(last.next(), FileIndex::new(0));
    }

    #[test]
    fn file_index_distance_signed() {
        let a = FileIndex::new(5);
        let b = FileIndex::new(3);
        assert_eq!(a.distance(b), 2);
        assert_eq!(b.distance(a), -2);

        // Across the wrap: index 1 is two files after index u16::MAX.
        let wrapped = FileIndex::new(1);
        let pre_wrap = FileIndex::new(u16::MAX);
        assert_eq!(wrapped.distance(pre_wrap), 2);
    }

    #[test]
    fn viewpoint_none_sentinel() {
        assert!(Viewpoint::NONE.is_none());
        assert!(!Viewpoint::new(1).is_none());
        assert!(Viewpoint::new(1) < Viewpoint::new(2));
    }

    #[test]
    fn protocol_codes_roundtrip() {
        for v in [
            ProtocolVersion::V1_0,
            ProtocolVersion::V1_1,
            ProtocolVersion::V1_2,
            ProtocolVersion::V1_3,
        ] {
            assert_eq!(ProtocolVersion::from_code(v.code()), Some(v));
        }
        assert_eq!(ProtocolVersion::from_code(11), None);
    }

    #[test]
    fn only_recent_protocols_readable() {
        assert!(!ProtocolVersion::V1_0.is_readable());
        assert!(!ProtocolVersion::V1_1.is_readable());
        assert!(ProtocolVersion::V1_2.is_readable());
        assert!(ProtocolVersion::V1_3.is_readable());
        assert!(ProtocolVersion::V1_3.supports_atomic_commit());
        assert!(!ProtocolVersion::V1_2.supports_atomic_commit());
    }
}
