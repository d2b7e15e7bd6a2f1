//! File version headers and the legacy wide-integer packings.
//!
//! Every engine file opens with a fixed 32-byte header recording the
//! engine version that created it and the paging protocol its contents
//! follow. Historic formats carried 64-bit quantities as split 32/16/16
//! triplets; the helpers here keep that packing explicit.

use crate::error::{CoreError, CoreResult};
use crate::paging::locality::FILE_HEADER_SIZE;
use crate::types::ProtocolVersion;

/// Engine release that writes the current format.
const ENGINE_MAJOR: i32 = 0;
const ENGINE_MINOR: i32 = 3;
const ENGINE_REVISION: i32 = 0;
const ENGINE_BUILD: i32 = 0;

/// The 32-byte header at the front of every engine file.
///
/// Layout (little-endian):
/// `[major i32][minor i32][revision i32][build i32][protocol i64][schema i64]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileVersionHeader {
    /// Engine major version that created the file.
    pub major: i32,
    /// Engine minor version.
    pub minor: i32,
    /// Engine revision.
    pub revision: i32,
    /// Engine build number.
    pub build: i32,
    /// Paging protocol code, see [`ProtocolVersion`].
    pub protocol: i64,
    /// Application schema cookie, opaque to the engine.
    pub schema: i64,
}

impl FileVersionHeader {
    /// Header for a freshly created file under the current protocol.
    #[must_use]
    pub fn current(schema: i64) -> Self {
        Self {
            major: ENGINE_MAJOR,
            minor: ENGINE_MINOR,
            revision: ENGINE_REVISION,
            build: ENGINE_BUILD,
            protocol: ProtocolVersion::CURRENT.code(),
            schema,
        }
    }

    /// The protocol the file's contents follow.
    ///
    /// Errors with [`CoreError::UnsupportedProtocol`] when the code is
    /// unknown or predates the readable generations.
    pub fn protocol_version(&self) -> CoreResult<ProtocolVersion> {
        let code = self.protocol;
        let version = ProtocolVersion::from_code(code)
            .ok_or(CoreError::UnsupportedProtocol { code })?;
        if !version.is_readable() {
            return Err(CoreError::UnsupportedProtocol { code });
        }
        Ok(version)
    }

    /// Encodes the header into its fixed 32-byte form.
    #[must_use]
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE as usize] {
        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.major.to_le_bytes());
        buf[4..8].copy_from_slice(&self.minor.to_le_bytes());
        buf[8..12].copy_from_slice(&self.revision.to_le_bytes());
        buf[12..16].copy_from_slice(&self.build.to_le_bytes());
        buf[16..24].copy_from_slice(&self.protocol.to_le_bytes());
        buf[24..32].copy_from_slice(&self.schema.to_le_bytes());
        buf
    }

    /// Decodes a header from the front of a file.
    pub fn decode(buf: &[u8]) -> CoreResult<Self> {
        if buf.len() < FILE_HEADER_SIZE as usize {
            return Err(CoreError::corruption(format!(
                "file header truncated: {} of {} bytes",
                buf.len(),
                FILE_HEADER_SIZE
            )));
        }
        let le_i32 = |at: usize| i32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
        let le_i64 = |at: usize| i64::from_le_bytes(buf[at..at + 8].try_into().unwrap());
        Ok(Self {
            major: le_i32(0),
            minor: le_i32(4),
            revision: le_i32(8),
            build: le_i32(12),
            protocol: le_i64(16),
            schema: le_i64(24),
        })
    }
}

/// Splits a u64 into the legacy `(low32, mid16, high16)` triplet used by
/// older fixed-width record slots.
#[must_use]
pub const fn pack_u64_as_legacy_triplet(value: u64) -> (u32, u16, u16) {
    (
        (value & 0xFFFF_FFFF) as u32,
        ((value >> 32) & 0xFFFF) as u16,
        (value >> 48) as u16,
    )
}

/// Rebuilds a u64 from its legacy triplet.
#[must_use]
pub const fn unpack_u64_from_legacy_triplet(low: u32, mid: u16, high: u16) -> u64 {
    (low as u64) | ((mid as u64) << 32) | ((high as u64) << 48)
}

/// Packs an entry count into the 48-bit `(low32, high16)` form carried
/// by closure records. Counts are capped rather than wrapped.
#[must_use]
pub const fn pack_entry_count(count: u64) -> (u32, u16) {
    let capped = if count > 0xFFFF_FFFF_FFFF {
        0xFFFF_FFFF_FFFF
    } else {
        count
    };
    ((capped & 0xFFFF_FFFF) as u32, (capped >> 32) as u16)
}

/// Rebuilds an entry count from its 48-bit halves.
#[must_use]
pub const fn unpack_entry_count(low: u32, high: u16) -> u64 {
    (low as u64) | ((high as u64) << 32)
}
