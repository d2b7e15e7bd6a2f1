//! On-disk encoding of segment delta blocks, closure markers, and the
//! validation scan that decides whether an index file can be trusted.
//!
//! A block is `[header][ref entries][entry block][post_location u32]`.
//! Header and footer both record the block's own file offset, so a
//! mismatched bracket pinpoints a torn write without checksumming the
//! whole block. Entry blocks may be LZ4-compressed as a unit, prefixed
//! with their compressed length so scans can seek past them.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::paging::header::{pack_entry_count, unpack_entry_count, FileVersionHeader};
use crate::paging::locality::FILE_HEADER_SIZE;
use crate::paging::segment::{Segment, SegmentState};
use crate::paging::version::{VersionEntry, VersionLevel};
use crate::types::{FileIndex, ProtocolVersion};
use keeldb_storage::RandomAccessFile;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use std::collections::BTreeMap;

/// Entry carries a value pointer.
pub const FLAG_CONTENT: u8 = 0x01;
/// Entry is a tombstone.
pub const FLAG_DELETED: u8 = 0x02;
/// Record is a file-closure marker, not an entry.
pub const FLAG_CLOSURE: u8 = 0x04;
/// Record is a back-reference to an older index file.
pub const FLAG_REF_IRT: u8 = 0x08;
/// Record is a reference to a streamed value file.
pub const FLAG_REF_VRT: u8 = 0x10;
/// The value payload sits inside a compressed frame.
pub const FLAG_COMPRESSED_VALUE: u8 = 0x80;

/// Closure marker size: bracket + flags + 48-bit count + epoch +
/// invalidation byte + bracket.
pub const CLOSURE_SIZE: u64 = 20;

/// Hard cap on back-reference hops before a chain walk gives up.
pub const MAX_CHAIN_HOPS: usize = 64;

/// Bounded little-endian reader over a block buffer.
struct Reader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn take(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .at
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                CoreError::corruption(format!(
                    "segment block truncated at byte {} (wanted {n} more)",
                    self.at
                ))
            })?;
        let slice = &self.buf[self.at..end];
        self.at = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> CoreResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> CoreResult<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn consumed(&self) -> usize {
        self.at
    }
}

/// How a segment's value-file references are carried in its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRefs {
    /// Every referenced value file lies within 8 indices of the newest;
    /// a bitmask covers them all.
    Compact {
        /// Bit `i` set means file `newest - i - 1` is referenced.
        range: u8,
        /// Newest referenced value file.
        newest: FileIndex,
    },
    /// References spill past the window; `ref_count` explicit reference
    /// records follow the header.
    Overflow {
        /// Number of reference records preceding the entries.
        ref_count: u8,
        /// Newest referenced value file.
        newest: FileIndex,
    },
}

impl StreamRefs {
    /// Newest value file either form points at.
    #[must_use]
    pub const fn newest(&self) -> FileIndex {
        match self {
            Self::Compact { newest, .. } | Self::Overflow { newest, .. } => *newest,
        }
    }

    const fn ref_count(&self) -> usize {
        match self {
            Self::Compact { .. } => 0,
            Self::Overflow { ref_count, .. } => *ref_count as usize,
        }
    }
}

/// An explicit reference record emitted by the overflow stream form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefRecord {
    /// True for an index-file back reference, false for a value file.
    pub to_index_file: bool,
    /// Referenced file.
    pub file_index: FileIndex,
    /// Byte position inside the referenced file; zero when whole-file.
    pub position: u32,
}

/// The decoded header of one segment delta block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Persistent state byte, see [`SegmentState`].
    pub state: u8,
    /// Log file this block's entries are consistent as of.
    pub log_index: FileIndex,
    /// Log length at write time.
    pub log_length: u32,
    /// Entry count estimate for the whole segment.
    pub virtual_size: u32,
    /// Per-key-part distinct-value estimates; present when the table
    /// declares more than one key part.
    pub cardinality: Option<Vec<i32>>,
    /// Value-file references.
    pub stream: StreamRefs,
    /// Which of the 8 preceding index files hold older deltas.
    pub paging_range: u8,
    /// Previous delta block's file.
    pub paging_index: FileIndex,
    /// Previous delta block's offset; zero ends the chain.
    pub paging_position: u32,
    /// Entries in this block, reference records excluded.
    pub physical_count: u16,
    /// Entry block is LZ4-compressed.
    pub key_compressed: bool,
    /// Stream write position; summary blocks reuse it as their epoch.
    pub stream_position: u32,
    /// Bracket: the block's own file offset.
    pub pre_location: u32,
}

impl SegmentHeader {
    fn encode_into(
        &self,
        out: &mut Vec<u8>,
        config: &Config,
        protocol: ProtocolVersion,
    ) -> CoreResult<()> {
        out.push(self.state);
        out.extend_from_slice(&self.log_index.as_u16().to_le_bytes());
        out.extend_from_slice(&self.log_length.to_le_bytes());
        out.extend_from_slice(&self.virtual_size.to_le_bytes());

        if config.key_parts > 1 {
            let parts = usize::from(config.key_parts);
            match &self.cardinality {
                Some(values) if values.len() == parts => {
                    for v in values {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }
                Some(_) => {
                    return Err(CoreError::invalid_format(
                        "cardinality arity does not match key parts",
                    ))
                }
                None => {
                    for _ in 0..parts {
                        out.extend_from_slice(&(-1i32).to_le_bytes());
                    }
                }
            }
        }

        match (protocol, self.stream) {
            (ProtocolVersion::V1_2, StreamRefs::Compact { range, newest }) => {
                out.push(range);
                out.extend_from_slice(&newest.as_u16().to_le_bytes());
            }
            (ProtocolVersion::V1_2, StreamRefs::Overflow { .. }) => {
                return Err(CoreError::invalid_format(
                    "overflow stream references need the current protocol",
                ))
            }
            (_, StreamRefs::Compact { range, newest }) => {
                out.push(0);
                out.push(range);
                out.extend_from_slice(&newest.as_u16().to_le_bytes());
            }
            (_, StreamRefs::Overflow { ref_count, newest }) => {
                out.push(1);
                out.push(ref_count);
                out.extend_from_slice(&newest.as_u16().to_le_bytes());
            }
        }

        out.push(self.paging_range);
        out.extend_from_slice(&self.paging_index.as_u16().to_le_bytes());
        out.extend_from_slice(&self.paging_position.to_le_bytes());
        out.extend_from_slice(&self.physical_count.to_le_bytes());

        if protocol.code() >= ProtocolVersion::V1_3.code() {
            out.push(u8::from(self.key_compressed));
            out.extend_from_slice(&self.stream_position.to_le_bytes());
        }

        out.extend_from_slice(&self.pre_location.to_le_bytes());
        Ok(())
    }

    fn decode(
        reader: &mut Reader<'_>,
        config: &Config,
        protocol: ProtocolVersion,
    ) -> CoreResult<Self> {
        let state = reader.u8()?;
        let log_index = FileIndex::new(reader.u16()?);
        let log_length = reader.u32()?;
        let virtual_size = reader.u32()?;

        let cardinality = if config.key_parts > 1 {
            let mut values = Vec::with_capacity(usize::from(config.key_parts));
            for _ in 0..config.key_parts {
                values.push(reader.i32()?);
            }
            Some(values)
        } else {
            None
        };

        let stream = if protocol == ProtocolVersion::V1_2 {
            let range = reader.u8()?;
            let newest = FileIndex::new(reader.u16()?);
            StreamRefs::Compact { range, newest }
        } else {
            match reader.u8()? {
                0 => {
                    let range = reader.u8()?;
                    let newest = FileIndex::new(reader.u16()?);
                    StreamRefs::Compact { range, newest }
                }
                1 => {
                    let ref_count = reader.u8()?;
                    let newest = FileIndex::new(reader.u16()?);
                    StreamRefs::Overflow { ref_count, newest }
                }
                other => {
                    return Err(CoreError::corruption(format!(
                        "unknown stream reference form {other}"
                    )))
                }
            }
        };

        let paging_range = reader.u8()?;
        let paging_index = FileIndex::new(reader.u16()?);
        let paging_position = reader.u32()?;
        let physical_count = reader.u16()?;

        let (key_compressed, stream_position) =
            if protocol.code() >= ProtocolVersion::V1_3.code() {
                (reader.u8()? != 0, reader.u32()?)
            } else {
                (false, 0)
            };

        let pre_location = reader.u32()?;

        Ok(Self {
            state,
            log_index,
            log_length,
            virtual_size,
            cardinality,
            stream,
            paging_range,
            paging_index,
            paging_position,
            physical_count,
            key_compressed,
            stream_position,
            pre_location,
        })
    }
}

/// Picks between rewriting the whole segment and appending a delta.
///
/// A rebuild is forced when the back chain is exhausted or absent, or
/// when the segment changed shape since the last write.
#[must_use]
pub fn should_rebuild(seg: &Segment, config: &Config) -> bool {
    seg.paging_position == 0
        || seg.fragment_count >= config.fragment_maximum
        || seg.state.has(SegmentState::ALTERED)
        || seg.state.has(SegmentState::RESEEDED)
        || seg.state.has(SegmentState::RELOCATED)
}

fn encode_entry(out: &mut Vec<u8>, key: &[u8], entry: &VersionEntry, config: &Config) {
    let mut flags = if entry.deleting {
        FLAG_DELETED
    } else {
        FLAG_CONTENT
    };
    if entry.compressed_offset.is_some() {
        flags |= FLAG_COMPRESSED_VALUE;
    }
    out.push(flags);
    out.extend_from_slice(&entry.value_file.as_u16().to_le_bytes());
    out.extend_from_slice(&entry.value_position.to_le_bytes());
    out.extend_from_slice(&entry.value_size.to_le_bytes());
    if let Some(offset) = entry.compressed_offset {
        out.extend_from_slice(&offset.to_le_bytes());
    }
    match config.fixed_key_size {
        Some(size) => {
            debug_assert_eq!(key.len(), size);
            out.extend_from_slice(key);
        }
        None => {
            out.extend_from_slice(&(key.len() as u16).to_le_bytes());
            out.extend_from_slice(key);
        }
    }
}

fn decode_entry(
    reader: &mut Reader<'_>,
    config: &Config,
) -> CoreResult<(Vec<u8>, VersionEntry)> {
    let flags = reader.u8()?;
    if flags & (FLAG_CONTENT | FLAG_DELETED) == 0 {
        return Err(CoreError::corruption(format!(
            "entry flags {flags:#04x} carry neither content nor deletion"
        )));
    }
    let value_file = FileIndex::new(reader.u16()?);
    let value_position = reader.u32()?;
    let value_size = reader.u32()?;
    let compressed_offset = if flags & FLAG_COMPRESSED_VALUE != 0 {
        Some(reader.u32()?)
    } else {
        None
    };
    let key = match config.fixed_key_size {
        Some(size) => reader.take(size)?.to_vec(),
        None => {
            let len = reader.u16()? as usize;
            reader.take(len)?.to_vec()
        }
    };
    let mut entry = VersionEntry::committed(value_file, value_position, value_size);
    entry.deleting = flags & FLAG_DELETED != 0;
    entry.compressed_offset = compressed_offset;
    Ok((key, entry))
}

fn encode_ref(out: &mut Vec<u8>, record: &RefRecord) {
    out.push(if record.to_index_file {
        FLAG_REF_IRT
    } else {
        FLAG_REF_VRT
    });
    out.extend_from_slice(&record.file_index.as_u16().to_le_bytes());
    out.extend_from_slice(&record.position.to_le_bytes());
}

fn decode_ref(reader: &mut Reader<'_>) -> CoreResult<RefRecord> {
    let flags = reader.u8()?;
    let to_index_file = match flags {
        FLAG_REF_IRT => true,
        FLAG_REF_VRT => false,
        other => {
            return Err(CoreError::corruption(format!(
                "expected a reference record, found flags {other:#04x}"
            )))
        }
    };
    Ok(RefRecord {
        to_index_file,
        file_index: FileIndex::new(reader.u16()?),
        position: reader.u32()?,
    })
}

/// Encodes one block for `seg` destined for `file_offset`.
///
/// A rebuild writes every resident entry; a delta writes the dirty set
/// only. Returns the block bytes and how many entries it carries. The
/// caller is responsible for updating the segment's back chain once the
/// write lands.
pub fn encode_segment(
    seg: &Segment,
    config: &Config,
    file_offset: u32,
    rebuild: bool,
) -> CoreResult<(Vec<u8>, u32)> {
    let keys: Vec<&[u8]> = if rebuild {
        seg.entries.keys().map(Vec::as_slice).collect()
    } else {
        seg.dirty_keys
            .iter()
            .filter(|k| seg.entries.contains_key(*k))
            .map(Vec::as_slice)
            .collect()
    };

    let mut refs: Vec<RefRecord> = Vec::new();
    let stream = if seg.stream_refs.is_empty() || seg.stream_refs_compact() {
        StreamRefs::Compact {
            range: seg.stream_range_mask(),
            newest: seg.stream_index,
        }
    } else {
        for r in &seg.stream_refs {
            refs.push(RefRecord {
                to_index_file: false,
                file_index: r.file_index,
                position: 0,
            });
        }
        StreamRefs::Overflow {
            ref_count: 0, // patched below once index refs are counted
            newest: seg.stream_index,
        }
    };
    for (_, index) in &seg.extra_paging_refs {
        refs.push(RefRecord {
            to_index_file: true,
            file_index: *index,
            position: 0,
        });
    }
    let stream = match stream {
        StreamRefs::Overflow { newest, .. } => {
            let count = u8::try_from(refs.len())
                .map_err(|_| CoreError::invalid_format("too many file references"))?;
            StreamRefs::Overflow {
                ref_count: count,
                newest,
            }
        }
        compact => {
            if !refs.is_empty() {
                // Index overflow alone also needs the explicit form.
                let count = u8::try_from(refs.len())
                    .map_err(|_| CoreError::invalid_format("too many file references"))?;
                StreamRefs::Overflow {
                    ref_count: count,
                    newest: seg.stream_index,
                }
            } else {
                compact
            }
        }
    };

    let key_compressed = config.key_compression && !keys.is_empty();
    let header = SegmentHeader {
        state: seg.state.to_disk_byte(),
        log_index: seg.log_locality.file_index,
        log_length: seg.log_locality.length,
        virtual_size: seg.virtual_size,
        cardinality: seg.cardinality.clone(),
        stream,
        paging_range: if rebuild { 0 } else { seg.paging_range },
        paging_index: seg.paging_index,
        paging_position: if rebuild { 0 } else { seg.paging_position },
        physical_count: u16::try_from(keys.len())
            .map_err(|_| CoreError::invalid_format("segment block exceeds entry capacity"))?,
        key_compressed,
        stream_position: if seg.state.has(SegmentState::SUMMARY) {
            seg.recovery_epoch
        } else {
            seg.stream_position
        },
        pre_location: file_offset,
    };

    let mut out = Vec::with_capacity(64 + keys.len() * 32);
    header.encode_into(&mut out, config, ProtocolVersion::CURRENT)?;
    for record in &refs {
        encode_ref(&mut out, record);
    }

    let mut entry_block = Vec::with_capacity(keys.len() * 32);
    for key in &keys {
        let entry = seg
            .entries
            .get(*key)
            .ok_or_else(|| CoreError::invalid_operation("dirty key vanished during encode"))?;
        encode_entry(&mut entry_block, key, entry, config);
    }
    if key_compressed {
        let frame = compress_prepend_size(&entry_block);
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&frame);
    } else {
        out.extend_from_slice(&entry_block);
    }

    out.extend_from_slice(&file_offset.to_le_bytes());
    Ok((out, keys.len() as u32))
}

/// One decoded block.
#[derive(Debug)]
pub struct DecodedBlock {
    /// The block header.
    pub header: SegmentHeader,
    /// Explicit file references, empty for the compact form.
    pub refs: Vec<RefRecord>,
    /// Entries in write order.
    pub entries: Vec<(Vec<u8>, VersionEntry)>,
    /// Bytes the block occupied.
    pub consumed: u64,
}

/// Decodes the block starting at `offset` within `buf`.
///
/// `buf` must begin at the block itself. The bracket check compares both
/// recorded locations against `offset`.
pub fn decode_segment_block(
    buf: &[u8],
    offset: u32,
    config: &Config,
    protocol: ProtocolVersion,
) -> CoreResult<DecodedBlock> {
    let mut reader = Reader::new(buf);
    let header = SegmentHeader::decode(&mut reader, config, protocol)?;
    if header.pre_location != offset {
        return Err(CoreError::corruption(format!(
            "segment bracket opens at {} but block sits at {offset}",
            header.pre_location
        )));
    }

    let mut refs = Vec::with_capacity(header.stream.ref_count());
    for _ in 0..header.stream.ref_count() {
        refs.push(decode_ref(&mut reader)?);
    }

    let mut entries = Vec::with_capacity(usize::from(header.physical_count));
    if header.key_compressed {
        let frame_len = reader.u32()? as usize;
        let frame = reader.take(frame_len)?;
        let entry_block = decompress_size_prepended(frame).map_err(|e| {
            CoreError::corruption(format!("compressed entry block unreadable: {e}"))
        })?;
        let mut inner = Reader::new(&entry_block);
        for _ in 0..header.physical_count {
            entries.push(decode_entry(&mut inner, config)?);
        }
        if inner.consumed() != entry_block.len() {
            return Err(CoreError::corruption(
                "compressed entry block carries trailing bytes",
            ));
        }
    } else {
        for _ in 0..header.physical_count {
            entries.push(decode_entry(&mut reader, config)?);
        }
    }

    let post_location = reader.u32()?;
    if post_location != offset {
        return Err(CoreError::corruption(format!(
            "segment bracket closes at {post_location} but block sits at {offset}"
        )));
    }

    Ok(DecodedBlock {
        header,
        refs,
        entries,
        consumed: reader.consumed() as u64,
    })
}

/// Folds a block into an accumulating map, newest block first.
///
/// The first occurrence of a key wins; older blocks never override it.
/// Tombstones are kept during the walk so they shadow older versions,
/// then dropped by [`collapse_tombstones`].
pub fn apply_block(acc: &mut BTreeMap<Vec<u8>, VersionEntry>, block: DecodedBlock) {
    for (key, entry) in block.entries {
        acc.entry(key).or_insert(entry);
    }
}

/// Removes shadowing tombstones once a chain walk completes.
pub fn collapse_tombstones(acc: &mut BTreeMap<Vec<u8>, VersionEntry>) {
    acc.retain(|_, entry| entry.level != VersionLevel::Rolled && !entry.deleting);
}

/// A decoded closure marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closure {
    /// Total entries the file holds across all its blocks.
    pub entry_count: u64,
    /// Recovery epoch active when the file was closed.
    pub epoch: u32,
    /// The closure has been struck; a scan is required.
    pub invalidated: bool,
}

/// Encodes the 20-byte closure marker for a file closing at `offset`.
#[must_use]
pub fn encode_closure(offset: u32, entry_count: u64, epoch: u32, invalidated: bool) -> [u8; 20] {
    let (low, high) = pack_entry_count(entry_count);
    let mut buf = [0u8; 20];
    buf[0..4].copy_from_slice(&offset.to_le_bytes());
    buf[4] = FLAG_CLOSURE;
    buf[5..9].copy_from_slice(&low.to_le_bytes());
    buf[9..11].copy_from_slice(&high.to_le_bytes());
    buf[11..15].copy_from_slice(&epoch.to_le_bytes());
    buf[15] = u8::from(invalidated);
    buf[16..20].copy_from_slice(&offset.to_le_bytes());
    buf
}

/// Decodes a closure marker expected to sit at `offset`.
///
/// Returns `None` when the bytes are not a well-bracketed closure; the
/// caller falls back to a linear scan.
#[must_use]
pub fn decode_closure(buf: &[u8], offset: u32) -> Option<Closure> {
    if buf.len() != 20 || buf[4] != FLAG_CLOSURE {
        return None;
    }
    let le_u32 = |at: usize| u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
    let pre = le_u32(0);
    let post = le_u32(16);
    if pre != offset || post != offset {
        return None;
    }
    let low = le_u32(5);
    let high = u16::from_le_bytes(buf[9..11].try_into().unwrap());
    Some(Closure {
        entry_count: unpack_entry_count(low, high),
        epoch: le_u32(11),
        invalidated: buf[15] != 0,
    })
}

/// Closes an index file by appending its closure marker.
///
/// `entry_count` is the file's total logical entry count and `epoch` the
/// recovery epoch at close. Readers use the marker to skip the full
/// validation scan on the next open.
pub fn terminate_paging(
    file: &mut dyn RandomAccessFile,
    entry_count: u64,
    epoch: u32,
) -> CoreResult<()> {
    let size = file.size()?;
    let offset = u32::try_from(size)
        .map_err(|_| CoreError::invalid_operation("index file exceeds addressable length"))?;
    file.append(&encode_closure(offset, entry_count, epoch, false))?;
    file.flush()?;
    Ok(())
}

/// Strikes an existing closure marker in place, forcing the next open to
/// run the validation scan. Used when a closed file is reopened for
/// further appends.
pub fn strike_closure(file: &mut dyn RandomAccessFile) -> CoreResult<()> {
    let size = file.size()?;
    if size < u64::from(FILE_HEADER_SIZE) + CLOSURE_SIZE {
        return Ok(());
    }
    let at = size - CLOSURE_SIZE;
    let tail = file.read_at(at, CLOSURE_SIZE as usize)?;
    if decode_closure(&tail, at as u32).is_some() {
        // Byte 15 is the invalidation marker.
        file.write_at(at + 15, &[1])?;
        file.flush()?;
    }
    Ok(())
}

/// Outcome of validating an index file's paging contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPagingValidation {
    /// A valid closure vouches for the whole file.
    Intact {
        /// Entry total recorded at close.
        entry_count: u64,
        /// Recovery epoch recorded at close.
        epoch: u32,
    },
    /// The file is readable up to `valid_until`; anything past that is a
    /// torn tail and must be discarded.
    Ignore {
        /// Last byte of the trailing well-formed block.
        valid_until: u64,
    },
    /// Header only, no blocks yet.
    Empty,
    /// The version header itself is unreadable.
    Error {
        /// What failed.
        message: String,
    },
}

/// Validates an index file: closure fast path first, linear bracket scan
/// as the fallback.
pub fn validate_key_paging(
    file: &dyn RandomAccessFile,
    config: &Config,
) -> CoreResult<KeyPagingValidation> {
    let size = file.size()?;
    if size < u64::from(FILE_HEADER_SIZE) {
        return Ok(KeyPagingValidation::Error {
            message: format!("file holds {size} bytes, too short for a header"),
        });
    }

    let header_bytes = file.read_at(0, FILE_HEADER_SIZE as usize)?;
    let header = match FileVersionHeader::decode(&header_bytes) {
        Ok(h) => h,
        Err(e) => {
            return Ok(KeyPagingValidation::Error {
                message: e.to_string(),
            })
        }
    };
    let protocol = match header.protocol_version() {
        Ok(p) => p,
        Err(e) => {
            return Ok(KeyPagingValidation::Error {
                message: e.to_string(),
            })
        }
    };

    if size == u64::from(FILE_HEADER_SIZE) {
        return Ok(KeyPagingValidation::Empty);
    }

    // Fast path: a well-bracketed, unstruck closure at the tail.
    if size >= u64::from(FILE_HEADER_SIZE) + CLOSURE_SIZE {
        let at = size - CLOSURE_SIZE;
        let tail = file.read_at(at, CLOSURE_SIZE as usize)?;
        if let Some(closure) = decode_closure(&tail, at as u32) {
            if !closure.invalidated {
                return Ok(KeyPagingValidation::Intact {
                    entry_count: closure.entry_count,
                    epoch: closure.epoch,
                });
            }
        }
    }

    // Linear scan: walk blocks front to back, stopping at the first
    // bracket mismatch or truncation.
    let body = file.read_at(
        u64::from(FILE_HEADER_SIZE),
        (size - u64::from(FILE_HEADER_SIZE)) as usize,
    )?;
    let mut at = 0u64;
    let mut entry_total = 0u64;
    loop {
        let remaining = body.len() as u64 - at;
        if remaining == 0 {
            return Ok(KeyPagingValidation::Ignore {
                valid_until: u64::from(FILE_HEADER_SIZE) + at,
            });
        }
        if remaining == CLOSURE_SIZE {
            let offset = u64::from(FILE_HEADER_SIZE) + at;
            if let Some(closure) = decode_closure(&body[at as usize..], offset as u32) {
                if !closure.invalidated {
                    return Ok(KeyPagingValidation::Intact {
                        entry_count: entry_total.max(closure.entry_count),
                        epoch: closure.epoch,
                    });
                }
            }
        }

        let offset = u64::from(FILE_HEADER_SIZE) + at;
        match decode_segment_block(&body[at as usize..], offset as u32, config, protocol) {
            Ok(block) => {
                entry_total += u64::from(block.header.physical_count);
                at += block.consumed;
            }
            Err(_) => {
                return Ok(KeyPagingValidation::Ignore { valid_until: offset });
            }
        }
    }
}

/// Validates an index file and cuts away any torn tail it finds.
///
/// Returns the validation verdict after repair; an `Ignore` verdict
/// means the file was truncated to its last well-formed block and must
/// be queued for reorganization.
pub fn repair_key_paging(
    file: &mut dyn RandomAccessFile,
    config: &Config,
) -> CoreResult<KeyPagingValidation> {
    let outcome = validate_key_paging(file, config)?;
    if let KeyPagingValidation::Ignore { valid_until } = outcome {
        if valid_until < file.size()? {
            file.truncate(valid_until)?;
            file.flush()?;
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::segment::Segment;
    use keeldb_storage::MemoryFile;

    fn seg_with(pairs: &[(&[u8], u32)]) -> Segment {
        let mut seg = Segment::new();
        for (key, pos) in pairs {
            seg.insert(
                key.to_vec(),
                VersionEntry::committed(FileIndex::new(3), *pos, 16),
            );
        }
        seg
    }

    #[test]
    fn block_round_trip() {
        let config = Config::default();
        let seg = seg_with(&[(b"carrot", 0), (b"apple", 16), (b"banana", 32)]);

        let (bytes, count) = encode_segment(&seg, &config, 32, true).unwrap();
        assert_eq!(count, 3);

        let block = decode_segment_block(&bytes, 32, &config, ProtocolVersion::CURRENT).unwrap();
        assert_eq!(block.header.physical_count, 3);
        assert_eq!(block.consumed, bytes.len() as u64);
        // BTreeMap iteration gives key order back.
        assert_eq!(block.entries[0].0, b"apple");
        assert_eq!(block.entries[2].0, b"carrot");
        assert_eq!(block.entries[1].1.value_position, 32);
    }

    #[test]
    fn bracket_mismatch_is_corruption() {
        let config = Config::default();
        let seg = seg_with(&[(b"k", 0)]);
        let (bytes, _) = encode_segment(&seg, &config, 100, true).unwrap();
        let err = decode_segment_block(&bytes, 200, &config, ProtocolVersion::CURRENT);
        assert!(matches!(err, Err(CoreError::Corruption { .. })));
    }

    #[test]
    fn delta_writes_dirty_keys_only() {
        let config = Config::default();
        let mut seg = seg_with(&[(b"a", 0), (b"b", 16)]);
        seg.dirty_keys.clear();
        seg.insert(
            b"b".to_vec(),
            VersionEntry::committed(FileIndex::new(4), 48, 16),
        );
        seg.reset_back_chain(FileIndex::new(1), 32);

        let (bytes, count) = encode_segment(&seg, &config, 64, false).unwrap();
        assert_eq!(count, 1);
        let block = decode_segment_block(&bytes, 64, &config, ProtocolVersion::CURRENT).unwrap();
        assert_eq!(block.entries.len(), 1);
        assert_eq!(block.entries[0].0, b"b");
        assert_eq!(block.header.paging_position, 32);
    }

    #[test]
    fn newest_delta_wins_over_chain() {
        // Scenario: key rewritten in a later delta, then the chain is
        // replayed newest first.
        let config = Config::default();

        let old = seg_with(&[(b"k", 0), (b"other", 16)]);
        let (old_bytes, _) = encode_segment(&old, &config, 32, true).unwrap();

        let mut newer = Segment::new();
        newer.insert(b"k".to_vec(), VersionEntry::committed(FileIndex::new(9), 640, 16));
        newer.reset_back_chain(FileIndex::new(1), 32);
        let (new_bytes, _) = encode_segment(&newer, &config, 500, false).unwrap();

        let mut acc = BTreeMap::new();
        apply_block(
            &mut acc,
            decode_segment_block(&new_bytes, 500, &config, ProtocolVersion::CURRENT).unwrap(),
        );
        apply_block(
            &mut acc,
            decode_segment_block(&old_bytes, 32, &config, ProtocolVersion::CURRENT).unwrap(),
        );
        collapse_tombstones(&mut acc);

        assert_eq!(acc.len(), 2);
        assert_eq!(acc[b"k".as_slice()].value_position, 640);
        assert_eq!(acc[b"other".as_slice()].value_position, 16);
    }

    #[test]
    fn tombstone_shadows_then_collapses() {
        let config = Config::default();
        let old = seg_with(&[(b"gone", 0)]);
        let (old_bytes, _) = encode_segment(&old, &config, 32, true).unwrap();

        let mut newer = Segment::new();
        newer.insert(b"gone".to_vec(), VersionEntry::tombstone(FileIndex::new(3), 0));
        newer.reset_back_chain(FileIndex::new(1), 32);
        let (new_bytes, _) = encode_segment(&newer, &config, 400, false).unwrap();

        let mut acc = BTreeMap::new();
        apply_block(
            &mut acc,
            decode_segment_block(&new_bytes, 400, &config, ProtocolVersion::CURRENT).unwrap(),
        );
        apply_block(
            &mut acc,
            decode_segment_block(&old_bytes, 32, &config, ProtocolVersion::CURRENT).unwrap(),
        );
        assert!(acc[b"gone".as_slice()].deleting);
        collapse_tombstones(&mut acc);
        assert!(acc.is_empty());
    }

    #[test]
    fn compressed_entry_block_round_trip() {
        let config = Config::default().key_compression(true);
        let mut seg = Segment::new();
        for i in 0..64u32 {
            seg.insert(
                format!("key-{i:04}").into_bytes(),
                VersionEntry::committed(FileIndex::new(2), i * 16, 16),
            );
        }
        let (bytes, count) = encode_segment(&seg, &config, 32, true).unwrap();
        assert_eq!(count, 64);

        let block = decode_segment_block(&bytes, 32, &config, ProtocolVersion::CURRENT).unwrap();
        assert!(block.header.key_compressed);
        assert_eq!(block.entries.len(), 64);
        assert_eq!(block.entries[10].0, b"key-0010");
    }

    #[test]
    fn fixed_keys_skip_length_prefixes() {
        let config = Config::default().fixed_key_size(Some(4));
        let seg = seg_with(&[(b"aaaa", 0), (b"bbbb", 16)]);
        let (fixed, _) = encode_segment(&seg, &config, 32, true).unwrap();

        let varlen = Config::default();
        let (prefixed, _) = encode_segment(&seg, &varlen, 32, true).unwrap();
        assert_eq!(prefixed.len(), fixed.len() + 4);

        let block = decode_segment_block(&fixed, 32, &config, ProtocolVersion::CURRENT).unwrap();
        assert_eq!(block.entries[0].0, b"aaaa");
    }

    #[test]
    fn previous_generation_header_decodes() {
        let config = Config::default();
        let header = SegmentHeader {
            state: 0,
            log_index: FileIndex::new(2),
            log_length: 4096,
            virtual_size: 10,
            cardinality: None,
            stream: StreamRefs::Compact {
                range: 0b11,
                newest: FileIndex::new(5),
            },
            paging_range: 0,
            paging_index: FileIndex::new(0),
            paging_position: 0,
            physical_count: 0,
            key_compressed: false,
            stream_position: 0,
            pre_location: 32,
        };
        let mut buf = Vec::new();
        header
            .encode_into(&mut buf, &config, ProtocolVersion::V1_2)
            .unwrap();
        buf.extend_from_slice(&32u32.to_le_bytes());

        let block = decode_segment_block(&buf, 32, &config, ProtocolVersion::V1_2).unwrap();
        assert_eq!(block.header.log_length, 4096);
        assert!(!block.header.key_compressed);
        assert_eq!(
            block.header.stream,
            StreamRefs::Compact {
                range: 0b11,
                newest: FileIndex::new(5)
            }
        );
    }

    #[test]
    fn overflow_stream_refs_emit_records() {
        let config = Config::default();
        let mut seg = seg_with(&[(b"k", 0)]);
        seg.add_stream_ref(FileIndex::new(5), 64);
        seg.add_stream_ref(FileIndex::new(40), 64);

        let (bytes, _) = encode_segment(&seg, &config, 32, true).unwrap();
        let block = decode_segment_block(&bytes, 32, &config, ProtocolVersion::CURRENT).unwrap();
        assert!(matches!(
            block.header.stream,
            StreamRefs::Overflow { ref_count: 2, .. }
        ));
        assert_eq!(block.refs.len(), 2);
        assert!(block.refs.iter().all(|r| !r.to_index_file));
        assert_eq!(block.entries.len(), 1);
    }

    #[test]
    fn closure_round_trip() {
        let bytes = encode_closure(900, 123_456, 7, false);
        let closure = decode_closure(&bytes, 900).unwrap();
        assert_eq!(closure.entry_count, 123_456);
        assert_eq!(closure.epoch, 7);
        assert!(!closure.invalidated);

        // Wrong offset: not this file's closure.
        assert!(decode_closure(&bytes, 901).is_none());
    }

    fn index_file_with(blocks: &[&Segment], close: bool, config: &Config) -> MemoryFile {
        let mut data = FileVersionHeader::current(0).encode().to_vec();
        let mut total = 0u64;
        for seg in blocks {
            let offset = data.len() as u32;
            let (bytes, count) = encode_segment(seg, config, offset, true).unwrap();
            total += u64::from(count);
            data.extend_from_slice(&bytes);
        }
        if close {
            let offset = data.len() as u32;
            data.extend_from_slice(&encode_closure(offset, total, 1, false));
        }
        MemoryFile::with_data(data)
    }

    #[test]
    fn closed_file_validates_via_fast_path() {
        let config = Config::default();
        let seg = seg_with(&[(b"a", 0), (b"b", 16)]);
        let file = index_file_with(&[&seg], true, &config);

        let outcome = validate_key_paging(&file, &config).unwrap();
        assert_eq!(
            outcome,
            KeyPagingValidation::Intact {
                entry_count: 2,
                epoch: 1
            }
        );
    }

    #[test]
    fn torn_tail_yields_truncation_point() {
        // Scenario: the process died mid-append. The trailing partial
        // block must be ignored and everything before it kept.
        let config = Config::default();
        let seg = seg_with(&[(b"a", 0)]);
        let file = index_file_with(&[&seg], false, &config);

        let good_len = file.size().unwrap();
        let mut data = file.data();
        data.extend_from_slice(&[0xAB; 13]); // torn partial block
        let torn = MemoryFile::with_data(data);

        let outcome = validate_key_paging(&torn, &config).unwrap();
        assert_eq!(
            outcome,
            KeyPagingValidation::Ignore {
                valid_until: good_len
            }
        );
    }

    #[test]
    fn unclosed_clean_file_is_ignore_at_end() {
        let config = Config::default();
        let seg = seg_with(&[(b"a", 0)]);
        let file = index_file_with(&[&seg], false, &config);
        let size = file.size().unwrap();

        let outcome = validate_key_paging(&file, &config).unwrap();
        assert_eq!(outcome, KeyPagingValidation::Ignore { valid_until: size });
    }

    #[test]
    fn header_only_file_is_empty() {
        let config = Config::default();
        let file = MemoryFile::with_data(FileVersionHeader::current(0).encode().to_vec());
        assert_eq!(
            validate_key_paging(&file, &config).unwrap(),
            KeyPagingValidation::Empty
        );
    }

    #[test]
    fn short_file_is_error() {
        let config = Config::default();
        let file = MemoryFile::with_data(vec![0u8; 5]);
        assert!(matches!(
            validate_key_paging(&file, &config).unwrap(),
            KeyPagingValidation::Error { .. }
        ));
    }

    #[test]
    fn terminate_then_reopen_skips_the_scan() {
        let config = Config::default();
        let mut data = FileVersionHeader::current(0).encode().to_vec();
        for seed in [b"a", b"m", b"x"] {
            let seg = seg_with(&[(seed.as_slice(), 0)]);
            let offset = data.len() as u32;
            let (bytes, _) = encode_segment(&seg, &config, offset, true).unwrap();
            data.extend_from_slice(&bytes);
        }
        let mut file = MemoryFile::with_data(data);
        terminate_paging(&mut file, 42, 7).unwrap();

        let outcome = validate_key_paging(&file, &config).unwrap();
        assert_eq!(
            outcome,
            KeyPagingValidation::Intact {
                entry_count: 42,
                epoch: 7
            }
        );
    }

    #[test]
    fn repair_truncates_torn_tail() {
        let config = Config::default();
        let mut data = FileVersionHeader::current(0).encode().to_vec();
        for seed in [b"a", b"m"] {
            let seg = seg_with(&[(seed.as_slice(), 0)]);
            let offset = data.len() as u32;
            let (bytes, _) = encode_segment(&seg, &config, offset, true).unwrap();
            data.extend_from_slice(&bytes);
        }
        let good_len = data.len() as u64;
        // Third segment torn off mid footer.
        let seg = seg_with(&[(b"x".as_slice(), 0)]);
        let (bytes, _) = encode_segment(&seg, &config, good_len as u32, true).unwrap();
        data.extend_from_slice(&bytes[..bytes.len() - 2]);
        let mut file = MemoryFile::with_data(data);

        let outcome = repair_key_paging(&mut file, &config).unwrap();
        assert_eq!(
            outcome,
            KeyPagingValidation::Ignore {
                valid_until: good_len
            }
        );
        assert_eq!(file.size().unwrap(), good_len);
        // Both surviving segments still decode.
        let outcome = validate_key_paging(&file, &config).unwrap();
        assert_eq!(
            outcome,
            KeyPagingValidation::Ignore {
                valid_until: good_len
            }
        );
    }

    #[test]
    fn strike_reopens_a_closed_file() {
        let config = Config::default();
        let seg = seg_with(&[(b"a", 0)]);
        let mut data = FileVersionHeader::current(0).encode().to_vec();
        let offset = data.len() as u32;
        let (bytes, _) = encode_segment(&seg, &config, offset, true).unwrap();
        data.extend_from_slice(&bytes);
        let mut file = MemoryFile::with_data(data);
        terminate_paging(&mut file, 1, 1).unwrap();
        assert!(matches!(
            validate_key_paging(&file, &config).unwrap(),
            KeyPagingValidation::Intact { .. }
        ));

        strike_closure(&mut file).unwrap();
        assert!(matches!(
            validate_key_paging(&file, &config).unwrap(),
            KeyPagingValidation::Ignore { .. }
        ));
    }

    #[test]
    fn struck_closure_forces_scan() {
        let config = Config::default();
        let seg = seg_with(&[(b"a", 0), (b"b", 16)]);
        let mut data = FileVersionHeader::current(0).encode().to_vec();
        let offset = data.len() as u32;
        let (bytes, count) = encode_segment(&seg, &config, offset, true).unwrap();
        data.extend_from_slice(&bytes);
        let close_at = data.len() as u32;
        data.extend_from_slice(&encode_closure(close_at, u64::from(count), 1, true));
        let file = MemoryFile::with_data(data);

        // The scan still reads the body, then lands on the struck
        // closure and refuses the fast verdict.
        let outcome = validate_key_paging(&file, &config).unwrap();
        assert_eq!(
            outcome,
            KeyPagingValidation::Ignore {
                valid_until: u64::from(close_at)
            }
        );
    }
}
