//! In-memory key segments and their paging metadata.

use crate::paging::locality::Locality;
use crate::paging::version::VersionEntry;
use crate::types::FileIndex;
use std::collections::{BTreeMap, BTreeSet};

/// Segment state flags.
///
/// The lower byte is what the paging protocol persists in a segment
/// header; the upper byte holds purely in-memory states. Transient flags
/// (everything except SUMMARY, STREAMED, KEY_COMPRESSED and VIRTUAL) are
/// reset to false when a header is read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentState(pub u16);

impl SegmentState {
    /// Holds entries not yet flushed to an index file.
    pub const DIRTY: u16 = 0x0001;
    /// Contains uncommitted entries; virtual size diverges from physical.
    pub const VIRTUAL: u16 = 0x0002;
    /// Written as part of a checkpoint viewpoint cycle.
    pub const VIEWPOINT: u16 = 0x0004;
    /// A rebuilt-keyspace snapshot segment.
    pub const SUMMARY: u16 = 0x0008;
    /// Entries evicted from memory; refill from disk on next miss.
    pub const PURGED: u16 = 0x0010;
    /// Values streamed into value-log files.
    pub const STREAMED: u16 = 0x0020;
    /// Key-delta blocks written compressed.
    pub const KEY_COMPRESSED: u16 = 0x0040;
    /// Structurally changed (entries moved) since the last write.
    pub const ALTERED: u16 = 0x0080;
    /// Seed key changed by a split since the last write.
    pub const RESEEDED: u16 = 0x0100;
    /// Moved to a different position in the key space.
    pub const RELOCATED: u16 = 0x0200;
    /// Currently pinned by an active reader.
    pub const REFERENCED: u16 = 0x0400;
    /// Mid log-file rollover.
    pub const ROLLING: u16 = 0x0800;

    /// Flags that survive the encode/decode round trip.
    pub const PERSISTENT_MASK: u16 =
        Self::VIRTUAL | Self::SUMMARY | Self::STREAMED | Self::KEY_COMPRESSED;

    /// Tests a flag.
    #[must_use]
    pub const fn has(self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    /// Sets a flag.
    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    /// Clears a flag.
    pub fn clear(&mut self, flag: u16) {
        self.0 &= !flag;
    }

    /// The persisted low byte for a segment header.
    #[must_use]
    pub const fn to_disk_byte(self) -> u8 {
        (self.0 & Self::PERSISTENT_MASK) as u8
    }

    /// Rebuilds state from a header byte, transient flags reset.
    #[must_use]
    pub const fn from_disk_byte(byte: u8) -> Self {
        Self((byte as u16) & Self::PERSISTENT_MASK)
    }
}

/// A value-log file reference carried by a streamed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamRef {
    /// Index of the value file.
    pub file_index: FileIndex,
    /// True when the reference predates the segment's last rebuild.
    pub old: bool,
}

/// An ordered, bounded run of key -> version-chain-head entries plus the
/// paging metadata the eviction policy and codec need.
///
/// Invariants:
/// - `virtual_size >= physical_size` unless the segment is a purged or
///   summary placeholder
/// - `paging_range` bit `i` set implies index file
///   `current_paging_index - i - 1` holds a back-reference
#[derive(Debug, Clone, Default)]
pub struct Segment {
    /// State flags.
    pub state: SegmentState,
    /// Live entries, ordered by key. Empty while purged.
    pub entries: BTreeMap<Vec<u8>, VersionEntry>,
    /// Keys mutated since the last flush; the delta write set.
    pub dirty_keys: BTreeSet<Vec<u8>>,
    /// Entry count estimate including pending/uncommitted entries.
    pub virtual_size: u32,
    /// Committed entries actually on disk.
    pub physical_size: u32,
    /// Log position this segment's data is consistent as of.
    pub log_locality: Locality,
    /// Index file holding the previous delta block for this segment.
    pub paging_index: FileIndex,
    /// Byte offset of the previous delta's header; zero ends the chain.
    pub paging_position: u32,
    /// Which of the last 8 index files hold back-references.
    pub paging_range: u8,
    /// Auxiliary paging references that no longer fit the range byte.
    pub extra_paging_refs: Vec<(u8, FileIndex)>,
    /// Newest value file this segment streams into.
    pub stream_index: FileIndex,
    /// Byte position within the newest stream file.
    pub stream_position: u32,
    /// All value files this segment has streamed into.
    pub stream_refs: BTreeSet<StreamRef>,
    /// Back-reference hops accumulated since the last rebuild (xfrag).
    pub fragment_count: u32,
    /// Per-key-part distinct-value estimates; `-1` per part when unknown.
    pub cardinality: Option<Vec<i32>>,
    /// Recovery epoch, reused as the stream position by summary segments.
    pub recovery_epoch: u32,
    /// Approximate resident bytes, fed to the resource governor.
    pub byte_size: u64,
}

impl Segment {
    /// Creates an empty resident segment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a summary segment placeholder.
    #[must_use]
    pub fn summary(recovery_epoch: u32) -> Self {
        let mut seg = Self::new();
        seg.state.set(SegmentState::SUMMARY);
        seg.recovery_epoch = recovery_epoch;
        seg
    }

    /// First key of the segment, the "seed" repeated in every delta.
    #[must_use]
    pub fn seed_key(&self) -> Option<&[u8]> {
        self.entries.keys().next().map(Vec::as_slice)
    }

    /// Inserts or replaces an entry, marking the segment dirty.
    pub fn insert(&mut self, key: Vec<u8>, entry: VersionEntry) {
        let approx = key.len() as u64 + entry.value_size as u64 + 64;
        if self.entries.insert(key.clone(), entry).is_none() {
            self.virtual_size += 1;
            self.byte_size += approx;
        }
        self.dirty_keys.insert(key);
        self.state.set(SegmentState::DIRTY);
    }

    /// Removes an entry outright (key-space collapse, not tombstoning).
    pub fn remove(&mut self, key: &[u8]) -> Option<VersionEntry> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.virtual_size = self.virtual_size.saturating_sub(1);
            self.dirty_keys.remove(key);
        }
        removed
    }

    /// Number of live entries currently resident.
    #[must_use]
    pub fn live_len(&self) -> usize {
        self.entries.len()
    }

    /// True when every entry is flushed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.state.has(SegmentState::DIRTY)
    }

    /// Records a stream into a value file.
    pub fn add_stream_ref(&mut self, file_index: FileIndex, position: u32) {
        self.stream_refs.insert(StreamRef {
            file_index,
            old: false,
        });
        self.stream_index = file_index;
        self.stream_position = position;
        self.state.set(SegmentState::STREAMED);
    }

    /// True when the stream-reference set still fits the compact
    /// `(range, index)` header encoding: every referenced file within 8
    /// indices behind the newest.
    #[must_use]
    pub fn stream_refs_compact(&self) -> bool {
        self.stream_refs.iter().all(|r| {
            let d = self.stream_index.distance(r.file_index);
            (0..=8).contains(&d)
        })
    }

    /// The compact stream-reference bitmask relative to `stream_index`.
    #[must_use]
    pub fn stream_range_mask(&self) -> u8 {
        let mut mask = 0u8;
        for r in &self.stream_refs {
            let d = self.stream_index.distance(r.file_index);
            if (1..=8).contains(&d) {
                mask |= 1 << (d - 1);
            }
        }
        mask
    }

    /// Records that this segment's latest delta landed in `file` at
    /// `position`, pushing the previous block onto the back chain.
    ///
    /// Bit `i` of `paging_range` always means "file `paging_index - i - 1`
    /// holds a back-reference"; references shifted past bit 7 move to
    /// [`extra_paging_refs`](Self::extra_paging_refs).
    pub fn link_back_reference(&mut self, file: FileIndex, position: u32) {
        let shift = file.distance(self.paging_index);
        if self.paging_position == 0 {
            self.paging_range = 0;
        } else if (1..=8).contains(&shift) {
            self.spill_displaced_refs(shift);
            let kept = if shift == 8 { 0 } else { self.paging_range << shift };
            self.paging_range = kept | (1 << (shift - 1));
        } else {
            // Nine or more index rolls since the last delta: nothing the
            // range byte tracked stays within the window.
            self.spill_displaced_refs(shift);
            self.paging_range = 0;
        }
        self.paging_index = file;
        self.paging_position = position;
    }

    /// Moves range-byte references that a shift of `shift` would push
    /// past bit 7 into `extra_paging_refs`, keyed by their new distance.
    fn spill_displaced_refs(&mut self, shift: i32) {
        let base = self.paging_index;
        if !(1..=8).contains(&shift) {
            let d = u8::try_from(shift).unwrap_or(u8::MAX);
            self.extra_paging_refs.push((d, base));
        }
        let mut bits = self.paging_range;
        let mut behind: u16 = 1;
        while bits != 0 {
            let distance = i64::from(shift) + i64::from(behind);
            if bits & 1 != 0 && !(1..=8).contains(&distance) {
                let d = u8::try_from(distance).unwrap_or(u8::MAX);
                self.extra_paging_refs
                    .push((d, FileIndex::new(base.as_u16().wrapping_sub(behind))));
            }
            bits >>= 1;
            behind += 1;
        }
    }

    /// Resets the back chain after a full rebuild.
    pub fn reset_back_chain(&mut self, file: FileIndex, position: u32) {
        self.paging_index = file;
        self.paging_position = position;
        self.paging_range = 0;
        self.fragment_count = 0;
        self.extra_paging_refs.clear();
        for r in self.stream_refs.clone() {
            if !r.old {
                self.stream_refs.remove(&r);
                self.stream_refs.insert(StreamRef { old: true, ..r });
            }
        }
        self.state.clear(SegmentState::ALTERED);
        self.state.clear(SegmentState::RESEEDED);
        self.state.clear(SegmentState::RELOCATED);
    }

    /// Evicts the resident entries, leaving a purged placeholder.
    ///
    /// Returns the bytes released, for governor accounting.
    pub fn purge(&mut self) -> u64 {
        let released = self.byte_size;
        self.entries.clear();
        self.dirty_keys.clear();
        self.byte_size = 0;
        self.state.set(SegmentState::PURGED);
        released
    }

    /// Splits the segment at its midpoint, returning the upper half.
    ///
    /// Both halves are marked altered; the upper half is reseeded since
    /// its first key changes identity. Returns `None` when the segment
    /// holds fewer than two entries and has no midpoint to split at.
    pub fn split(&mut self) -> Option<Segment> {
        let keys: Vec<Vec<u8>> = self.entries.keys().cloned().collect();
        if keys.len() < 2 {
            return None;
        }
        let mid = keys.len() / 2;
        let split_key = keys[mid].clone();

        let upper_entries = self.entries.split_off(&split_key);
        let upper_dirty: BTreeSet<Vec<u8>> = self
            .dirty_keys
            .iter()
            .filter(|k| **k >= split_key)
            .cloned()
            .collect();
        self.dirty_keys.retain(|k| *k < split_key);

        let moved = upper_entries.len() as u32;
        let upper_bytes = self.byte_size / 2;
        self.byte_size -= upper_bytes;
        self.virtual_size = self.virtual_size.saturating_sub(moved);
        self.state.set(SegmentState::ALTERED);
        self.state.set(SegmentState::DIRTY);

        let mut upper = Segment::new();
        upper.entries = upper_entries;
        upper.dirty_keys = upper_dirty;
        upper.virtual_size = moved;
        upper.byte_size = upper_bytes;
        upper.log_locality = self.log_locality;
        upper.stream_index = self.stream_index;
        upper.stream_refs = self.stream_refs.clone();
        if self.state.has(SegmentState::STREAMED) {
            upper.state.set(SegmentState::STREAMED);
        }
        upper.state.set(SegmentState::ALTERED);
        upper.state.set(SegmentState::RESEEDED);
        upper.state.set(SegmentState::DIRTY);
        Some(upper)
    }

    /// Absorbs an adjacent (higher-keyed) segment after a merge decision.
    pub fn absorb(&mut self, other: Segment) {
        self.entries.extend(other.entries);
        self.dirty_keys.extend(other.dirty_keys);
        self.virtual_size += other.virtual_size;
        self.physical_size += other.physical_size;
        self.byte_size += other.byte_size;
        self.fragment_count = self.fragment_count.max(other.fragment_count);
        self.stream_refs.extend(other.stream_refs);
        self.state.set(SegmentState::ALTERED);
        self.state.set(SegmentState::DIRTY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pos: u32) -> VersionEntry {
        VersionEntry::committed(FileIndex::new(1), pos, 8)
    }

    #[test]
    fn disk_byte_drops_transient_flags() {
        let mut state = SegmentState::default();
        state.set(SegmentState::DIRTY);
        state.set(SegmentState::SUMMARY);
        state.set(SegmentState::REFERENCED);
        state.set(SegmentState::KEY_COMPRESSED);

        let byte = state.to_disk_byte();
        let restored = SegmentState::from_disk_byte(byte);
        assert!(restored.has(SegmentState::SUMMARY));
        assert!(restored.has(SegmentState::KEY_COMPRESSED));
        assert!(!restored.has(SegmentState::DIRTY));
        assert!(!restored.has(SegmentState::REFERENCED));
    }

    #[test]
    fn insert_tracks_virtual_size_and_dirt() {
        let mut seg = Segment::new();
        seg.insert(b"alpha".to_vec(), entry(0));
        seg.insert(b"beta".to_vec(), entry(8));
        // Replacing a key does not grow the count.
        seg.insert(b"alpha".to_vec(), entry(16));

        assert_eq!(seg.virtual_size, 2);
        assert_eq!(seg.dirty_keys.len(), 2);
        assert!(!seg.is_clean());
        assert_eq!(seg.seed_key(), Some(b"alpha".as_slice()));
    }

    #[test]
    fn purge_releases_bytes() {
        let mut seg = Segment::new();
        seg.insert(b"alpha".to_vec(), entry(0));
        let released = seg.purge();
        assert!(released > 0);
        assert!(seg.state.has(SegmentState::PURGED));
        assert_eq!(seg.live_len(), 0);
        // Virtual size survives the purge; it is metadata, not cache.
        assert_eq!(seg.virtual_size, 1);
    }

    #[test]
    fn split_reseeds_upper_half() {
        let mut seg = Segment::new();
        for i in 0..10u8 {
            seg.insert(vec![i], entry(u32::from(i) * 8));
        }

        let upper = seg.split().unwrap();
        assert_eq!(seg.live_len(), 5);
        assert_eq!(upper.live_len(), 5);
        assert!(upper.state.has(SegmentState::RESEEDED));
        assert!(seg.state.has(SegmentState::ALTERED));
        assert_eq!(upper.seed_key(), Some([5u8].as_slice()));
        assert_eq!(seg.virtual_size + upper.virtual_size, 10);
    }

    #[test]
    fn split_refuses_without_a_midpoint() {
        let mut seg = Segment::new();
        assert!(seg.split().is_none());

        seg.insert(b"only".to_vec(), entry(0));
        assert!(seg.split().is_none());
        assert_eq!(seg.live_len(), 1);
    }

    #[test]
    fn absorb_merges_entries() {
        let mut low = Segment::new();
        low.insert(b"a".to_vec(), entry(0));
        let mut high = Segment::new();
        high.insert(b"z".to_vec(), entry(8));

        low.absorb(high);
        assert_eq!(low.live_len(), 2);
        assert!(low.state.has(SegmentState::ALTERED));
    }

    #[test]
    fn back_reference_range_tracks_recent_files() {
        let mut seg = Segment::new();
        seg.reset_back_chain(FileIndex::new(10), 100);
        assert_eq!(seg.paging_range, 0);

        // Next delta lands one file later: bit 0 records file 10.
        seg.link_back_reference(FileIndex::new(11), 200);
        assert_eq!(seg.paging_range, 0b1);
        assert_eq!(seg.paging_index, FileIndex::new(11));
        assert_eq!(seg.paging_position, 200);

        // Two files later: previous bits shift up.
        seg.link_back_reference(FileIndex::new(13), 300);
        assert_eq!(seg.paging_range, 0b110);
    }

    #[test]
    fn back_references_past_the_window_spill_to_extra_refs() {
        let mut seg = Segment::new();
        seg.reset_back_chain(FileIndex::new(10), 100);
        seg.link_back_reference(FileIndex::new(11), 200);
        seg.link_back_reference(FileIndex::new(13), 300);
        assert_eq!(seg.paging_range, 0b110);

        // Twenty index rolls dormant: files 10, 11 and 13 all leave the
        // range byte but stay recorded.
        seg.link_back_reference(FileIndex::new(33), 400);
        assert_eq!(seg.paging_range, 0);
        assert_eq!(seg.paging_index, FileIndex::new(33));
        let spilled: Vec<FileIndex> = seg.extra_paging_refs.iter().map(|(_, f)| *f).collect();
        assert!(spilled.contains(&FileIndex::new(13)));
        assert!(spilled.contains(&FileIndex::new(11)));
        assert!(spilled.contains(&FileIndex::new(10)));

        // A rebuild clears the spilled set with the rest of the chain.
        seg.reset_back_chain(FileIndex::new(34), 100);
        assert!(seg.extra_paging_refs.is_empty());
    }

    #[test]
    fn long_shift_within_window_spills_only_the_expelled_bits() {
        let mut seg = Segment::new();
        seg.reset_back_chain(FileIndex::new(10), 100);
        seg.link_back_reference(FileIndex::new(11), 200);
        // Seven files later: bit 0 (file 10) lands exactly on bit 7.
        seg.link_back_reference(FileIndex::new(18), 300);
        assert_eq!(seg.paging_range, 0b1100_0000);
        assert!(seg.extra_paging_refs.is_empty());

        // One more roll pushes file 10 out of the byte.
        seg.link_back_reference(FileIndex::new(19), 400);
        assert_eq!(seg.paging_range, 0b1000_0001);
        assert_eq!(seg.extra_paging_refs, vec![(9, FileIndex::new(10))]);
    }

    #[test]
    fn stream_refs_compact_within_window() {
        let mut seg = Segment::new();
        seg.add_stream_ref(FileIndex::new(5), 64);
        seg.add_stream_ref(FileIndex::new(9), 64);
        assert!(seg.stream_refs_compact());
        assert_eq!(seg.stream_range_mask(), 0b1000);

        seg.add_stream_ref(FileIndex::new(20), 64);
        // File 5 is now 15 indices behind; the compact form cannot
        // express it.
        assert!(!seg.stream_refs_compact());
    }

    #[test]
    fn rebuild_tags_stream_refs_old() {
        let mut seg = Segment::new();
        seg.add_stream_ref(FileIndex::new(5), 64);
        seg.reset_back_chain(FileIndex::new(2), 32);
        assert!(seg.stream_refs.iter().all(|r| r.old));
    }

    #[test]
    fn summary_placeholder() {
        let seg = Segment::summary(7);
        assert!(seg.state.has(SegmentState::SUMMARY));
        assert_eq!(seg.recovery_epoch, 7);
    }
}
