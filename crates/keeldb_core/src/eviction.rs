//! Segment purge and merge eligibility, file reorganization triggers,
//! and the summary-invalidation safety rules guarding file deletion.
//!
//! None of these decisions error. A segment that cannot be purged right
//! now is simply not eligible, and the reason lands in a counter so
//! operators can see why the cache refuses to shrink.

use crate::config::{
    Config, FILE_FRAG_BASE_PERCENT, FILE_FRAG_FLOOR_PERCENT, FILE_FRAG_IDLE_DISCOUNT,
    FILE_FRAG_SIZE_RATIO_STEPS,
};
use crate::governor::PressureLevel;
use crate::paging::segment::{Segment, SegmentState};
use crate::types::FileIndex;
use std::fmt;

/// Per-pass tally of purge rejections, one counter per rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Global purge flag was off.
    pub purge_flag: u64,
    /// Segment is a summary awaiting indexing.
    pub summary: u64,
    /// Segment was already purged.
    pub purged: u64,
    /// A dynamic reindex is running and pressure is below Immense.
    pub reindexing: u64,
    /// Segment is pinned by checkpoint or rollover state.
    pub index_state: u64,
    /// A key/value fragmentation repair is queued for the segment.
    pub fragmented_key: u64,
    /// Segment was reseeded, altered, or relocated since its last write.
    pub reseeded: u64,
    /// Segment holds unflushed entries.
    pub dirty: u64,
    /// Segment is pinned by an active reader.
    pub referenced: u64,
    /// Segments that passed every gate.
    pub purgeable: u64,
}

impl PurgeReport {
    /// Total rejections across all rules.
    #[must_use]
    pub const fn rejections(&self) -> u64 {
        self.purge_flag
            + self.summary
            + self.purged
            + self.reindexing
            + self.index_state
            + self.fragmented_key
            + self.reseeded
            + self.dirty
            + self.referenced
    }
}

impl fmt::Display for PurgeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "purgeable={} flag={} summary={} purged={} reindex={} index={} frag={} reseed={} dirty={} refs={}",
            self.purgeable,
            self.purge_flag,
            self.summary,
            self.purged,
            self.reindexing,
            self.index_state,
            self.fragmented_key,
            self.reseeded,
            self.dirty,
            self.referenced
        )
    }
}

/// Decides whether `seg` may be evicted from memory right now.
///
/// Every rejection increments the matching [`PurgeReport`] counter.
#[allow(clippy::fn_params_excessive_bools)]
pub fn can_purge(
    seg: &Segment,
    purge_flag: bool,
    level: PressureLevel,
    reindexing: bool,
    fragment_repair_queued: bool,
    report: &mut PurgeReport,
) -> bool {
    if !purge_flag {
        report.purge_flag += 1;
        return false;
    }
    if seg.state.has(SegmentState::SUMMARY) {
        report.summary += 1;
        return false;
    }
    if seg.state.has(SegmentState::PURGED) {
        report.purged += 1;
        return false;
    }
    if reindexing && level < PressureLevel::Immense {
        report.reindexing += 1;
        return false;
    }
    if seg.state.has(SegmentState::VIEWPOINT) || seg.state.has(SegmentState::ROLLING) {
        report.index_state += 1;
        return false;
    }
    if fragment_repair_queued {
        report.fragmented_key += 1;
        return false;
    }
    if seg.state.has(SegmentState::RESEEDED)
        || seg.state.has(SegmentState::ALTERED)
        || seg.state.has(SegmentState::RELOCATED)
    {
        report.reseeded += 1;
        return false;
    }
    if seg.state.has(SegmentState::DIRTY) {
        report.dirty += 1;
        return false;
    }
    if seg.state.has(SegmentState::REFERENCED) {
        report.referenced += 1;
        return false;
    }
    report.purgeable += 1;
    true
}

/// Decides whether two adjacent segments may merge.
///
/// Only small, quiet segments merge: both under the byte-size minimum,
/// neither purged, snapshotted, virtual, structurally realigned,
/// rolling, or pinned, and with identical streamed state.
#[must_use]
pub fn merge_fragmentation(low: &Segment, high: &Segment, config: &Config) -> bool {
    for seg in [low, high] {
        if seg.state.has(SegmentState::PURGED)
            || seg.state.has(SegmentState::VIEWPOINT)
            || seg.state.has(SegmentState::VIRTUAL)
            || seg.state.has(SegmentState::ALTERED)
            || seg.state.has(SegmentState::RESEEDED)
            || seg.state.has(SegmentState::RELOCATED)
            || seg.state.has(SegmentState::ROLLING)
            || seg.state.has(SegmentState::REFERENCED)
        {
            return false;
        }
        if seg.byte_size >= config.segment_minimum_bytes
            || seg.byte_size > config.segment_maximum_bytes
        {
            return false;
        }
        if seg.virtual_size >= config.segment_virtual_maximum
            || seg.physical_size >= config.segment_physical_minimum
        {
            return false;
        }
    }

    let low_streamed = low.state.has(SegmentState::STREAMED);
    if low_streamed != high.state.has(SegmentState::STREAMED) {
        return false;
    }
    if low_streamed
        && (low.stream_index != high.stream_index
            || low.stream_range_mask() != high.stream_range_mask())
    {
        return false;
    }
    true
}

/// Per-file counters feeding the reorganization trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    /// The file.
    pub file_index: FileIndex,
    /// Entries still reachable from the live index.
    pub live_entries: u64,
    /// Superseded or deleted entries.
    pub dead_entries: u64,
    /// File length in bytes.
    pub byte_length: u64,
    /// Global optimize-counter value at the file's last reorganization.
    pub last_optimize_count: u64,
    /// Cleared when a validation scan truncated the file; the next
    /// reorganization pass must pick it up.
    pub reorganize_complete: bool,
    /// Measured compression ratio as a percentage saved.
    pub compression_percent: u32,
    /// File holds payloads that would benefit from compression.
    pub compression_qualified: bool,
}

impl FileStats {
    /// Fraction of dead entries, as an integer percentage.
    #[must_use]
    pub const fn fragmentation_percent(&self) -> u32 {
        let total = self.live_entries + self.dead_entries;
        if total == 0 {
            0
        } else {
            (self.dead_entries * 100 / total) as u32
        }
    }

    /// Marks the file freshly reorganized under `optimize_count`.
    pub fn mark_reorganized(&mut self, optimize_count: u64) {
        self.last_optimize_count = optimize_count;
        self.reorganize_complete = true;
    }

    /// Marks the file repaired by a validation scan, forcing the next
    /// reorganization pass to rebuild it.
    pub fn mark_repaired(&mut self) {
        self.reorganize_complete = true;
        self.last_optimize_count = 0;
    }
}

/// Size-aware fragmentation test: bigger files reorganize at lower
/// fragmentation, and an idle system lowers the bar further.
///
/// The step table is tuned-by-observation and preserved as documented,
/// not re-derived.
#[must_use]
pub fn file_fragmented(stats: &FileStats, config: &Config, idle: bool) -> bool {
    let total = stats.live_entries + stats.dead_entries;
    if total == 0 {
        return false;
    }

    let ratio = if config.max_file_size == 0 {
        0.0
    } else {
        stats.byte_length as f64 / config.max_file_size as f64
    };
    let mut discount = 0;
    for (step, cut) in FILE_FRAG_SIZE_RATIO_STEPS {
        if ratio >= step {
            discount = cut;
        }
    }

    let mut threshold = FILE_FRAG_BASE_PERCENT.saturating_sub(discount);
    if idle {
        threshold = threshold.saturating_sub(FILE_FRAG_IDLE_DISCOUNT);
    }
    let threshold = threshold.max(FILE_FRAG_FLOOR_PERCENT);

    stats.fragmentation_percent() >= threshold
}

/// Decides whether a file should be queued for reorganization.
///
/// `audit_tick` drives the periodic reference-count self-audit: every
/// `file_ref_check_mod` ticks the file reorganizes regardless, purely to
/// re-derive its reference accounting.
#[must_use]
pub fn drive_reorganization(
    stats: &FileStats,
    config: &Config,
    global_optimize_count: u64,
    idle: bool,
    audit_tick: u64,
) -> bool {
    if stats.live_entries == 0 && stats.dead_entries > 0 {
        return true;
    }
    if !stats.reorganize_complete || stats.last_optimize_count < global_optimize_count {
        return true;
    }
    if file_fragmented(stats, config, idle) {
        return true;
    }
    if config.value_compression
        && stats.compression_qualified
        && stats.compression_percent < config.compression_target_percent
    {
        return true;
    }
    if config.file_ref_check_mod > 0 && audit_tick > 0 && audit_tick % config.file_ref_check_mod == 0
    {
        return true;
    }
    false
}

/// What a candidate file deletion would cost the summary population.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryImpact {
    /// Summaries that become unreachable.
    pub active: u32,
    /// Anchor summaries that become unreachable.
    pub anchors: u32,
    /// The most-recent-locality summary is among them.
    pub most_recent: bool,
}

impl SummaryImpact {
    fn combined(a: Self, b: Self) -> Self {
        Self {
            active: a.active + b.active,
            anchors: a.anchors + b.anchors,
            most_recent: a.most_recent || b.most_recent,
        }
    }
}

/// Whether deleting files with the given summary impact is safe.
///
/// The floors hold unless deferred storage has outgrown the configured
/// multiple of active storage, which forces the invalidation through as
/// a storage-pressure escape valve. The most-recent summary is never
/// invalidated.
#[must_use]
pub fn allow_invalidate_summaries(
    active_count: u32,
    anchor_count: u32,
    impact: SummaryImpact,
    deferred_bytes: u64,
    active_bytes: u64,
    config: &Config,
) -> bool {
    if impact.most_recent {
        return false;
    }
    let floors_hold = active_count.saturating_sub(impact.active) >= config.summary_target
        && anchor_count.saturating_sub(impact.anchors) >= config.summary_anchor;
    if floors_hold {
        return true;
    }
    let forced = deferred_bytes > config.deferred_storage_multiple.saturating_mul(active_bytes);
    if forced {
        tracing::warn!(
            deferred_bytes,
            active_bytes,
            multiple = config.deferred_storage_multiple,
            "deferred storage outgrew active storage, forcing summary invalidation"
        );
    }
    forced
}

/// A file awaiting physical deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredFile {
    /// The file.
    pub file_index: FileIndex,
    /// Bytes reclaimed by deleting it.
    pub bytes: u64,
    /// Position in summary order, 0 = newest. Older files weigh more.
    pub summary_age_rank: u32,
    /// Summaries its deletion takes down.
    pub impact: SummaryImpact,
}

impl DeferredFile {
    fn weight(&self) -> u128 {
        u128::from(self.bytes) * (1 + u128::from(self.summary_age_rank))
    }
}

/// Largest deferred set that enumerating subsets stays affordable for.
const CLOBBER_ENUMERATION_LIMIT: usize = 10;

/// Picks the maximum-weight subset of deferred files whose combined
/// deletion still satisfies [`allow_invalidate_summaries`].
///
/// Small sets are solved exactly by enumerating all subsets; this is
/// exponential and acceptable only because deferred sets are kept small.
/// Larger sets fall back to a greedy heaviest-first pass.
#[must_use]
pub fn choose_files_to_clobber(
    deferred: &[DeferredFile],
    active_count: u32,
    anchor_count: u32,
    deferred_bytes: u64,
    active_bytes: u64,
    config: &Config,
) -> Vec<FileIndex> {
    let safe = |impact: SummaryImpact| {
        allow_invalidate_summaries(
            active_count,
            anchor_count,
            impact,
            deferred_bytes,
            active_bytes,
            config,
        )
    };

    if deferred.len() <= CLOBBER_ENUMERATION_LIMIT {
        let mut best: Option<(u128, u32)> = None;
        for mask in 1u32..(1 << deferred.len()) {
            let mut impact = SummaryImpact::default();
            let mut weight = 0u128;
            for (i, file) in deferred.iter().enumerate() {
                if mask & (1 << i) != 0 {
                    impact = SummaryImpact::combined(impact, file.impact);
                    weight += file.weight();
                }
            }
            if safe(impact) && best.map_or(true, |(w, _)| weight > w) {
                best = Some((weight, mask));
            }
        }
        let Some((_, mask)) = best else {
            return Vec::new();
        };
        deferred
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, f)| f.file_index)
            .collect()
    } else {
        let mut order: Vec<&DeferredFile> = deferred.iter().collect();
        order.sort_by(|a, b| b.weight().cmp(&a.weight()));
        let mut taken = Vec::new();
        let mut impact = SummaryImpact::default();
        for file in order {
            let with = SummaryImpact::combined(impact, file.impact);
            if safe(with) {
                impact = with;
                taken.push(file.file_index);
            }
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::version::VersionEntry;
    use proptest::prelude::*;

    fn quiet_segment(bytes: u64) -> Segment {
        let mut seg = Segment::new();
        seg.insert(
            b"k".to_vec(),
            VersionEntry::committed(FileIndex::new(1), 0, 8),
        );
        seg.dirty_keys.clear();
        seg.state.clear(SegmentState::DIRTY);
        seg.byte_size = bytes;
        seg
    }

    #[test]
    fn purge_rules_fill_the_report() {
        let config = Config::default();
        let mut report = PurgeReport::default();

        let clean = quiet_segment(100);
        assert!(can_purge(
            &clean,
            true,
            PressureLevel::Shallow,
            false,
            false,
            &mut report
        ));
        assert_eq!(report.purgeable, 1);

        // Flag off.
        assert!(!can_purge(
            &clean,
            false,
            PressureLevel::Shallow,
            false,
            false,
            &mut report
        ));
        assert_eq!(report.purge_flag, 1);

        // Dirty.
        let mut dirty = quiet_segment(100);
        dirty.state.set(SegmentState::DIRTY);
        assert!(!can_purge(
            &dirty,
            true,
            PressureLevel::Shallow,
            false,
            false,
            &mut report
        ));
        assert_eq!(report.dirty, 1);

        // Referenced.
        let mut pinned = quiet_segment(100);
        pinned.state.set(SegmentState::REFERENCED);
        assert!(!can_purge(
            &pinned,
            true,
            PressureLevel::Shallow,
            false,
            false,
            &mut report
        ));
        assert_eq!(report.referenced, 1);

        assert_eq!(report.rejections(), 3);
    }

    #[test]
    fn reindexing_blocks_purge_below_immense_only() {
        let seg = quiet_segment(100);
        let mut report = PurgeReport::default();
        assert!(!can_purge(
            &seg,
            true,
            PressureLevel::Shallow,
            true,
            false,
            &mut report
        ));
        assert_eq!(report.reindexing, 1);

        assert!(can_purge(
            &seg,
            true,
            PressureLevel::Immense,
            true,
            false,
            &mut report
        ));
    }

    #[test]
    fn small_quiet_neighbors_merge() {
        // Two adjacent segments each at 40% of the byte-size minimum.
        let config = Config::default();
        let bytes = config.segment_minimum_bytes * 2 / 5;
        let low = quiet_segment(bytes);
        let high = quiet_segment(bytes);
        assert!(merge_fragmentation(&low, &high, &config));

        let mut pinned = quiet_segment(bytes);
        pinned.state.set(SegmentState::REFERENCED);
        assert!(!merge_fragmentation(&low, &pinned, &config));
    }

    #[test]
    fn merge_requires_matching_stream_state() {
        let config = Config::default();
        let bytes = config.segment_minimum_bytes / 2;
        let low = quiet_segment(bytes);
        let mut high = quiet_segment(bytes);
        high.add_stream_ref(FileIndex::new(4), 64);
        assert!(!merge_fragmentation(&low, &high, &config));

        let mut low = quiet_segment(bytes);
        low.add_stream_ref(FileIndex::new(4), 64);
        assert!(merge_fragmentation(&low, &high, &config));

        let mut other = quiet_segment(bytes);
        other.add_stream_ref(FileIndex::new(5), 64);
        assert!(!merge_fragmentation(&low, &other, &config));
    }

    #[test]
    fn large_segments_never_merge() {
        let config = Config::default();
        let low = quiet_segment(config.segment_minimum_bytes + 1);
        let high = quiet_segment(100);
        assert!(!merge_fragmentation(&low, &high, &config));
    }

    #[test]
    fn frag_threshold_scales_with_file_size() {
        let config = Config::default();
        let mut stats = FileStats {
            live_entries: 60,
            dead_entries: 40, // 40% fragmented
            byte_length: config.max_file_size / 10,
            reorganize_complete: true,
            ..FileStats::default()
        };
        // Small file: threshold 50, 40% is under it.
        assert!(!file_fragmented(&stats, &config, false));

        // Three-quarters full: threshold 50 - 20 = 30.
        stats.byte_length = config.max_file_size * 3 / 4;
        assert!(file_fragmented(&stats, &config, false));

        // Idle drops the small-file bar to 40.
        stats.byte_length = config.max_file_size / 10;
        assert!(file_fragmented(&stats, &config, true));
    }

    #[test]
    fn frag_threshold_never_drops_below_floor() {
        let config = Config::default();
        let stats = FileStats {
            live_entries: 91,
            dead_entries: 9, // 9%, under the 10% floor
            byte_length: config.max_file_size,
            reorganize_complete: true,
            ..FileStats::default()
        };
        assert!(!file_fragmented(&stats, &config, true));
    }

    #[test]
    fn dead_only_file_reorganizes() {
        let config = Config::default();
        let stats = FileStats {
            live_entries: 0,
            dead_entries: 5,
            reorganize_complete: true,
            last_optimize_count: 3,
            ..FileStats::default()
        };
        assert!(drive_reorganization(&stats, &config, 3, false, 1));
    }

    #[test]
    fn stale_optimize_count_reorganizes() {
        let config = Config::default();
        let mut stats = FileStats {
            live_entries: 100,
            reorganize_complete: true,
            last_optimize_count: 2,
            ..FileStats::default()
        };
        assert!(drive_reorganization(&stats, &config, 3, false, 1));
        stats.mark_reorganized(3);
        assert!(!drive_reorganization(&stats, &config, 3, false, 1));
    }

    #[test]
    fn repaired_file_forces_reorganization() {
        let config = Config::default();
        let mut stats = FileStats {
            live_entries: 100,
            ..FileStats::default()
        };
        stats.mark_reorganized(5);
        assert!(!drive_reorganization(&stats, &config, 5, false, 1));
        stats.mark_repaired();
        assert!(stats.reorganize_complete);
        assert_eq!(stats.last_optimize_count, 0);
        assert!(drive_reorganization(&stats, &config, 5, false, 1));
    }

    #[test]
    fn audit_tick_forces_reorganization() {
        let config = Config::default();
        let mut stats = FileStats {
            live_entries: 100,
            ..FileStats::default()
        };
        stats.mark_reorganized(1);
        let modulo = config.file_ref_check_mod;
        assert!(!drive_reorganization(&stats, &config, 1, false, modulo - 1));
        assert!(drive_reorganization(&stats, &config, 1, false, modulo));
    }

    #[test]
    fn compression_shortfall_reorganizes() {
        let config = Config::default().value_compression(true);
        let mut stats = FileStats {
            live_entries: 100,
            compression_qualified: true,
            compression_percent: config.compression_target_percent - 5,
            ..FileStats::default()
        };
        stats.mark_reorganized(1);
        assert!(drive_reorganization(&stats, &config, 1, false, 1));
        stats.compression_percent = config.compression_target_percent;
        assert!(!drive_reorganization(&stats, &config, 1, false, 1));
    }

    #[test]
    fn most_recent_summary_is_untouchable() {
        let config = Config::default();
        let impact = SummaryImpact {
            active: 0,
            anchors: 0,
            most_recent: true,
        };
        // Even with huge deferred pressure, never.
        assert!(!allow_invalidate_summaries(
            10, 10, impact, u64::MAX, 1, &config
        ));
    }

    #[test]
    fn escape_valve_overrides_floors() {
        let config = Config::default();
        let impact = SummaryImpact {
            active: 5,
            anchors: 5,
            most_recent: false,
        };
        // Floors broken, deferred storage fine: no.
        assert!(!allow_invalidate_summaries(5, 5, impact, 100, 100, &config));
        // Deferred storage past the multiple: forced through.
        let deferred = config.deferred_storage_multiple * 100 + 1;
        assert!(allow_invalidate_summaries(
            5, 5, impact, deferred, 100, &config
        ));
    }

    proptest! {
        #[test]
        fn invalidation_matches_documented_formula(
            active in 0u32..20,
            anchors in 0u32..20,
            impacted_active in 0u32..20,
            impacted_anchors in 0u32..20,
            most_recent in proptest::bool::ANY,
            deferred in 0u64..1_000_000,
            active_bytes in 1u64..100_000,
        ) {
            let config = Config::default();
            let impact = SummaryImpact {
                active: impacted_active,
                anchors: impacted_anchors,
                most_recent,
            };
            let got = allow_invalidate_summaries(
                active, anchors, impact, deferred, active_bytes, &config,
            );

            let floors = active.saturating_sub(impacted_active) >= config.summary_target
                && anchors.saturating_sub(impacted_anchors) >= config.summary_anchor;
            let forced = deferred
                > config.deferred_storage_multiple.saturating_mul(active_bytes);
            let expect = !most_recent && (floors || forced);
            prop_assert_eq!(got, expect);
        }
    }

    fn deferred(index: u16, bytes: u64, rank: u32, active: u32, anchors: u32) -> DeferredFile {
        DeferredFile {
            file_index: FileIndex::new(index),
            bytes,
            summary_age_rank: rank,
            impact: SummaryImpact {
                active,
                anchors,
                most_recent: false,
            },
        }
    }

    #[test]
    fn clobber_picks_heaviest_safe_subset() {
        let config = Config::default().summary_floors(2, 1);
        // 4 active summaries, 2 anchors. Deleting both files would leave
        // 4-3=1 active, under the floor of 2; each alone is safe but the
        // older, larger file weighs more.
        let files = [
            deferred(1, 1000, 3, 2, 1),
            deferred(2, 4000, 0, 1, 0),
        ];
        let chosen = choose_files_to_clobber(&files, 4, 2, 0, 1000, &config);
        assert_eq!(chosen, vec![FileIndex::new(2)]);

        // With enough summaries both go.
        let chosen = choose_files_to_clobber(&files, 10, 10, 0, 1000, &config);
        assert_eq!(chosen.len(), 2);
    }

    #[test]
    fn clobber_age_rank_outweighs_raw_size() {
        let config = Config::default().summary_floors(2, 1);
        // Each impacts 2 active summaries; only one fits the floor.
        let files = [
            deferred(1, 1000, 4, 2, 0), // weight 5000
            deferred(2, 2000, 0, 2, 0), // weight 2000
        ];
        let chosen = choose_files_to_clobber(&files, 4, 2, 0, 1000, &config);
        assert_eq!(chosen, vec![FileIndex::new(1)]);
    }

    #[test]
    fn clobber_empty_when_nothing_is_safe() {
        let config = Config::default().summary_floors(2, 1);
        let files = [deferred(1, 1000, 0, 5, 5)];
        let chosen = choose_files_to_clobber(&files, 2, 1, 0, 1000, &config);
        assert!(chosen.is_empty());
    }

    #[test]
    fn clobber_greedy_path_for_large_sets() {
        let config = Config::default().summary_floors(1, 1);
        let files: Vec<DeferredFile> = (0..12)
            .map(|i| deferred(i, 100 * u64::from(i + 1), u32::from(i), 0, 0))
            .collect();
        // No summary impact at all: everything is safe to take.
        let chosen = choose_files_to_clobber(&files, 5, 5, 0, 1000, &config);
        assert_eq!(chosen.len(), 12);
    }
}
