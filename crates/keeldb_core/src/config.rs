//! Engine configuration.

use std::time::Duration;

/// Size-aware fragmentation thresholds for file reorganization.
///
/// Each row is `(size ratio against max_file_size, percent subtracted from
/// the base threshold)`. Bigger files get reorganized at lower
/// fragmentation percentages. The values are empirically tuned; they are
/// preserved as documented, not re-derived.
pub const FILE_FRAG_SIZE_RATIO_STEPS: [(f64, u32); 4] =
    [(0.25, 0), (0.50, 10), (0.75, 20), (1.00, 30)];

/// Base fragmentation percentage above which a file qualifies for
/// reorganization.
pub const FILE_FRAG_BASE_PERCENT: u32 = 50;

/// Extra percentage subtracted from the reorganization bar when the system
/// is idle.
pub const FILE_FRAG_IDLE_DISCOUNT: u32 = 10;

/// Floor below which the reorganization bar never drops.
pub const FILE_FRAG_FLOOR_PERCENT: u32 = 10;

/// Configuration for opening a table store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the table directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Cache budget in bytes fed to the resource governor.
    pub cache_budget: u64,

    /// Fraction of the cache budget the free list may occupy before its
    /// bytes are subtracted from consumption.
    pub freelist_budget_fraction: f64,

    /// Budget size above which the normalized budget starts shrinking
    /// geometrically (divided by 1.5 per decade).
    pub budget_diviser: u64,

    /// Over-budget fraction at which pressure becomes `Shallow`.
    pub pressure_shallow: f64,

    /// Over-budget fraction at which pressure becomes `Immense`.
    pub pressure_immense: f64,

    /// Over-budget fraction at which pressure becomes `Extreme`.
    pub pressure_extreme: f64,

    /// Whether pacing keeps retrying while pressure stays `Extreme`.
    pub infinite_pacing: bool,

    /// Retry cap for infinite pacing before giving up with a warning.
    pub pace_retries: u32,

    /// Minimum byte size below which adjacent segments become merge
    /// candidates.
    pub segment_minimum_bytes: u64,

    /// Maximum byte size a segment may reach.
    pub segment_maximum_bytes: u64,

    /// Ceiling on a segment's virtual entry count before a rebuild (and a
    /// split) is forced.
    pub segment_virtual_maximum: u32,

    /// Minimum physical entry count for merge eligibility arithmetic.
    pub segment_physical_minimum: u32,

    /// Maximum back-reference chain hops before a full rebuild is forced.
    pub fragment_maximum: u32,

    /// Minimum number of active summary segments that must survive any
    /// invalidation.
    pub summary_target: u32,

    /// Minimum number of summary anchors that must survive any
    /// invalidation.
    pub summary_anchor: u32,

    /// Multiple of active storage beyond which deferred (awaiting
    /// deletion) storage forces summary invalidation regardless of counts.
    pub deferred_storage_multiple: u64,

    /// Maximum file size, the denominator of the reorganization
    /// size-ratio thresholds and the rollover bound for log files.
    pub max_file_size: u64,

    /// Every `file_ref_check_mod`-th reorganization check runs purely to
    /// audit file-reference-count accounting.
    pub file_ref_check_mod: u64,

    /// Whether key-delta blocks are written compressed.
    pub key_compression: bool,

    /// Whether value payloads are written compressed.
    pub value_compression: bool,

    /// Compression percentage a file must achieve to keep qualifying for
    /// compressed writes.
    pub compression_target_percent: u32,

    /// Whether VRT payloads carry a CRC32 prefix.
    pub validate_values: bool,

    /// Fixed key size in bytes, or `None` for length-prefixed keys.
    pub fixed_key_size: Option<usize>,

    /// Number of key parts for composite keys (cardinality estimates are
    /// written per part when greater than 1).
    pub key_parts: u8,

    /// Whether replay refuses to guess when the last safe transaction
    /// boundary cannot be resolved.
    pub safe_recovery: bool,

    /// Whether the cross-table atomic-commit protocol is active.
    pub atomic_commit: bool,

    /// Process-wide open-file budget.
    pub max_open_files: usize,

    /// Whether to sync the log on every commit boundary.
    pub sync_on_commit: bool,

    /// How often to automatically checkpoint (zero = never).
    pub checkpoint_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            cache_budget: 64 * 1024 * 1024, // 64 MB
            freelist_budget_fraction: 0.25,
            budget_diviser: 1024 * 1024 * 1024, // 1 GB
            pressure_shallow: 0.05,
            pressure_immense: 0.10,
            pressure_extreme: 0.15,
            infinite_pacing: true,
            pace_retries: 100,
            segment_minimum_bytes: 16 * 1024,
            segment_maximum_bytes: 1024 * 1024,
            segment_virtual_maximum: 8192,
            segment_physical_minimum: 16,
            fragment_maximum: 8,
            summary_target: 2,
            summary_anchor: 1,
            deferred_storage_multiple: 3,
            max_file_size: 256 * 1024 * 1024, // 256 MB
            file_ref_check_mod: 64,
            key_compression: false,
            value_compression: false,
            compression_target_percent: 30,
            validate_values: false,
            fixed_key_size: None,
            key_parts: 1,
            safe_recovery: true,
            atomic_commit: false,
            max_open_files: 64,
            sync_on_commit: true,
            checkpoint_interval: Duration::ZERO,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache budget in bytes.
    #[must_use]
    pub const fn cache_budget(mut self, bytes: u64) -> Self {
        self.cache_budget = bytes;
        self
    }

    /// Enables or disables key-delta block compression.
    #[must_use]
    pub const fn key_compression(mut self, value: bool) -> Self {
        self.key_compression = value;
        self
    }

    /// Enables or disables value payload compression.
    #[must_use]
    pub const fn value_compression(mut self, value: bool) -> Self {
        self.value_compression = value;
        self
    }

    /// Enables or disables CRC validation of value payloads.
    #[must_use]
    pub const fn validate_values(mut self, value: bool) -> Self {
        self.validate_values = value;
        self
    }

    /// Sets the safe-recovery flag.
    #[must_use]
    pub const fn safe_recovery(mut self, value: bool) -> Self {
        self.safe_recovery = value;
        self
    }

    /// Enables or disables the cross-table atomic-commit protocol.
    #[must_use]
    pub const fn atomic_commit(mut self, value: bool) -> Self {
        self.atomic_commit = value;
        self
    }

    /// Sets the segment virtual-size ceiling.
    #[must_use]
    pub const fn segment_virtual_maximum(mut self, entries: u32) -> Self {
        self.segment_virtual_maximum = entries;
        self
    }

    /// Sets the maximum back-reference chain length before rebuild.
    #[must_use]
    pub const fn fragment_maximum(mut self, hops: u32) -> Self {
        self.fragment_maximum = hops;
        self
    }

    /// Sets the summary floor counts.
    #[must_use]
    pub const fn summary_floors(mut self, target: u32, anchor: u32) -> Self {
        self.summary_target = target;
        self.summary_anchor = anchor;
        self
    }

    /// Sets the open-file budget.
    #[must_use]
    pub const fn max_open_files(mut self, budget: usize) -> Self {
        self.max_open_files = budget;
        self
    }

    /// Sets whether to sync the log on commit boundaries.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Declares a fixed key width, dropping per-key length prefixes.
    #[must_use]
    pub const fn fixed_key_size(mut self, size: Option<usize>) -> Self {
        self.fixed_key_size = size;
        self
    }

    /// Declares a composite key arity for cardinality tracking.
    #[must_use]
    pub const fn key_parts(mut self, parts: u8) -> Self {
        self.key_parts = parts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.safe_recovery);
        assert!(!config.atomic_commit);
        assert_eq!(config.fragment_maximum, 8);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .cache_budget(1024)
            .atomic_commit(true)
            .safe_recovery(false)
            .summary_floors(4, 2);

        assert_eq!(config.cache_budget, 1024);
        assert!(config.atomic_commit);
        assert!(!config.safe_recovery);
        assert_eq!(config.summary_target, 4);
        assert_eq!(config.summary_anchor, 2);
    }

    #[test]
    fn frag_steps_are_monotonic() {
        let mut last_ratio = 0.0;
        let mut last_discount = 0;
        for (ratio, discount) in FILE_FRAG_SIZE_RATIO_STEPS {
            assert!(ratio > last_ratio);
            assert!(discount >= last_discount);
            last_ratio = ratio;
            last_discount = discount;
        }
    }
}
