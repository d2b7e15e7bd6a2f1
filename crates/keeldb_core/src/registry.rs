//! Locality and file-set registry.
//!
//! Tracks the ordered sets of on-disk files per file kind, with O(1)
//! lookup by file index and ordered iteration by creation time. The
//! registry is the authority for every "older than" question: raw file
//! indices wrap, so locality comparison resolves the creation time of the
//! referenced file here first and only falls back to index arithmetic
//! when a file has already been unregistered.

use crate::paging::locality::Locality;
use crate::types::{FileIndex, FileKind};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Registry entry for one on-disk file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecord {
    /// Index of the file within its kind.
    pub index: FileIndex,
    /// Creation time in microseconds; strictly increasing per kind.
    pub created_at: i64,
    /// Current byte length.
    pub length: u64,
    /// Whether the file closed cleanly with a closure marker.
    pub clean_closed: bool,
}

#[derive(Debug, Default)]
struct FileSet {
    by_index: HashMap<FileIndex, FileRecord>,
    /// Indices in creation order (oldest first).
    order: Vec<FileIndex>,
}

/// Per-kind ordered sets of open files.
///
/// Read-heavy: lookups take the read lock only; the write lock is held
/// for structural changes (register/unregister), never for single-index
/// resolution.
#[derive(Debug, Default)]
pub struct FileSetRegistry {
    sets: RwLock<HashMap<FileKind, FileSet>>,
}

impl FileSetRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly created or reopened file.
    ///
    /// Re-registering an index replaces the record but keeps its position
    /// in creation order.
    pub fn register(&self, kind: FileKind, record: FileRecord) {
        let mut sets = self.sets.write();
        let set = sets.entry(kind).or_default();
        if set.by_index.insert(record.index, record).is_none() {
            set.order.push(record.index);
            // Reopened files arrive in directory order, not creation
            // order; keep the vector sorted by creation time.
            let by_index = &set.by_index;
            set.order
                .sort_by_key(|idx| by_index.get(idx).map_or(i64::MAX, |r| r.created_at));
        }
    }

    /// Removes a file from the set.
    pub fn unregister(&self, kind: FileKind, index: FileIndex) {
        let mut sets = self.sets.write();
        if let Some(set) = sets.get_mut(&kind) {
            set.by_index.remove(&index);
            set.order.retain(|&i| i != index);
        }
    }

    /// Looks up a file record.
    #[must_use]
    pub fn get(&self, kind: FileKind, index: FileIndex) -> Option<FileRecord> {
        self.sets
            .read()
            .get(&kind)
            .and_then(|set| set.by_index.get(&index).copied())
    }

    /// Updates the recorded length of a file.
    pub fn update_length(&self, kind: FileKind, index: FileIndex, length: u64) {
        let mut sets = self.sets.write();
        if let Some(record) = sets
            .get_mut(&kind)
            .and_then(|set| set.by_index.get_mut(&index))
        {
            record.length = length;
        }
    }

    /// Marks whether a file closed cleanly with a closure marker.
    pub fn set_clean_closed(&self, kind: FileKind, index: FileIndex, clean: bool) {
        let mut sets = self.sets.write();
        if let Some(record) = sets
            .get_mut(&kind)
            .and_then(|set| set.by_index.get_mut(&index))
        {
            record.clean_closed = clean;
        }
    }

    /// File indices of a kind in creation order, oldest first.
    #[must_use]
    pub fn in_creation_order(&self, kind: FileKind) -> Vec<FileIndex> {
        self.sets
            .read()
            .get(&kind)
            .map(|set| set.order.clone())
            .unwrap_or_default()
    }

    /// The most recently created file of a kind.
    #[must_use]
    pub fn newest(&self, kind: FileKind) -> Option<FileRecord> {
        let sets = self.sets.read();
        let set = sets.get(&kind)?;
        let idx = set.order.last()?;
        set.by_index.get(idx).copied()
    }

    /// Number of registered files of a kind.
    #[must_use]
    pub fn count(&self, kind: FileKind) -> usize {
        self.sets
            .read()
            .get(&kind)
            .map_or(0, |set| set.by_index.len())
    }

    /// Compares two log-stream localities for checkpoint-position math.
    ///
    /// The primary key is the creation time of the referenced file; when a
    /// file has been unregistered the wrapping index distance stands in as
    /// a tie-break (not a true ordering). The tertiary key is the byte
    /// length; the viewpoint is compared last and only when requested.
    ///
    /// The none sentinel sorts before every real locality.
    #[must_use]
    pub fn compare(
        &self,
        kind: FileKind,
        a: &Locality,
        b: &Locality,
        with_viewpoint: bool,
    ) -> Ordering {
        match (a.is_none(), b.is_none()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        if a.file_index != b.file_index {
            let ta = self.get(kind, a.file_index).map(|r| r.created_at);
            let tb = self.get(kind, b.file_index).map(|r| r.created_at);
            let ord = match (ta, tb) {
                (Some(ta), Some(tb)) => ta.cmp(&tb),
                // One or both files are gone: fall back to wrapping
                // index distance.
                _ => a.file_index.distance(b.file_index).cmp(&0),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }

        let ord = a.length.cmp(&b.length);
        if ord != Ordering::Equal {
            return ord;
        }

        if with_viewpoint {
            a.viewpoint.cmp(&b.viewpoint)
        } else {
            Ordering::Equal
        }
    }

    /// Replay progress as a fraction in `[0, 1]`.
    ///
    /// Sums file lengths from the oldest registered file of the kind up to
    /// `file_length` bytes into the target file, normalized by the total
    /// outstanding bytes. Returns `0.0` when the target file cannot be
    /// located; progress reporting never errors.
    #[must_use]
    pub fn recovery_position(&self, kind: FileKind, target: FileIndex, file_length: u64) -> f64 {
        let sets = self.sets.read();
        let Some(set) = sets.get(&kind) else {
            return 0.0;
        };
        if !set.by_index.contains_key(&target) {
            return 0.0;
        }

        let total: u64 = set.by_index.values().map(|r| r.length).sum();
        if total == 0 {
            return 0.0;
        }

        let mut reached = 0u64;
        for idx in &set.order {
            let Some(record) = set.by_index.get(idx) else {
                continue;
            };
            if *idx == target {
                reached += file_length.min(record.length);
                break;
            }
            reached += record.length;
        }

        (reached as f64 / total as f64).clamp(0.0, 1.0)
    }
}
