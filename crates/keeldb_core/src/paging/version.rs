//! Version-chain entries and the transaction gate.
//!
//! Each logical key maps to a chain of versions. The head of a chain is
//! the entry reachable from the live index; older committed versions and
//! rolled-back siblings hang off `next`. At most one entry per key is
//! "rooted" - committed and not deleting - at any instant.

use crate::types::{FileIndex, TransactionId, Viewpoint};

/// Commit level of a version entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionLevel {
    /// Written by a still-open transaction.
    Active,
    /// Committed and durable.
    Commit,
    /// Rolled back; kept only until no viewpoint can observe it.
    Rolled,
}

/// A single version of a key ("information" in the storage model).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    /// Commit level.
    pub level: VersionLevel,
    /// Value file holding the payload.
    pub value_file: FileIndex,
    /// Byte position of the payload within the value file.
    pub value_position: u32,
    /// Payload size in bytes.
    pub value_size: u32,
    /// Offset into the compressed frame when value compression is active.
    pub compressed_offset: Option<u32>,
    /// The entry is a pending delete (tombstone once committed).
    pub deleting: bool,
    /// The entry supersedes an older version of the same key.
    pub updating: bool,
    /// Which indexes (bit 0 = primary) have absorbed this entry.
    pub indexed: u32,
    /// Readers that started before this viewpoint may still observe the
    /// entry even after it is logically superseded.
    pub view_limit: Viewpoint,
    /// Transaction that wrote the entry, when the atomic-commit protocol
    /// records one.
    pub transaction: Option<TransactionId>,
    /// Older committed versions or rolled-back siblings.
    pub next: Option<Box<VersionEntry>>,
}

impl VersionEntry {
    /// Creates a committed entry pointing at a value payload.
    #[must_use]
    pub fn committed(value_file: FileIndex, value_position: u32, value_size: u32) -> Self {
        Self {
            level: VersionLevel::Commit,
            value_file,
            value_position,
            value_size,
            compressed_offset: None,
            deleting: false,
            updating: false,
            indexed: 1,
            view_limit: Viewpoint::NONE,
            transaction: None,
            next: None,
        }
    }

    /// Creates a committed tombstone.
    #[must_use]
    pub fn tombstone(value_file: FileIndex, value_position: u32) -> Self {
        Self {
            deleting: true,
            ..Self::committed(value_file, value_position, 0)
        }
    }

    /// True when this entry is reachable from the live index: committed
    /// and not a pending delete.
    #[must_use]
    pub fn is_rooted(&self) -> bool {
        self.level == VersionLevel::Commit && !self.deleting
    }

    /// Pushes this entry on top of an older version, chaining the MVCC
    /// storyline.
    #[must_use]
    pub fn superseding(mut self, older: VersionEntry) -> Self {
        self.updating = true;
        self.next = Some(Box::new(older));
        self
    }

    /// Number of versions in this chain, the head included.
    #[must_use]
    pub fn chain_len(&self) -> usize {
        let mut len = 1;
        let mut cursor = self.next.as_deref();
        while let Some(entry) = cursor {
            len += 1;
            cursor = entry.next.as_deref();
        }
        len
    }

    /// Drops chain tails no reader can observe anymore.
    ///
    /// An older version is unlinked once no transaction's viewpoint can
    /// still see it (per the gate) and it is not itself the head.
    pub fn prune(&mut self, gate: &dyn TransactionGate) {
        let mut cursor = self;
        loop {
            let drop_next = match cursor.next.as_deref() {
                Some(older) => {
                    !(older.view_limit.is_none() || gate.viewing(older.view_limit))
                }
                None => false,
            };
            if drop_next {
                let tail = cursor.next.take().and_then(|older| older.next);
                cursor.next = tail;
                continue;
            }
            match cursor.next.as_deref_mut() {
                Some(older) => cursor = older,
                None => break,
            }
        }
    }
}

/// Capabilities the paging core consumes from the transaction manager.
///
/// The transaction manager itself (lock tables, timeouts, deadlock
/// handling) is an external collaborator; the paging protocol only needs
/// these yes/no answers about individual storylines.
pub trait TransactionGate: Send + Sync {
    /// May `id` take a lock on the storyline of `key`?
    fn lockable(&self, key: &[u8], id: TransactionId, share: bool) -> bool;

    /// May this entry be physically deleted?
    fn deletable(&self, entry: &VersionEntry) -> bool;

    /// Is any reader still observing the given view limit?
    fn viewing(&self, view_limit: Viewpoint) -> bool;

    /// The currently active checkpoint viewpoint.
    fn current_viewpoint(&self) -> Viewpoint;

    /// The viewpoint the next checkpoint cycle will be assigned.
    fn next_viewpoint(&self) -> Viewpoint;
}

/// A gate that always says yes; every entry is committed, lockable and
/// unobserved. Used in tests and single-writer embeddings with no
/// concurrent readers.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenGate;

impl TransactionGate for OpenGate {
    fn lockable(&self, _key: &[u8], _id: TransactionId, _share: bool) -> bool {
        true
    }

    fn deletable(&self, _entry: &VersionEntry) -> bool {
        true
    }

    fn viewing(&self, _view_limit: Viewpoint) -> bool {
        false
    }

    fn current_viewpoint(&self) -> Viewpoint {
        Viewpoint::NONE
    }

    fn next_viewpoint(&self) -> Viewpoint {
        Viewpoint::new(1)
    }
}
