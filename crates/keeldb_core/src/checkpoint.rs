//! Checkpoint coordination: viewpoint minting, per-index completion
//! tracking, and the global/local sequence handshake.
//!
//! A checkpoint request only raises a flag; the next indexing pass
//! observes it, mints a fresh viewpoint, and tags every segment write of
//! that pass with it. The request path uses its own lock so ordinary
//! writers holding the structural lock cannot starve it. Completion is
//! signalled through a condition variable rather than polling.

use crate::paging::locality::Locality;
use crate::types::Viewpoint;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Where the overlaid checkpoint state machine stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    /// No checkpoint pending or running.
    Inactive,
    /// Requested, waiting for the next indexing pass to pick it up.
    Requested,
    /// An indexing pass is writing under a checkpoint viewpoint.
    InProgress,
    /// Every registered index reported completion.
    Complete,
}

#[derive(Debug)]
struct IndexProgress {
    complete: bool,
    /// Oldest locality the index still has to cover, for diagnostics.
    locality: Locality,
}

#[derive(Debug)]
struct Inner {
    state: CheckpointState,
    /// Viewpoint of the in-progress or last completed cycle.
    viewpoint: Viewpoint,
    /// Primary is id 0, secondaries count up from 1.
    indexes: HashMap<u32, IndexProgress>,
}

/// Coordinates checkpoint cycles for one table.
#[derive(Debug)]
pub struct CheckpointCoordinator {
    inner: Mutex<Inner>,
    complete: Condvar,
    /// Monotonic viewpoint mint, shared with MVCC visibility.
    next_viewpoint: AtomicU32,
    /// Global checkpoint sequence; each request increments it.
    global_sequence: AtomicU64,
}

impl Default for CheckpointCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointCoordinator {
    /// Creates a coordinator with only the primary index registered.
    #[must_use]
    pub fn new() -> Self {
        let mut indexes = HashMap::new();
        indexes.insert(
            0,
            IndexProgress {
                complete: false,
                locality: Locality::NONE,
            },
        );
        Self {
            inner: Mutex::new(Inner {
                state: CheckpointState::Inactive,
                viewpoint: Viewpoint::NONE,
                indexes,
            }),
            complete: Condvar::new(),
            next_viewpoint: AtomicU32::new(1),
            global_sequence: AtomicU64::new(0),
        }
    }

    /// Current state.
    pub fn state(&self) -> CheckpointState {
        self.inner.lock().state
    }

    /// The viewpoint writers must stamp, or `NONE` outside a cycle.
    pub fn active_viewpoint(&self) -> Viewpoint {
        let inner = self.inner.lock();
        if inner.state == CheckpointState::InProgress {
            inner.viewpoint
        } else {
            Viewpoint::NONE
        }
    }

    /// The most recently minted viewpoint, for visibility checks.
    pub fn current_viewpoint(&self) -> Viewpoint {
        Viewpoint::new(self.next_viewpoint.load(Ordering::Acquire).saturating_sub(1))
    }

    /// Mints a fresh viewpoint.
    pub fn mint_viewpoint(&self) -> Viewpoint {
        Viewpoint::new(self.next_viewpoint.fetch_add(1, Ordering::AcqRel))
    }

    /// Registers a secondary index. New indexes join mid-cycle as
    /// incomplete.
    pub fn register_index(&self, id: u32) {
        let mut inner = self.inner.lock();
        inner.indexes.entry(id).or_insert(IndexProgress {
            complete: false,
            locality: Locality::NONE,
        });
    }

    /// Drops a secondary index from completion tracking.
    pub fn unregister_index(&self, id: u32) {
        let mut inner = self.inner.lock();
        if id != 0 {
            inner.indexes.remove(&id);
            self.settle(&mut inner);
        }
    }

    /// Raises the checkpoint flag and returns the new global sequence.
    pub fn request_checkpoint(&self) -> u64 {
        let sequence = self.global_sequence.fetch_add(1, Ordering::AcqRel) + 1;
        let mut inner = self.inner.lock();
        if inner.state == CheckpointState::Inactive || inner.state == CheckpointState::Complete {
            inner.state = CheckpointState::Requested;
        }
        sequence
    }

    /// The sequence a table's local counter must catch up to.
    pub fn global_sequence(&self) -> u64 {
        self.global_sequence.load(Ordering::Acquire)
    }

    /// Whether a table's local sequence has caught up.
    pub fn synced(&self, local_sequence: u64) -> bool {
        local_sequence >= self.global_sequence()
    }

    /// Called by the indexing pass when it observes a pending request.
    ///
    /// Mints the cycle's viewpoint and resets completion tracking.
    /// Returns `None` when no checkpoint is pending.
    pub fn begin_cycle(&self) -> Option<Viewpoint> {
        let mut inner = self.inner.lock();
        if inner.state != CheckpointState::Requested {
            return None;
        }
        let viewpoint = self.mint_viewpoint();
        inner.state = CheckpointState::InProgress;
        inner.viewpoint = viewpoint;
        for progress in inner.indexes.values_mut() {
            progress.complete = false;
        }
        Some(viewpoint)
    }

    /// Records one index's completion, with the locality it covered.
    pub fn report_index_complete(&self, id: u32, covered: Locality) {
        let mut inner = self.inner.lock();
        if let Some(progress) = inner.indexes.get_mut(&id) {
            progress.complete = true;
            progress.locality = covered;
        }
        self.settle(&mut inner);
    }

    /// Updates the oldest locality an index still has to cover.
    pub fn report_index_position(&self, id: u32, pending: Locality) {
        let mut inner = self.inner.lock();
        if let Some(progress) = inner.indexes.get_mut(&id) {
            progress.locality = pending;
        }
    }

    /// True only when the primary and every secondary completed.
    pub fn fully_complete(&self) -> bool {
        self.inner.lock().state == CheckpointState::Complete
    }

    /// Diagnostic: the oldest locality among incomplete indexes, for
    /// operators watching a stuck checkpoint. `None` when complete or
    /// idle.
    pub fn oldest_incomplete(&self) -> Option<Locality> {
        let inner = self.inner.lock();
        if inner.state != CheckpointState::InProgress {
            return None;
        }
        inner
            .indexes
            .values()
            .filter(|p| !p.complete && p.locality.is_some())
            .map(|p| p.locality)
            .min_by_key(|l| (l.timestamp, l.length))
    }

    /// Blocks until the running cycle completes or `timeout` passes.
    ///
    /// Returns whether the cycle completed. Returns immediately when no
    /// cycle is running.
    pub fn wait_complete(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != CheckpointState::InProgress {
            return inner.state == CheckpointState::Complete;
        }
        let deadline = std::time::Instant::now() + timeout;
        while inner.state == CheckpointState::InProgress {
            if self
                .complete
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                return inner.state == CheckpointState::Complete;
            }
        }
        inner.state == CheckpointState::Complete
    }

    fn settle(&self, inner: &mut Inner) {
        if inner.state == CheckpointState::InProgress
            && inner.indexes.values().all(|p| p.complete)
        {
            inner.state = CheckpointState::Complete;
            tracing::debug!(viewpoint = inner.viewpoint.as_u32(), "checkpoint complete");
            self.complete.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileIndex;
    use std::sync::Arc;
    use std::thread;

    fn loc(length: u32, timestamp: i64) -> Locality {
        Locality {
            file_index: FileIndex::new(1),
            length,
            viewpoint: Viewpoint::NONE,
            timestamp,
        }
    }

    #[test]
    fn request_then_cycle_then_complete() {
        let cp = CheckpointCoordinator::new();
        assert_eq!(cp.state(), CheckpointState::Inactive);
        assert!(cp.begin_cycle().is_none());

        let seq = cp.request_checkpoint();
        assert_eq!(seq, 1);
        assert_eq!(cp.state(), CheckpointState::Requested);

        let viewpoint = cp.begin_cycle().unwrap();
        assert!(viewpoint.as_u32() > 0);
        assert_eq!(cp.active_viewpoint(), viewpoint);
        assert!(!cp.fully_complete());

        cp.report_index_complete(0, loc(100, 10));
        assert!(cp.fully_complete());
        assert_eq!(cp.active_viewpoint(), Viewpoint::NONE);
    }

    #[test]
    fn secondary_indexes_gate_completion() {
        let cp = CheckpointCoordinator::new();
        cp.register_index(1);
        cp.register_index(2);
        cp.request_checkpoint();
        cp.begin_cycle().unwrap();

        cp.report_index_complete(0, loc(100, 10));
        cp.report_index_complete(2, loc(100, 10));
        assert!(!cp.fully_complete());

        cp.report_index_complete(1, loc(100, 10));
        assert!(cp.fully_complete());
    }

    #[test]
    fn oldest_incomplete_is_exposed() {
        let cp = CheckpointCoordinator::new();
        cp.register_index(1);
        cp.request_checkpoint();
        cp.begin_cycle().unwrap();

        cp.report_index_position(0, loc(500, 50));
        cp.report_index_position(1, loc(200, 20));
        let oldest = cp.oldest_incomplete().unwrap();
        assert_eq!(oldest.length, 200);

        cp.report_index_complete(1, loc(600, 60));
        let oldest = cp.oldest_incomplete().unwrap();
        assert_eq!(oldest.length, 500);

        cp.report_index_complete(0, loc(700, 70));
        assert!(cp.oldest_incomplete().is_none());
    }

    #[test]
    fn unregistering_last_incomplete_index_settles() {
        let cp = CheckpointCoordinator::new();
        cp.register_index(1);
        cp.request_checkpoint();
        cp.begin_cycle().unwrap();
        cp.report_index_complete(0, loc(100, 10));
        assert!(!cp.fully_complete());

        cp.unregister_index(1);
        assert!(cp.fully_complete());
    }

    #[test]
    fn viewpoints_are_monotonic() {
        let cp = CheckpointCoordinator::new();
        let a = cp.mint_viewpoint();
        let b = cp.mint_viewpoint();
        assert!(b > a);
        assert_eq!(cp.current_viewpoint(), b);
    }

    #[test]
    fn sequence_sync_handshake() {
        let cp = CheckpointCoordinator::new();
        assert!(cp.synced(0));
        cp.request_checkpoint();
        assert!(!cp.synced(0));
        assert!(cp.synced(1));
    }

    #[test]
    fn wait_complete_wakes_on_signal() {
        let cp = Arc::new(CheckpointCoordinator::new());
        cp.request_checkpoint();
        cp.begin_cycle().unwrap();

        let waiter = {
            let cp = Arc::clone(&cp);
            thread::spawn(move || cp.wait_complete(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        cp.report_index_complete(0, loc(100, 10));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn wait_complete_times_out() {
        let cp = CheckpointCoordinator::new();
        cp.request_checkpoint();
        cp.begin_cycle().unwrap();
        assert!(!cp.wait_complete(Duration::from_millis(20)));
    }
}
