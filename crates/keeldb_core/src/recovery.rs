//! Startup replay of log files into the in-memory key space.
//!
//! Recovery starts from the newest summary locality when one exists,
//! otherwise from the newest validated index closure, and replays every
//! log file past that point in creation order. Log entries between an
//! opening and closing boundary form one transaction batch; a batch is
//! applied only once its closing entry has been read, and an unterminated
//! tail is discarded with the file truncated back to the last confirmed
//! boundary. Value-file fragmentation counters are recomputed as a side
//! effect so post-recovery reorganization decisions start from accurate
//! inputs.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::eviction::FileStats;
use crate::log::{LogEntry, LogReader, TransactionLedger, LOG_OPENING, LOG_ROLLING};
use crate::paging::locality::{Locality, FILE_HEADER_SIZE};
use crate::paging::version::VersionEntry;
use crate::registry::FileSetRegistry;
use crate::types::{FileIndex, FileKind, Viewpoint};
use keeldb_storage::RandomAccessFile;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Picks where replay begins.
///
/// The newest summary segment's locality wins when present; otherwise the
/// newest validated index closure; otherwise the none sentinel, meaning a
/// full replay from the oldest registered log file.
#[must_use]
pub fn starting_locality(summary: Option<Locality>, closure: Option<Locality>) -> Locality {
    summary
        .filter(Locality::is_some)
        .or(closure)
        .unwrap_or(Locality::NONE)
}

/// A secondary index created after the replay starting point, to be
/// activated at the exact log position where its creation was recorded.
#[derive(Debug, Clone, Copy)]
pub struct IndexActivation {
    /// Index identifier (primary is 0).
    pub index_id: u32,
    /// Log position of the creation record.
    pub recorded_at: Locality,
}

/// One log file handed to replay, oldest first.
pub struct LogSource {
    /// The log file's index.
    pub file_index: FileIndex,
    /// Open handle; truncated in place when a tail is discarded.
    pub file: Box<dyn RandomAccessFile>,
}

/// Result of a completed replay.
#[derive(Debug)]
pub struct RecoveryOutcome {
    /// Reconstructed key space.
    pub keyspace: BTreeMap<Vec<u8>, VersionEntry>,
    /// Recomputed per-value-file fragmentation statistics.
    pub value_stats: BTreeMap<FileIndex, FileStats>,
    /// Entries read past the starting locality.
    pub entries_replayed: u64,
    /// Entries discarded: unterminated tails plus atomic-commit rejects.
    pub entries_discarded: u64,
    /// Transaction batches applied.
    pub batches_committed: u64,
    /// Files truncated back to a confirmed boundary, with the new length.
    pub truncated: Vec<(FileIndex, u64)>,
    /// The last confirmed log position; writes resume here.
    pub end_locality: Locality,
    /// Secondary indexes activated during replay, in activation order.
    pub activated_indexes: Vec<u32>,
}

/// Drives startup replay for one table.
pub struct Recovery<'a> {
    registry: &'a FileSetRegistry,
    config: &'a Config,
    ledger: Option<&'a TransactionLedger>,
    /// f64 bits; readable from other threads while replay runs.
    progress: AtomicU64,
}

impl<'a> Recovery<'a> {
    /// Creates a replay driver. The ledger is required only when the
    /// cross-table atomic-commit feature is enabled.
    #[must_use]
    pub fn new(
        registry: &'a FileSetRegistry,
        config: &'a Config,
        ledger: Option<&'a TransactionLedger>,
    ) -> Self {
        Self {
            registry,
            config,
            ledger,
            progress: AtomicU64::new(0),
        }
    }

    /// Replay progress as a monotonic fraction in `[0, 1]`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(AtomicOrdering::Acquire))
    }

    fn report_progress(&self, file_index: FileIndex, offset: u64) {
        let fraction = self
            .registry
            .recovery_position(FileKind::Log, file_index, offset);
        self.progress
            .store(fraction.to_bits(), AtomicOrdering::Release);
    }

    /// Replays `logs` (creation order, oldest first) past `start`.
    ///
    /// `initial_value_file` is the value file active at `start`; rolling
    /// entries switch it as they are replayed.
    ///
    /// # Errors
    ///
    /// Returns a fatal error when a file's boundary cannot be resolved
    /// and safe recovery is configured, or when file I/O fails.
    pub fn replay(
        &self,
        logs: &mut [LogSource],
        start: Locality,
        initial_value_file: FileIndex,
        pending_indexes: &[IndexActivation],
    ) -> CoreResult<RecoveryOutcome> {
        let mut outcome = RecoveryOutcome {
            keyspace: BTreeMap::new(),
            value_stats: BTreeMap::new(),
            entries_replayed: 0,
            entries_discarded: 0,
            batches_committed: 0,
            truncated: Vec::new(),
            end_locality: start,
            activated_indexes: Vec::new(),
        };
        let mut value_file = initial_value_file;
        let mut activated = vec![false; pending_indexes.len()];

        // Indexes recorded at or before the starting point were already
        // live when the summary or closure was taken.
        for (i, activation) in pending_indexes.iter().enumerate() {
            if start.is_some()
                && self.registry.compare(
                    FileKind::Log,
                    &activation.recorded_at,
                    &start,
                    false,
                ) != Ordering::Greater
            {
                activated[i] = true;
                outcome.activated_indexes.push(activation.index_id);
            }
        }

        for source in logs.iter_mut() {
            let skip_to = if start.is_some() && source.file_index == start.file_index {
                u64::from(start.length)
            } else {
                u64::from(FILE_HEADER_SIZE)
            };

            let mut reader =
                LogReader::from_header(source.file.as_ref(), self.config.fixed_key_size)?;
            let mut pending: Vec<LogEntry> = Vec::new();

            while let Some((offset, entry)) = reader.next() {
                self.report_progress(source.file_index, offset);

                for (i, activation) in pending_indexes.iter().enumerate() {
                    if !activated[i]
                        && activation.recorded_at.file_index == source.file_index
                        && offset >= u64::from(activation.recorded_at.length)
                    {
                        activated[i] = true;
                        outcome.activated_indexes.push(activation.index_id);
                        tracing::info!(
                            index_id = activation.index_id,
                            file = activation.recorded_at.file_index.as_u16(),
                            position = activation.recorded_at.length,
                            "secondary index activated during replay"
                        );
                    }
                }

                if offset < skip_to {
                    continue;
                }
                outcome.entries_replayed += 1;

                if entry.is_structural() {
                    // Rolling entries carry the successor value-file index
                    // in the position field; markers carry a viewpoint.
                    if entry.flags & LOG_ROLLING != 0 {
                        value_file = FileIndex::new(entry.value_position as u16);
                    }
                    continue;
                }

                if entry.flags & LOG_OPENING != 0 {
                    pending.clear();
                }
                let closes = entry.is_closing();
                pending.push(entry);
                if closes {
                    self.commit_batch(&mut pending, value_file, &mut outcome)?;
                }
            }

            let mut confirmed = reader.confirmed_until();
            let boundary_unresolved =
                reader.torn() && confirmed == u64::from(FILE_HEADER_SIZE);
            if boundary_unresolved {
                if self.config.safe_recovery {
                    return Err(CoreError::recovery_ambiguous(format!(
                        "no confirmed transaction boundary in log file {}",
                        source.file_index
                    )));
                }
                tracing::error!(
                    file = source.file_index.as_u16(),
                    "no confirmed transaction boundary; restarting from the \
                     file header and losing the unreplayable tail"
                );
                confirmed = u64::from(FILE_HEADER_SIZE);
            }

            if !pending.is_empty() || reader.torn() {
                outcome.entries_discarded += pending.len() as u64;
                pending.clear();
                let size = source.file.size()?;
                if size > confirmed {
                    tracing::warn!(
                        file = source.file_index.as_u16(),
                        from = size,
                        to = confirmed,
                        "discarding unterminated log tail"
                    );
                    source.file.truncate(confirmed)?;
                    source.file.flush()?;
                    self.registry
                        .update_length(FileKind::Log, source.file_index, confirmed);
                    outcome.truncated.push((source.file_index, confirmed));
                }
            }

            let timestamp = self
                .registry
                .get(FileKind::Log, source.file_index)
                .map_or(0, |r| r.created_at);
            outcome.end_locality = Locality::new(
                source.file_index,
                confirmed as u32,
                Viewpoint::NONE,
                timestamp,
            );
            self.report_progress(source.file_index, confirmed);
        }

        tracing::info!(
            entries = outcome.entries_replayed,
            batches = outcome.batches_committed,
            discarded = outcome.entries_discarded,
            end = %outcome.end_locality,
            "log replay complete"
        );
        Ok(outcome)
    }

    fn commit_batch(
        &self,
        pending: &mut Vec<LogEntry>,
        value_file: FileIndex,
        outcome: &mut RecoveryOutcome,
    ) -> CoreResult<()> {
        for entry in pending.drain(..) {
            if let Some(id) = entry.transaction {
                let completed = match self.ledger {
                    Some(ledger) => ledger.contains(id)?,
                    None => false,
                };
                if !completed {
                    tracing::warn!(
                        transaction = id.as_u64(),
                        "discarding log entry of a transaction absent from \
                         the atomic-commit ledger"
                    );
                    outcome.entries_discarded += 1;
                    continue;
                }
            }

            let stats = outcome
                .value_stats
                .entry(value_file)
                .or_insert_with(|| fresh_stats(value_file));
            if entry.is_delete() {
                // Kept as a tombstone: the key may still be live in the
                // index files the caller merges this key space over.
                let version = VersionEntry::tombstone(value_file, entry.value_position);
                match outcome.keyspace.insert(entry.key, version) {
                    Some(old) if !old.deleting => {
                        mark_dead(&mut outcome.value_stats, old.value_file);
                    }
                    Some(_) => {}
                    None => stats.dead_entries += 1,
                }
            } else {
                stats.live_entries += 1;
                let version =
                    VersionEntry::committed(value_file, entry.value_position, entry.value_size);
                if let Some(old) = outcome.keyspace.insert(entry.key, version) {
                    mark_dead(&mut outcome.value_stats, old.value_file);
                }
            }
        }
        outcome.batches_committed += 1;
        Ok(())
    }
}

fn fresh_stats(file_index: FileIndex) -> FileStats {
    FileStats {
        file_index,
        reorganize_complete: true,
        ..FileStats::default()
    }
}

fn mark_dead(stats: &mut BTreeMap<FileIndex, FileStats>, file_index: FileIndex) {
    let entry = stats
        .entry(file_index)
        .or_insert_with(|| fresh_stats(file_index));
    entry.live_entries = entry.live_entries.saturating_sub(1);
    entry.dead_entries += 1;
}
