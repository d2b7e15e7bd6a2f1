//! The per-table storage facade.
//!
//! A table lives in one directory holding its numbered real-time files
//! (`000001.irt`, `000001.lrt`, `000001.vrt`, ...), a `stats.xrt` side
//! file, and an advisory `LOCK` file so only one process writes at a
//! time. Writes stream values into the current VRT file, commit through
//! the LRT log, and reach the IRT index lazily through indexing passes;
//! reads refill purged segments from the IRT back chain on demand.

use crate::checkpoint::CheckpointCoordinator;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::eviction::{self, DeferredFile, FileStats, PurgeReport};
use crate::governor::EngineContext;
use crate::log::{compute_crc32, LogEntry, LogWriter, TransactionLedger};
use crate::paging::codec::{
    self, decode_segment_block, encode_segment, repair_key_paging, should_rebuild,
    strike_closure, terminate_paging, DecodedBlock, KeyPagingValidation, CLOSURE_SIZE,
    MAX_CHAIN_HOPS,
};
use crate::paging::header::FileVersionHeader;
use crate::paging::locality::{Locality, FILE_HEADER_SIZE};
use crate::paging::segment::{Segment, SegmentState};
use crate::paging::version::VersionEntry;
use crate::recovery::{LogSource, Recovery, RecoveryOutcome};
use crate::registry::{FileRecord, FileSetRegistry};
use crate::stats::{self, EngineStats, XrtRecord};
use crate::types::{FileIndex, FileKind, ProtocolVersion, TransactionId, Viewpoint};
use fs2::FileExt;
use keeldb_storage::{OsFile, RandomAccessFile};
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const LOCK_FILE: &str = "LOCK";
const STATS_FILE: &str = "stats.xrt";

fn file_name(index: FileIndex, kind: FileKind) -> String {
    format!("{:06}.{}", index.as_u16(), kind.extension())
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as i64)
}

/// Wraps a value for storage: compression frame first, then the CRC
/// prefix covering the stored bytes.
fn encode_value(value: &[u8], config: &Config) -> Vec<u8> {
    let body = if config.value_compression {
        compress_prepend_size(value)
    } else {
        value.to_vec()
    };
    if config.validate_values {
        let mut out = Vec::with_capacity(body.len() + 4);
        out.extend_from_slice(&compute_crc32(&body).to_le_bytes());
        out.extend_from_slice(&body);
        out
    } else {
        body
    }
}

fn decode_value(stored: &[u8], config: &Config) -> CoreResult<Vec<u8>> {
    let body = if config.validate_values {
        if stored.len() < 4 {
            return Err(CoreError::corruption("value shorter than its checksum"));
        }
        let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        let body = &stored[4..];
        let actual = compute_crc32(body);
        if actual != expected {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }
        body
    } else {
        stored
    };
    if config.value_compression {
        decompress_size_prepended(body)
            .map_err(|e| CoreError::corruption(format!("value frame unreadable: {e}")))
    } else {
        Ok(body.to_vec())
    }
}

/// State behind the per-table structural lock.
struct TableInner {
    /// Segments keyed by their lower-bound key; the floor segment is
    /// keyed by the empty key so every lookup lands somewhere.
    segments: BTreeMap<Vec<u8>, Segment>,
    irt: Box<dyn RandomAccessFile>,
    irt_index: FileIndex,
    vrt: Box<dyn RandomAccessFile>,
    vrt_index: FileIndex,
    log: LogWriter,
    /// Per-value-file fragmentation accounting.
    value_stats: HashMap<FileIndex, FileStats>,
    /// Per-index-file fragmentation accounting.
    index_stats: HashMap<FileIndex, FileStats>,
    epoch: u32,
    total_entries: u64,
    local_sequence: u64,
    optimize_count: u64,
    audit_tick: u64,
    recovering: bool,
}

/// Files awaiting physical deletion, under a lock of their own so
/// background reclamation never contends with foreground writes.
#[derive(Default)]
struct DeferredState {
    files: Vec<DeferredFile>,
    bytes: u64,
}

/// One open table: the exposed surface of the storage core.
pub struct TableStore {
    context: Arc<EngineContext>,
    registry: FileSetRegistry,
    checkpoint: CheckpointCoordinator,
    stats: EngineStats,
    ledger: Option<Arc<TransactionLedger>>,
    path: PathBuf,
    _lock_file: File,
    inner: Mutex<TableInner>,
    deferred: Mutex<DeferredState>,
}

impl TableStore {
    /// Opens or creates a table directory, running recovery when the
    /// previous shutdown was unclean.
    ///
    /// # Errors
    ///
    /// Fails when another process holds the lock, when a log or value
    /// file is corrupt, or when recovery is ambiguous under safe
    /// recovery.
    pub fn open(path: &Path, context: Arc<EngineContext>) -> CoreResult<Self> {
        Self::open_with_ledger(path, context, None)
    }

    /// Opens a table that participates in cross-table atomic commit
    /// through a shared transaction ledger.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`TableStore::open`].
    pub fn open_with_ledger(
        path: &Path,
        context: Arc<EngineContext>,
        ledger: Option<Arc<TransactionLedger>>,
    ) -> CoreResult<Self> {
        let config = context.config();
        if !path.exists() {
            if config.create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "table directory does not exist: {}",
                    path.display()
                )));
            }
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::TableLocked);
        }

        let registry = FileSetRegistry::new();
        scan_directory(path, &registry)?;

        let fresh = registry.count(FileKind::Log) == 0;
        if fresh {
            for kind in [FileKind::Index, FileKind::Log, FileKind::Value] {
                create_file(path, FileIndex::new(1), kind, &registry)?;
            }
        }

        let irt_index = newest_index(&registry, FileKind::Index)?;
        let vrt_index = newest_index(&registry, FileKind::Value)?;
        let log_index = newest_index(&registry, FileKind::Log)?;

        let mut irt: Box<dyn RandomAccessFile> =
            Box::new(OsFile::open(&path.join(file_name(irt_index, FileKind::Index)))?);
        let vrt: Box<dyn RandomAccessFile> =
            Box::new(OsFile::open(&path.join(file_name(vrt_index, FileKind::Value)))?);

        let started = Instant::now();
        tracing::info!(path = %path.display(), "opening table");

        // Validate the index file. Index corruption is self-healing: the
        // file is derived state and a truncation only costs replay time.
        let mut total_entries = 0u64;
        let mut epoch = 0u32;
        let mut index_stats: HashMap<FileIndex, FileStats> = HashMap::new();
        match repair_key_paging(irt.as_mut(), config)? {
            KeyPagingValidation::Intact {
                entry_count,
                epoch: stored_epoch,
            } => {
                total_entries = entry_count;
                epoch = stored_epoch;
                // Reopening for append: invalidate the closure so a crash
                // before the next one forces the scan, then cut it off so
                // new blocks continue the stream.
                strike_closure(irt.as_mut())?;
                let size = irt.size()?;
                irt.truncate(size - CLOSURE_SIZE)?;
                registry.update_length(FileKind::Index, irt_index, size - CLOSURE_SIZE);
            }
            KeyPagingValidation::Ignore { valid_until } => {
                tracing::warn!(
                    file = irt_index.as_u16(),
                    valid_until,
                    "index file truncated to its last well-formed block"
                );
                registry.update_length(FileKind::Index, irt_index, valid_until);
                let entry = index_stats
                    .entry(irt_index)
                    .or_insert_with(|| fresh_file_stats(irt_index));
                entry.mark_repaired();
            }
            KeyPagingValidation::Empty => {}
            KeyPagingValidation::Error { message } => {
                tracing::warn!(
                    file = irt_index.as_u16(),
                    message,
                    "index file unreadable; rebuilding from the logs"
                );
                let size = irt.size()?;
                if size > u64::from(FILE_HEADER_SIZE) {
                    irt.truncate(u64::from(FILE_HEADER_SIZE))?;
                } else {
                    // Not even a header survived; restamp it.
                    irt = Box::new(OsFile::open(
                        &path.join(file_name(irt_index, FileKind::Index)),
                    )?);
                    stamp_header(irt.as_mut())?;
                }
                registry.update_length(FileKind::Index, irt_index, u64::from(FILE_HEADER_SIZE));
            }
        }

        let (mut keyspace, start) =
            load_index_blocks(path, irt.as_ref(), irt_index, config, &registry)?;

        // Replay every log entry newer than the index's consistency point.
        let recovery = Recovery::new(&registry, config, ledger.as_deref());
        let mut sources = open_log_sources(path, &registry, start)?;
        let outcome = recovery.replay(&mut sources, start, vrt_index, &[])?;
        drop(sources);
        let replayed = outcome.entries_replayed;
        let replayed_keys: Vec<Vec<u8>> = outcome.keyspace.keys().cloned().collect();
        let value_stats = merge_recovery(&mut keyspace, outcome);

        let total_live = keyspace.values().filter(|e| !e.deleting).count() as u64;
        if total_live > total_entries {
            total_entries = total_live;
        }
        let mut segments = build_segments(keyspace, config, &context);
        // Replayed entries exist only in the logs; they must reach the
        // index on the next pass.
        for key in replayed_keys {
            if let Some((_, seg)) = segments
                .range_mut::<[u8], _>((Bound::Unbounded, Bound::Included(key.as_slice())))
                .next_back()
            {
                seg.dirty_keys.insert(key);
                seg.state.set(SegmentState::DIRTY);
            }
        }

        // Opened after replay: a truncation during replay went through a
        // separate handle and this one must see the final length.
        let log_file: Box<dyn RandomAccessFile> =
            Box::new(OsFile::open(&path.join(file_name(log_index, FileKind::Log)))?);
        let log = LogWriter::new(log_file, log_index, config.fixed_key_size, config.sync_on_commit);

        let table = Self {
            context,
            registry,
            checkpoint: CheckpointCoordinator::new(),
            stats: EngineStats::new(),
            ledger,
            path: path.to_path_buf(),
            _lock_file: lock_file,
            inner: Mutex::new(TableInner {
                segments,
                irt,
                irt_index,
                vrt,
                vrt_index,
                log,
                value_stats,
                index_stats,
                epoch,
                total_entries,
                local_sequence: 0,
                optimize_count: 0,
                audit_tick: 0,
                recovering: false,
            }),
            deferred: Mutex::new(DeferredState::default()),
        };
        // Bind the count first: an inline `table.inner.lock()` argument
        // would keep its guard alive across the second lock inside
        // `recover_complete` and self-deadlock.
        let segment_count = table.inner.lock().segments.len() as u64;
        table.recover_complete(replayed, segment_count, started.elapsed());
        Ok(table)
    }

    /// Marks the start of an externally driven recovery pass.
    pub fn recover_begin(&self) {
        self.inner.lock().recovering = true;
        tracing::info!(path = %self.path.display(), "recovery started");
    }

    /// Marks recovery finished and logs its shape.
    pub fn recover_complete(&self, entries: u64, segments: u64, elapsed: Duration) {
        self.inner.lock().recovering = false;
        tracing::info!(
            path = %self.path.display(),
            entries,
            segments,
            elapsed_ms = elapsed.as_millis() as u64,
            "table open"
        );
    }

    /// Engine counters for this table.
    #[must_use]
    pub fn engine_stats(&self) -> &EngineStats {
        &self.stats
    }

    /// The table's file-set registry.
    #[must_use]
    pub fn registry(&self) -> &FileSetRegistry {
        &self.registry
    }

    /// The table's checkpoint coordinator.
    #[must_use]
    pub fn checkpoint(&self) -> &CheckpointCoordinator {
        &self.checkpoint
    }

    /// The shared atomic-commit ledger, when the table was opened with
    /// one.
    #[must_use]
    pub fn ledger(&self) -> Option<&Arc<TransactionLedger>> {
        self.ledger.as_ref()
    }

    /// Writes one key/value pair.
    ///
    /// # Errors
    ///
    /// Fails on file I/O errors or when a file grows past addressable
    /// length.
    pub fn put(&self, key: &[u8], value: &[u8]) -> CoreResult<()> {
        self.put_with_transaction(key, value, None)
    }

    /// Writes one key/value pair stamped with a cross-table transaction.
    ///
    /// # Errors
    ///
    /// Same as [`TableStore::put`].
    pub fn put_with_transaction(
        &self,
        key: &[u8],
        value: &[u8],
        transaction: Option<TransactionId>,
    ) -> CoreResult<()> {
        let config = self.context.config();
        if self.context.governor().purge_flag(config) {
            self.context.governor().pace(config, true, true);
            EngineStats::bump(&self.stats.pace_waits);
        }

        let mut inner = self.inner.lock();
        self.roll_value_file_if_full(&mut inner)?;

        let stored = encode_value(value, config);
        let position = inner.vrt.append(&stored)?;
        let position = u32::try_from(position)
            .map_err(|_| CoreError::invalid_operation("value file exceeds addressable length"))?;
        let size = stored.len() as u32;
        let vrt_index = inner.vrt_index;
        self.registry
            .update_length(FileKind::Value, vrt_index, u64::from(position) + u64::from(size));

        let mut entry = LogEntry::write(key.to_vec(), position, size)
            .opening()
            .closing();
        if let Some(id) = transaction {
            entry = entry.with_transaction(id);
        }
        let viewpoint = self.checkpoint.active_viewpoint();
        let locality = inner.log.append_with_viewpoint(&entry, viewpoint)?;
        self.registry
            .update_length(FileKind::Log, locality.file_index, u64::from(locality.length));

        let file_stat = inner
            .value_stats
            .entry(vrt_index)
            .or_insert_with(|| fresh_file_stats(vrt_index));
        file_stat.live_entries += 1;
        file_stat.byte_length = u64::from(position) + u64::from(size);

        let prior = {
            let seg = self.segment_for_mut(&mut inner, key)?;
            seg.entries.get(key).map(|e| (e.value_file, e.deleting))
        };
        match prior {
            Some((old_file, false)) => bump_dead(&mut inner.value_stats, old_file),
            _ => inner.total_entries += 1,
        }
        let seg = self.segment_for_mut(&mut inner, key)?;
        let before = seg.byte_size;
        seg.insert(key.to_vec(), VersionEntry::committed(vrt_index, position, size));
        seg.add_stream_ref(vrt_index, position);
        seg.log_locality = locality;
        let grown = seg.byte_size.saturating_sub(before);
        self.context.governor().record_allocation(grown);
        EngineStats::bump(&self.stats.writes);

        self.split_if_oversized(&mut inner, key);
        Ok(())
    }

    /// Deletes a key. A tombstone enters the delta set so the deletion
    /// reaches the index file on the next pass.
    ///
    /// # Errors
    ///
    /// Fails on file I/O errors.
    pub fn delete(&self, key: &[u8]) -> CoreResult<()> {
        let mut inner = self.inner.lock();

        let entry = LogEntry::delete(key.to_vec()).opening().closing();
        let viewpoint = self.checkpoint.active_viewpoint();
        let locality = inner.log.append_with_viewpoint(&entry, viewpoint)?;
        self.registry
            .update_length(FileKind::Log, locality.file_index, u64::from(locality.length));

        let vrt_index = inner.vrt_index;
        let seg = self.segment_for_mut(&mut inner, key)?;
        let old = seg.entries.get(key).filter(|e| !e.deleting).map(|e| e.value_file);
        if let Some(old_file) = old {
            let seg = self.segment_for_mut(&mut inner, key)?;
            seg.insert(key.to_vec(), VersionEntry::tombstone(vrt_index, 0));
            seg.log_locality = locality;
            bump_dead(&mut inner.value_stats, old_file);
            inner.total_entries = inner.total_entries.saturating_sub(1);
            EngineStats::bump(&self.stats.deletes);
        }
        Ok(())
    }

    /// Reads a key's current value.
    ///
    /// # Errors
    ///
    /// Fails on file I/O errors or a checksum mismatch on the stored
    /// value.
    pub fn get(&self, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        let config = self.context.config();
        let mut inner = self.inner.lock();
        let seg = self.segment_for_mut(&mut inner, key)?;
        let Some(entry) = seg.entries.get(key) else {
            return Ok(None);
        };
        if entry.deleting {
            return Ok(None);
        }
        let (value_file, position, size) = (entry.value_file, entry.value_position, entry.value_size);
        let stored = self.read_stored_value(&inner, value_file, position, size)?;
        decode_value(&stored, config).map(Some)
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.lock().total_entries
    }

    /// True when the table holds no live keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of resident segments, purged shells included.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Raises the checkpoint flag; the next indexing pass honors it.
    pub fn request_checkpoint(&self) -> u64 {
        self.checkpoint.request_checkpoint()
    }

    /// One indexing pass: flushes dirty segments to the index file as
    /// deltas or rebuilds, honoring a pending checkpoint.
    ///
    /// Returns `(more_work, needs_reorganization)`.
    ///
    /// # Errors
    ///
    /// Fails on file I/O errors; individual segment encode failures
    /// escalate to a rebuild retry before surfacing.
    pub fn index_cache(&self, cycle: bool) -> CoreResult<(bool, bool)> {
        let config = self.context.config();
        let mut inner = self.inner.lock();
        self.roll_index_file_if_full(&mut inner)?;
        self.merge_small_segments(&mut inner);

        let viewpoint = self.checkpoint.begin_cycle();
        let inner = &mut *inner;
        let irt_index = inner.irt_index;
        let mut wrote = 0u64;

        for seg in inner.segments.values_mut() {
            if seg.state.has(SegmentState::PURGED) {
                continue;
            }
            if seg.is_clean() && seg.dirty_keys.is_empty() {
                continue;
            }

            let mut rebuild = should_rebuild(seg, config);
            // Bounded escalation: one delta attempt, then a rebuild.
            loop {
                let offset = u32::try_from(inner.irt.size()?).map_err(|_| {
                    CoreError::invalid_operation("index file exceeds addressable length")
                })?;
                if let Some(vp) = viewpoint {
                    seg.log_locality.viewpoint = vp;
                    seg.state.set(SegmentState::VIEWPOINT);
                }
                match encode_segment(seg, config, offset, rebuild) {
                    Ok((bytes, count)) => {
                        if count == 0 && !rebuild {
                            seg.dirty_keys.clear();
                            seg.state.clear(SegmentState::DIRTY);
                            break;
                        }
                        inner.irt.append(&bytes)?;
                        let stat = inner
                            .index_stats
                            .entry(irt_index)
                            .or_insert_with(|| fresh_file_stats(irt_index));
                        stat.byte_length = u64::from(offset) + bytes.len() as u64;
                        if rebuild {
                            stat.dead_entries += u64::from(seg.physical_size);
                            stat.live_entries += u64::from(count);
                            seg.reset_back_chain(irt_index, offset);
                            seg.physical_size = count;
                            // The rebuilt block is self-contained; spent
                            // tombstones have nothing left to shadow.
                            seg.entries.retain(|_, e| !e.deleting);
                            seg.virtual_size = seg.entries.len() as u32;
                            EngineStats::bump(&self.stats.rebuilds);
                        } else {
                            stat.live_entries += u64::from(count);
                            seg.link_back_reference(irt_index, offset);
                            seg.fragment_count += 1;
                            seg.physical_size = seg.physical_size.saturating_add(count);
                            EngineStats::bump(&self.stats.delta_writes);
                        }
                        seg.dirty_keys.clear();
                        seg.state.clear(SegmentState::DIRTY);
                        wrote += 1;
                        break;
                    }
                    Err(err) if !rebuild => {
                        // The segment changed shape underneath the delta
                        // plan; a rebuild writes a self-contained block.
                        tracing::debug!(error = %err, "delta encode failed, retrying as rebuild");
                        rebuild = true;
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        if wrote > 0 {
            inner.irt.flush()?;
            self.registry
                .update_length(FileKind::Index, irt_index, inner.irt.size()?);
        }

        if viewpoint.is_some() {
            let length = u32::try_from(inner.log.length()?).unwrap_or(u32::MAX);
            let covered = Locality {
                file_index: inner.log.file_index(),
                length: length.max(FILE_HEADER_SIZE),
                viewpoint: viewpoint.unwrap_or(Viewpoint::NONE),
                timestamp: now_micros(),
            };
            self.checkpoint.report_index_complete(0, covered);
            inner.local_sequence = self.checkpoint.global_sequence();
            for seg in inner.segments.values_mut() {
                seg.state.clear(SegmentState::VIEWPOINT);
            }
        }

        inner.audit_tick += 1;
        let needs_reorg = inner
            .value_stats
            .values()
            .chain(inner.index_stats.values())
            .any(|s| {
                eviction::drive_reorganization(s, config, inner.optimize_count, false, inner.audit_tick)
            });
        let more = cycle
            && inner
                .segments
                .values()
                .any(|s| !s.is_clean() || !s.dirty_keys.is_empty());
        Ok((more, needs_reorg))
    }

    /// Evicts eligible segments from memory.
    ///
    /// `index` purges index segments, `deep` purges even without memory
    /// pressure, `log` flushes the log and value files. Returns the
    /// number of segments purged.
    ///
    /// # Errors
    ///
    /// Fails only on flush I/O errors.
    pub fn purge_cache(&self, index: bool, deep: bool, log: bool) -> CoreResult<u64> {
        let config = self.context.config();
        let governor = self.context.governor();
        let mut inner = self.inner.lock();
        let mut purged = 0u64;

        if index {
            let level = governor.usage(config);
            let flag = governor.purge_flag(config) || deep;
            let mut report = PurgeReport::default();
            let recovering = inner.recovering;
            for seg in inner.segments.values_mut() {
                if eviction::can_purge(seg, flag, level, recovering, false, &mut report) {
                    let released = seg.purge();
                    governor.record_release(released);
                    purged += 1;
                    EngineStats::bump(&self.stats.purges);
                }
            }
            tracing::debug!(purged, rejections = %report, "purge pass");
        }

        if log {
            inner.log.flush()?;
            inner.vrt.flush()?;
        }
        Ok(purged)
    }

    /// Total bytes across every registered file of this table.
    #[must_use]
    pub fn size_storage(&self) -> u64 {
        let mut total = 0u64;
        for kind in [
            FileKind::Index,
            FileKind::Log,
            FileKind::Value,
            FileKind::Summary,
            FileKind::Transaction,
        ] {
            for index in self.registry.in_creation_order(kind) {
                if let Some(record) = self.registry.get(kind, index) {
                    total += record.length;
                }
            }
        }
        total
    }

    /// Queues a file for deferred physical deletion.
    pub fn defer_deletion(&self, file: DeferredFile) {
        let mut deferred = self.deferred.lock();
        deferred.bytes += file.bytes;
        deferred.files.push(file);
    }

    /// Deletes the best-weighted deferred subset that keeps the summary
    /// floors satisfied. Returns the indices actually removed.
    ///
    /// # Errors
    ///
    /// Fails when a chosen file cannot be removed from disk.
    pub fn reclaim_deferred(&self) -> CoreResult<Vec<FileIndex>> {
        let config = self.context.config();
        let (candidates, deferred_bytes) = {
            let deferred = self.deferred.lock();
            (deferred.files.clone(), deferred.bytes)
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let (active, anchors) = {
            let inner = self.inner.lock();
            let summaries = inner
                .segments
                .values()
                .filter(|s| s.state.has(SegmentState::SUMMARY))
                .count() as u32;
            (summaries, summaries)
        };
        let active_bytes = self.size_storage().saturating_sub(deferred_bytes);
        let chosen = eviction::choose_files_to_clobber(
            &candidates,
            active,
            anchors,
            deferred_bytes,
            active_bytes,
            config,
        );

        let mut removed = Vec::with_capacity(chosen.len());
        for index in chosen {
            let name = self.path.join(file_name(index, FileKind::Value));
            if name.exists() {
                fs::remove_file(&name)?;
            }
            self.registry.unregister(FileKind::Value, index);
            let mut deferred = self.deferred.lock();
            if let Some(pos) = deferred.files.iter().position(|f| f.file_index == index) {
                let file = deferred.files.remove(pos);
                deferred.bytes = deferred.bytes.saturating_sub(file.bytes);
            }
            removed.push(index);
            tracing::info!(file = index.as_u16(), "deferred file reclaimed");
        }
        Ok(removed)
    }

    /// Appends the table's current statistics element to `stats.xrt`.
    ///
    /// # Errors
    ///
    /// Fails on file I/O errors.
    pub fn write_statistics(&self) -> CoreResult<()> {
        let record = {
            let inner = self.inner.lock();
            let key_fragments: u64 = inner.index_stats.values().map(|s| s.dead_entries).sum();
            let value_fragments: u64 = inner.value_stats.values().map(|s| s.dead_entries).sum();
            let compression_percent = inner
                .value_stats
                .values()
                .map(|s| s.compression_percent)
                .max()
                .unwrap_or(0);
            XrtRecord {
                size: self.size_storage(),
                key_fragments,
                value_fragments,
                compression_percent,
                compression_qualified: self.context.config().value_compression,
            }
        };
        let mut file = OsFile::open(&self.path.join(STATS_FILE))?;
        stats::append_record(&mut file, &record)
    }

    /// Reads the effective statistics element from `stats.xrt`.
    ///
    /// # Errors
    ///
    /// Fails on file I/O errors or an unparseable statistics file.
    pub fn read_statistics(&self) -> CoreResult<XrtRecord> {
        let file = OsFile::open(&self.path.join(STATS_FILE))?;
        stats::read_latest(&file)
    }

    /// Flushes everything and writes the index closure so the next open
    /// takes the fast path.
    ///
    /// # Errors
    ///
    /// Fails on file I/O errors.
    pub fn close(self) -> CoreResult<()> {
        self.index_cache(false)?;
        self.write_statistics()?;
        let mut inner = self.inner.lock();
        inner.log.flush()?;
        inner.vrt.flush()?;
        inner.vrt.sync()?;
        let total = inner.total_entries;
        let epoch = inner.epoch + 1;
        terminate_paging(inner.irt.as_mut(), total, epoch)?;
        inner.irt.sync()?;
        let irt_index = inner.irt_index;
        self.registry
            .update_length(FileKind::Index, irt_index, inner.irt.size()?);
        self.registry.set_clean_closed(FileKind::Index, irt_index, true);
        tracing::info!(path = %self.path.display(), entries = total, epoch, "table closed");
        Ok(())
    }

    fn segment_for_mut<'a>(
        &self,
        inner: &'a mut TableInner,
        key: &[u8],
    ) -> CoreResult<&'a mut Segment> {
        let seed: Vec<u8> = inner
            .segments
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(k, _)| k.clone())
            .ok_or_else(|| CoreError::invalid_operation("segment map lost its floor segment"))?;
        let needs_refill = inner
            .segments
            .get(&seed)
            .is_some_and(|s| s.state.has(SegmentState::PURGED));
        if needs_refill {
            self.refill_segment(inner, &seed)?;
        }
        inner
            .segments
            .get_mut(&seed)
            .ok_or_else(|| CoreError::invalid_operation("segment vanished during refill"))
    }

    /// Reloads a purged segment by walking its back-reference chain,
    /// newest block first, across possibly several index files.
    fn refill_segment(&self, inner: &mut TableInner, seed: &[u8]) -> CoreResult<()> {
        let (mut file, mut position) = {
            let seg = inner
                .segments
                .get(seed)
                .ok_or_else(|| CoreError::invalid_operation("refill of an unknown segment"))?;
            (seg.paging_index, seg.paging_position)
        };

        let mut acc: BTreeMap<Vec<u8>, VersionEntry> = BTreeMap::new();
        let mut hops = 0usize;
        while position != 0 {
            if hops >= MAX_CHAIN_HOPS {
                return Err(CoreError::corruption(format!(
                    "back-reference chain exceeds {MAX_CHAIN_HOPS} hops at file {file}"
                )));
            }
            let block = self.read_block(inner, file, position)?;
            let next = (block.header.paging_index, block.header.paging_position);
            codec::apply_block(&mut acc, block);
            hops += 1;
            (file, position) = next;
        }
        codec::collapse_tombstones(&mut acc);

        let seg = inner
            .segments
            .get_mut(seed)
            .ok_or_else(|| CoreError::invalid_operation("segment vanished during refill"))?;
        let bytes: u64 = acc
            .iter()
            .map(|(k, e)| k.len() as u64 + u64::from(e.value_size) + 64)
            .sum();
        seg.physical_size = acc.len() as u32;
        seg.virtual_size = seg.virtual_size.max(acc.len() as u32);
        seg.entries = acc;
        seg.byte_size = bytes;
        seg.fragment_count = hops.saturating_sub(1) as u32;
        seg.state.clear(SegmentState::PURGED);
        self.context.governor().record_allocation(bytes);
        EngineStats::bump(&self.stats.refills);
        Ok(())
    }

    /// Reads and decodes one segment block, opening an older index file
    /// on demand when the chain leaves the current one.
    fn read_block(
        &self,
        inner: &TableInner,
        file_index: FileIndex,
        position: u32,
    ) -> CoreResult<DecodedBlock> {
        let config = self.context.config();
        if file_index == inner.irt_index {
            let size = inner.irt.size()?;
            let buf = inner
                .irt
                .read_at(u64::from(position), (size - u64::from(position)) as usize)?;
            return decode_segment_block(&buf, position, config, ProtocolVersion::CURRENT);
        }

        self.context.limiter().acquire(FileKind::Index, file_index)?;
        let result = (|| {
            let file = OsFile::open(&self.path.join(file_name(file_index, FileKind::Index)))?;
            let header = FileVersionHeader::decode(&file.read_at(0, FILE_HEADER_SIZE as usize)?)?;
            let protocol = header.protocol_version()?;
            let size = file.size()?;
            let buf = file.read_at(u64::from(position), (size - u64::from(position)) as usize)?;
            decode_segment_block(&buf, position, config, protocol)
        })();
        self.context.limiter().release(FileKind::Index, file_index);
        result
    }

    fn read_stored_value(
        &self,
        inner: &TableInner,
        file_index: FileIndex,
        position: u32,
        size: u32,
    ) -> CoreResult<Vec<u8>> {
        if file_index == inner.vrt_index {
            return Ok(inner.vrt.read_at(u64::from(position), size as usize)?);
        }
        self.context.limiter().acquire(FileKind::Value, file_index)?;
        let result = (|| {
            let file = OsFile::open(&self.path.join(file_name(file_index, FileKind::Value)))?;
            Ok(file.read_at(u64::from(position), size as usize)?)
        })();
        self.context.limiter().release(FileKind::Value, file_index);
        result
    }

    fn roll_value_file_if_full(&self, inner: &mut TableInner) -> CoreResult<()> {
        let config = self.context.config();
        if inner.vrt.size()? < config.max_file_size {
            return Ok(());
        }
        let next = inner.vrt_index.next();
        let file = create_file(&self.path, next, FileKind::Value, &self.registry)?;
        let locality = inner.log.append(&LogEntry::roll(next))?;
        self.registry
            .update_length(FileKind::Log, locality.file_index, u64::from(locality.length));
        inner.vrt.flush()?;
        inner.vrt = file;
        inner.vrt_index = next;
        tracing::info!(file = next.as_u16(), "value file rolled");
        Ok(())
    }

    fn roll_index_file_if_full(&self, inner: &mut TableInner) -> CoreResult<()> {
        let config = self.context.config();
        if inner.irt.size()? < config.max_file_size {
            return Ok(());
        }
        let total = inner.total_entries;
        let epoch = inner.epoch;
        terminate_paging(inner.irt.as_mut(), total, epoch)?;
        self.registry
            .set_clean_closed(FileKind::Index, inner.irt_index, true);
        self.registry
            .update_length(FileKind::Index, inner.irt_index, inner.irt.size()?);

        let next = inner.irt_index.next();
        let file = create_file(&self.path, next, FileKind::Index, &self.registry)?;
        inner.irt = file;
        inner.irt_index = next;
        tracing::info!(file = next.as_u16(), "index file rolled");
        Ok(())
    }

    /// Collapses adjacent undersized segments ahead of an indexing pass.
    ///
    /// The higher segment of an eligible pair is absorbed into the lower
    /// and its seed leaves the map; the merged segment comes out altered
    /// and dirty, so the same pass rewrites it as a rebuild block.
    fn merge_small_segments(&self, inner: &mut TableInner) {
        let config = self.context.config();
        if inner.segments.len() < 2 {
            return;
        }
        let seeds: Vec<Vec<u8>> = inner.segments.keys().cloned().collect();
        let mut low_seed = &seeds[0];
        for high_seed in &seeds[1..] {
            let eligible = match (inner.segments.get(low_seed), inner.segments.get(high_seed)) {
                (Some(low), Some(high)) => {
                    !low.state.has(SegmentState::SUMMARY)
                        && !high.state.has(SegmentState::SUMMARY)
                        && eviction::merge_fragmentation(low, high, config)
                }
                _ => false,
            };
            if !eligible {
                low_seed = high_seed;
                continue;
            }
            if let Some(absorbed) = inner.segments.remove(high_seed) {
                if let Some(low) = inner.segments.get_mut(low_seed) {
                    low.absorb(absorbed);
                    EngineStats::bump(&self.stats.merges);
                }
            }
            // The merged segment is now altered, which blocks a chained
            // absorb of the next neighbor until it is rebuilt.
        }
    }

    fn split_if_oversized(&self, inner: &mut TableInner, key: &[u8]) {
        let config = self.context.config();
        let Some(seg) = inner
            .segments
            .range_mut::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, s)| s)
        else {
            return;
        };
        if seg.virtual_size <= config.segment_virtual_maximum || seg.live_len() < 2 {
            return;
        }
        let Some(upper) = seg.split() else {
            return;
        };
        if let Some(upper_seed) = upper.seed_key().map(<[u8]>::to_vec) {
            inner.segments.insert(upper_seed, upper);
            EngineStats::bump(&self.stats.splits);
        }
    }
}

impl std::fmt::Debug for TableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn fresh_file_stats(file_index: FileIndex) -> FileStats {
    FileStats {
        file_index,
        reorganize_complete: true,
        ..FileStats::default()
    }
}

fn bump_dead(stats: &mut HashMap<FileIndex, FileStats>, file_index: FileIndex) {
    let stat = stats
        .entry(file_index)
        .or_insert_with(|| fresh_file_stats(file_index));
    stat.live_entries = stat.live_entries.saturating_sub(1);
    stat.dead_entries += 1;
}

fn stamp_header(file: &mut dyn RandomAccessFile) -> CoreResult<()> {
    file.append(&FileVersionHeader::current(0).encode())?;
    file.flush()?;
    Ok(())
}

fn create_file(
    path: &Path,
    index: FileIndex,
    kind: FileKind,
    registry: &FileSetRegistry,
) -> CoreResult<Box<dyn RandomAccessFile>> {
    let mut file: Box<dyn RandomAccessFile> =
        Box::new(OsFile::open(&path.join(file_name(index, kind)))?);
    if file.size()? == 0 {
        stamp_header(file.as_mut())?;
    }
    registry.register(
        kind,
        FileRecord {
            index,
            created_at: now_micros(),
            length: file.size()?,
            clean_closed: false,
        },
    );
    Ok(file)
}

fn newest_index(registry: &FileSetRegistry, kind: FileKind) -> CoreResult<FileIndex> {
    registry
        .newest(kind)
        .map(|r| r.index)
        .ok_or_else(|| CoreError::invalid_operation(format!("no {kind} file registered")))
}

/// Registers every real-time file found in the directory.
fn scan_directory(path: &Path, registry: &FileSetRegistry) -> CoreResult<()> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((stem, ext)) = name.split_once('.') else {
            continue;
        };
        let kind = match ext {
            "irt" => FileKind::Index,
            "lrt" => FileKind::Log,
            "vrt" => FileKind::Value,
            "srt" => FileKind::Summary,
            "trt" => FileKind::Transaction,
            _ => continue,
        };
        let Ok(index) = stem.parse::<u16>() else {
            continue;
        };
        let meta = entry.metadata()?;
        let created_at = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(i64::from(index), |d| d.as_micros() as i64);
        registry.register(
            kind,
            FileRecord {
                index: FileIndex::new(index),
                created_at,
                length: meta.len(),
                clean_closed: false,
            },
        );
    }
    Ok(())
}

/// Walks every index file front to back in creation order, folding
/// blocks into a key space (later blocks win) and tracking the newest
/// log consistency point seen in any header.
///
/// Older files end at a closure marker; the newest file was validated
/// and its closure cut off, so it reads to the end.
fn load_index_blocks(
    path: &Path,
    irt: &dyn RandomAccessFile,
    irt_index: FileIndex,
    config: &Config,
    registry: &FileSetRegistry,
) -> CoreResult<(BTreeMap<Vec<u8>, VersionEntry>, Locality)> {
    let mut keyspace = BTreeMap::new();
    let mut newest = Locality::NONE;
    for index in registry.in_creation_order(FileKind::Index) {
        if index == irt_index {
            scan_index_file(
                irt,
                ProtocolVersion::CURRENT,
                config,
                registry,
                &mut keyspace,
                &mut newest,
            )?;
        } else {
            let file = OsFile::open(&path.join(file_name(index, FileKind::Index)))?;
            let header = FileVersionHeader::decode(&file.read_at(0, FILE_HEADER_SIZE as usize)?)?;
            let protocol = header.protocol_version()?;
            scan_index_file(&file, protocol, config, registry, &mut keyspace, &mut newest)?;
        }
    }
    Ok((keyspace, newest))
}

fn scan_index_file(
    file: &dyn RandomAccessFile,
    protocol: ProtocolVersion,
    config: &Config,
    registry: &FileSetRegistry,
    keyspace: &mut BTreeMap<Vec<u8>, VersionEntry>,
    newest: &mut Locality,
) -> CoreResult<()> {
    let size = file.size()?;
    let mut at = u64::from(FILE_HEADER_SIZE);
    if size <= at {
        return Ok(());
    }
    let body = file.read_at(at, (size - at) as usize)?;
    let mut cursor = 0usize;
    while cursor < body.len() {
        let remaining = body.len() - cursor;
        if remaining as u64 == CLOSURE_SIZE
            && codec::decode_closure(&body[cursor..], at as u32).is_some()
        {
            break;
        }
        let block = decode_segment_block(&body[cursor..], at as u32, config, protocol)?;
        cursor += block.consumed as usize;
        at += block.consumed;
        if block.header.log_length >= FILE_HEADER_SIZE {
            let candidate = Locality {
                file_index: block.header.log_index,
                length: block.header.log_length,
                viewpoint: Viewpoint::NONE,
                timestamp: registry
                    .get(FileKind::Log, block.header.log_index)
                    .map_or(0, |r| r.created_at),
            };
            if registry.compare(FileKind::Log, &candidate, newest, false)
                == std::cmp::Ordering::Greater
            {
                *newest = candidate;
            }
        }
        for (key, entry) in block.entries {
            if entry.deleting {
                keyspace.remove(&key);
            } else {
                keyspace.insert(key, entry);
            }
        }
    }
    Ok(())
}

/// Opens the log files replay must read: the start file and everything
/// created after it, oldest first.
fn open_log_sources(
    path: &Path,
    registry: &FileSetRegistry,
    start: Locality,
) -> CoreResult<Vec<LogSource>> {
    let mut sources = Vec::new();
    let mut reached_start = start.is_none();
    for index in registry.in_creation_order(FileKind::Log) {
        if !reached_start {
            if index == start.file_index {
                reached_start = true;
            } else {
                continue;
            }
        }
        let file: Box<dyn RandomAccessFile> =
            Box::new(OsFile::open(&path.join(file_name(index, FileKind::Log)))?);
        let header = FileVersionHeader::decode(&file.read_at(0, FILE_HEADER_SIZE as usize)?)?;
        header.protocol_version()?;
        sources.push(LogSource {
            file_index: index,
            file,
        });
    }
    Ok(sources)
}

/// Folds a replay outcome into the index-derived key space.
fn merge_recovery(
    keyspace: &mut BTreeMap<Vec<u8>, VersionEntry>,
    outcome: RecoveryOutcome,
) -> HashMap<FileIndex, FileStats> {
    for (key, entry) in outcome.keyspace {
        keyspace.insert(key, entry);
    }
    outcome
        .value_stats
        .into_iter()
        .map(|(index, stat)| (index, stat))
        .collect()
}

/// Chunks a key space into segments bounded by the virtual-size ceiling,
/// with a floor segment keyed by the empty key. Segments come out clean;
/// the caller re-dirties what the index has not seen.
fn build_segments(
    keyspace: BTreeMap<Vec<u8>, VersionEntry>,
    config: &Config,
    context: &EngineContext,
) -> BTreeMap<Vec<u8>, Segment> {
    let mut segments = BTreeMap::new();
    let chunk = config.segment_virtual_maximum.max(1) as usize;
    let mut current = Segment::new();
    let mut current_seed: Vec<u8> = Vec::new();
    let mut bytes = 0u64;

    for (key, entry) in keyspace {
        if current.live_len() >= chunk {
            current.dirty_keys.clear();
            current.state.clear(SegmentState::DIRTY);
            bytes += current.byte_size;
            segments.insert(
                std::mem::take(&mut current_seed),
                std::mem::replace(&mut current, Segment::new()),
            );
            current_seed = key.clone();
        }
        current.insert(key, entry);
    }
    current.dirty_keys.clear();
    current.state.clear(SegmentState::DIRTY);
    bytes += current.byte_size;
    segments.insert(current_seed, current);
    context.governor().record_allocation(bytes);
    segments
}
