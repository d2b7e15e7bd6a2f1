//! Log-file (`.lrt`) records, the append path, and the streaming reader
//! recovery uses. Also holds the transaction ledger (`.trt`) backing the
//! cross-table atomic-commit protocol.
//!
//! Log entries have no per-record checksum; validity comes from
//! transaction boundary flags. Entries after the last confirmed closing
//! boundary are a crash artifact and get truncated away during replay.

use crate::error::{CoreError, CoreResult};
use crate::paging::locality::Locality;
use crate::paging::locality::FILE_HEADER_SIZE;
use crate::types::{FileIndex, TransactionId, Viewpoint};
use keeldb_storage::RandomAccessFile;
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Entry begins a transaction batch.
pub const LOG_OPENING: u8 = 0x01;
/// Entry ends a transaction batch; everything since the opening commits.
pub const LOG_CLOSING: u8 = 0x02;
/// Writing continues in the next log file; `value_position` carries the
/// successor's file index.
pub const LOG_ROLLING: u8 = 0x04;
/// The write is a delete.
pub const LOG_DESTROYING: u8 = 0x08;
/// Structural no-op used for large-transaction bookkeeping and for
/// checkpoint viewpoint markers (`value_position` carries the viewpoint).
pub const LOG_MARKING: u8 = 0x10;
/// Entry participates in the atomic-commit protocol and carries a
/// transaction id.
pub const LOG_ACP: u8 = 0x20;

/// One log entry.
///
/// Wire shape, little-endian:
/// `[flags u8][txn u64 if ACP][value_position u32][value_size u32][key]`
/// with the key length-prefixed (u16) unless the table declares a fixed
/// key width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// State flags, see the `LOG_*` constants.
    pub flags: u8,
    /// Transaction stamp, present under the atomic-commit protocol.
    pub transaction: Option<TransactionId>,
    /// Byte position of the value payload in the current value file.
    pub value_position: u32,
    /// Value payload size. Zero for deletes and structural entries.
    pub value_size: u32,
    /// The key. Empty for structural entries.
    pub key: Vec<u8>,
}

impl LogEntry {
    /// A content write.
    #[must_use]
    pub fn write(key: Vec<u8>, value_position: u32, value_size: u32) -> Self {
        Self {
            flags: 0,
            transaction: None,
            value_position,
            value_size,
            key,
        }
    }

    /// A delete.
    #[must_use]
    pub fn delete(key: Vec<u8>) -> Self {
        Self {
            flags: LOG_DESTROYING,
            transaction: None,
            value_position: 0,
            value_size: 0,
            key,
        }
    }

    /// A checkpoint viewpoint marker.
    #[must_use]
    pub fn mark(viewpoint: Viewpoint) -> Self {
        Self {
            flags: LOG_MARKING,
            transaction: None,
            value_position: viewpoint.as_u32(),
            value_size: 0,
            key: Vec::new(),
        }
    }

    /// A rollover marker naming the successor log file.
    #[must_use]
    pub fn roll(next_index: FileIndex) -> Self {
        Self {
            flags: LOG_ROLLING,
            transaction: None,
            value_position: u32::from(next_index.as_u16()),
            value_size: 0,
            key: Vec::new(),
        }
    }

    /// Sets the opening boundary flag.
    #[must_use]
    pub fn opening(mut self) -> Self {
        self.flags |= LOG_OPENING;
        self
    }

    /// Sets the closing boundary flag.
    #[must_use]
    pub fn closing(mut self) -> Self {
        self.flags |= LOG_CLOSING;
        self
    }

    /// Stamps the entry with an atomic-commit transaction id.
    #[must_use]
    pub fn with_transaction(mut self, id: TransactionId) -> Self {
        self.flags |= LOG_ACP;
        self.transaction = Some(id);
        self
    }

    /// True when the entry tombstones its key.
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        self.flags & LOG_DESTROYING != 0
    }

    /// True for structural entries carrying no key mutation.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        self.flags & (LOG_MARKING | LOG_ROLLING) != 0
    }

    /// True when the entry confirms a transaction boundary.
    #[must_use]
    pub const fn is_closing(&self) -> bool {
        self.flags & LOG_CLOSING != 0
    }

    /// Serializes the entry.
    pub fn encode(&self, fixed_key_size: Option<usize>) -> CoreResult<Vec<u8>> {
        if (self.flags & LOG_ACP != 0) != self.transaction.is_some() {
            return Err(CoreError::invalid_operation(
                "log entry transaction stamp disagrees with its ACP flag",
            ));
        }
        let mut buf = Vec::with_capacity(16 + self.key.len());
        buf.push(self.flags);
        if let Some(txn) = self.transaction {
            buf.extend_from_slice(&txn.as_u64().to_le_bytes());
        }
        buf.extend_from_slice(&self.value_position.to_le_bytes());
        buf.extend_from_slice(&self.value_size.to_le_bytes());
        match fixed_key_size {
            Some(size) if !self.is_structural() => {
                if self.key.len() != size {
                    return Err(CoreError::invalid_operation(format!(
                        "key is {} bytes, table declares {size}",
                        self.key.len()
                    )));
                }
                buf.extend_from_slice(&self.key);
            }
            _ => {
                let len = u16::try_from(self.key.len())
                    .map_err(|_| CoreError::invalid_operation("log entry key too large"))?;
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(&self.key);
            }
        }
        Ok(buf)
    }

    /// Deserializes one entry from `buf`, returning it and the bytes it
    /// occupied. `None` means the buffer ends mid-entry (a torn tail).
    pub fn decode(buf: &[u8], fixed_key_size: Option<usize>) -> Option<(Self, usize)> {
        let mut at = 0usize;
        let take = |at: &mut usize, n: usize| -> Option<&[u8]> {
            if *at + n > buf.len() {
                return None;
            }
            let slice = &buf[*at..*at + n];
            *at += n;
            Some(slice)
        };

        let flags = take(&mut at, 1)?[0];
        let transaction = if flags & LOG_ACP != 0 {
            let raw = u64::from_le_bytes(take(&mut at, 8)?.try_into().unwrap());
            Some(TransactionId::new(raw))
        } else {
            None
        };
        let value_position = u32::from_le_bytes(take(&mut at, 4)?.try_into().unwrap());
        let value_size = u32::from_le_bytes(take(&mut at, 4)?.try_into().unwrap());
        let structural = flags & (LOG_MARKING | LOG_ROLLING) != 0;
        let key = match fixed_key_size {
            Some(size) if !structural => take(&mut at, size)?.to_vec(),
            _ => {
                let len = u16::from_le_bytes(take(&mut at, 2)?.try_into().unwrap()) as usize;
                take(&mut at, len)?.to_vec()
            }
        };
        Some((
            Self {
                flags,
                transaction,
                value_position,
                value_size,
                key,
            },
            at,
        ))
    }
}

/// CRC32 (IEEE polynomial) over `data`. Used for the optional value
/// payload prefix when validation is configured.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Appends entries to one log file and tracks its locality.
pub struct LogWriter {
    file: Mutex<Box<dyn RandomAccessFile>>,
    file_index: FileIndex,
    fixed_key_size: Option<usize>,
    sync_on_write: bool,
}

impl LogWriter {
    /// Wraps an open log file.
    pub fn new(
        file: Box<dyn RandomAccessFile>,
        file_index: FileIndex,
        fixed_key_size: Option<usize>,
        sync_on_write: bool,
    ) -> Self {
        Self {
            file: Mutex::new(file),
            file_index,
            fixed_key_size,
            sync_on_write,
        }
    }

    /// The file this writer appends to.
    #[must_use]
    pub const fn file_index(&self) -> FileIndex {
        self.file_index
    }

    /// Appends one entry, returning the locality after the write.
    pub fn append(&self, entry: &LogEntry) -> CoreResult<Locality> {
        self.append_with_viewpoint(entry, Viewpoint::NONE)
    }

    /// Appends one entry stamped with the checkpoint viewpoint the table
    /// is writing under.
    pub fn append_with_viewpoint(
        &self,
        entry: &LogEntry,
        viewpoint: Viewpoint,
    ) -> CoreResult<Locality> {
        let data = entry.encode(self.fixed_key_size)?;
        let mut file = self.file.lock();
        let offset = file.append(&data)?;
        if self.sync_on_write && entry.is_closing() {
            file.flush()?;
        }
        let length = u32::try_from(offset + data.len() as u64)
            .map_err(|_| CoreError::invalid_operation("log file exceeds addressable length"))?;
        Ok(Locality {
            file_index: self.file_index,
            length,
            viewpoint,
            timestamp: now_millis(),
        })
    }

    /// Flushes buffered writes to durable storage.
    pub fn flush(&self) -> CoreResult<()> {
        self.file.lock().flush()?;
        Ok(())
    }

    /// Current file length.
    pub fn length(&self) -> CoreResult<u64> {
        Ok(self.file.lock().size()?)
    }

    /// Cuts the file back to `length`, discarding an unterminated tail.
    pub fn truncate(&self, length: u64) -> CoreResult<()> {
        self.file.lock().truncate(length)?;
        Ok(())
    }

    /// Runs `f` with the underlying file.
    pub fn with_file<R>(&self, f: impl FnOnce(&dyn RandomAccessFile) -> R) -> R {
        let file = self.file.lock();
        f(file.as_ref())
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("file_index", &self.file_index)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

/// Streams entries out of a log file.
///
/// Iteration ends at the exact end of file or at a torn trailing entry.
/// [`LogReader::confirmed_until`] names the offset just past the last
/// entry carrying a closing boundary; replay truncates there when the
/// tail holds an unterminated transaction.
pub struct LogReader {
    body: Vec<u8>,
    base: u64,
    at: usize,
    fixed_key_size: Option<usize>,
    confirmed_until: u64,
    torn: bool,
    finished: bool,
}

impl LogReader {
    /// Reads the body after the standard 32-byte file header.
    pub fn from_header(
        file: &dyn RandomAccessFile,
        fixed_key_size: Option<usize>,
    ) -> CoreResult<Self> {
        let size = file.size()?;
        let base = u64::from(FILE_HEADER_SIZE);
        let body = if size > base {
            file.read_at(base, (size - base) as usize)?
        } else {
            Vec::new()
        };
        Ok(Self {
            body,
            base,
            at: 0,
            fixed_key_size,
            confirmed_until: base,
            torn: false,
            finished: false,
        })
    }

    /// Offset just past the last closing boundary seen so far.
    #[must_use]
    pub const fn confirmed_until(&self) -> u64 {
        self.confirmed_until
    }

    /// True when iteration ended mid-entry rather than at end of file.
    #[must_use]
    pub const fn torn(&self) -> bool {
        self.torn
    }
}

impl Iterator for LogReader {
    type Item = (u64, LogEntry);

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.at >= self.body.len() {
            self.finished = true;
            return None;
        }
        let start = self.base + self.at as u64;
        match LogEntry::decode(&self.body[self.at..], self.fixed_key_size) {
            Some((entry, consumed)) => {
                self.at += consumed;
                if entry.is_closing() || entry.is_structural() {
                    self.confirmed_until = self.base + self.at as u64;
                }
                Some((start, entry))
            }
            None => {
                self.torn = true;
                self.finished = true;
                None
            }
        }
    }
}

/// Reserved slot at the front of a ledger body.
const LEDGER_RESERVED: usize = 8;

/// The atomic-commit transaction ledger, a `.trt` file listing committed
/// transaction ids as flat ascending u64s.
///
/// Eight reserved zero bytes follow the file header; real ids start
/// after them. Presence of an id means the transaction committed across
/// every participating table.
pub struct TransactionLedger {
    file: Mutex<Box<dyn RandomAccessFile>>,
    last: Mutex<Option<TransactionId>>,
}

impl TransactionLedger {
    /// Wraps an open ledger file, writing the reserved slot when empty.
    pub fn open(mut file: Box<dyn RandomAccessFile>) -> CoreResult<Self> {
        let size = file.size()?;
        let body_start = u64::from(FILE_HEADER_SIZE) + LEDGER_RESERVED as u64;
        if size < body_start {
            file.append(&vec![0u8; (body_start - size) as usize])?;
        }
        let ledger = Self {
            file: Mutex::new(file),
            last: Mutex::new(None),
        };
        let ids = ledger.committed()?;
        *ledger.last.lock() = ids.last().copied();
        Ok(ledger)
    }

    /// Records a committed transaction. Ids must arrive in commit order.
    pub fn record_commit(&self, id: TransactionId) -> CoreResult<()> {
        let mut last = self.last.lock();
        if let Some(prev) = *last {
            if id.as_u64() <= prev.as_u64() {
                return Err(CoreError::invalid_operation(format!(
                    "ledger commit {} arrived after {}",
                    id.as_u64(),
                    prev.as_u64()
                )));
            }
        }
        let mut file = self.file.lock();
        file.append(&id.as_u64().to_le_bytes())?;
        file.flush()?;
        *last = Some(id);
        Ok(())
    }

    /// Every committed transaction id, in commit order.
    pub fn committed(&self) -> CoreResult<Vec<TransactionId>> {
        let file = self.file.lock();
        let size = file.size()?;
        let body_start = u64::from(FILE_HEADER_SIZE) + LEDGER_RESERVED as u64;
        if size <= body_start {
            return Ok(Vec::new());
        }
        // A torn trailing id (fewer than 8 bytes) is dropped, same as a
        // torn log tail.
        let whole = (size - body_start) / 8 * 8;
        let body = file.read_at(body_start, whole as usize)?;
        let mut ids = Vec::with_capacity(body.len() / 8);
        for chunk in body.chunks_exact(8) {
            let id = u64::from_le_bytes(chunk.try_into().unwrap());
            if id != 0 {
                ids.push(TransactionId::new(id));
            }
        }
        Ok(ids)
    }

    /// Whether `id` committed.
    pub fn contains(&self, id: TransactionId) -> CoreResult<bool> {
        Ok(self.committed()?.binary_search(&id).is_ok())
    }
}

impl std::fmt::Debug for TransactionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLedger").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::header::FileVersionHeader;
    use keeldb_storage::MemoryFile;

    fn log_file() -> MemoryFile {
        MemoryFile::with_data(FileVersionHeader::current(0).encode().to_vec())
    }

    #[test]
    fn entry_round_trips() {
        let entries = [
            LogEntry::write(b"key".to_vec(), 100, 8).opening().closing(),
            LogEntry::delete(b"gone".to_vec()).closing(),
            LogEntry::write(b"acp".to_vec(), 0, 4).with_transaction(TransactionId::new(7)),
            LogEntry::mark(Viewpoint::new(40)),
            LogEntry::roll(FileIndex::new(12)),
        ];
        for entry in entries {
            let bytes = entry.encode(None).unwrap();
            let (decoded, consumed) = LogEntry::decode(&bytes, None).unwrap();
            assert_eq!(decoded, entry);
            assert_eq!(consumed, bytes.len());
        }
    }

    #[test]
    fn fixed_keys_skip_length_prefixes() {
        let entry = LogEntry::write(b"abcd".to_vec(), 0, 4);
        let fixed = entry.encode(Some(4)).unwrap();
        let prefixed = entry.encode(None).unwrap();
        assert_eq!(prefixed.len(), fixed.len() + 2);

        let (decoded, _) = LogEntry::decode(&fixed, Some(4)).unwrap();
        assert_eq!(decoded.key, b"abcd");

        // Structural entries keep the prefixed form even when the table
        // declares fixed keys; their key is empty, not fixed-width.
        let mark = LogEntry::mark(Viewpoint::new(1));
        let bytes = mark.encode(Some(4)).unwrap();
        let (decoded, _) = LogEntry::decode(&bytes, Some(4)).unwrap();
        assert_eq!(decoded, mark);
    }

    #[test]
    fn acp_stamp_and_flag_must_agree() {
        let mut entry = LogEntry::write(b"k".to_vec(), 0, 1);
        entry.flags |= LOG_ACP;
        assert!(entry.encode(None).is_err());
    }

    #[test]
    fn crc32_known_vector() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn write_then_read_back() {
        let writer = LogWriter::new(Box::new(log_file()), FileIndex::new(1), None, false);
        let a = LogEntry::write(b"a".to_vec(), 0, 1).opening();
        let b = LogEntry::write(b"b".to_vec(), 1, 1).closing();
        let loc1 = writer.append(&a).unwrap();
        let loc2 = writer.append(&b).unwrap();
        assert!(loc2.length > loc1.length);
        assert_eq!(loc1.file_index, FileIndex::new(1));

        let mut reader = writer
            .with_file(|f| LogReader::from_header(f, None))
            .unwrap();
        assert_eq!(reader.next().unwrap().1, a);
        assert_eq!(reader.next().unwrap().1, b);
        assert!(reader.next().is_none());
        assert!(!reader.torn());
        assert_eq!(reader.confirmed_until(), u64::from(loc2.length));
    }

    #[test]
    fn unterminated_batch_is_not_confirmed() {
        let writer = LogWriter::new(Box::new(log_file()), FileIndex::new(1), None, false);
        let boundary = writer
            .append(&LogEntry::write(b"a".to_vec(), 0, 1).opening().closing())
            .unwrap();
        // A second batch opens but never closes.
        writer
            .append(&LogEntry::write(b"b".to_vec(), 1, 1).opening())
            .unwrap();
        writer.append(&LogEntry::write(b"c".to_vec(), 2, 1)).unwrap();

        let mut reader = writer
            .with_file(|f| LogReader::from_header(f, None))
            .unwrap();
        let replayed: Vec<_> = reader.by_ref().map(|(_, e)| e.key).collect();
        assert_eq!(replayed, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(!reader.torn());
        assert_eq!(reader.confirmed_until(), u64::from(boundary.length));
    }

    #[test]
    fn torn_tail_stops_iteration() {
        let writer = LogWriter::new(Box::new(log_file()), FileIndex::new(1), None, false);
        let good = writer
            .append(&LogEntry::write(b"a".to_vec(), 0, 1).closing())
            .unwrap();
        writer
            .append(&LogEntry::write(b"bbbbbbbb".to_vec(), 1, 1).closing())
            .unwrap();
        writer.truncate(u64::from(good.length) + 5).unwrap();

        let mut reader = writer
            .with_file(|f| LogReader::from_header(f, None))
            .unwrap();
        assert!(reader.next().is_some());
        assert!(reader.next().is_none());
        assert!(reader.torn());
        assert_eq!(reader.confirmed_until(), u64::from(good.length));
    }

    fn ledger_bytes(ledger: &TransactionLedger) -> Vec<u8> {
        let file = ledger.file.lock();
        let size = file.size().unwrap();
        file.read_at(0, size as usize).unwrap()
    }

    #[test]
    fn ledger_records_and_finds_commits() {
        let file = MemoryFile::with_data(FileVersionHeader::current(0).encode().to_vec());
        let ledger = TransactionLedger::open(Box::new(file)).unwrap();
        ledger.record_commit(TransactionId::new(3)).unwrap();
        ledger.record_commit(TransactionId::new(8)).unwrap();

        assert!(ledger.contains(TransactionId::new(3)).unwrap());
        assert!(ledger.contains(TransactionId::new(8)).unwrap());
        assert!(!ledger.contains(TransactionId::new(5)).unwrap());
        assert_eq!(
            ledger.committed().unwrap(),
            vec![TransactionId::new(3), TransactionId::new(8)]
        );
    }

    #[test]
    fn ledger_rejects_out_of_order_commits() {
        let file = MemoryFile::with_data(FileVersionHeader::current(0).encode().to_vec());
        let ledger = TransactionLedger::open(Box::new(file)).unwrap();
        ledger.record_commit(TransactionId::new(10)).unwrap();
        assert!(ledger.record_commit(TransactionId::new(10)).is_err());
        assert!(ledger.record_commit(TransactionId::new(4)).is_err());
    }

    #[test]
    fn ledger_survives_reopen() {
        let file = MemoryFile::with_data(FileVersionHeader::current(0).encode().to_vec());
        let data = {
            let ledger = TransactionLedger::open(Box::new(file)).unwrap();
            ledger.record_commit(TransactionId::new(2)).unwrap();
            ledger.record_commit(TransactionId::new(6)).unwrap();
            ledger_bytes(&ledger)
        };

        let reopened = TransactionLedger::open(Box::new(MemoryFile::with_data(data))).unwrap();
        assert_eq!(
            reopened.committed().unwrap(),
            vec![TransactionId::new(2), TransactionId::new(6)]
        );
        // Monotonicity carries across the reopen.
        assert!(reopened.record_commit(TransactionId::new(6)).is_err());
        reopened.record_commit(TransactionId::new(7)).unwrap();
    }

    #[test]
    fn ledger_drops_torn_trailing_id() {
        let file = MemoryFile::with_data(FileVersionHeader::current(0).encode().to_vec());
        let data = {
            let ledger = TransactionLedger::open(Box::new(file)).unwrap();
            ledger.record_commit(TransactionId::new(9)).unwrap();
            let mut data = ledger_bytes(&ledger);
            data.extend_from_slice(&[0x11, 0x22, 0x33]); // partial id
            data
        };
        let reopened = TransactionLedger::open(Box::new(MemoryFile::with_data(data))).unwrap();
        assert_eq!(reopened.committed().unwrap(), vec![TransactionId::new(9)]);
    }
}
