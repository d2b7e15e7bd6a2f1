//! Engine counters and the XRT statistics side file.
//!
//! The XRT file is an append-only sequence of XML-like elements, each
//! followed by a terminator marker. Updates never rewrite earlier
//! elements; readers scan forward and keep the last value seen per
//! field, so a torn trailing element (no terminator) is simply ignored.

use crate::error::{CoreError, CoreResult};
use keeldb_storage::RandomAccessFile;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime operation counters for one table.
///
/// All counters are monotonic and lock-free; snapshots are not atomic
/// across fields.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Key writes applied.
    pub writes: AtomicU64,
    /// Key deletes applied.
    pub deletes: AtomicU64,
    /// Segment refills from disk after a purge.
    pub refills: AtomicU64,
    /// Segments purged from the cache.
    pub purges: AtomicU64,
    /// Delta blocks written.
    pub delta_writes: AtomicU64,
    /// Full segment rebuilds written.
    pub rebuilds: AtomicU64,
    /// Segment merges performed.
    pub merges: AtomicU64,
    /// Segment splits performed.
    pub splits: AtomicU64,
    /// Writer pace waits taken under memory pressure.
    pub pace_waits: AtomicU64,
}

impl EngineStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumps a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads a counter.
    #[must_use]
    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// One XRT statistics element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XrtRecord {
    /// Total storage bytes across the table's files.
    pub size: u64,
    /// Dead entries across index files.
    pub key_fragments: u64,
    /// Dead entries across value files.
    pub value_fragments: u64,
    /// Measured value-compression saving, as a percentage.
    pub compression_percent: u32,
    /// Whether the stored payloads qualify for compression.
    pub compression_qualified: bool,
}

const XRT_OPEN: &str = "<statistics>";
const XRT_CLOSE: &str = "</statistics>";
const XRT_TERMINATOR: &str = "<end/>";

fn element(tag: &str, value: &str) -> String {
    format!("  <{tag}>{value}</{tag}>\n")
}

/// Appends one statistics element and its terminator.
///
/// # Errors
///
/// Returns an error when the append or flush fails.
pub fn append_record(file: &mut dyn RandomAccessFile, record: &XrtRecord) -> CoreResult<()> {
    let mut body = String::new();
    body.push_str(XRT_OPEN);
    body.push('\n');
    body.push_str(&element("size", &record.size.to_string()));
    body.push_str(&element("keyFragments", &record.key_fragments.to_string()));
    body.push_str(&element("valueFragments", &record.value_fragments.to_string()));
    body.push_str(&element(
        "compressionPercent",
        &record.compression_percent.to_string(),
    ));
    body.push_str(&element(
        "compressionQualified",
        if record.compression_qualified { "true" } else { "false" },
    ));
    body.push_str(XRT_CLOSE);
    body.push('\n');
    body.push_str(XRT_TERMINATOR);
    body.push('\n');

    file.append(body.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn field<'a>(block: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = block.find(&open)? + open.len();
    let end = block[start..].find(&close)? + start;
    Some(block[start..end].trim())
}

/// Reads the effective statistics: forward scan, last value per field
/// wins.
///
/// Returns the default record for an empty or brand-new file. A trailing
/// element with no terminator is skipped, not an error.
///
/// # Errors
///
/// Returns an error when the file cannot be read or no terminated
/// element parses.
pub fn read_latest(file: &dyn RandomAccessFile) -> CoreResult<XrtRecord> {
    let size = file.size()?;
    if size == 0 {
        return Ok(XrtRecord::default());
    }
    let bytes = file.read_at(0, size as usize)?;
    let text = String::from_utf8_lossy(&bytes);

    let mut record = XrtRecord::default();
    let mut terminated_blocks = 0usize;
    let mut parse_failures = 0usize;

    let mut rest: &str = &text;
    while let Some(end) = rest.find(XRT_TERMINATOR) {
        let block = &rest[..end];
        rest = &rest[end + XRT_TERMINATOR.len()..];
        if !block.contains(XRT_OPEN) {
            parse_failures += 1;
            continue;
        }
        terminated_blocks += 1;
        if let Some(v) = field(block, "size").and_then(|v| v.parse().ok()) {
            record.size = v;
        }
        if let Some(v) = field(block, "keyFragments").and_then(|v| v.parse().ok()) {
            record.key_fragments = v;
        }
        if let Some(v) = field(block, "valueFragments").and_then(|v| v.parse().ok()) {
            record.value_fragments = v;
        }
        if let Some(v) = field(block, "compressionPercent").and_then(|v| v.parse().ok()) {
            record.compression_percent = v;
        }
        if let Some(v) = field(block, "compressionQualified") {
            record.compression_qualified = v == "true";
        }
    }

    if terminated_blocks == 0 {
        if parse_failures > 0 {
            return Err(CoreError::invalid_format(
                "statistics file holds no parseable element",
            ));
        }
        // Only an unterminated tail: treat as never written.
        tracing::debug!("statistics file ends in an unterminated element");
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeldb_storage::MemoryFile;

    fn record(size: u64, value_fragments: u64) -> XrtRecord {
        XrtRecord {
            size,
            key_fragments: 1,
            value_fragments,
            compression_percent: 40,
            compression_qualified: true,
        }
    }

    #[test]
    fn round_trip_single_element() {
        let mut file = MemoryFile::new();
        let written = record(1000, 5);
        append_record(&mut file, &written).unwrap();
        assert_eq!(read_latest(&file).unwrap(), written);
    }

    #[test]
    fn last_value_wins_across_appends() {
        let mut file = MemoryFile::new();
        append_record(&mut file, &record(1000, 5)).unwrap();
        append_record(&mut file, &record(2000, 9)).unwrap();
        let latest = read_latest(&file).unwrap();
        assert_eq!(latest.size, 2000);
        assert_eq!(latest.value_fragments, 9);
    }

    #[test]
    fn unterminated_tail_is_ignored() {
        let mut file = MemoryFile::new();
        append_record(&mut file, &record(1000, 5)).unwrap();
        // A torn append: element without terminator.
        file.append(b"<statistics>\n  <size>9999</size>\n").unwrap();
        let latest = read_latest(&file).unwrap();
        assert_eq!(latest.size, 1000);
    }

    #[test]
    fn empty_file_reads_default() {
        let file = MemoryFile::new();
        assert_eq!(read_latest(&file).unwrap(), XrtRecord::default());
    }

    #[test]
    fn partial_element_keeps_earlier_fields() {
        let mut file = MemoryFile::new();
        append_record(&mut file, &record(1000, 5)).unwrap();
        // A later element updating only the size.
        file.append(b"<statistics>\n  <size>3000</size>\n</statistics>\n<end/>\n")
            .unwrap();
        let latest = read_latest(&file).unwrap();
        assert_eq!(latest.size, 3000);
        assert_eq!(latest.value_fragments, 5);
    }

    #[test]
    fn counters_bump_and_read() {
        let stats = EngineStats::new();
        EngineStats::bump(&stats.writes);
        EngineStats::bump(&stats.writes);
        EngineStats::bump(&stats.purges);
        assert_eq!(EngineStats::read(&stats.writes), 2);
        assert_eq!(EngineStats::read(&stats.purges), 1);
        assert_eq!(EngineStats::read(&stats.deletes), 0);
    }
}
