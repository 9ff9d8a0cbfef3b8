//! Write-ahead log (commit log).
//!
//! An append-only sequence of length-prefixed, checksummed records across
//! rotating segment files. Sequence numbers are global: they increase
//! monotonically for the lifetime of the database and survive rotation.
//!
//! ## Record layout (little-endian)
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ timestamp_us  u64   wall clock at append    │
//! │ type          u32   INSERT=1 UPDATE=2       │
//! │                     DELETE=3 CHECKPOINT=4   │
//! │                     COMMIT=5                │
//! │ sequence      u64   global, monotonic       │
//! │ checksum      u32   XOR fold, see below     │
//! │ data_length   u32   payload byte length     │
//! │ data          N bytes                       │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The checksum XORs the u32-truncated timestamp, type, u32-truncated
//! sequence, data_length, and every payload byte.
//!
//! Replay is robust: records failing the checksum are skipped with a
//! warning, and a partial record at the tail of the last segment (short
//! header or short payload) terminates the scan cleanly at the last
//! intact record.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::Vector;

/// Common prefix of WAL segment file names.
pub const LOG_FILE_PREFIX: &str = "commit.log.";

/// Fixed byte length of a record header.
const ENTRY_HEADER_SIZE: usize = 8 + 4 + 8 + 4 + 4;

/// Wall clock in microseconds since the Unix epoch.
pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Kind of a WAL record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum LogEntryType {
    /// New entry: key + vector + metadata payload.
    Insert = 1,
    /// Replaced entry: same payload shape as insert.
    Update = 2,
    /// Removed entry: key payload.
    Delete = 3,
    /// Snapshot marker: sequence + snapshot file name payload.
    Checkpoint = 4,
    /// Transaction marker with empty payload.
    Commit = 5,
}

impl LogEntryType {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Insert),
            2 => Some(Self::Update),
            3 => Some(Self::Delete),
            4 => Some(Self::Checkpoint),
            5 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// One decoded WAL record.
#[derive(Clone, Debug)]
pub struct LogEntry {
    /// Wall clock at append, microseconds.
    pub timestamp_us: u64,
    /// Record kind.
    pub entry_type: LogEntryType,
    /// Global sequence number.
    pub sequence: u64,
    /// Stored checksum.
    pub checksum: u32,
    /// Type-specific payload.
    pub data: Vec<u8>,
}

impl LogEntry {
    fn new(entry_type: LogEntryType, sequence: u64, data: Vec<u8>) -> Self {
        let mut entry = Self {
            timestamp_us: now_us(),
            entry_type,
            sequence,
            checksum: 0,
            data,
        };
        entry.checksum = entry.compute_checksum();
        entry
    }

    /// XOR fold over the u32-truncated header fields and payload bytes.
    fn compute_checksum(&self) -> u32 {
        let mut crc = 0u32;
        crc ^= self.timestamp_us as u32;
        crc ^= self.entry_type as u32;
        crc ^= self.sequence as u32;
        crc ^= self.data.len() as u32;
        for &byte in &self.data {
            crc ^= byte as u32;
        }
        crc
    }

    /// Whether the stored checksum matches the record contents.
    pub fn is_valid(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    fn encoded_len(&self) -> usize {
        ENTRY_HEADER_SIZE + self.data.len()
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.timestamp_us.to_le_bytes());
        buf.extend_from_slice(&(self.entry_type as u32).to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decodes one record at `*offset`, advancing it past the record.
    ///
    /// Returns `None` when fewer bytes remain than a complete record
    /// claims: the torn-tail condition that terminates a segment scan.
    /// A record with an unknown type is returned with `Commit` standing
    /// in and a failing checksum, so the caller's skip path handles it.
    fn decode(buf: &[u8], offset: &mut usize) -> Option<LogEntry> {
        let remaining = &buf[*offset..];
        if remaining.len() < ENTRY_HEADER_SIZE {
            return None;
        }

        let timestamp_us = LittleEndian::read_u64(&remaining[0..8]);
        let raw_type = LittleEndian::read_u32(&remaining[8..12]);
        let sequence = LittleEndian::read_u64(&remaining[12..20]);
        let checksum = LittleEndian::read_u32(&remaining[20..24]);
        let data_length = LittleEndian::read_u32(&remaining[24..28]) as usize;

        if remaining.len() < ENTRY_HEADER_SIZE + data_length {
            return None;
        }

        let data = remaining[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + data_length].to_vec();
        *offset += ENTRY_HEADER_SIZE + data_length;

        match LogEntryType::from_u32(raw_type) {
            Some(entry_type) => Some(LogEntry {
                timestamp_us,
                entry_type,
                sequence,
                checksum,
                data,
            }),
            None => Some(LogEntry {
                timestamp_us,
                entry_type: LogEntryType::Commit,
                sequence,
                // Inverted so the checksum fails and replay skips it.
                checksum: !checksum,
                data,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload codecs (inline strings, little-endian length prefixes)
// ---------------------------------------------------------------------------

/// Decoded INSERT/UPDATE payload.
#[derive(Clone, Debug, PartialEq)]
pub struct VectorRecord {
    /// Entry key.
    pub key: String,
    /// Entry vector.
    pub vector: Vector,
    /// Entry metadata, empty when none.
    pub metadata: String,
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn take_u32(buf: &[u8], offset: &mut usize) -> Option<u32> {
    if *offset + 4 > buf.len() {
        return None;
    }
    let v = LittleEndian::read_u32(&buf[*offset..*offset + 4]);
    *offset += 4;
    Some(v)
}

fn take_u64(buf: &[u8], offset: &mut usize) -> Option<u64> {
    if *offset + 8 > buf.len() {
        return None;
    }
    let v = LittleEndian::read_u64(&buf[*offset..*offset + 8]);
    *offset += 8;
    Some(v)
}

fn take_str(buf: &[u8], offset: &mut usize) -> Option<String> {
    let len = take_u32(buf, offset)? as usize;
    if *offset + len > buf.len() {
        return None;
    }
    let s = String::from_utf8_lossy(&buf[*offset..*offset + len]).into_owned();
    *offset += len;
    Some(s)
}

/// Encodes `key_len · key · dims · dims×f32 · meta_len · meta`.
pub fn encode_vector_record(key: &str, vector: &Vector, metadata: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len() + 4 + vector.len() * 4 + 4 + metadata.len());
    put_str(&mut buf, key);
    buf.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    for x in vector.as_slice() {
        buf.extend_from_slice(&x.to_le_bytes());
    }
    put_str(&mut buf, metadata);
    buf
}

/// Decodes an INSERT/UPDATE payload; `None` on truncation.
pub fn decode_vector_record(data: &[u8]) -> Option<VectorRecord> {
    let mut offset = 0;
    let key = take_str(data, &mut offset)?;
    let dims = take_u32(data, &mut offset)? as usize;
    if offset + dims * 4 > data.len() {
        return None;
    }
    let mut components = Vec::with_capacity(dims);
    for _ in 0..dims {
        components.push(f32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]));
        offset += 4;
    }
    let metadata = take_str(data, &mut offset)?;
    Some(VectorRecord {
        key,
        vector: Vector::from(components),
        metadata,
    })
}

/// Encodes a DELETE payload: `key_len · key`.
pub fn encode_delete_record(key: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len());
    put_str(&mut buf, key);
    buf
}

/// Decodes a DELETE payload; `None` on truncation.
pub fn decode_delete_record(data: &[u8]) -> Option<String> {
    let mut offset = 0;
    take_str(data, &mut offset)
}

/// Encodes a CHECKPOINT payload:
/// `checkpoint_sequence · file_len · file bytes`.
pub fn encode_checkpoint_record(checkpoint_sequence: u64, snapshot_file: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + 4 + snapshot_file.len());
    buf.extend_from_slice(&checkpoint_sequence.to_le_bytes());
    put_str(&mut buf, snapshot_file);
    buf
}

/// Decodes a CHECKPOINT payload; `None` on truncation.
pub fn decode_checkpoint_record(data: &[u8]) -> Option<(u64, String)> {
    let mut offset = 0;
    let sequence = take_u64(data, &mut offset)?;
    let file = take_str(data, &mut offset)?;
    Some((sequence, file))
}

// ---------------------------------------------------------------------------
// CommitLog
// ---------------------------------------------------------------------------

/// Counters describing the log.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct WalStats {
    /// Records written since open.
    pub total_entries: u64,
    /// Bytes written since open.
    pub total_bytes: u64,
    /// Sequence the next append will receive.
    pub next_sequence: u64,
    /// Byte length of the active segment.
    pub current_log_size: u64,
}

/// Append-only commit log with rotation and robust replay.
pub struct CommitLog {
    log_dir: PathBuf,
    max_log_size: u64,
    max_log_files: usize,
    file: BufWriter<File>,
    current_path: PathBuf,
    next_sequence: u64,
    current_log_size: u64,
    total_entries: u64,
    total_bytes: u64,
    // Test hook: Some(n) fails the append after n more succeed.
    fail_appends_after: Option<u64>,
}

impl CommitLog {
    /// Opens the log in `log_dir`, creating the directory if needed.
    ///
    /// If segments already exist, appending resumes on the newest one and
    /// the next sequence continues after the highest intact record; the
    /// sequence is monotonic for the lifetime of the database.
    pub fn open(
        log_dir: impl Into<PathBuf>,
        max_log_size: u64,
        max_log_files: usize,
    ) -> Result<Self> {
        let log_dir = log_dir.into();
        fs::create_dir_all(&log_dir)?;

        let segments = Self::list_segments(&log_dir)?;
        let (current_path, next_sequence) = match segments.last() {
            Some(latest) => {
                let mut max_seq = 0u64;
                for segment in &segments {
                    for entry in Self::read_segment(segment)? {
                        if entry.is_valid() {
                            max_seq = max_seq.max(entry.sequence);
                        }
                    }
                }
                // A freshly rotated segment can be empty; its name still
                // records the sequence it was opened at, which floors the
                // resume point so numbering never runs backwards.
                let opened_at = Self::parse_segment_sequence(latest).unwrap_or(1);
                let next = (max_seq + 1).max(opened_at);
                debug!(
                    segment = %latest.display(),
                    resume_sequence = next,
                    "resuming existing WAL segment"
                );
                (latest.clone(), next)
            }
            None => (log_dir.join(Self::segment_name(1)), 1),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&current_path)?;
        let current_log_size = file.metadata()?.len();

        Ok(Self {
            log_dir,
            max_log_size,
            max_log_files,
            file: BufWriter::new(file),
            current_path,
            next_sequence,
            current_log_size,
            total_entries: 0,
            total_bytes: 0,
            fail_appends_after: None,
        })
    }

    fn segment_name(sequence: u64) -> String {
        format!("{LOG_FILE_PREFIX}{sequence:06}")
    }

    /// Sequence a segment was opened at, parsed from its file name.
    fn parse_segment_sequence(path: &Path) -> Option<u64> {
        path.file_name()?
            .to_string_lossy()
            .strip_prefix(LOG_FILE_PREFIX)?
            .parse()
            .ok()
    }

    /// All segment paths in the directory, sorted by name (and therefore
    /// by opening sequence).
    pub fn list_segments(log_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut segments = Vec::new();
        if !log_dir.exists() {
            return Ok(segments);
        }
        for entry in fs::read_dir(log_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(LOG_FILE_PREFIX) {
                segments.push(entry.path());
            }
        }
        segments.sort();
        Ok(segments)
    }

    fn read_segment(path: &Path) -> Result<Vec<LogEntry>> {
        let buf = fs::read(path)?;
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < buf.len() {
            match LogEntry::decode(&buf, &mut offset) {
                Some(entry) => entries.push(entry),
                // Torn tail: stop at the last intact record.
                None => break,
            }
        }
        Ok(entries)
    }

    fn append(&mut self, entry_type: LogEntryType, data: Vec<u8>) -> Result<u64> {
        if let Some(remaining) = self.fail_appends_after.as_mut() {
            if *remaining == 0 {
                return Err(std::io::Error::other("injected WAL append failure").into());
            }
            *remaining -= 1;
        }

        let entry = LogEntry::new(entry_type, self.next_sequence, data);
        let encoded = entry.encode();

        self.file.write_all(&encoded)?;
        self.file.flush()?;

        self.next_sequence += 1;
        self.current_log_size += encoded.len() as u64;
        self.total_entries += 1;
        self.total_bytes += encoded.len() as u64;

        if self.current_log_size >= self.max_log_size {
            self.rotate()?;
        }

        Ok(entry.sequence)
    }

    /// Appends an INSERT record, returning its sequence.
    pub fn append_insert(&mut self, key: &str, vector: &Vector, metadata: &str) -> Result<u64> {
        self.append(LogEntryType::Insert, encode_vector_record(key, vector, metadata))
    }

    /// Appends an UPDATE record, returning its sequence.
    pub fn append_update(&mut self, key: &str, vector: &Vector, metadata: &str) -> Result<u64> {
        self.append(LogEntryType::Update, encode_vector_record(key, vector, metadata))
    }

    /// Appends a DELETE record, returning its sequence.
    pub fn append_delete(&mut self, key: &str) -> Result<u64> {
        self.append(LogEntryType::Delete, encode_delete_record(key))
    }

    /// Appends a CHECKPOINT record marking a snapshot on disk.
    pub fn append_checkpoint(
        &mut self,
        checkpoint_sequence: u64,
        snapshot_file: &str,
    ) -> Result<u64> {
        self.append(
            LogEntryType::Checkpoint,
            encode_checkpoint_record(checkpoint_sequence, snapshot_file),
        )
    }

    /// Appends an empty COMMIT marker.
    pub fn append_commit(&mut self) -> Result<u64> {
        self.append(LogEntryType::Commit, Vec::new())
    }

    /// Flushes buffered bytes and fsyncs the active segment.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Opens a fresh segment named after the next sequence. The global
    /// sequence continues uninterrupted; only the file changes.
    pub fn rotate(&mut self) -> Result<()> {
        self.file.flush()?;

        let path = self.log_dir.join(Self::segment_name(self.next_sequence));
        if path == self.current_path {
            // Nothing appended since the segment opened.
            return Ok(());
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(segment = %path.display(), "rotated WAL segment");
        self.file = BufWriter::new(file);
        self.current_path = path;
        self.current_log_size = 0;

        self.cleanup_old_logs()?;
        Ok(())
    }

    /// Removes the oldest segments beyond `max_log_files`.
    pub fn cleanup_old_logs(&self) -> Result<()> {
        let segments = Self::list_segments(&self.log_dir)?;
        if segments.len() <= self.max_log_files {
            return Ok(());
        }
        for stale in &segments[..segments.len() - self.max_log_files] {
            if stale != &self.current_path {
                debug!(segment = %stale.display(), "removing old WAL segment");
                fs::remove_file(stale)?;
            }
        }
        Ok(())
    }

    /// Removes every segment except the active one. Called after a
    /// snapshot commits, when older segments are fully superseded.
    pub fn retain_only_current(&self) -> Result<()> {
        for segment in Self::list_segments(&self.log_dir)? {
            if segment != self.current_path {
                debug!(segment = %segment.display(), "removing superseded WAL segment");
                fs::remove_file(segment)?;
            }
        }
        Ok(())
    }

    /// Reads every record with `sequence >= since` across all segments in
    /// sequence order.
    ///
    /// When `validate` is set, records failing the checksum are skipped
    /// with a warning, never an error. A torn tail terminates its
    /// segment's scan cleanly.
    pub fn read_entries_since(&self, since: u64, validate: bool) -> Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        for segment in Self::list_segments(&self.log_dir)? {
            for entry in Self::read_segment(&segment)? {
                if validate && !entry.is_valid() {
                    warn!(
                        segment = %segment.display(),
                        sequence = entry.sequence,
                        "skipping WAL record with bad checksum"
                    );
                    continue;
                }
                if entry.sequence >= since {
                    out.push(entry);
                }
            }
        }
        out.sort_by_key(|e| e.sequence);
        Ok(out)
    }

    /// Reads every record across all segments.
    pub fn read_all_entries(&self, validate: bool) -> Result<Vec<LogEntry>> {
        self.read_entries_since(0, validate)
    }

    /// The most recent CHECKPOINT record, if any segment holds one.
    pub fn find_latest_checkpoint(&self) -> Result<Option<LogEntry>> {
        Ok(self
            .read_all_entries(true)?
            .into_iter()
            .rev()
            .find(|e| e.entry_type == LogEntryType::Checkpoint))
    }

    /// Hard reset: deletes every segment and reopens as segment 000001
    /// with the sequence restarted at 1.
    pub fn reset(&mut self) -> Result<()> {
        self.file.flush()?;
        for segment in Self::list_segments(&self.log_dir)? {
            fs::remove_file(segment)?;
        }

        let path = self.log_dir.join(Self::segment_name(1));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.file = BufWriter::new(file);
        self.current_path = path;
        self.next_sequence = 1;
        self.current_log_size = 0;
        self.total_entries = 0;
        self.total_bytes = 0;
        Ok(())
    }

    /// Snapshot of the log counters.
    pub fn stats(&self) -> WalStats {
        WalStats {
            total_entries: self.total_entries,
            total_bytes: self.total_bytes,
            next_sequence: self.next_sequence,
            current_log_size: self.current_log_size,
        }
    }

    /// Path of the active segment.
    pub fn current_path(&self) -> &Path {
        &self.current_path
    }

    /// Allows `n` more appends to succeed, then fails each one with an
    /// I/O error. Test-only fault injection.
    #[doc(hidden)]
    pub fn fail_appends_after(&mut self, n: u64) {
        self.fail_appends_after = Some(n);
    }
}

impl std::fmt::Debug for CommitLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitLog")
            .field("log_dir", &self.log_dir)
            .field("current_path", &self.current_path)
            .field("next_sequence", &self.next_sequence)
            .field("current_log_size", &self.current_log_size)
            .finish_non_exhaustive()
    }
}
