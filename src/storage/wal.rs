//! Write-ahead log.
//!
//! One append-only file per node, holding CRC-protected framed records:
//!
//! ```text
//! [crc:u32 le][op:u8][key_len:u16 le][payload_len:u32 le][key][payload]
//! ```
//!
//! The CRC is reflected CRC-32 (polynomial 0xEDB88320) over
//! `op ‖ key ‖ payload`. A BATCH record carries inner records in its payload
//! (`[count:u32] {[op:u8][klen:u16][key][vlen:u32][val]}×count`) and is
//! replayed atomically: either every inner record is delivered to the
//! recovery callback or none is.
//!
//! Appends go to a large user-space buffer and never wait for the disk;
//! durability comes from buffered writes plus an explicit [`WriteAheadLog::flush`]
//! at shutdown. Recovery runs once, at open, before the writer is armed, and
//! stops cleanly at the first truncated or corrupt record.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// User-space write buffer size (20 MiB).
const WRITE_BUFFER_CAPACITY: usize = 20 * 1024 * 1024;

/// Read buffer size used during recovery (10 MiB).
const READ_BUFFER_CAPACITY: usize = 10 * 1024 * 1024;

/// Framed record header length: crc + op + key_len + payload_len.
const HEADER_LEN: usize = 4 + 1 + 2 + 4;

/// WAL operation codes.
///
/// The numeric values are part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalOp {
    /// Full-value write.
    Put = 1,
    /// In-place integer field patch; payload is `field ":" decimal`.
    PatchI64 = 2,
    /// Tombstone write; payload is empty.
    Delete = 3,
    /// Container for an atomic group of inner records.
    Batch = 4,
    /// In-place string field patch; payload is `field ":" value`.
    PatchStr = 5,
}

impl WalOp {
    /// Decode an op byte; `None` for unknown codes.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Put),
            2 => Some(Self::PatchI64),
            3 => Some(Self::Delete),
            4 => Some(Self::Batch),
            5 => Some(Self::PatchStr),
            _ => None,
        }
    }
}

/// One operation inside a batch append.
#[derive(Debug, Clone)]
pub struct BatchOp {
    pub op: WalOp,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl BatchOp {
    /// Convenience constructor for a PUT.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            op: WalOp::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    /// Convenience constructor for a DELETE (empty payload).
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: WalOp::Delete,
            key: key.into(),
            value: Vec::new(),
        }
    }

    /// Convenience constructor for an integer patch.
    pub fn patch_i64(key: impl Into<Vec<u8>>, field: &str, value: i64) -> Self {
        Self {
            op: WalOp::PatchI64,
            key: key.into(),
            value: format!("{field}:{value}").into_bytes(),
        }
    }

    /// Convenience constructor for a string patch.
    pub fn patch_str(key: impl Into<Vec<u8>>, field: &str, value: &str) -> Self {
        Self {
            op: WalOp::PatchStr,
            key: key.into(),
            value: format!("{field}:{value}").into_bytes(),
        }
    }
}

/// Append/flush counters surfaced to the status output.
#[derive(Debug, Default)]
pub struct WalStats {
    records_appended: AtomicU64,
    batches_appended: AtomicU64,
    bytes_appended: AtomicU64,
    flushes: AtomicU64,
    recovered_records: AtomicU64,
}

/// Point-in-time copy of [`WalStats`].
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct WalStatsSnapshot {
    pub records_appended: u64,
    pub batches_appended: u64,
    pub bytes_appended: u64,
    pub flushes: u64,
    pub recovered_records: u64,
}

impl WalStats {
    fn snapshot(&self) -> WalStatsSnapshot {
        WalStatsSnapshot {
            records_appended: self.records_appended.load(Ordering::Relaxed),
            batches_appended: self.batches_appended.load(Ordering::Relaxed),
            bytes_appended: self.bytes_appended.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            recovered_records: self.recovered_records.load(Ordering::Relaxed),
        }
    }
}

/// Compute the record CRC over `op ‖ key ‖ payload`.
pub fn record_crc(op: u8, key: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[op]);
    hasher.update(key);
    hasher.update(payload);
    hasher.finalize()
}

/// Append-only write-ahead log over a single file.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    stats: WalStats,
}

impl WriteAheadLog {
    /// Open (or create) the log at `path`, replaying every intact record
    /// through `on_record` before arming the writer.
    ///
    /// The file is locked exclusively for the lifetime of the returned
    /// value; opening the same WAL from a second engine is a fatal error.
    pub fn open<P, F>(path: P, mut on_record: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnMut(WalOp, &[u8], &[u8]),
    {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("failed to open wal file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            bail!(
                "wal file {} is locked by another engine instance",
                path.display()
            );
        }

        let stats = WalStats::default();

        let read_handle = file
            .try_clone()
            .with_context(|| format!("failed to clone wal handle for {}", path.display()))?;
        let mut reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, read_handle);
        let recovered = replay_records(&mut reader, &mut on_record);
        stats.recovered_records.store(recovered, Ordering::Relaxed);
        info!(path = %path.display(), records = recovered, "wal recovery complete");

        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, file)),
            stats,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a single record. Buffered; never fsyncs.
    pub fn append(&self, op: WalOp, key: &[u8], payload: &[u8]) -> io::Result<()> {
        let crc = record_crc(op as u8, key, payload);

        let mut writer = self.writer.lock();
        writer.write_all(&crc.to_le_bytes())?;
        writer.write_all(&[op as u8])?;
        writer.write_all(&(key.len() as u16).to_le_bytes())?;
        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(key)?;
        writer.write_all(payload)?;
        drop(writer);

        self.stats.records_appended.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_appended
            .fetch_add((HEADER_LEN + key.len() + payload.len()) as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Append a group of operations as one atomic BATCH record.
    pub fn append_batch(&self, ops: &[BatchOp]) -> io::Result<()> {
        let mut payload_len = 4;
        for op in ops {
            payload_len += 1 + 2 + op.key.len() + 4 + op.value.len();
        }

        let mut payload = Vec::with_capacity(payload_len);
        payload.extend_from_slice(&(ops.len() as u32).to_le_bytes());
        for op in ops {
            payload.push(op.op as u8);
            payload.extend_from_slice(&(op.key.len() as u16).to_le_bytes());
            payload.extend_from_slice(&op.key);
            payload.extend_from_slice(&(op.value.len() as u32).to_le_bytes());
            payload.extend_from_slice(&op.value);
        }

        self.append(WalOp::Batch, b"", &payload)?;
        self.stats.batches_appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drain the user-space buffer and ask the kernel to sync.
    pub fn flush(&self) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_data()?;
        drop(writer);
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current counters.
    pub fn stats(&self) -> WalStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        let mut writer = self.writer.lock();
        if let Err(e) = writer.flush().and_then(|_| writer.get_ref().sync_data()) {
            warn!(path = %self.path.display(), error = %e, "wal flush on drop failed");
        }
    }
}

/// Read `buf.len()` bytes, tolerating EOF. Returns the number of bytes read.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Stream records out of `reader`, delivering each intact one to `on_record`.
///
/// Stops at clean EOF, on a truncated record, or on the first CRC mismatch;
/// earlier records are unaffected. BATCH records are buffered and delivered
/// only when the whole batch decodes, so a batch cut short by a crash
/// contributes nothing. Returns the number of records delivered.
pub fn replay_records<R, F>(reader: &mut R, on_record: &mut F) -> u64
where
    R: Read,
    F: FnMut(WalOp, &[u8], &[u8]),
{
    let mut delivered = 0u64;
    let mut offset = 0u64;

    loop {
        let mut header = [0u8; HEADER_LEN];
        match read_fully(reader, &mut header) {
            // EOF at or inside a header is the normal end of the log.
            Ok(n) if n < HEADER_LEN => break,
            Ok(_) => {}
            Err(e) => {
                warn!(offset, error = %e, "wal read error; stopping recovery");
                break;
            }
        }

        let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let op_byte = header[4];
        let key_len = u16::from_le_bytes([header[5], header[6]]) as usize;
        let payload_len =
            u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let mut key = vec![0u8; key_len];
        match read_fully(reader, &mut key) {
            Ok(n) if n == key_len => {}
            Ok(_) => {
                warn!(offset, "truncated wal record key; stopping recovery");
                break;
            }
            Err(e) => {
                warn!(offset, error = %e, "wal read error; stopping recovery");
                break;
            }
        }

        let mut payload = vec![0u8; payload_len];
        match read_fully(reader, &mut payload) {
            Ok(n) if n == payload_len => {}
            Ok(_) => {
                warn!(offset, "truncated wal record payload; stopping recovery");
                break;
            }
            Err(e) => {
                warn!(offset, error = %e, "wal read error; stopping recovery");
                break;
            }
        }

        if record_crc(op_byte, &key, &payload) != crc {
            warn!(offset, "corrupt wal record (crc mismatch); stopping recovery");
            break;
        }

        offset += (HEADER_LEN + key_len + payload_len) as u64;

        let op = match WalOp::from_u8(op_byte) {
            Some(op) => op,
            None => {
                warn!(offset, op = op_byte, "unknown wal op code; skipping record");
                continue;
            }
        };

        if op == WalOp::Batch {
            match decode_batch(&payload) {
                Some(inner) => {
                    for (inner_op, inner_key, inner_value) in inner {
                        on_record(inner_op, inner_key, inner_value);
                        delivered += 1;
                    }
                }
                None => {
                    warn!(offset, "malformed wal batch payload; stopping recovery");
                    break;
                }
            }
        } else {
            on_record(op, &key, &payload);
            delivered += 1;
        }
    }

    debug!(offset, delivered, "wal replay finished");
    delivered
}

/// Decode a batch payload into its inner records.
///
/// Returns `None` unless every declared inner record decodes, preserving
/// batch atomicity on replay.
fn decode_batch(payload: &[u8]) -> Option<Vec<(WalOp, &[u8], &[u8])>> {
    if payload.len() < 4 {
        return None;
    }
    let count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    let mut pos = 4;
    let mut inner = Vec::with_capacity(count);

    for _ in 0..count {
        if pos + 1 > payload.len() {
            return None;
        }
        let op = WalOp::from_u8(payload[pos])?;
        pos += 1;

        if pos + 2 > payload.len() {
            return None;
        }
        let klen = u16::from_le_bytes([payload[pos], payload[pos + 1]]) as usize;
        pos += 2;
        if pos + klen > payload.len() {
            return None;
        }
        let key = &payload[pos..pos + klen];
        pos += klen;

        if pos + 4 > payload.len() {
            return None;
        }
        let vlen = u32::from_le_bytes([
            payload[pos],
            payload[pos + 1],
            payload[pos + 2],
            payload[pos + 3],
        ]) as usize;
        pos += 4;
        if pos + vlen > payload.len() {
            return None;
        }
        let value = &payload[pos..pos + vlen];
        pos += vlen;

        inner.push((op, key, value));
    }

    Some(inner)
}

/// Summary of an offline scan, for the `inspect-wal` command.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ScanSummary {
    pub records: u64,
    pub batches: u64,
    pub bytes: u64,
    pub stopped_early: bool,
}

/// Scan a WAL file read-only without taking the writer lock, reporting each
/// top-level record to `on_record` as `(op, key, payload, crc_ok)`.
pub fn scan_file<P, F>(path: P, mut on_record: F) -> Result<ScanSummary>
where
    P: AsRef<Path>,
    F: FnMut(u8, &[u8], &[u8], bool),
{
    let file = File::open(path.as_ref())
        .with_context(|| format!("failed to open wal file {}", path.as_ref().display()))?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, file);
    let mut summary = ScanSummary::default();

    loop {
        let mut header = [0u8; HEADER_LEN];
        match read_fully(&mut reader, &mut header) {
            Ok(0) => break,
            Ok(n) if n < HEADER_LEN => {
                summary.stopped_early = true;
                break;
            }
            Ok(_) => {}
            Err(e) => return Err(e).context("wal read error"),
        }

        let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let op = header[4];
        let key_len = u16::from_le_bytes([header[5], header[6]]) as usize;
        let payload_len =
            u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let mut key = vec![0u8; key_len];
        let mut payload = vec![0u8; payload_len];
        let key_read = read_fully(&mut reader, &mut key).context("wal read error")?;
        let payload_read = read_fully(&mut reader, &mut payload).context("wal read error")?;
        if key_read < key_len || payload_read < payload_len {
            summary.stopped_early = true;
            break;
        }

        let crc_ok = record_crc(op, &key, &payload) == crc;
        on_record(op, &key, &payload, crc_ok);

        summary.records += 1;
        summary.bytes += (HEADER_LEN + key_len + payload_len) as u64;
        if op == WalOp::Batch as u8 {
            summary.batches += 1;
        }
        if !crc_ok {
            summary.stopped_early = true;
            break;
        }
    }

    Ok(summary)
}
