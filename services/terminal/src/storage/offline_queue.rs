//! Durable offline queue for attendance records.
//!
//! # Log format
//! One JSON object per line: `{"type":"rfid","id":"04A1B2","timestamp":"..."}`.
//! Appends are flushed with `sync_data` before returning.
//!
//! # Compaction
//! Removing a committed prefix streams the remaining records to the temp log,
//! `sync_all`s it, then renames it over the live log. A crash before the
//! rename leaves the old log intact (the stale temp log is discarded at the
//! next open); a crash after it leaves the new log. The live log is never
//! truncated in place.
//!
//! # Degraded mode
//! If the log cannot be opened or written, records go to a bounded in-memory
//! ring (oldest dropped when full). Ring records are always newer than
//! durable ones; while the ring is non-empty every enqueue goes to it too, so
//! draining durable-then-ring keeps FIFO order.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use at_protocol::AttendanceRecord;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{StorageError, StorageMode};
use crate::config::QueueConfig;

// ---------------------------------------------------------------------------
// DurableLog
// ---------------------------------------------------------------------------

/// The append-only record log plus its compaction temp file.
#[derive(Debug)]
pub struct DurableLog {
    log_path: PathBuf,
    temp_path: PathBuf,
    len: usize,
}

/// A compaction whose new log is fully written and synced but not yet
/// swapped in. Dropping it without [`DurableLog::swap_in`] is equivalent to a
/// crash before the rename.
#[derive(Debug)]
#[must_use]
pub struct StagedCompaction {
    remaining: usize,
}

impl StagedCompaction {
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl DurableLog {
    /// Open (or create) the log. Discards a leftover temp log and terminates
    /// a torn final line so later appends start on a fresh line.
    pub fn open(log_path: &Path, temp_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        if temp_path.exists() {
            warn!(path = %temp_path.display(), "discarding interrupted compaction");
            std::fs::remove_file(temp_path).map_err(|e| StorageError::io(temp_path, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(log_path)
            .map_err(|e| StorageError::io(log_path, e))?;
        terminate_torn_line(&mut file).map_err(|e| StorageError::io(log_path, e))?;

        let mut log = DurableLog {
            log_path: log_path.to_path_buf(),
            temp_path: temp_path.to_path_buf(),
            len: 0,
        };
        let mut len = 0;
        for record in log.records()? {
            record?;
            len += 1;
        }
        log.len = len;
        debug!(path = %log_path.display(), records = log.len, "offline log opened");
        Ok(log)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    pub fn append(&mut self, record: &AttendanceRecord) -> Result<(), StorageError> {
        let line = encode_line(record)?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.log_path)
            .map_err(|e| self.io_err(e))?;
        file.write_all(&line).map_err(|e| self.io_err(e))?;
        file.sync_data().map_err(|e| self.io_err(e))?;
        self.len += 1;
        Ok(())
    }

    /// Up to `max` oldest records, without removing them. Reading stops at
    /// `max`.
    pub fn peek(&self, max: usize) -> Result<Vec<AttendanceRecord>, StorageError> {
        self.records()?.take(max).collect()
    }

    /// Write every record after the first `count` to the temp log and sync it.
    /// Records are streamed through, one line at a time.
    pub fn stage_compaction(&self, count: usize) -> Result<StagedCompaction, StorageError> {
        let temp_err = |e: std::io::Error| StorageError::io(&self.temp_path, e);
        let temp = File::create(&self.temp_path).map_err(temp_err)?;
        let mut writer = BufWriter::new(temp);
        let mut remaining = 0;
        for (index, record) in self.records()?.enumerate() {
            let record = record?;
            if index < count {
                continue;
            }
            writer.write_all(&encode_line(&record)?).map_err(temp_err)?;
            remaining += 1;
        }
        let temp = writer
            .into_inner()
            .map_err(|e| temp_err(e.into_error()))?;
        temp.sync_all().map_err(temp_err)?;

        Ok(StagedCompaction { remaining })
    }

    /// Atomically replace the live log with a staged one.
    pub fn swap_in(&mut self, staged: StagedCompaction) -> Result<(), StorageError> {
        std::fs::rename(&self.temp_path, &self.log_path).map_err(|e| self.io_err(e))?;
        sync_parent_dir(&self.log_path);
        self.len = staged.remaining;
        Ok(())
    }

    /// Remove the first `count` records.
    pub fn compact(&mut self, count: usize) -> Result<(), StorageError> {
        if count == 0 {
            return Ok(());
        }
        let staged = self.stage_compaction(count)?;
        self.swap_in(staged)
    }

    /// Remove every record.
    pub fn clear(&mut self) -> Result<(), StorageError> {
        let staged = self.stage_compaction(usize::MAX)?;
        self.swap_in(staged)
    }

    fn records(&self) -> Result<RecordReader<'_>, StorageError> {
        let file = File::open(&self.log_path).map_err(|e| self.io_err(e))?;
        Ok(RecordReader {
            path: &self.log_path,
            reader: BufReader::new(file),
            line: Vec::new(),
            lineno: 0,
        })
    }

    fn io_err(&self, e: std::io::Error) -> StorageError {
        StorageError::io(&self.log_path, e)
    }
}

/// Decoded records of a log, oldest first. Lines that do not decode are
/// skipped with a warning; that covers torn appends, including ones cut
/// inside a multi-byte character.
struct RecordReader<'a> {
    path: &'a Path,
    reader: BufReader<File>,
    line: Vec<u8>,
    lineno: usize,
}

impl Iterator for RecordReader<'_> {
    type Item = Result<AttendanceRecord, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line.clear();
            match self.reader.read_until(b'\n', &mut self.line) {
                Ok(0) => return None,
                Ok(_) => self.lineno += 1,
                Err(e) => return Some(Err(StorageError::io(self.path, e))),
            }
            let line = self.line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<AttendanceRecord>(line) {
                Ok(record) => return Some(Ok(record)),
                Err(e) => {
                    warn!(line = self.lineno, error = %e, "skipping malformed offline record");
                }
            }
        }
    }
}

fn encode_line(record: &AttendanceRecord) -> Result<Vec<u8>, StorageError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

fn terminate_torn_line(file: &mut File) -> std::io::Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
        file.sync_data()?;
    }
    Ok(())
}

fn sync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

// ---------------------------------------------------------------------------
// OfflineQueue
// ---------------------------------------------------------------------------

/// Result of [`OfflineQueue::enqueue`].
#[derive(Debug)]
pub enum EnqueueOutcome {
    Persisted,
    /// Kept in memory because the queue is in memory mode or already
    /// holding buffered records.
    Buffered { evicted: bool },
    /// The durable append failed; the record went to memory instead.
    Degraded { error: StorageError, evicted: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub durable: usize,
    pub buffered: usize,
    pub dropped: u64,
    pub mode: StorageMode,
    pub degraded: bool,
}

/// How the last drained batch was split between log and ring.
#[derive(Debug, Clone, Copy, Default)]
struct InFlight {
    from_log: usize,
    from_memory: usize,
}

#[derive(Debug)]
pub struct OfflineQueue {
    log_path: PathBuf,
    temp_path: PathBuf,
    log: Option<DurableLog>,
    ring: VecDeque<AttendanceRecord>,
    capacity: usize,
    mode: StorageMode,
    dropped: u64,
    degraded: bool,
    last_error: Option<String>,
    in_flight: Option<InFlight>,
}

impl OfflineQueue {
    /// Open the queue. Never fails: if the log cannot be opened the queue
    /// starts degraded (see [`OfflineQueue::is_degraded`]).
    pub fn open(config: &QueueConfig) -> Self {
        let mut queue = OfflineQueue {
            log_path: config.log_path.clone(),
            temp_path: config.temp_path.clone(),
            log: None,
            ring: VecDeque::new(),
            capacity: config.fallback_capacity.max(1),
            mode: config.mode,
            dropped: 0,
            degraded: false,
            last_error: None,
            in_flight: None,
        };
        match DurableLog::open(&config.log_path, &config.temp_path) {
            Ok(log) => {
                info!(
                    path = %config.log_path.display(),
                    pending = log.len(),
                    "offline queue ready"
                );
                queue.log = Some(log);
            }
            Err(e) => queue.mark_degraded(&e),
        }
        queue
    }

    pub fn len(&self) -> usize {
        self.durable_len() + self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: StorageMode) {
        if self.mode != mode {
            info!(from = %self.mode, to = %mode, "offline storage mode changed");
            self.mode = mode;
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            durable: self.durable_len(),
            buffered: self.ring.len(),
            dropped: self.dropped,
            mode: self.mode,
            degraded: self.degraded,
        }
    }

    pub fn enqueue(&mut self, record: AttendanceRecord) -> EnqueueOutcome {
        if self.mode == StorageMode::Memory || !self.ring.is_empty() {
            let evicted = self.push_ring(record);
            return EnqueueOutcome::Buffered { evicted };
        }

        match self.append_durable(&record) {
            Ok(()) => {
                if self.degraded {
                    info!("offline log writable again");
                    self.degraded = false;
                }
                EnqueueOutcome::Persisted
            }
            Err(error) => {
                self.mark_degraded(&error);
                let evicted = self.push_ring(record);
                EnqueueOutcome::Degraded { error, evicted }
            }
        }
    }

    /// Up to `max` oldest records, without removing them. The split between
    /// log and ring is remembered for the following [`OfflineQueue::commit`].
    pub fn drain_batch(&mut self, max: usize) -> Vec<AttendanceRecord> {
        let peeked = self.log.as_ref().map(|log| log.peek(max));
        let mut batch = match peeked {
            Some(Ok(records)) => records,
            Some(Err(e)) => {
                // An unreadable log is set aside so the ring can still drain.
                self.mark_degraded(&e);
                self.log = None;
                Vec::new()
            }
            None => Vec::new(),
        };
        let from_log = batch.len();
        batch.extend(self.ring.iter().take(max - from_log).cloned());
        let from_memory = batch.len() - from_log;

        self.in_flight = Some(InFlight {
            from_log,
            from_memory,
        });
        batch
    }

    /// Remove the first `count` records after their batch was acknowledged.
    /// On error nothing is removed, so the batch is retried.
    pub fn commit(&mut self, count: usize) -> Result<(), StorageError> {
        if count == 0 {
            return Ok(());
        }
        let split = self.in_flight.take().unwrap_or_else(|| InFlight {
            from_log: count.min(self.durable_len()),
            from_memory: count.saturating_sub(self.durable_len()),
        });
        let from_log = count.min(split.from_log);
        let from_memory = (count - from_log).min(split.from_memory);

        if from_log > 0 {
            let log = self.log.as_mut().ok_or(StorageError::Unavailable)?;
            log.compact(from_log)?;
        }
        let from_memory = from_memory.min(self.ring.len());
        self.ring.drain(..from_memory);
        debug!(
            from_log,
            from_memory,
            remaining = self.len(),
            "offline records committed"
        );
        Ok(())
    }

    /// Drop every queued record. Used by factory reset.
    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.ring.clear();
        self.in_flight = None;
        self.dropped = 0;
        if self.log.is_none() {
            self.reopen()?;
        }
        self.log
            .as_mut()
            .ok_or(StorageError::Unavailable)?
            .clear()?;
        self.degraded = false;
        self.last_error = None;
        Ok(())
    }

    fn durable_len(&self) -> usize {
        self.log.as_ref().map_or(0, DurableLog::len)
    }

    fn append_durable(&mut self, record: &AttendanceRecord) -> Result<(), StorageError> {
        if self.log.is_none() {
            self.reopen()?;
        }
        self.log
            .as_mut()
            .ok_or(StorageError::Unavailable)?
            .append(record)
    }

    fn reopen(&mut self) -> Result<(), StorageError> {
        self.log = Some(DurableLog::open(&self.log_path, &self.temp_path)?);
        Ok(())
    }

    fn push_ring(&mut self, record: AttendanceRecord) -> bool {
        let mut evicted = false;
        if self.ring.len() >= self.capacity {
            self.ring.pop_front();
            self.dropped += 1;
            evicted = true;
            if let Some(split) = self.in_flight.as_mut() {
                split.from_memory = split.from_memory.saturating_sub(1);
            }
            warn!(
                capacity = self.capacity,
                dropped = self.dropped,
                "offline ring full, oldest record dropped"
            );
        }
        self.ring.push_back(record);
        evicted
    }

    fn mark_degraded(&mut self, error: &StorageError) {
        if !self.degraded {
            warn!(error = %error, "offline log unavailable, buffering in memory");
        }
        self.degraded = true;
        self.last_error = Some(error.to_string());
    }
}
