//! Write-Ahead Logging (WAL) Module
//!
//! An append-only log that makes every accepted insert durable before the
//! `put` call returns, and is replayed at startup to recover in-memory data
//! lost to an abnormal exit.
//!
//! ## On-disk layout
//!
//! A log file is named `<monotonic_ms>.kvwal` and holds accepted inserts in
//! acknowledgement order:
//!
//! ```text
//! [KEY_BYTES]\n[VALUE_BYTES]\n
//! [KEY_BYTES]\n[VALUE_BYTES]\n
//! ...
//! ```
//!
//! Keys are text lines; values are raw bytes terminated by the next
//! newline. Replay alternates line reads, so a value containing `\n` will
//! misalign the remainder of the file — keys are checked at the store
//! boundary, values are not. This is a known limitation of the line framing.
//!
//! ## Concurrency model
//!
//! Concurrent writers hand node references through a fixed-size ring buffer
//! guarded by a reader/writer lock used in an *inverted* sense:
//!
//! - **Producers** take the shared side, reserve a slot with a CAS on the
//!   write head, and store their entry.
//! - **The drainer** takes the exclusive side non-blockingly; if the lock is
//!   contended another drainer is already at work and the producer simply
//!   returns. The winner appends every queued entry to the file and syncs.
//!
//! This serializes actual file writes through at most one thread while many
//! producers enqueue concurrently.
//!
//! ## Lifecycle
//!
//! A log file exists on disk only while it may contain operations not yet
//! flushed to an SSTable: the store swaps in a fresh `Wal` when it flushes,
//! and dropping the old handle deletes the old file.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{info, trace, warn};

use crate::clock;
use crate::memtable::{Memtable, Node};

/// File extension of write-ahead log files.
pub const FILE_EXT: &str = "kvwal";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The given path does not carry the `.kvwal` extension.
    #[error("not a WAL file: {0}")]
    BadExtension(PathBuf),

    /// A replayed key was not valid UTF-8.
    #[error("corrupt WAL key (invalid UTF-8)")]
    CorruptKey,

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Wal`].
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Ring-buffer capacity: the maximum number of concurrent put
    /// operations that can be queued before producers spin.
    pub concurrent_put_limit: usize,

    /// Directory where log files are created.
    pub base_dir: PathBuf,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            concurrent_put_limit: 256,
            base_dir: PathBuf::from("."),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Queue entries
// ------------------------------------------------------------------------------------------------

/// A queued reference to a memtable node awaiting logging.
///
/// Carries an `Arc` to the owning memtable so the node (and its record
/// arena) stay alive even if the active memtable rotates before the drainer
/// reaches this entry. The value written is the node's record *at drain
/// time*, which may be newer than at insert time — read-committed, same as
/// every other reader of the table.
pub struct WalEntry {
    table: Arc<Memtable>,
    node: NonNull<Node>,
}

// The node pointer is owned by `table`, which the entry keeps alive.
unsafe impl Send for WalEntry {}
unsafe impl Sync for WalEntry {}

impl WalEntry {
    /// `node` must be a node of `table`.
    pub(crate) fn new(table: Arc<Memtable>, node: NonNull<Node>) -> Self {
        Self { table, node }
    }

    fn key(&self) -> &str {
        unsafe { self.node.as_ref() }.key()
    }

    fn value(&self) -> &[u8] {
        self.table.value(unsafe { self.node.as_ref() })
    }
}

/// One ring-buffer slot. A producer that won the CAS on the write head owns
/// the slot until it stores its entry under the shared lock; the drainer
/// only reads under the exclusive lock, after all producers have released.
struct QueueSlot(UnsafeCell<Option<WalEntry>>);

unsafe impl Sync for QueueSlot {}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// A write-ahead log file plus its producer queue.
///
/// See the [module-level documentation](self) for format and concurrency
/// details.
pub struct Wal {
    /// Configuration this log was created with.
    config: WalConfig,

    /// Path of the log file. The file itself is created on first drain.
    logfile: PathBuf,

    /// Ring buffer of queued entries.
    slots: Box<[QueueSlot]>,

    /// Inverted reader/writer lock: producers share, the drainer excludes.
    gate: RwLock<()>,

    /// Producer write head.
    write: AtomicUsize,

    /// Consumer read head. Only the drainer stores it, but producers read
    /// it for the full-queue check.
    read: AtomicUsize,
}

impl Wal {
    /// Creates a log with a fresh monotonic-millisecond file name under the
    /// configured directory. No file is created until the first drain.
    pub fn new(config: WalConfig) -> Self {
        let logfile = config
            .base_dir
            .join(format!("{}.{}", clock::unique_ms(), FILE_EXT));

        let slots = (0..config.concurrent_put_limit)
            .map(|_| QueueSlot(UnsafeCell::new(None)))
            .collect();

        info!(path = %logfile.display(), "created WAL");

        Self {
            config,
            logfile,
            slots,
            gate: RwLock::new(()),
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.logfile
    }

    /// Queues a logged insert and drains the queue to disk if no other
    /// thread is already doing so.
    ///
    /// Spins while the queue is full; a concurrent drainer will make room.
    pub fn log(&self, entry: WalEntry) -> Result<(), WalError> {
        let mut entry = Some(entry);
        loop {
            let guard = self
                .gate
                .read()
                .map_err(|_| WalError::Internal("RwLock poisoned".into()))?;

            let write = self.write.load(SeqCst);
            let next = (write + 1) % self.slots.len();
            if next == self.read.load(SeqCst) {
                // Full. Release the shared side so a drainer can take the
                // exclusive side, then retry.
                drop(guard);
                continue;
            }

            if self
                .write
                .compare_exchange(write, next, SeqCst, SeqCst)
                .is_ok()
            {
                // The CAS made this slot ours; store before releasing the
                // shared lock so the drainer always sees a full slot.
                unsafe { *self.slots[write].0.get() = entry.take() };
                drop(guard);
                break;
            }

            drop(guard);
        }

        self.drain()
    }

    /// Appends every queued entry to the log file. At most one drainer runs
    /// at a time; contenders return immediately.
    fn drain(&self) -> Result<(), WalError> {
        let Ok(_exclusive) = self.gate.try_write() else {
            return Ok(());
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.logfile)?;
        let mut writer = BufWriter::new(file);

        let mut read = self.read.load(SeqCst);
        let mut drained = 0usize;
        while read != self.write.load(SeqCst) {
            let entry = unsafe { (*self.slots[read].0.get()).take() }
                .ok_or_else(|| WalError::Internal("empty queue slot under exclusive lock".into()))?;

            writer.write_all(entry.key().as_bytes())?;
            writer.write_all(b"\n")?;
            writer.write_all(entry.value())?;
            writer.write_all(b"\n")?;

            read = (read + 1) % self.slots.len();
            self.read.store(read, SeqCst);
            drained += 1;
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
        trace!(drained, path = %self.logfile.display(), "drained WAL queue");
        Ok(())
    }

    /// Reads an existing log file and returns the most recent value per
    /// key, newest observation first.
    ///
    /// A truncated trailing record (crash mid-append) is dropped with a
    /// warning. The caller owns inserting the pairs into a memtable and
    /// rotating it if it seals mid-load.
    pub fn replay(path: &Path) -> Result<Vec<(String, Vec<u8>)>, WalError> {
        if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXT) {
            return Err(WalError::BadExtension(path.to_path_buf()));
        }

        let mut reader = BufReader::new(File::open(path)?);
        let mut raw: Vec<(String, Vec<u8>)> = Vec::new();

        loop {
            let mut key = Vec::new();
            if reader.read_until(b'\n', &mut key)? == 0 {
                break;
            }
            if key.pop() != Some(b'\n') {
                warn!(path = %path.display(), "truncated WAL key; dropping tail");
                break;
            }

            let mut value = Vec::new();
            if reader.read_until(b'\n', &mut value)? == 0 {
                warn!(path = %path.display(), "key without value; dropping tail");
                break;
            }
            if value.pop() != Some(b'\n') {
                warn!(path = %path.display(), "truncated WAL value; dropping tail");
                break;
            }

            let key = String::from_utf8(key).map_err(|_| WalError::CorruptKey)?;
            raw.push((key, value));
        }

        // The newest observation per key wins: walk backwards and keep the
        // first occurrence.
        let mut seen: HashSet<String> = HashSet::new();
        let mut newest: Vec<(String, Vec<u8>)> = Vec::new();
        for (key, value) in raw.into_iter().rev() {
            if seen.insert(key.clone()) {
                newest.push((key, value));
            }
        }

        info!(path = %path.display(), records = newest.len(), "replayed WAL");
        Ok(newest)
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        // The file only exists if something was drained into it; a missing
        // file is the common case for an idle log.
        match fs::remove_file(&self.logfile) {
            Ok(()) => info!(path = %self.logfile.display(), "removed WAL"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.logfile.display(), error = %e, "failed to remove WAL"),
        }
    }
}
