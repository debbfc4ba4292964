//! Store Coordinator Module
//!
//! The top-level handle tying the subsystems together: one **active
//! memtable** absorbing writes, a **history stack** of sealed memtables
//! awaiting flush, the current **write-ahead log**, and the
//! timestamp-ordered **SSTable set**, plus one background worker that
//! drives flushing.
//!
//! ## Data flow
//!
//! - `put` → insert into the active memtable → log the node to the WAL.
//!   A sealed memtable rotates: the active table is swapped for a fresh one
//!   and pushed onto the history stack, then the insert retries (bounded).
//! - `get` → active memtable → history stack newest-first → SSTables
//!   newest-first → not found. The first hit wins, which makes the most
//!   recent value for a key authoritative across all three layers.
//! - background → every `background_activity_period`, flush the history to
//!   SSTables once it grows past `memtable_history` entries, rotating the
//!   WAL in the process.
//!
//! ## Startup
//!
//! Leftover WAL files are replayed oldest-first into fresh memtables
//! (rotating whenever one seals mid-load) and then deleted; SSTable files
//! are discovered and registered newest-first. A table file with a bad
//! magic number refuses to start; a file that vanishes between listing and
//! open is skipped with a warning.
//!
//! ## Shutdown
//!
//! Dropping the store sets the exit flag, joins the background worker, and
//! performs a final synchronous flush. Long `background_activity_period`
//! values therefore delay shutdown by up to one period.
//!
//! ## Locking
//!
//! The SSTable set sits behind a reader/writer lock: `get` holds the shared
//! side across its (blocking, memory-mapped) file reads, the flusher takes
//! the exclusive side while building and registering a new table. Heavy
//! read traffic can therefore starve flushing; this is an accepted property
//! of the design, and the place to look when the history grows without
//! bound.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs;
use std::io;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::memtable::{Memtable, MemtableConfig};
use crate::sstable::{self, SSTable, SSTableConfig, SSTableError};
use crate::wal::{self, Wal, WalConfig, WalEntry, WalError};

/// Rotation attempts before a `put` gives up on a memtable that never
/// unseals. Each attempt installs a fresh table, so hitting this bound
/// means rotation itself is wedged rather than the table merely full.
const MAX_PUT_RETRIES: usize = 64;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error originating from the WAL subsystem.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error originating from the SSTable subsystem.
    #[error("SSTable error: {0}")]
    SSTable(#[from] SSTableError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Keys are newline-delimited in the WAL and may not contain `\n`.
    #[error("key contains a newline byte")]
    KeyContainsNewline,

    /// Rotating the memtable repeatedly failed to unblock an insert.
    #[error("insert still rejected after repeated memtable rotations")]
    MemtableSaturated,

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Store`] instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Memtable growth thresholds.
    pub memtable: MemtableConfig,

    /// SSTable block size and directory.
    pub sstable: SSTableConfig,

    /// WAL queue capacity and directory.
    pub wal: WalConfig,

    /// How often the background thread wakes to check the history depth.
    pub background_activity_period: Duration,

    /// Number of sealed memtables held in memory before the background
    /// thread flushes them to SSTables. Larger values can help write
    /// throughput at the cost of memory footprint and WAL size; the actual
    /// depth may exceed this between background wake-ups.
    pub memtable_history: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memtable: MemtableConfig::default(),
            sstable: SSTableConfig::default(),
            wal: WalConfig::default(),
            background_activity_period: Duration::from_millis(50),
            memtable_history: 2,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// History stack
// ------------------------------------------------------------------------------------------------

/// One sealed memtable on the history stack. Entries link newest-to-oldest
/// through `Arc`s, so a reader that cloned the head can keep traversing its
/// snapshot while the flusher takes and frees the live stack.
struct HistoryEntry {
    table: Arc<Memtable>,
    next: Option<Arc<HistoryEntry>>,
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

struct Shared {
    /// Configuration the store was opened with.
    config: StoreConfig,

    /// Memtable currently accepting writes.
    active: RwLock<Arc<Memtable>>,

    /// Head of the sealed-memtable stack, newest first.
    history: RwLock<Option<Arc<HistoryEntry>>>,

    /// Current write-ahead log. Swapped on flush; in-flight loggers keep
    /// the old log (and its file) alive through their `Arc` clones.
    wal: RwLock<Arc<Wal>>,

    /// On-disk tables, newest first.
    sstables: RwLock<Vec<SSTable>>,

    /// Cooperative shutdown flag for the background thread.
    exit: AtomicBool,
}

impl Shared {
    fn poisoned<T>(_: T) -> StoreError {
        StoreError::Internal("RwLock poisoned".into())
    }

    fn active(&self) -> Result<Arc<Memtable>, StoreError> {
        Ok(Arc::clone(&*self.active.read().map_err(Self::poisoned)?))
    }

    /// Inserts with bounded seal-and-rotate retries, returning a WAL entry
    /// for the node that accepted the write.
    fn insert_with_rotate(&self, key: &str, value: &[u8]) -> Result<WalEntry, StoreError> {
        for _ in 0..MAX_PUT_RETRIES {
            let table = self.active()?;
            if let Some(node) = table.insert(key, value) {
                let node = NonNull::from(node);
                return Ok(WalEntry::new(table, node));
            }
            self.save_memtable()?;
        }
        Err(StoreError::MemtableSaturated)
    }

    /// Seals the active memtable and pushes it onto the history stack,
    /// installing a fresh empty table. A no-op while the active table holds
    /// no live data, so concurrent rotations collapse into one.
    fn save_memtable(&self) -> Result<(), StoreError> {
        let sealed = {
            let mut active = self.active.write().map_err(Self::poisoned)?;
            if active.empty() {
                return Ok(());
            }
            let fresh = Arc::new(Memtable::new(self.config.memtable.clone()));
            std::mem::replace(&mut *active, fresh)
        };

        // Writers that still hold the old table may complete in-flight
        // inserts until the seal lands; their data flushes with the table.
        sealed.lock();

        let mut head = self.history.write().map_err(Self::poisoned)?;
        *head = Some(Arc::new(HistoryEntry {
            table: sealed,
            next: head.take(),
        }));

        info!("sealed memtable pushed to history");
        Ok(())
    }

    /// Number of sealed memtables awaiting flush.
    fn history_depth(&self) -> Result<usize, StoreError> {
        let mut entry = self.history.read().map_err(Self::poisoned)?.clone();
        let mut depth = 0;
        while let Some(e) = entry {
            depth += 1;
            entry = e.next.clone();
        }
        Ok(depth)
    }

    /// Flushes every sealed memtable to an SSTable and rotates the WAL.
    ///
    /// The old WAL object is retained until the flush completes so a crash
    /// mid-flush still finds a replayable log on disk; dropping it at the
    /// end deletes the file. The history is flushed oldest-first so table
    /// timestamps mirror data recency.
    fn flush_memtables(&self) -> Result<(), StoreError> {
        self.save_memtable()?;

        let old_wal = {
            let mut wal = self.wal.write().map_err(Self::poisoned)?;
            std::mem::replace(&mut *wal, Arc::new(Wal::new(self.config.wal.clone())))
        };

        let head = self.history.write().map_err(Self::poisoned)?.take();

        let mut stack = Vec::new();
        let mut entry = head;
        while let Some(e) = entry {
            stack.push(Arc::clone(&e.table));
            entry = e.next.clone();
        }

        let flushed = stack.len();
        for table in stack.into_iter().rev() {
            let mut set = self.sstables.write().map_err(Self::poisoned)?;
            let sst = SSTable::build(&self.config.sstable, &table)?;
            // Fresh builds carry the newest timestamp; the front keeps the
            // set ordered newest-first.
            set.insert(0, sst);
            // The memtable is freed here once no reader snapshot holds it.
        }

        if flushed > 0 {
            info!(flushed, "flushed memtable history");
        }

        drop(old_wal);
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Store Core
// ------------------------------------------------------------------------------------------------

/// The store handle.
///
/// Cheap to share across threads behind an `Arc` if needed; `put` and `get`
/// take `&self`. Dropping the handle shuts the background worker down and
/// flushes everything still in memory.
pub struct Store {
    inner: Arc<Shared>,
    background: Option<JoinHandle<()>>,
}

impl Store {
    /// Opens a store: creates the configured directories, replays leftover
    /// WAL files, registers existing SSTables, and starts the background
    /// flush thread.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.wal.base_dir)?;
        fs::create_dir_all(&config.sstable.base_dir)?;

        let shared = Arc::new(Shared {
            active: RwLock::new(Arc::new(Memtable::new(config.memtable.clone()))),
            history: RwLock::new(None),
            wal: RwLock::new(Arc::new(Wal::new(config.wal.clone()))),
            sstables: RwLock::new(Vec::new()),
            exit: AtomicBool::new(false),
            config,
        });

        Self::recover_wals(&shared)?;
        Self::discover_sstables(&shared)?;

        let worker = Arc::clone(&shared);
        let background = thread::Builder::new()
            .name("stratakv-flush".into())
            .spawn(move || background_loop(worker))?;

        info!("store opened");

        Ok(Self {
            inner: shared,
            background: Some(background),
        })
    }

    /// Inserts a key/value pair. Durable in the WAL once this returns.
    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if key.contains('\n') {
            return Err(StoreError::KeyContainsNewline);
        }

        let entry = self.inner.insert_with_rotate(key, value)?;
        let wal = Arc::clone(&*self.inner.wal.read().map_err(Shared::poisoned)?);
        wal.log(entry)?;
        Ok(())
    }

    /// Looks up the most recent value for `key`.
    ///
    /// Searches the active memtable, then the history stack newest-first,
    /// then the SSTables newest-first.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let active = self.inner.active()?;
        if let Some(value) = active.get(key) {
            return Ok(Some(value.to_vec()));
        }

        let mut entry = self
            .inner
            .history
            .read()
            .map_err(Shared::poisoned)?
            .clone();
        while let Some(e) = entry {
            if let Some(value) = e.table.get(key) {
                return Ok(Some(value.to_vec()));
            }
            entry = e.next.clone();
        }

        let set = self.inner.sstables.read().map_err(Shared::poisoned)?;
        for sst in set.iter() {
            if let Some(value) = sst.get(key)? {
                return Ok(Some(value));
            }
        }

        Ok(None)
    }

    /// Replays every leftover WAL file oldest-first into the active
    /// memtable (rotating whenever it seals mid-load), then deletes it.
    fn recover_wals(shared: &Arc<Shared>) -> Result<(), StoreError> {
        let mut logs: Vec<(u64, PathBuf)> = Vec::new();
        for item in fs::read_dir(&shared.config.wal.base_dir)? {
            let path = item?.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(wal::FILE_EXT)
            {
                continue;
            }
            let stamp = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            logs.push((stamp, path));
        }
        // Oldest first, so a newer log's values overwrite an older log's.
        logs.sort();

        for (_, path) in logs {
            let records = Wal::replay(&path)?;
            for (key, value) in &records {
                // Recovery only rebuilds memory; the records are not
                // re-logged. Until the next flush, recovered data lives
                // nowhere but in these memtables.
                let entry = shared.insert_with_rotate(key, value)?;
                drop(entry);
            }
            fs::remove_file(&path)?;
            info!(path = %path.display(), records = records.len(), "recovered WAL");
        }

        Ok(())
    }

    /// Registers every SSTable file in the configured directory, newest
    /// first. Bad magic refuses to start; a vanished file is skipped.
    fn discover_sstables(shared: &Arc<Shared>) -> Result<(), StoreError> {
        let mut found = Vec::new();
        for item in fs::read_dir(&shared.config.sstable.base_dir)? {
            let path = item?.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(sstable::FILE_EXT)
            {
                continue;
            }
            match SSTable::open(&path) {
                Ok(sst) => found.push(sst),
                Err(SSTableError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "SSTable vanished before open; skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }

        found.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        let count = found.len();

        *shared.sstables.write().map_err(Shared::poisoned)? = found;
        if count > 0 {
            info!(count, "registered SSTables");
        }
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.inner.exit.store(true, SeqCst);
        if let Some(handle) = self.background.take() {
            if handle.join().is_err() {
                error!("background thread panicked");
            }
        }
        if let Err(e) = self.inner.flush_memtables() {
            error!(error = %e, "final flush failed");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Background worker
// ------------------------------------------------------------------------------------------------

/// Periodically wakes and flushes the history once it outgrows the
/// configured depth. A long period delays shutdown by up to one sleep; a
/// refinement would be to partition the wait to poll the exit flag sooner.
fn background_loop(shared: Arc<Shared>) {
    loop {
        thread::sleep(shared.config.background_activity_period);
        if shared.exit.load(SeqCst) {
            break;
        }

        match shared.history_depth() {
            Ok(depth) if depth > shared.config.memtable_history => {
                if let Err(e) = shared.flush_memtables() {
                    error!(error = %e, "background flush failed");
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "background depth check failed");
                break;
            }
        }
    }
}
