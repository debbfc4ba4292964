//! Memtable Module
//!
//! The mutable, in-memory write buffer of the store: an ordered map from
//! text key to opaque value bytes, realized as a **lock-free concurrent
//! skip list** over a pre-allocated record arena.
//!
//! ## Design Overview
//!
//! - Value bytes live in a fixed array of *record slots*, pre-allocated for
//!   `writes_before_lock` writes. A writer reserves a slot with an atomic
//!   fetch-add; the returned index is the record's identity and orders all
//!   writes within this memtable — a larger index always means a later
//!   write. Slots are written exactly once and never recycled.
//! - Skip-list nodes carry the key, the current record index (atomic, so an
//!   overwrite is a single index swing), and one forward link per level.
//!   The probabilistic level is drawn from a thread-local generator with
//!   ~50% survival per level, capped at [`MAX_TABLE_LEVELS`].
//! - Splicing searches top-down but commits bottom-up: the level-0 CAS makes
//!   the node visible (a failure there restarts the search with nothing
//!   published); higher levels are linked with per-level retries.
//!
//! ## Sealing
//!
//! The table reports [`locked`](Memtable::locked) — and rejects further
//! inserts — once any of three growth thresholds is crossed (slot count,
//! live data, total data including overwritten records) or after an explicit
//! [`lock`](Memtable::lock). Sealing is idempotent; the coordinator rotates
//! a sealed table into the flush history.
//!
//! ## Concurrency
//!
//! - All forward links and the record-index counter are sequentially
//!   consistent atomics; no mutex is taken anywhere.
//! - A node's key is immutable after construction.
//! - Readers may observe a value newer than the one present when their
//!   search began (read-committed of the latest insert); they can never
//!   observe the record index of a key move backwards.
//! - Nodes and records are only freed when the memtable is dropped, so any
//!   node reference obtained from this table is valid for the table's
//!   lifetime.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cell::{RefCell, UnsafeCell};
use std::cmp::Ordering::{Equal, Greater, Less};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicUsize};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

/// Maximum depth of the skip list. Higher values cost space per node but
/// shorten searches; read-heavy workloads may benefit from raising this.
pub const MAX_TABLE_LEVELS: usize = 16;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Growth thresholds for a [`Memtable`].
///
/// None of the data limits is hard: concurrent in-progress writes may
/// overshoot them slightly before the table observes itself as locked.
#[derive(Debug, Clone)]
pub struct MemtableConfig {
    /// Maximum inserts before the table seals. Record-slot space for this
    /// many writes is pre-allocated up front. Must be below `i32::MAX`.
    pub writes_before_lock: usize,

    /// The table seals once it holds more than this much live data.
    pub data_limit: usize,

    /// The table seals once it holds more than this much data including
    /// overwritten (stale) records. If values are updated much more often
    /// than inserted, stale data can significantly outweigh live values, so
    /// this should be a comfortable multiple of `data_limit`.
    pub total_data_limit: usize,
}

impl Default for MemtableConfig {
    fn default() -> Self {
        Self {
            writes_before_lock: 2000,
            data_limit: 16 * 1024 * 1024,
            total_data_limit: 160 * 1024 * 1024,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// An opaque value held in the record arena. Valid for the lifetime of the
/// owning memtable.
#[derive(Default)]
struct Record {
    data: Box<[u8]>,
}

/// One write-once arena slot.
///
/// A slot is written by exactly one thread — the writer that reserved its
/// index — and only read after that index has been published through a
/// sequentially consistent store on some node, which orders the slot write
/// before every read.
struct RecordSlot(UnsafeCell<Record>);

unsafe impl Sync for RecordSlot {}

// ------------------------------------------------------------------------------------------------
// Nodes
// ------------------------------------------------------------------------------------------------

/// A skip-list node: key, current record index, and one forward link per
/// level. Node references obtained from a [`Memtable`] are valid for the
/// table's lifetime.
pub struct Node {
    /// The key. Immutable after construction.
    key: String,

    /// Index of the node's current record slot. Updated atomically on
    /// overwrite; a larger index is always the later write.
    record_idx: AtomicI32,

    /// Forward links, one per level the node participates in.
    next: Box<[AtomicPtr<Node>]>,
}

impl Node {
    fn new(key: &str, record_idx: i32, height: usize) -> Self {
        let next = (0..height)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();

        Self {
            key: key.to_owned(),
            record_idx: AtomicI32::new(record_idx),
            next,
        }
    }

    /// The node's key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The node's current record index. Larger indices are later writes.
    pub fn idx(&self) -> i32 {
        self.record_idx.load(SeqCst)
    }
}

// ------------------------------------------------------------------------------------------------
// Level generator
// ------------------------------------------------------------------------------------------------

fn thread_seed() -> u64 {
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

thread_local! {
    static LEVEL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::seed_from_u64(thread_seed()));
}

/// Draws a level in `[0, MAX_TABLE_LEVELS - 1]`: keep climbing while a coin
/// flip says so, giving roughly half the node count per level.
fn random_level() -> usize {
    LEVEL_RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        let mut level = 0;
        while level < MAX_TABLE_LEVELS - 1 && rng.gen::<bool>() {
            level += 1;
        }
        level
    })
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// A concurrent sorted map from text key to value bytes, with lock-free
/// insertion and lookup and growth-bounded sealing.
///
/// See the [module-level documentation](self) for the full protocol.
pub struct Memtable {
    /// Thresholds this table was created with.
    config: MemtableConfig,

    /// Pre-allocated record arena, one slot per permitted write.
    records: Box<[RecordSlot]>,

    /// Bytes ever written into the arena, including overwritten records.
    total_data_size: AtomicUsize,

    /// Bytes of live (currently referenced) values.
    data_size: AtomicUsize,

    /// Explicit seal flag, set by [`lock`](Self::lock).
    is_locked: AtomicBool,

    /// Next free record slot. Only ever incremented.
    next_record: AtomicI32,

    /// Head sentinel with the full level count. Never returned to callers.
    head: Node,
}

// The raw node pointers inside the forward links are owned by this table and
// only freed in `Drop`; the arena is append-only. See the slot and node
// publication invariants above.
unsafe impl Send for Memtable {}
unsafe impl Sync for Memtable {}

impl Memtable {
    /// Creates an empty memtable, pre-allocating record-slot space for
    /// `config.writes_before_lock` writes.
    pub fn new(config: MemtableConfig) -> Self {
        assert!(
            config.writes_before_lock < i32::MAX as usize,
            "writes_before_lock must fit an i32 record index"
        );

        let records = (0..config.writes_before_lock)
            .map(|_| RecordSlot(UnsafeCell::new(Record::default())))
            .collect();

        Self {
            config,
            records,
            total_data_size: AtomicUsize::new(0),
            data_size: AtomicUsize::new(0),
            is_locked: AtomicBool::new(false),
            next_record: AtomicI32::new(0),
            head: Node::new("", -1, MAX_TABLE_LEVELS),
        }
    }

    /// Seals the table explicitly. Returns the previous seal state.
    /// Idempotent; a sealed table rejects all further inserts.
    pub fn lock(&self) -> bool {
        self.is_locked.swap(true, SeqCst)
    }

    /// True once any growth threshold has been crossed or [`lock`](Self::lock)
    /// was called.
    pub fn locked(&self) -> bool {
        self.total_data_size.load(SeqCst) >= self.config.total_data_limit
            || self.next_record.load(SeqCst) as usize >= self.config.writes_before_lock
            || self.data_size.load(SeqCst) >= self.config.data_limit
            || self.is_locked.load(SeqCst)
    }

    /// True while the table holds no live data.
    pub fn empty(&self) -> bool {
        self.data_size.load(SeqCst) == 0
    }

    /// Bytes of live values currently referenced by nodes.
    pub fn data_size(&self) -> usize {
        self.data_size.load(SeqCst)
    }

    /// Bytes ever written, including overwritten records.
    pub fn total_data_size(&self) -> usize {
        self.total_data_size.load(SeqCst)
    }

    /// The thresholds this table was created with.
    pub fn config(&self) -> &MemtableConfig {
        &self.config
    }

    /// Inserts a key/value pair, returning the node now holding the key, or
    /// `None` if the table is sealed (or ran out of record slots under a
    /// concurrent burst).
    ///
    /// Overwrites of an existing key swing that node's record index to the
    /// new slot; between two racing writers of the same key, the one with
    /// the larger record index wins regardless of arrival order.
    pub fn insert(&self, key: &str, value: &[u8]) -> Option<&Node> {
        if self.locked() {
            return None;
        }

        // Reserve a slot. The counter only grows, so the index doubles as a
        // total order over writes. A concurrent burst can push the counter
        // past the arena; those writers fail as if sealed.
        let record_idx = self.next_record.fetch_add(1, SeqCst);
        if record_idx < 0 || record_idx as usize >= self.records.len() {
            return None;
        }

        // The slot is ours alone until its index is published via a node.
        unsafe {
            *self.records[record_idx as usize].0.get() = Record { data: value.into() };
        }
        self.total_data_size.fetch_add(value.len(), SeqCst);

        let level = random_level();
        let new_node: *mut Node = Box::into_raw(Box::new(Node::new(key, record_idx, level + 1)));

        let mut updates: [*const Node; MAX_TABLE_LEVELS] = [ptr::null(); MAX_TABLE_LEVELS];
        let mut update_nexts: [*mut Node; MAX_TABLE_LEVELS] = [ptr::null_mut(); MAX_TABLE_LEVELS];

        'search: loop {
            // Record the predecessor and its successor at every level we
            // will link, descending from the node's own level.
            let mut n: &Node = &self.head;
            for i in (0..=level).rev() {
                loop {
                    let n2_ptr = n.next[i].load(SeqCst);
                    if n2_ptr.is_null() {
                        updates[i] = n as *const Node;
                        update_nexts[i] = n2_ptr;
                        break;
                    }

                    let n2 = unsafe { &*n2_ptr };
                    match key.cmp(n2.key.as_str()) {
                        Less => {
                            updates[i] = n as *const Node;
                            update_nexts[i] = n2_ptr;
                            break;
                        }
                        Greater => n = n2,
                        Equal => {
                            return Some(self.overwrite(n2, record_idx, value.len(), new_node));
                        }
                    }
                }
            }

            // Commit bottom-up. Level 0 publishes the node; nothing is
            // visible yet if it fails, so a full restart is safe.
            unsafe { (*new_node).next[0].store(update_nexts[0], SeqCst) };
            let pred0 = unsafe { &*updates[0] };
            if pred0.next[0]
                .compare_exchange(update_nexts[0], new_node, SeqCst, SeqCst)
                .is_err()
            {
                continue 'search;
            }

            // Higher levels only affect search speed; retry each link
            // against a fresh scan of that level.
            for i in 1..=level {
                let mut pred = updates[i];
                let mut succ = update_nexts[i];
                loop {
                    unsafe { (*new_node).next[i].store(succ, SeqCst) };
                    let linked = unsafe { &*pred }.next[i]
                        .compare_exchange(succ, new_node, SeqCst, SeqCst)
                        .is_ok();
                    if linked {
                        break;
                    }

                    let mut cur: &Node = &self.head;
                    loop {
                        let next_ptr = cur.next[i].load(SeqCst);
                        if next_ptr.is_null() || unsafe { &*next_ptr }.key.as_str() >= key {
                            pred = cur as *const Node;
                            succ = next_ptr;
                            break;
                        }
                        cur = unsafe { &*next_ptr };
                    }
                }
            }

            self.data_size.fetch_add(value.len(), SeqCst);
            trace!(key, record_idx, level, "inserted new node");
            return Some(unsafe { &*new_node });
        }
    }

    /// The key already has a node; the larger record index wins. Loops
    /// because other writers may be swinging the index concurrently.
    fn overwrite<'a>(
        &'a self,
        existing: &'a Node,
        record_idx: i32,
        value_len: usize,
        new_node: *mut Node,
    ) -> &'a Node {
        // The discarded node was never linked, so freeing it here is safe.
        unsafe { drop(Box::from_raw(new_node)) };

        let mut observed = existing.record_idx.load(SeqCst);
        loop {
            if observed > record_idx {
                // A later write already landed; treat this insert as
                // succeeded and then overwritten.
                return existing;
            }
            debug_assert!(observed != record_idx, "record indices are never reused");

            match existing
                .record_idx
                .compare_exchange(observed, record_idx, SeqCst, SeqCst)
            {
                Ok(old) => {
                    // Slots are write-once, so the displaced record's size
                    // is stable.
                    let old_size = self.record_at(old).data.len();
                    self.data_size.fetch_sub(old_size, SeqCst);
                    self.data_size.fetch_add(value_len, SeqCst);
                    trace!(key = existing.key(), record_idx, "overwrote record");
                    return existing;
                }
                Err(now) => observed = now,
            }
        }
    }

    /// Finds the node holding `key`, or `None` if absent. The returned
    /// reference is valid for the table's lifetime.
    pub fn find(&self, key: &str) -> Option<&Node> {
        let mut n: &Node = &self.head;
        for i in (0..MAX_TABLE_LEVELS).rev() {
            loop {
                let n2_ptr = n.next[i].load(SeqCst);
                if n2_ptr.is_null() {
                    break;
                }
                let n2 = unsafe { &*n2_ptr };
                match key.cmp(n2.key.as_str()) {
                    Less => break,
                    Equal => return Some(n2),
                    Greater => n = n2,
                }
            }
        }
        None
    }

    /// Returns the value bytes for `key`, or `None` if absent.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.find(key).map(|node| self.value(node))
    }

    /// Returns the current value bytes of a node from this table.
    ///
    /// If the node reference is stale a concurrent overwrite may have moved
    /// its record index forward; in that case the *newer* value is returned,
    /// which is the read-committed behavior callers rely on.
    pub fn value(&self, node: &Node) -> &[u8] {
        let idx = node.record_idx.load(SeqCst);
        assert!(
            idx >= 0 && (idx as usize) < self.records.len(),
            "record index out of range"
        );
        &self.record_at(idx).data
    }

    fn record_at(&self, idx: i32) -> &Record {
        // Only published indices reach here; the publishing store ordered
        // the slot write before this read.
        unsafe { &*self.records[idx as usize].0.get() }
    }

    /// Iterates all nodes in ascending key order (the bottom level of the
    /// skip list).
    pub fn iter(&self) -> Nodes<'_> {
        Nodes {
            cur: self.head.next[0].load(SeqCst),
            _table: self,
        }
    }
}

impl Drop for Memtable {
    fn drop(&mut self) {
        // Exclusive access here: walk the bottom level and free every node.
        let mut p = self.head.next[0].load(SeqCst);
        while !p.is_null() {
            let node = unsafe { Box::from_raw(p) };
            p = node.next[0].load(SeqCst);
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Iteration
// ------------------------------------------------------------------------------------------------

/// Ascending-key iterator over the nodes of a [`Memtable`].
pub struct Nodes<'a> {
    cur: *mut Node,
    _table: &'a Memtable,
}

impl<'a> Iterator for Nodes<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        let node = unsafe { &*self.cur };
        self.cur = node.next[0].load(SeqCst);
        Some(node)
    }
}
