//! # StrataKV
//!
//! An embeddable, persistent key-value store built on a
//! **Log-Structured Merge Tree (LSM-tree)** architecture. Designed for
//! concurrent writers and crash-safe operation inside a single host process.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Store                            │
//! │  ┌────────────┐   ┌──────────────┐   ┌──────────────┐   │
//! │  │   Active   │   │   History    │   │   SSTables   │   │
//! │  │  Memtable  │   │  (sealed     │   │  (on disk,   │   │
//! │  │  + WAL     │   │   memtables) │   │   immutable) │   │
//! │  └─────┬──────┘   └──────┬───────┘   └──────┬───────┘   │
//! │        │    seal         │    flush         │           │
//! │        └──────────►      └─────────►        │           │
//! │                                                         │
//! │  background thread: periodically flushes the history    │
//! │  to SSTables and rotates the write-ahead log            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | Coordinator — open, put, get, background flush, recovery |
//! | [`memtable`] | Lock-free concurrent skip-list write buffer with sealing |
//! | [`wal`] | Append-only write-ahead log replayed on startup |
//! | [`sstable`] | Immutable, sorted, block-structured on-disk tables |
//! | [`bloom`] | Static and scalable Bloom filters for negative lookups |
//!
//! ## Key Properties
//!
//! - **Write-ahead logging** — every accepted insert is appended to the WAL
//!   before the call returns, so a crash never loses acknowledged writes.
//! - **Lock-free writes** — the memtable is a concurrent skip list; inserts
//!   and lookups never block each other.
//! - **Freshest-value reads** — `get` searches the active memtable, then the
//!   sealed history newest-first, then SSTables newest-first, so the most
//!   recent value for a key always wins.
//! - **Bounded memory** — memtables seal once they cross a configured write,
//!   live-data, or total-data threshold and are flushed in the background.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratakv::{Store, StoreConfig};
//!
//! let mut config = StoreConfig::default();
//! config.wal.base_dir = "/tmp/mydb/wal".into();
//! config.sstable.base_dir = "/tmp/mydb/sst".into();
//!
//! let store = Store::open(config).unwrap();
//!
//! store.put("hello", b"world").unwrap();
//! assert_eq!(store.get("hello").unwrap(), Some(b"world".to_vec()));
//! assert_eq!(store.get("missing").unwrap(), None);
//!
//! // Dropping the store joins the background thread and flushes
//! // everything still in memory.
//! drop(store);
//! ```

#![allow(dead_code)]

pub mod bloom;
mod clock;
pub mod memtable;
pub mod sstable;
pub mod store;
pub mod wal;

pub use store::{Store, StoreConfig, StoreError};
