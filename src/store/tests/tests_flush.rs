#[cfg(test)]
mod tests {
    use crate::memtable::MemtableConfig;
    use crate::sstable::SSTableConfig;
    use crate::store::{Store, StoreConfig};
    use crate::wal::WalConfig;
    use std::fs;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            wal: WalConfig {
                base_dir: dir.path().join("wal"),
                ..Default::default()
            },
            sstable: SSTableConfig {
                base_dir: dir.path().join("sst"),
                ..Default::default()
            },
            ..StoreConfig::default()
        }
    }

    fn sstable_count(dir: &TempDir) -> usize {
        fs::read_dir(dir.path().join("sst"))
            .map(|entries| entries.filter_map(|e| e.ok()).count())
            .unwrap_or(0)
    }

    fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_explicit_flush_moves_data_to_sstables() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(&dir)).unwrap();

        store.put("a", b"1").unwrap();
        store.put("b", b"2").unwrap();
        store.inner.flush_memtables().unwrap();

        assert_eq!(store.inner.history_depth().unwrap(), 0);
        assert_eq!(sstable_count(&dir), 1);
        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_flush_rotates_and_deletes_old_wal() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(&dir)).unwrap();

        store.put("a", b"1").unwrap();
        let old_wal = store
            .inner
            .wal
            .read()
            .unwrap()
            .path()
            .to_path_buf();
        assert!(old_wal.exists());

        store.inner.flush_memtables().unwrap();

        assert!(!old_wal.exists(), "old WAL should be deleted after flush");
        let new_wal = store.inner.wal.read().unwrap().path().to_path_buf();
        assert_ne!(old_wal, new_wal);
    }

    #[test]
    fn test_overwrites_survive_flush_order() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(&dir)).unwrap();

        // Same key in two history generations; after both flush, the
        // newer SSTable must shadow the older one.
        store.put("k", b"old").unwrap();
        store.inner.save_memtable().unwrap();
        store.put("k", b"new").unwrap();
        store.inner.save_memtable().unwrap();
        store.inner.flush_memtables().unwrap();

        assert_eq!(sstable_count(&dir), 2);
        assert_eq!(store.get("k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn test_background_flush_after_seal() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.memtable = MemtableConfig {
            writes_before_lock: 2,
            ..MemtableConfig::default()
        };
        cfg.memtable_history = 0;
        cfg.background_activity_period = Duration::from_millis(10);
        let store = Store::open(cfg).unwrap();

        store.put("a", b"1").unwrap();
        store.put("b", b"2").unwrap();
        // The table sealed at two writes; this rotates and retries.
        store.put("c", b"3").unwrap();

        wait_for("background flush", || sstable_count(&dir) >= 1);

        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_drop_performs_final_flush() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(config(&dir)).unwrap();
            store.put("persisted", b"yes").unwrap();
        }

        assert_eq!(sstable_count(&dir), 1);
        // The WAL was rotated out and deleted by the final flush.
        let wal_files = fs::read_dir(dir.path().join("wal"))
            .unwrap()
            .filter_map(|e| e.ok())
            .count();
        assert_eq!(wal_files, 0);
    }

    #[test]
    fn test_flush_with_empty_history_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(&dir)).unwrap();

        store.inner.flush_memtables().unwrap();
        assert_eq!(sstable_count(&dir), 0);
    }
}
