#[cfg(test)]
mod tests {
    use crate::memtable::{Memtable, MemtableConfig};
    use crate::wal::{Wal, WalConfig, WalEntry};
    use std::fs;
    use std::ptr::NonNull;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn wal_in(dir: &TempDir) -> Wal {
        Wal::new(WalConfig {
            base_dir: dir.path().to_path_buf(),
            ..WalConfig::default()
        })
    }

    fn log_pair(wal: &Wal, table: &Arc<Memtable>, key: &str, value: &[u8]) {
        let node = NonNull::from(table.insert(key, value).expect("insert"));
        wal.log(WalEntry::new(Arc::clone(table), node)).expect("log");
    }

    #[test]
    fn test_log_writes_line_framed_records() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let table = Arc::new(Memtable::new(MemtableConfig::default()));

        log_pair(&wal, &table, "alpha", b"1");
        log_pair(&wal, &table, "beta", b"22");

        let bytes = fs::read(wal.path()).unwrap();
        assert_eq!(bytes, b"alpha\n1\nbeta\n22\n");
    }

    #[test]
    fn test_log_then_replay_round_trips() {
        let dir = TempDir::new().unwrap();
        let wal = wal_in(&dir);
        let table = Arc::new(Memtable::new(MemtableConfig::default()));

        log_pair(&wal, &table, "a", b"first");
        log_pair(&wal, &table, "b", b"");
        log_pair(&wal, &table, "a", b"second");

        let records = Wal::replay(wal.path()).unwrap();
        // Newest observation per key, newest first.
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], ("a".to_string(), b"second".to_vec()));
        assert_eq!(records[1], ("b".to_string(), b"".to_vec()));
    }

    #[test]
    fn test_file_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let table = Arc::new(Memtable::new(MemtableConfig::default()));

        let path = {
            let wal = wal_in(&dir);
            log_pair(&wal, &table, "k", b"v");
            assert!(wal.path().exists());
            wal.path().to_path_buf()
        };

        assert!(!path.exists());
    }

    #[test]
    fn test_unused_wal_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let path = {
            let wal = wal_in(&dir);
            wal.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_concurrent_producers_log_everything() {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(wal_in(&dir));
        let table = Arc::new(Memtable::new(MemtableConfig {
            writes_before_lock: 100_000,
            ..MemtableConfig::default()
        }));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let wal = Arc::clone(&wal);
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("t{t}-k{i:03}");
                        let node =
                            NonNull::from(table.insert(&key, key.as_bytes()).expect("insert"));
                        wal.log(WalEntry::new(Arc::clone(&table), node)).expect("log");
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let records = Wal::replay(wal.path()).unwrap();
        assert_eq!(records.len(), 8 * 200);
        for (key, value) in &records {
            assert_eq!(key.as_bytes(), &value[..]);
        }
    }

    #[test]
    fn test_distinct_wals_get_distinct_names() {
        let dir = TempDir::new().unwrap();
        let a = wal_in(&dir);
        let b = wal_in(&dir);
        assert_ne!(a.path(), b.path());
    }
}
