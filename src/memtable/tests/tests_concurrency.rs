#[cfg(test)]
mod tests {
    use crate::memtable::{Memtable, MemtableConfig};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_concurrent_distinct_keys_all_retrievable() {
        let table = Arc::new(Memtable::new(MemtableConfig {
            writes_before_lock: 100_000,
            ..MemtableConfig::default()
        }));

        let threads = 8;
        let per_thread = 500;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        let key = format!("t{t:02}-k{i:04}");
                        let value = format!("v{t:02}-{i:04}");
                        assert!(table.insert(&key, value.as_bytes()).is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        for t in 0..threads {
            for i in 0..per_thread {
                let key = format!("t{t:02}-k{i:04}");
                let value = format!("v{t:02}-{i:04}");
                assert_eq!(table.get(&key), Some(value.as_bytes()), "lost {key}");
            }
        }
    }

    #[test]
    fn test_concurrent_order_stays_sorted() {
        let table = Arc::new(Memtable::new(MemtableConfig {
            writes_before_lock: 100_000,
            ..MemtableConfig::default()
        }));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    // Interleave key ranges across threads to force
                    // neighboring inserts from different threads.
                    for i in 0..1000 {
                        let key = format!("k{:05}", i * 4 + t);
                        table.insert(&key, b"x").unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let keys: Vec<String> = table.iter().map(|n| n.key().to_owned()).collect();
        assert_eq!(keys.len(), 4000);
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1], "order violated: {} !< {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_concurrent_same_key_latest_index_wins() {
        let table = Arc::new(Memtable::new(MemtableConfig {
            writes_before_lock: 100_000,
            ..MemtableConfig::default()
        }));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..500 {
                        let value = format!("t{t}-{i}");
                        table.insert("contested", value.as_bytes()).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Exactly one node survives, holding the record with the largest
        // index ever installed for the key.
        assert_eq!(table.iter().count(), 1);
        let node = table.find("contested").unwrap();
        let winner = node.idx();
        assert!(winner >= 0);
        let value = table.value(node).to_vec();
        assert!(!value.is_empty());

        // No subsequent read may observe an older index.
        assert_eq!(table.find("contested").unwrap().idx(), winner);
    }

    #[test]
    fn test_concurrent_readers_during_writes() {
        let table = Arc::new(Memtable::new(MemtableConfig {
            writes_before_lock: 100_000,
            ..MemtableConfig::default()
        }));

        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..2000 {
                    let key = format!("k{i:05}");
                    table.insert(&key, key.as_bytes()).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in (0..2000).rev() {
                        let key = format!("k{i:05}");
                        // Whatever is visible must be consistent.
                        if let Some(value) = table.get(&key) {
                            assert_eq!(value, key.as_bytes());
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        for i in 0..2000 {
            let key = format!("k{i:05}");
            assert_eq!(table.get(&key), Some(key.as_bytes()));
        }
    }
}
