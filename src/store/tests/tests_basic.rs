#[cfg(test)]
mod tests {
    use crate::memtable::MemtableConfig;
    use crate::store::{Store, StoreConfig, StoreError};
    use std::time::Duration;
    use tempfile::TempDir;
    use tracing_subscriber::EnvFilter;

    /// Initialize tracing controlled by `RUST_LOG`. Safe to call multiple
    /// times — only the first call takes effect.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn config(dir: &TempDir) -> StoreConfig {
        init_tracing();
        StoreConfig {
            wal: crate::wal::WalConfig {
                base_dir: dir.path().join("wal"),
                ..Default::default()
            },
            sstable: crate::sstable::SSTableConfig {
                base_dir: dir.path().join("sst"),
                ..Default::default()
            },
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_put_get_and_miss() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(&dir)).unwrap();

        store.put("a", b"1").unwrap();
        store.put("b", b"2").unwrap();

        assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get("c").unwrap(), None);
    }

    #[test]
    fn test_overwrite_in_same_memtable() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(&dir)).unwrap();

        store.put("k", b"v1").unwrap();
        store.put("k", b"v2").unwrap();

        assert_eq!(store.get("k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_empty_key_and_empty_value() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(&dir)).unwrap();

        store.put("", b"empty key").unwrap();
        store.put("k", b"").unwrap();

        assert_eq!(store.get("").unwrap(), Some(b"empty key".to_vec()));
        assert_eq!(store.get("k").unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_newline_key_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(&dir)).unwrap();

        assert!(matches!(
            store.put("bad\nkey", b"v"),
            Err(StoreError::KeyContainsNewline)
        ));
    }

    #[test]
    fn test_get_from_history_after_rotation() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(&dir)).unwrap();

        store.put("old", b"value").unwrap();
        store.inner.save_memtable().unwrap();
        store.put("new", b"value2").unwrap();

        // "old" now lives in a sealed history table, "new" in the active.
        assert_eq!(store.get("old").unwrap(), Some(b"value".to_vec()));
        assert_eq!(store.get("new").unwrap(), Some(b"value2".to_vec()));
        assert_eq!(store.inner.history_depth().unwrap(), 1);
    }

    #[test]
    fn test_history_shadowing_newest_wins() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(config(&dir)).unwrap();

        store.put("k", b"oldest").unwrap();
        store.inner.save_memtable().unwrap();
        store.put("k", b"middle").unwrap();
        store.inner.save_memtable().unwrap();
        store.put("k", b"newest").unwrap();

        assert_eq!(store.get("k").unwrap(), Some(b"newest".to_vec()));
        assert_eq!(store.inner.history_depth().unwrap(), 2);
    }

    #[test]
    fn test_saturated_rotation_surfaces_error() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        // A zero-slot memtable can never accept a write, so rotation can
        // never unblock the insert.
        cfg.memtable = MemtableConfig {
            writes_before_lock: 0,
            ..MemtableConfig::default()
        };
        cfg.background_activity_period = Duration::from_secs(3600);
        let store = Store::open(cfg).unwrap();

        assert!(matches!(
            store.put("k", b"v"),
            Err(StoreError::MemtableSaturated)
        ));
    }
}
