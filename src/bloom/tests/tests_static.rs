#[cfg(test)]
mod tests {
    use crate::bloom::{FilterParams, StaticFilter, MAX_HASH_COUNT};

    fn params(rate: f64, capacity: usize) -> FilterParams {
        FilterParams {
            target_error_rate: rate,
            capacity,
            ..FilterParams::with_seed(42)
        }
    }

    #[test]
    fn test_hash_count_formula() {
        // k = ceil(log2(1/p))
        assert_eq!(FilterParams::hash_count(0.5), 1);
        assert_eq!(FilterParams::hash_count(0.25), 2);
        assert_eq!(FilterParams::hash_count(0.01), 7);
        assert_eq!(FilterParams::hash_count(0.001), 10);
    }

    #[test]
    fn test_slice_bits_formula() {
        // m = ceil(c * |ln p| / (k * ln^2 2)) with k = 7 for p = 0.01
        let m = FilterParams::slice_bits(0.01, 100);
        assert_eq!(m, 137);
    }

    #[test]
    fn test_inserted_elements_test_positive() {
        let mut filter = StaticFilter::new(params(0.01, 500));

        for i in 0..500 {
            let key = format!("element-{i}");
            filter.insert(key.as_bytes());
        }

        for i in 0..500 {
            let key = format!("element-{i}");
            assert!(filter.might_contain(key.as_bytes()), "lost {key}");
        }
    }

    #[test]
    fn test_insert_reports_duplicates() {
        let mut filter = StaticFilter::new(params(0.01, 100));

        assert!(!filter.insert(b"alpha"));
        assert!(filter.insert(b"alpha"));
        assert_eq!(filter.count(), 1);
    }

    #[test]
    fn test_insert_new_skips_probe() {
        let mut filter = StaticFilter::new(params(0.01, 100));

        filter.insert_new(b"alpha");
        filter.insert_new(b"beta");

        assert!(filter.might_contain(b"alpha"));
        assert!(filter.might_contain(b"beta"));
        assert_eq!(filter.count(), 2);
    }

    #[test]
    fn test_good_until_capacity() {
        let mut filter = StaticFilter::new(params(0.01, 3));

        assert!(filter.good());
        filter.insert_new(b"a");
        filter.insert_new(b"b");
        assert!(filter.good());
        filter.insert_new(b"c");
        assert!(!filter.good());

        // Inserts past capacity are still accepted.
        filter.insert_new(b"d");
        assert!(filter.might_contain(b"d"));
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let mut filter = StaticFilter::new(params(0.01, 1000));

        for i in 0..1000 {
            let key = format!("member-{i}");
            filter.insert_new(key.as_bytes());
        }

        let mut false_positives = 0usize;
        let trials = 10_000usize;
        for i in 0..trials {
            let key = format!("outsider-{i}");
            if filter.might_contain(key.as_bytes()) {
                false_positives += 1;
            }
        }

        let rate = false_positives as f64 / trials as f64;
        assert!(rate <= 0.02, "observed fpr {rate} above 2x target");
    }

    #[test]
    fn test_seed_expansion_is_distinct() {
        let params = FilterParams::with_seed(7);
        for i in 0..MAX_HASH_COUNT {
            for j in (i + 1)..MAX_HASH_COUNT {
                assert_ne!(params.hash_seeds[i], params.hash_seeds[j]);
            }
        }
    }
}
