//! Bloom Filter Module
//!
//! Probabilistic membership testing used to short-circuit SSTable point
//! lookups: a negative answer is definitive, a positive answer may be a
//! false positive at a configurable rate.
//!
//! ## Design Overview
//!
//! Two filters are provided:
//!
//! - [`StaticFilter`] — a classic partitioned Bloom filter. For a target
//!   false-positive rate `p` it computes `k = ⌈log₂(1/p)⌉` hash functions
//!   and allocates `k` equal-sized bit slices of
//!   `m = ⌈capacity · |ln p| / (k · ln²2)⌉` bits each; hash `i` sets one bit
//!   inside slice `i`. The filter is *good* while its element count stays
//!   below capacity; further inserts are accepted but degrade `p`.
//! - [`ScalableFilter`] — a growing list of static filters, after
//!   Almeida et al., *Scalable Bloom Filters* (GLOBECOM 2007). When the
//!   newest sub-filter fills up, a new one is appended with capacity scaled
//!   by `scaling_factor` and target rate tightened by `tightening_ratio`,
//!   which keeps the composite false-positive rate bounded.
//!
//! Hashing is non-cryptographic 64-bit xxHash with caller-supplied seeds
//! (up to [`MAX_HASH_COUNT`] of them). The current implementation computes
//! `k` full hashes per operation; a Kirsch-Mitzenmacher double-hashing
//! scheme would reduce that to two.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use xxhash_rust::xxh64::xxh64;

/// Maximum number of hash functions a filter may use. 32 seeds allow for
/// target rates down to roughly one in 4 billion.
pub const MAX_HASH_COUNT: usize = 32;

// ------------------------------------------------------------------------------------------------
// Parameters
// ------------------------------------------------------------------------------------------------

/// Sizing parameters for a [`StaticFilter`].
#[derive(Debug, Clone, Copy)]
pub struct FilterParams {
    /// Maximum allowable false-positive rate. `0 < target_error_rate < 1`.
    pub target_error_rate: f64,

    /// Elements that can be inserted before the rate exceeds
    /// `target_error_rate`. Must be > 0.
    pub capacity: usize,

    /// Seeds for the per-slice hash functions. Each seed must be distinct or
    /// filter quality degrades.
    pub hash_seeds: [u64; MAX_HASH_COUNT],
}

impl FilterParams {
    /// Default false-positive rate (1%).
    pub const DEFAULT_FPR: f64 = 0.01;

    /// Default capacity.
    pub const DEFAULT_CAPACITY: usize = 1000;

    /// Builds parameters with the defaults and a full seed set expanded from
    /// a single caller seed (splitmix64).
    pub fn with_seed(seed: u64) -> Self {
        let mut state = seed;
        let mut hash_seeds = [0u64; MAX_HASH_COUNT];
        for slot in &mut hash_seeds {
            state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
            *slot = z ^ (z >> 31);
        }

        Self {
            target_error_rate: Self::DEFAULT_FPR,
            capacity: Self::DEFAULT_CAPACITY,
            hash_seeds,
        }
    }

    /// Optimal hash count for the given target rate: `⌈log₂(1/p)⌉`.
    pub fn hash_count(target_error_rate: f64) -> usize {
        (1.0 / target_error_rate).log2().ceil() as usize
    }

    /// Optimal size in bits of each filter slice for the given rate and
    /// capacity.
    pub fn slice_bits(target_error_rate: f64, capacity: usize) -> usize {
        let numerator = capacity as f64 * target_error_rate.ln().abs();
        let denominator =
            Self::hash_count(target_error_rate) as f64 * 2.0_f64.ln() * 2.0_f64.ln();
        (numerator / denominator).ceil() as usize
    }
}

impl Default for FilterParams {
    fn default() -> Self {
        Self::with_seed(0)
    }
}

// ------------------------------------------------------------------------------------------------
// Static filter
// ------------------------------------------------------------------------------------------------

/// A fixed-capacity partitioned Bloom filter.
///
/// Each of the `k` hash functions owns one slice of the bit array; an
/// element sets (or probes) exactly one bit per slice. Membership tests
/// return `false` as soon as any required bit is clear.
pub struct StaticFilter {
    /// Parameters the filter was created with.
    params: FilterParams,

    /// Number of hash functions / bit slices.
    slices: usize,

    /// Bits per slice.
    bits_per_slice: usize,

    /// Packed bit array, `slices * bits_per_slice` bits, zero-initialized.
    bits: Vec<u8>,

    /// Number of distinct elements inserted so far.
    element_count: usize,
}

impl StaticFilter {
    /// Creates a filter sized for `params`.
    pub fn new(params: FilterParams) -> Self {
        assert!(
            params.target_error_rate > 0.0 && params.target_error_rate < 1.0,
            "target_error_rate must be in (0, 1)"
        );
        assert!(params.capacity > 0, "capacity must be > 0");

        let slices = FilterParams::hash_count(params.target_error_rate);
        assert!(slices <= MAX_HASH_COUNT, "target_error_rate too small");

        let bits_per_slice = FilterParams::slice_bits(params.target_error_rate, params.capacity);
        let bit_count = slices * bits_per_slice;
        let byte_count = bit_count / 8 + usize::from(bit_count % 8 != 0);

        Self {
            params,
            slices,
            bits_per_slice,
            bits: vec![0u8; byte_count],
            element_count: 0,
        }
    }

    /// Parameters the filter was created with.
    pub fn params(&self) -> &FilterParams {
        &self.params
    }

    /// Returns true while the filter holds fewer elements than its capacity.
    /// Beyond that point the false-positive rate worsens with each insert.
    pub fn good(&self) -> bool {
        self.element_count < self.params.capacity
    }

    /// Number of distinct elements inserted.
    pub fn count(&self) -> usize {
        self.element_count
    }

    /// Bit index for the `i`-th hash of `data`. Requires `i < slices`.
    fn bit_index(&self, i: usize, data: &[u8]) -> usize {
        let hash = xxh64(data, self.params.hash_seeds[i]);
        (hash % self.bits_per_slice as u64) as usize + i * self.bits_per_slice
    }

    /// Returns false if the element is certainly absent, true if it is
    /// probably present.
    pub fn might_contain(&self, data: &[u8]) -> bool {
        for i in 0..self.slices {
            if !self.check(self.bit_index(i, data)) {
                return false;
            }
        }
        true
    }

    /// Inserts an element, returning true if it was (probably) already
    /// present — i.e. every required bit was already set.
    pub fn insert(&mut self, data: &[u8]) -> bool {
        let mut all_set = true;
        for i in 0..self.slices {
            all_set = self.check_set(self.bit_index(i, data)) && all_set;
        }

        if !all_set {
            self.element_count += 1;
        }
        all_set
    }

    /// Inserts an element known not to have been inserted before, skipping
    /// the membership probe.
    pub fn insert_new(&mut self, data: &[u8]) {
        self.element_count += 1;
        for i in 0..self.slices {
            self.set(self.bit_index(i, data));
        }
    }

    fn check(&self, bit: usize) -> bool {
        self.bits[bit / 8] & (1 << (bit % 8)) != 0
    }

    fn set(&mut self, bit: usize) {
        self.bits[bit / 8] |= 1 << (bit % 8);
    }

    /// Sets a bit, returning its previous state.
    fn check_set(&mut self, bit: usize) -> bool {
        let old = self.check(bit);
        self.set(bit);
        old
    }
}

// ------------------------------------------------------------------------------------------------
// Scalable filter
// ------------------------------------------------------------------------------------------------

/// Parameters for a [`ScalableFilter`].
#[derive(Debug, Clone, Copy)]
pub struct ScalableParams {
    /// Parameters of the first sub-filter.
    pub filter: FilterParams,

    /// Target-rate multiplier applied to each successive sub-filter.
    /// `0 < tightening_ratio < 1`; typical values are 0.8–0.9.
    pub tightening_ratio: f64,

    /// Capacity multiplier applied to each successive sub-filter. Must be
    /// > 1; smaller values are more space efficient but slower.
    pub scaling_factor: usize,
}

impl Default for ScalableParams {
    fn default() -> Self {
        Self {
            filter: FilterParams::default(),
            tightening_ratio: 0.9,
            scaling_factor: 2,
        }
    }
}

/// An unbounded-capacity Bloom filter built from geometrically growing
/// static sub-filters with tightening error rates.
pub struct ScalableFilter {
    /// Parameters the filter was created with.
    params: ScalableParams,

    /// Sub-filters, oldest first. The last entry accepts new elements.
    filters: Vec<StaticFilter>,
}

impl ScalableFilter {
    /// Creates a scalable filter whose first sub-filter is sized by
    /// `params.filter`.
    pub fn new(params: ScalableParams) -> Self {
        assert!(
            params.tightening_ratio > 0.0 && params.tightening_ratio < 1.0,
            "tightening_ratio must be in (0, 1)"
        );
        assert!(params.scaling_factor > 1, "scaling_factor must be > 1");

        Self {
            params,
            filters: vec![StaticFilter::new(params.filter)],
        }
    }

    /// Total capacity across all sub-filters.
    pub fn capacity(&self) -> usize {
        self.filters.iter().map(|f| f.params.capacity).sum()
    }

    /// Total distinct elements inserted across all sub-filters.
    pub fn count(&self) -> usize {
        self.filters.iter().map(StaticFilter::count).sum()
    }

    /// Returns true if any sub-filter probably contains the element.
    pub fn might_contain(&self, data: &[u8]) -> bool {
        self.filters.iter().any(|f| f.might_contain(data))
    }

    /// Inserts an element, returning true if it was (probably) already
    /// present. Appends a new, larger and tighter sub-filter when the
    /// current one is full.
    pub fn insert(&mut self, data: &[u8]) -> bool {
        if self.might_contain(data) {
            return true;
        }

        let current = self.filters.last().expect("at least one sub-filter");
        if !current.good() {
            let mut next = *current.params();
            next.capacity *= self.params.scaling_factor;
            next.target_error_rate *= self.params.tightening_ratio;
            self.filters.push(StaticFilter::new(next));
        }

        self.filters
            .last_mut()
            .expect("at least one sub-filter")
            .insert_new(data);
        false
    }
}
