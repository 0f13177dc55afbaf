//! Probabilistic membership pre-filter
//!
//! A fixed-size atomic bit array with K derived hash probes. `contains`
//! may report true for keys never added (false positive) but never the
//! reverse, so the filter only ever short-circuits toward the authoritative
//! store: a whitelist hit allows immediately, a blocklist hit is confirmed
//! against the block ledger before dropping.

use std::sync::atomic::{AtomicU64, Ordering};

/// Default filter width in bits
pub const DEFAULT_BITS: usize = 8192;

/// Default number of hash probes
pub const DEFAULT_HASHES: u32 = 3;

/// Atomic bloom filter over u32 keys
pub struct BloomFilter {
    words: Box<[AtomicU64]>,
    bits: usize,
    hashes: u32,
}

impl BloomFilter {
    /// Create a filter with `bits` cells (rounded up to a whole word) and
    /// `hashes` probes per key
    pub fn with_params(bits: usize, hashes: u32) -> Self {
        assert!(bits >= 64, "filter must hold at least one word");
        assert!(hashes >= 1, "at least one hash probe required");

        let words = bits.div_ceil(64);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            bits: words * 64,
            hashes,
        }
    }

    pub fn new() -> Self {
        Self::with_params(DEFAULT_BITS, DEFAULT_HASHES)
    }

    /// Two seeded splitmix-style mixes; probe i is their linear combination
    #[inline]
    fn probes(&self, key: u32) -> (u64, u64) {
        (mix(key as u64, 0x9E37_79B9_7F4A_7C15), mix(key as u64, 0xBF58_476D_1CE4_E5B9))
    }

    pub fn add(&self, key: u32) {
        let (h1, h2) = self.probes(key);
        for i in 0..self.hashes as u64 {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) % self.bits as u64) as usize;
            self.words[bit / 64].fetch_or(1 << (bit % 64), Ordering::Relaxed);
        }
    }

    pub fn contains(&self, key: u32) -> bool {
        let (h1, h2) = self.probes(key);
        for i in 0..self.hashes as u64 {
            let bit = (h1.wrapping_add(i.wrapping_mul(h2)) % self.bits as u64) as usize;
            if self.words[bit / 64].load(Ordering::Relaxed) & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Clear every bit
    ///
    /// A concurrent `contains` during the sweep may transiently miss a
    /// member; callers must treat the filter as a pre-filter only.
    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn mix(mut x: u64, seed: u64) -> u64 {
    x = x.wrapping_add(seed);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let filter = BloomFilter::new();
        for key in (0..10_000u32).step_by(7) {
            filter.add(key);
        }
        for key in (0..10_000u32).step_by(7) {
            assert!(filter.contains(key), "key {} lost", key);
        }
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let filter = BloomFilter::new();
        for key in 0..1000u32 {
            assert!(!filter.contains(key));
        }
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let filter = BloomFilter::new();
        for key in 0..500u32 {
            filter.add(key);
        }

        // 500 keys in 8192 bits with 3 probes: expect well under 10% FP
        let false_positives = (10_000..60_000u32)
            .filter(|&key| filter.contains(key))
            .count();
        assert!(
            false_positives < 5_000,
            "false positive rate too high: {}/50000",
            false_positives
        );
    }

    #[test]
    fn test_clear_resets_membership() {
        let filter = BloomFilter::new();
        filter.add(42);
        assert!(filter.contains(42));
        filter.clear();
        assert!(!filter.contains(42));
    }

    #[test]
    fn test_concurrent_add_contains() {
        use std::sync::Arc;

        let filter = Arc::new(BloomFilter::new());
        let mut handles = Vec::new();

        for t in 0..4u32 {
            let filter = Arc::clone(&filter);
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    filter.add(t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        for key in 0..4000u32 {
            assert!(filter.contains(key));
        }
    }
}
