//! Time-bucketed sliding counters
//!
//! A ring of per-second cells indexed by `epoch_seconds % N`. Whichever
//! recorder first observes a stale cell wins a CAS on its timestamp and
//! resets the value; losers skip the reset and accumulate directly. Under a
//! burst, at most one record per cell can land between the timestamp swap
//! and the reset and be undercounted by one — acceptable for rate
//! thresholds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the Unix epoch
#[inline]
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug)]
struct Bucket {
    stamp: AtomicU64,
    value: AtomicU64,
}

/// Lock-free windowed counter
#[derive(Debug)]
pub struct SlidingCounter {
    buckets: Box<[Bucket]>,
}

impl SlidingCounter {
    /// Create a counter able to answer windows up to `window_secs`
    pub fn with_window(window_secs: u64) -> Self {
        Self::new(window_secs as usize + 1)
    }

    pub fn new(buckets: usize) -> Self {
        assert!(buckets >= 2, "need at least two buckets");
        Self {
            buckets: (0..buckets)
                .map(|_| Bucket {
                    stamp: AtomicU64::new(0),
                    value: AtomicU64::new(0),
                })
                .collect(),
        }
    }

    /// Number of one-second cells in the ring
    pub fn buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn record(&self, amount: u64) {
        self.record_at(epoch_secs(), amount);
    }

    pub fn record_at(&self, now_sec: u64, amount: u64) {
        let bucket = &self.buckets[(now_sec % self.buckets.len() as u64) as usize];

        let stamp = bucket.stamp.load(Ordering::Relaxed);
        if stamp != now_sec
            && bucket
                .stamp
                .compare_exchange(stamp, now_sec, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            bucket.value.store(0, Ordering::Relaxed);
        }

        bucket.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Sum of all cells stamped within the last `window_secs` seconds
    pub fn sum(&self, window_secs: u64) -> u64 {
        self.sum_at(epoch_secs(), window_secs)
    }

    pub fn sum_at(&self, now_sec: u64, window_secs: u64) -> u64 {
        debug_assert!(
            (window_secs as usize) < self.buckets.len(),
            "window exceeds ring capacity"
        );

        self.buckets
            .iter()
            .filter_map(|b| {
                let stamp = b.stamp.load(Ordering::Relaxed);
                (stamp != 0 && now_sec.saturating_sub(stamp) < window_secs)
                    .then(|| b.value.load(Ordering::Relaxed))
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A fixed "now" keeps these tests deterministic; 1_700_000_000 is an
    // arbitrary recent epoch second.
    const T0: u64 = 1_700_000_000;

    #[test]
    fn test_events_within_window_are_counted() {
        let counter = SlidingCounter::with_window(5);
        for i in 0..20 {
            counter.record_at(T0 + (i % 3), 1);
        }
        assert_eq!(counter.sum_at(T0 + 2, 5), 20);
    }

    #[test]
    fn test_window_expires() {
        let counter = SlidingCounter::with_window(5);
        counter.record_at(T0, 10);
        assert_eq!(counter.sum_at(T0, 5), 10);

        // Twice the window later, nothing remains
        assert_eq!(counter.sum_at(T0 + 10, 5), 0);
    }

    #[test]
    fn test_byte_amounts_accumulate() {
        let counter = SlidingCounter::with_window(5);
        counter.record_at(T0, 1500);
        counter.record_at(T0, 1500);
        counter.record_at(T0 + 1, 64);
        assert_eq!(counter.sum_at(T0 + 1, 5), 3064);
    }

    #[test]
    fn test_stale_bucket_is_reused() {
        let counter = SlidingCounter::new(4);
        counter.record_at(T0, 7);

        // Same ring index four seconds later must not inherit the old count
        counter.record_at(T0 + 4, 1);
        assert_eq!(counter.sum_at(T0 + 4, 3), 1);
    }

    #[test]
    fn test_partial_window() {
        let counter = SlidingCounter::with_window(10);
        counter.record_at(T0, 5);
        counter.record_at(T0 + 4, 3);
        counter.record_at(T0 + 8, 2);

        // A 5-second window ending at T0+8 sees only the last two
        assert_eq!(counter.sum_at(T0 + 8, 5), 5);
        // The full window sees everything
        assert_eq!(counter.sum_at(T0 + 8, 10), 10);
    }

    #[test]
    fn test_concurrent_recording() {
        use std::sync::Arc;

        let counter = Arc::new(SlidingCounter::with_window(5));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    counter.record_at(T0, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // No resets occur at a constant timestamp, so the count is exact
        assert_eq!(counter.sum_at(T0, 5), 4000);
    }
}
