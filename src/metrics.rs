//! Statistics and performance metrics
//!
//! Everything here is updated from the hot path with relaxed atomics;
//! snapshots are eventually consistent by design. Counters sit in their own
//! cache lines to keep concurrent workers from bouncing them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;
use serde::Serialize;

use crate::sliding::epoch_secs;

// ============================================================================
// Verdict statistics
// ============================================================================

/// Engine-wide packet and threat counters
pub struct Statistics {
    packets_processed: CachePadded<AtomicU64>,
    packets_allowed: CachePadded<AtomicU64>,
    packets_dropped: CachePadded<AtomicU64>,
    bytes_processed: CachePadded<AtomicU64>,
    threats_detected: CachePadded<AtomicU64>,
    threats_mitigated: CachePadded<AtomicU64>,
    total_blocks: CachePadded<AtomicU64>,
    active_blocks: CachePadded<AtomicU64>,
    started_at: Instant,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            packets_processed: CachePadded::new(AtomicU64::new(0)),
            packets_allowed: CachePadded::new(AtomicU64::new(0)),
            packets_dropped: CachePadded::new(AtomicU64::new(0)),
            bytes_processed: CachePadded::new(AtomicU64::new(0)),
            threats_detected: CachePadded::new(AtomicU64::new(0)),
            threats_mitigated: CachePadded::new(AtomicU64::new(0)),
            total_blocks: CachePadded::new(AtomicU64::new(0)),
            active_blocks: CachePadded::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    #[inline]
    pub fn packet_processed(&self) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn packet_allowed(&self) {
        self.packets_allowed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn packet_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes(&self, n: u64) {
        self.bytes_processed.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn threat_detected(&self) {
        self.threats_detected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn threat_mitigated(&self) {
        self.threats_mitigated.fetch_add(1, Ordering::Relaxed);
    }

    /// A block was installed
    pub fn block_installed(&self) {
        self.total_blocks.fetch_add(1, Ordering::Relaxed);
        self.active_blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// A block expired, was evicted, or was removed
    pub fn block_released(&self) {
        self.active_blocks.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_blocks(&self) -> u64 {
        self.active_blocks.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let packets_processed = self.packets_processed.load(Ordering::Relaxed);
        let packets_allowed = self.packets_allowed.load(Ordering::Relaxed);
        let packets_dropped = self.packets_dropped.load(Ordering::Relaxed);
        let bytes_processed = self.bytes_processed.load(Ordering::Relaxed);
        let threats_detected = self.threats_detected.load(Ordering::Relaxed);
        let uptime_secs = self.started_at.elapsed().as_secs_f64();

        let (packets_per_second, bytes_per_second, threat_rate_per_minute) = if uptime_secs > 0.0 {
            (
                packets_processed as f64 / uptime_secs,
                bytes_processed as f64 / uptime_secs,
                threats_detected as f64 / uptime_secs * 60.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        let (drop_rate_percent, allow_rate_percent) = if packets_processed > 0 {
            (
                packets_dropped as f64 * 100.0 / packets_processed as f64,
                packets_allowed as f64 * 100.0 / packets_processed as f64,
            )
        } else {
            (0.0, 0.0)
        };

        StatsSnapshot {
            packets_processed,
            packets_allowed,
            packets_dropped,
            bytes_processed,
            threats_detected,
            threats_mitigated: self.threats_mitigated.load(Ordering::Relaxed),
            total_blocks: self.total_blocks.load(Ordering::Relaxed),
            active_blocks: self.active_blocks.load(Ordering::Relaxed),
            packets_per_second,
            bytes_per_second,
            threat_rate_per_minute,
            drop_rate_percent,
            allow_rate_percent,
            uptime_secs: uptime_secs as u64,
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the statistics counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub packets_processed: u64,
    pub packets_allowed: u64,
    pub packets_dropped: u64,
    pub bytes_processed: u64,
    pub threats_detected: u64,
    pub threats_mitigated: u64,
    pub total_blocks: u64,
    pub active_blocks: u64,
    pub packets_per_second: f64,
    pub bytes_per_second: f64,
    pub threat_rate_per_minute: f64,
    pub drop_rate_percent: f64,
    pub allow_rate_percent: f64,
    pub uptime_secs: u64,
}

// ============================================================================
// Latency tracking
// ============================================================================

const HISTOGRAM_BUCKETS: usize = 32;

/// Hot-path latency tracker
///
/// Keeps count/sum plus CAS-maintained min/max and a logarithmic histogram:
/// bucket index is half the bit length of the nanosecond value, so each
/// bucket spans a 4x latency range.
pub struct LatencyTracker {
    samples: CachePadded<AtomicU64>,
    total_ns: CachePadded<AtomicU64>,
    min_ns: CachePadded<AtomicU64>,
    max_ns: CachePadded<AtomicU64>,
    histogram: [AtomicU64; HISTOGRAM_BUCKETS],
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            samples: CachePadded::new(AtomicU64::new(0)),
            total_ns: CachePadded::new(AtomicU64::new(0)),
            min_ns: CachePadded::new(AtomicU64::new(u64::MAX)),
            max_ns: CachePadded::new(AtomicU64::new(0)),
            histogram: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, ns: u64) {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);

        let mut current = self.min_ns.load(Ordering::Relaxed);
        while ns < current {
            match self.min_ns.compare_exchange_weak(
                current,
                ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }

        let mut current = self.max_ns.load(Ordering::Relaxed);
        while ns > current {
            match self.max_ns.compare_exchange_weak(
                current,
                ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }

        let bucket = (((63 - (ns | 1).leading_zeros()) / 2) as usize).min(HISTOGRAM_BUCKETS - 1);
        self.histogram[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> LatencyStats {
        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return LatencyStats::default();
        }

        let total = self.total_ns.load(Ordering::Relaxed);
        let avg_ns = total as f64 / samples as f64;
        LatencyStats {
            samples,
            min_ns: self.min_ns.load(Ordering::Relaxed),
            max_ns: self.max_ns.load(Ordering::Relaxed),
            avg_ns,
            avg_us: avg_ns / 1_000.0,
            avg_ms: avg_ns / 1_000_000.0,
        }
    }

    /// Histogram bucket counts, low latency first
    pub fn histogram(&self) -> [u64; HISTOGRAM_BUCKETS] {
        std::array::from_fn(|i| self.histogram[i].load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.samples.store(0, Ordering::Relaxed);
        self.total_ns.store(0, Ordering::Relaxed);
        self.min_ns.store(u64::MAX, Ordering::Relaxed);
        self.max_ns.store(0, Ordering::Relaxed);
        for bucket in &self.histogram {
            bucket.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: f64,
    pub avg_us: f64,
    pub avg_ms: f64,
}

// ============================================================================
// Throughput tracking
// ============================================================================

const THROUGHPUT_WINDOW: usize = 60;

struct ThroughputSlot {
    packets: AtomicU64,
    bytes: AtomicU64,
    stamp: AtomicU64,
}

/// Per-second packets/bytes over a one-minute ring
pub struct ThroughputTracker {
    slots: [ThroughputSlot; THROUGHPUT_WINDOW],
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| ThroughputSlot {
                packets: AtomicU64::new(0),
                bytes: AtomicU64::new(0),
                stamp: AtomicU64::new(0),
            }),
        }
    }

    pub fn record(&self, bytes: u64) {
        self.record_at(epoch_secs(), bytes);
    }

    pub fn record_at(&self, now_sec: u64, bytes: u64) {
        let slot = &self.slots[(now_sec % THROUGHPUT_WINDOW as u64) as usize];

        let stamp = slot.stamp.load(Ordering::Relaxed);
        if stamp != now_sec
            && slot
                .stamp
                .compare_exchange(stamp, now_sec, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            slot.packets.store(0, Ordering::Relaxed);
            slot.bytes.store(0, Ordering::Relaxed);
        }

        slot.packets.fetch_add(1, Ordering::Relaxed);
        slot.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn stats(&self, window_secs: u64) -> ThroughputStats {
        self.stats_at(epoch_secs(), window_secs)
    }

    pub fn stats_at(&self, now_sec: u64, window_secs: u64) -> ThroughputStats {
        let window_secs = window_secs.min(THROUGHPUT_WINDOW as u64);
        let mut packets = 0u64;
        let mut bytes = 0u64;
        let mut valid = 0u64;

        for slot in &self.slots {
            let stamp = slot.stamp.load(Ordering::Relaxed);
            if stamp != 0 && now_sec.saturating_sub(stamp) < window_secs {
                packets += slot.packets.load(Ordering::Relaxed);
                bytes += slot.bytes.load(Ordering::Relaxed);
                valid += 1;
            }
        }

        if valid == 0 {
            return ThroughputStats::default();
        }

        let bytes_per_sec = bytes as f64 / valid as f64;
        ThroughputStats {
            packets_per_sec: packets as f64 / valid as f64,
            bytes_per_sec,
            mbps: bytes_per_sec * 8.0 / 1_000_000.0,
        }
    }
}

impl Default for ThroughputTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ThroughputStats {
    pub packets_per_sec: f64,
    pub bytes_per_sec: f64,
    pub mbps: f64,
}

// ============================================================================
// Resource accounting
// ============================================================================

/// Paired allocation counters for arena-style accounting
pub struct ResourceMonitor {
    allocated: CachePadded<AtomicU64>,
    freed: CachePadded<AtomicU64>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            allocated: CachePadded::new(AtomicU64::new(0)),
            freed: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn record_allocation(&self, bytes: u64) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_deallocation(&self, bytes: u64) {
        self.freed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn current_usage(&self) -> u64 {
        let allocated = self.allocated.load(Ordering::Relaxed);
        let freed = self.freed.load(Ordering::Relaxed);
        allocated.saturating_sub(freed)
    }

    pub fn usage_mb(&self) -> f64 {
        self.current_usage() as f64 / (1024.0 * 1024.0)
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Combined manager
// ============================================================================

/// All performance metrics the engine records
pub struct MetricsManager {
    packet_latency: LatencyTracker,
    threat_latency: LatencyTracker,
    throughput: ThroughputTracker,
    resources: ResourceMonitor,
}

impl MetricsManager {
    pub fn new() -> Self {
        Self {
            packet_latency: LatencyTracker::new(),
            threat_latency: LatencyTracker::new(),
            throughput: ThroughputTracker::new(),
            resources: ResourceMonitor::new(),
        }
    }

    pub fn packet_latency(&self) -> &LatencyTracker {
        &self.packet_latency
    }

    pub fn threat_latency(&self) -> &LatencyTracker {
        &self.threat_latency
    }

    pub fn throughput(&self) -> &ThroughputTracker {
        &self.throughput
    }

    pub fn resources(&self) -> &ResourceMonitor {
        &self.resources
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packet_latency: self.packet_latency.stats(),
            threat_latency: self.threat_latency.stats(),
            throughput: self.throughput.stats(10),
            memory_mb: self.resources.usage_mb(),
        }
    }
}

impl Default for MetricsManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub packet_latency: LatencyStats,
    pub threat_latency: LatencyStats,
    pub throughput: ThroughputStats,
    pub memory_mb: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_counters_balance() {
        let stats = Statistics::new();
        for i in 0..100 {
            stats.packet_processed();
            if i % 4 == 0 {
                stats.packet_dropped();
            } else {
                stats.packet_allowed();
            }
        }

        let snap = stats.snapshot();
        assert_eq!(snap.packets_processed, 100);
        assert_eq!(snap.packets_allowed + snap.packets_dropped, snap.packets_processed);
        assert_eq!(snap.packets_dropped, 25);
    }

    #[test]
    fn test_block_gauge() {
        let stats = Statistics::new();
        stats.block_installed();
        stats.block_installed();
        stats.block_released();

        let snap = stats.snapshot();
        assert_eq!(snap.total_blocks, 2);
        assert_eq!(snap.active_blocks, 1);
    }

    #[test]
    fn test_latency_min_max_avg() {
        let tracker = LatencyTracker::new();
        tracker.record(100);
        tracker.record(300);
        tracker.record(200);

        let stats = tracker.stats();
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.min_ns, 100);
        assert_eq!(stats.max_ns, 300);
        assert!((stats.avg_ns - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_empty_stats() {
        let tracker = LatencyTracker::new();
        let stats = tracker.stats();
        assert_eq!(stats.samples, 0);
        assert_eq!(stats.min_ns, 0);
        assert_eq!(stats.max_ns, 0);
    }

    #[test]
    fn test_latency_histogram_buckets() {
        let tracker = LatencyTracker::new();
        tracker.record(1); // bucket 0
        tracker.record(1_000); // ~2^10, bucket 4
        tracker.record(1_000_000); // ~2^20, bucket 9

        let hist = tracker.histogram();
        assert_eq!(hist.iter().sum::<u64>(), 3);
        assert_eq!(hist[0], 1);
        assert_eq!(hist[4], 1);
        assert_eq!(hist[9], 1);
    }

    #[test]
    fn test_latency_concurrent_min_max() {
        use std::sync::Arc;

        let tracker = Arc::new(LatencyTracker::new());
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    tracker.record(t * 1000 + i + 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let stats = tracker.stats();
        assert_eq!(stats.samples, 4000);
        assert_eq!(stats.min_ns, 1);
        assert_eq!(stats.max_ns, 4000);
    }

    #[test]
    fn test_throughput_window() {
        const T0: u64 = 1_700_000_000;
        let tracker = ThroughputTracker::new();

        for _ in 0..10 {
            tracker.record_at(T0, 1000);
        }
        for _ in 0..20 {
            tracker.record_at(T0 + 1, 500);
        }

        let stats = tracker.stats_at(T0 + 1, 10);
        assert!((stats.packets_per_sec - 15.0).abs() < 1e-9);
        assert!((stats.bytes_per_sec - 10_000.0).abs() < 1e-9);

        // Far outside the window nothing remains
        let later = tracker.stats_at(T0 + 120, 10);
        assert_eq!(later.packets_per_sec, 0.0);
    }

    #[test]
    fn test_resource_monitor_pairing() {
        let monitor = ResourceMonitor::new();
        monitor.record_allocation(4096);
        monitor.record_allocation(4096);
        monitor.record_deallocation(4096);
        assert_eq!(monitor.current_usage(), 4096);

        monitor.record_deallocation(8192);
        assert_eq!(monitor.current_usage(), 0);
    }
}
