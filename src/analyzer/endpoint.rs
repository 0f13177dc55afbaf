//! Per-source endpoint state
//!
//! Every source IP the engine observes gets one `EndpointState`, held in a
//! lock-striped table: an array of shards, each shard a mutex around a hash
//! map keyed by the IPv4 u32 key. The hot path touches exactly one shard
//! mutex per packet. Idle endpoints are retired by the periodic sweep.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::DetectionConfig;
use crate::sliding::SlidingCounter;

/// Number of lock stripes in the endpoint table
pub const SHARD_COUNT: usize = 64;

/// Endpoints idle this long are retired by the sweep
pub const ENDPOINT_IDLE_SECS: u64 = 600;

/// Capacity divisor applied while a rate-limit restriction is active
const RESTRICT_DIVISOR: f64 = 4.0;

/// Running mean and variance over packet sizes (Welford)
#[derive(Debug, Clone, Default)]
pub struct SizeStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl SizeStats {
    pub fn update(&mut self, size: f64) {
        self.count += 1;
        let delta = size - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (size - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }
}

/// Per-source token bucket applied before analysis
///
/// Capacity is twice the DoS packet threshold, refilled at the threshold
/// rate, so sustained traffic above the detection ceiling is shed before it
/// reaches the analyzer. A rate-limit mitigation shrinks the effective
/// capacity for a bounded interval.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    restricted_until: Option<Instant>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
            restricted_until: None,
        }
    }

    fn effective_capacity(&mut self) -> f64 {
        match self.restricted_until {
            Some(until) if Instant::now() < until => self.capacity / RESTRICT_DIVISOR,
            Some(_) => {
                self.restricted_until = None;
                self.capacity
            }
            None => self.capacity,
        }
    }

    /// Take one token; false means the bucket is empty
    pub fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        let cap = self.effective_capacity();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(cap);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Shrink capacity for `duration`
    pub fn restrict(&mut self, duration: Duration) {
        self.restricted_until = Some(Instant::now() + duration);
        let cap = self.capacity / RESTRICT_DIVISOR;
        if self.tokens > cap {
            self.tokens = cap;
        }
    }

    pub fn is_restricted(&self) -> bool {
        matches!(self.restricted_until, Some(until) if Instant::now() < until)
    }
}

/// Behavioral state for one source endpoint
#[derive(Debug)]
pub struct EndpointState {
    pub first_seen: u64,
    pub last_seen: u64,
    /// Destination ports with their most recent observation time
    ports: HashMap<u16, u64>,
    pub packets: SlidingCounter,
    pub bytes: SlidingCounter,
    pub reads_total: u64,
    pub writes_total: u64,
    reads_window: SlidingCounter,
    writes_window: SlidingCounter,
    pub exceptions: SlidingCounter,
    pub size_stats: SizeStats,
    pub governor: TokenBucket,
}

impl EndpointState {
    pub fn new(config: &DetectionConfig, now: u64) -> Self {
        let window = config.dos_window;
        Self {
            first_seen: now,
            last_seen: now,
            ports: HashMap::new(),
            packets: SlidingCounter::with_window(window),
            bytes: SlidingCounter::with_window(window),
            reads_total: 0,
            writes_total: 0,
            reads_window: SlidingCounter::with_window(window),
            writes_window: SlidingCounter::with_window(window),
            exceptions: SlidingCounter::with_window(window),
            size_stats: SizeStats::default(),
            governor: TokenBucket::new(
                2.0 * config.dos_packet_threshold as f64,
                config.dos_packet_threshold as f64 / window as f64,
            ),
        }
    }

    pub fn touch(&mut self, now: u64) {
        self.last_seen = now;
    }

    /// Record a destination port, drop entries older than the window, and
    /// return the distinct-port count
    pub fn record_port(&mut self, port: u16, now: u64, window: u64) -> usize {
        self.ports.insert(port, now);
        self.ports.retain(|_, seen| now.saturating_sub(*seen) < window);
        self.ports.len()
    }

    pub fn record_read(&mut self, now: u64) {
        self.reads_total += 1;
        self.reads_window.record_at(now, 1);
    }

    pub fn record_write(&mut self, now: u64) {
        self.writes_total += 1;
        self.writes_window.record_at(now, 1);
    }

    /// writes/(reads+1) over the recent window
    pub fn write_read_ratio(&self, now: u64, window: u64) -> f64 {
        let writes = self.writes_window.sum_at(now, window) as f64;
        let reads = self.reads_window.sum_at(now, window) as f64;
        writes / (reads + 1.0)
    }
}

struct Shard {
    map: Mutex<HashMap<u32, EndpointState>>,
}

/// Lock-striped map of source endpoint state
pub struct EndpointTable {
    shards: Vec<Shard>,
    config: DetectionConfig,
}

impl EndpointTable {
    pub fn new(config: DetectionConfig) -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Shard {
                    map: Mutex::new(HashMap::new()),
                })
                .collect(),
            config,
        }
    }

    #[inline]
    fn shard(&self, key: u32) -> &Shard {
        // Multiplicative hash spreads nearby addresses across shards
        let hash = key.wrapping_mul(0x9E37_79B9);
        &self.shards[(hash as usize) % self.shards.len()]
    }

    /// Run `f` on the endpoint's state, creating it on first observation
    pub fn with_state<R>(&self, key: u32, now: u64, f: impl FnOnce(&mut EndpointState) -> R) -> R {
        let mut map = self.shard(key).map.lock();
        let state = map
            .entry(key)
            .or_insert_with(|| EndpointState::new(&self.config, now));
        state.touch(now);
        f(state)
    }

    /// Run `f` on the endpoint's state only if it exists
    pub fn with_existing<R>(&self, key: u32, f: impl FnOnce(&mut EndpointState) -> R) -> Option<R> {
        self.shard(key).map.lock().get_mut(&key).map(f)
    }

    pub fn contains(&self, key: u32) -> bool {
        self.shard(key).map.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retire endpoints idle longer than `idle_secs`; returns how many
    pub fn retire_idle(&self, now: u64, idle_secs: u64) -> usize {
        let mut retired = 0;
        for shard in &self.shards {
            let mut map = shard.map.lock();
            let before = map.len();
            map.retain(|_, state| now.saturating_sub(state.last_seen) < idle_secs);
            retired += before - map.len();
        }
        retired
    }
}
