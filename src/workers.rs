//! Worker pool
//!
//! A fixed set of threads pulls `PacketJob`s from the MPMC queue and runs
//! them through `GridWatch::process_packet`. Submission never blocks: a
//! full queue rejects the job and counts it. Each job carries a result cell
//! the worker fills with release stores; submitters poll it with acquire
//! loads.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::core::Ipv4;
use crate::engine::GridWatch;
use crate::lockfree::MpmcQueue;

/// Default job queue capacity
pub const PACKET_QUEUE_CAPACITY: usize = 32_768;

/// One packet awaiting a verdict
pub struct PacketJob {
    pub received_at: Instant,
    pub payload: Vec<u8>,
    pub source: Ipv4,
    pub dest: Ipv4,
    pub source_port: u16,
    pub dest_port: u16,
    result: Arc<JobResult>,
}

struct JobResult {
    processed: AtomicBool,
    allowed: AtomicBool,
}

/// Submitter-side view of a job's outcome
#[derive(Clone)]
pub struct JobHandle(Arc<JobResult>);

impl JobHandle {
    /// The verdict, once a worker has published it
    pub fn verdict(&self) -> Option<bool> {
        self.0
            .processed
            .load(Ordering::Acquire)
            .then(|| self.0.allowed.load(Ordering::Acquire))
    }

    /// Poll until the verdict is available or the timeout elapses
    pub fn wait(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(verdict) = self.verdict() {
                return Some(verdict);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::yield_now();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerPoolStats {
    pub packets_queued: u64,
    pub packets_processed: u64,
    pub packets_rejected: u64,
    pub queue_depth: usize,
    pub workers: usize,
}

struct PoolCounters {
    queued: CachePadded<AtomicU64>,
    processed: CachePadded<AtomicU64>,
    rejected: CachePadded<AtomicU64>,
}

/// Thread pool driving the engine hot path
pub struct WorkerPool {
    engine: Arc<GridWatch>,
    queue: Arc<MpmcQueue<PacketJob>>,
    counters: Arc<PoolCounters>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl WorkerPool {
    /// Pool with the default 32K-slot queue; `num_threads == 0` uses the
    /// CPU count
    pub fn new(engine: Arc<GridWatch>, num_threads: usize) -> Self {
        Self::with_capacity(engine, num_threads, PACKET_QUEUE_CAPACITY)
    }

    pub fn with_capacity(engine: Arc<GridWatch>, num_threads: usize, capacity: usize) -> Self {
        let num_threads = if num_threads == 0 {
            num_cpus::get().max(1)
        } else {
            num_threads
        };

        Self {
            engine,
            queue: Arc::new(MpmcQueue::new(capacity)),
            counters: Arc::new(PoolCounters {
                queued: CachePadded::new(AtomicU64::new(0)),
                processed: CachePadded::new(AtomicU64::new(0)),
                rejected: CachePadded::new(AtomicU64::new(0)),
            }),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            num_threads,
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut workers = self.workers.lock();
        for i in 0..self.num_threads {
            let engine = Arc::clone(&self.engine);
            let queue = Arc::clone(&self.queue);
            let counters = Arc::clone(&self.counters);
            let running = Arc::clone(&self.running);

            let handle = std::thread::Builder::new()
                .name(format!("gw-worker-{}", i))
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        match queue.try_pop() {
                            Some(job) => {
                                let allowed = engine.process_packet(
                                    &job.payload,
                                    job.source,
                                    job.dest,
                                    job.source_port,
                                    job.dest_port,
                                );
                                job.result.allowed.store(allowed, Ordering::Release);
                                job.result.processed.store(true, Ordering::Release);
                                counters.processed.fetch_add(1, Ordering::Relaxed);
                            }
                            None => std::thread::yield_now(),
                        }
                    }
                    // Residual jobs are abandoned on shutdown
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        info!("worker pool started with {} threads", self.num_threads);
    }

    /// Stop and join all workers; queued jobs left behind are abandoned
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        let leftover = self.queue.len();
        if leftover > 0 {
            debug!("worker pool stopped with {} jobs abandoned", leftover);
        }
    }

    /// Enqueue a packet without blocking; `None` means the queue was full
    pub fn submit(
        &self,
        payload: Vec<u8>,
        source: Ipv4,
        dest: Ipv4,
        source_port: u16,
        dest_port: u16,
    ) -> Option<JobHandle> {
        let result = Arc::new(JobResult {
            processed: AtomicBool::new(false),
            allowed: AtomicBool::new(false),
        });
        let job = PacketJob {
            received_at: Instant::now(),
            payload,
            source,
            dest,
            source_port,
            dest_port,
            result: Arc::clone(&result),
        };

        match self.queue.try_push(job) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Some(JobHandle(result))
            }
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            packets_queued: self.counters.queued.load(Ordering::Relaxed),
            packets_processed: self.counters.processed.load(Ordering::Relaxed),
            packets_rejected: self.counters.rejected.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
            workers: self.num_threads,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_threads
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectionConfig;
    use crate::core::AttackType;
    use crate::modbus::build_frame;

    fn make_engine(tag: &str) -> Arc<GridWatch> {
        let log = std::env::temp_dir()
            .join(format!("gridwatch-workers-{}-{}.log", tag, std::process::id()));
        GridWatch::new(DetectionConfig::default(), &log.to_string_lossy()).unwrap()
    }

    const SRC: Ipv4 = Ipv4::new(10, 0, 0, 5);
    const DST: Ipv4 = Ipv4::new(192, 168, 1, 100);

    #[test]
    fn test_pool_processes_submitted_jobs() {
        let engine = make_engine("basic");
        let pool = WorkerPool::new(Arc::clone(&engine), 2);
        pool.start();

        let frame = build_frame(1, 1, 0x03, &[0x00, 0x00, 0x00, 0x01]);
        let mut handles = Vec::new();
        for _ in 0..50 {
            handles.push(pool.submit(frame.clone(), SRC, DST, 45000, 502).unwrap());
        }

        for handle in &handles {
            assert_eq!(handle.wait(Duration::from_secs(5)), Some(true));
        }

        let stats = pool.stats();
        assert_eq!(stats.packets_queued, 50);
        assert_eq!(stats.packets_processed, 50);
        assert_eq!(stats.packets_rejected, 0);
        pool.stop();
    }

    #[test]
    fn test_blocked_source_gets_drop_verdict() {
        let engine = make_engine("verdict");
        engine.block_ip(SRC, AttackType::DosFlood);

        let pool = WorkerPool::new(Arc::clone(&engine), 1);
        pool.start();

        let handle = pool
            .submit(vec![0u8; 32], SRC, DST, 45000, 502)
            .unwrap();
        assert_eq!(handle.wait(Duration::from_secs(5)), Some(false));
        pool.stop();
    }

    #[test]
    fn test_full_queue_rejects_without_blocking() {
        let engine = make_engine("full");
        // Workers never started, so the queue only fills
        let pool = WorkerPool::with_capacity(engine, 1, 8);

        for _ in 0..8 {
            assert!(pool.submit(vec![0u8; 4], SRC, DST, 45000, 502).is_some());
        }
        assert!(pool.submit(vec![0u8; 4], SRC, DST, 45000, 502).is_none());
        assert_eq!(pool.stats().packets_rejected, 1);
    }

    #[test]
    fn test_verdict_unavailable_until_processed() {
        let engine = make_engine("pending");
        let pool = WorkerPool::with_capacity(engine, 1, 8);

        let handle = pool.submit(vec![0u8; 4], SRC, DST, 45000, 8080).unwrap();
        assert_eq!(handle.verdict(), None);

        pool.start();
        assert_eq!(handle.wait(Duration::from_secs(5)), Some(true));
        pool.stop();
    }

    #[test]
    fn test_stop_abandons_residual_jobs() {
        let engine = make_engine("abandon");
        let pool = WorkerPool::with_capacity(engine, 1, 16);

        let handle = pool.submit(vec![0u8; 4], SRC, DST, 45000, 8080).unwrap();
        // Pool was never started; stop() must not hang and the job stays
        // unprocessed
        pool.stop();
        assert_eq!(handle.verdict(), None);
    }

    #[test]
    fn test_auto_thread_count() {
        let engine = make_engine("auto");
        let pool = WorkerPool::new(engine, 0);
        assert!(pool.num_workers() >= 1);
    }
}
