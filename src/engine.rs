//! Engine facade
//!
//! `GridWatch` wires the analyzer, mitigation engine, bloom fast paths,
//! statistics and audit logger into the per-packet verdict pipeline:
//!
//! ```text
//! payload ──▶ whitelist bloom ──▶ blocklist bloom ──▶ parse ──▶ governor
//!                 (allow)         (confirm + drop)
//!                                                        │
//!                      verdict ◀── mitigation ◀── behavioral analysis
//! ```
//!
//! The hot path never blocks and never fails: every error condition
//! converts to a DROP verdict. Two background threads sweep expired blocks
//! (every 60 s) and log a traffic summary (every 30 s); both observe the
//! shared `running` flag and are joined on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::analyzer::{BehavioralAnalyzer, EndpointTable};
use crate::bloom::BloomFilter;
use crate::config::DetectionConfig;
use crate::core::{AttackType, Ipv4, PacketRecord, ProtocolTag};
use crate::logger::AuditLogger;
use crate::metrics::{MetricsManager, MetricsSnapshot, Statistics, StatsSnapshot};
use crate::mitigation::{BlockEntry, MitigationAction, MitigationEngine};
use crate::modbus::ModbusParser;
use crate::whitelist::Whitelist;

/// Block-expiry sweep interval
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Traffic summary interval
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// The inline IDS/IPS engine
pub struct GridWatch {
    config: Arc<DetectionConfig>,
    parser: ModbusParser,
    analyzer: BehavioralAnalyzer,
    mitigation: Arc<MitigationEngine>,
    stats: Arc<Statistics>,
    metrics: Arc<MetricsManager>,
    logger: Arc<AuditLogger>,
    /// Fast allow path; populated from config, grows only via `add_whitelist`
    whitelist_bloom: BloomFilter,
    /// Fast probe; every hit is confirmed against the block ledger
    blocked_bloom: BloomFilter,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl GridWatch {
    /// Build the engine; fails on invalid config or unopenable log file
    pub fn new(config: DetectionConfig, log_file: &str) -> Result<Arc<Self>> {
        config.validate()?;

        let whitelist = Arc::new(Whitelist::from_ips(&config.whitelisted_ips));
        let table = Arc::new(EndpointTable::new(config.clone()));
        let config = Arc::new(config);
        let stats = Arc::new(Statistics::new());
        let metrics = Arc::new(MetricsManager::new());

        let logger = Arc::new(AuditLogger::new(log_file)?);
        logger.start();

        let analyzer = BehavioralAnalyzer::new(
            Arc::clone(&config),
            Arc::clone(&table),
            Arc::clone(&whitelist),
        );
        let mitigation = Arc::new(MitigationEngine::new(
            Arc::clone(&config),
            table,
            whitelist,
            Arc::clone(&stats),
        ));

        // Mitigation decisions are part of the audit trail
        let audit = Arc::clone(&logger);
        mitigation.register_callback(Box::new(move |alert, action| {
            let message = format!(
                "mitigation: {} for {} due to {}",
                action, alert.source, alert.attack_type
            );
            if action == MitigationAction::BlockIp {
                audit.warning("Mitigation", message);
            } else {
                audit.info("Mitigation", message);
            }
        }));

        let whitelist_bloom = BloomFilter::new();
        for ip in &config.whitelisted_ips {
            whitelist_bloom.add(ip.key());
        }

        let blocked_bloom = BloomFilter::new();
        for ip in &config.blacklisted_ips {
            mitigation.block_ip(*ip, AttackType::None, None);
            blocked_bloom.add(ip.key());
        }

        logger.info("GridWatch", "engine initialized".to_string());

        Ok(Arc::new(Self {
            config,
            parser: ModbusParser::new(),
            analyzer,
            mitigation,
            stats,
            metrics,
            logger,
            whitelist_bloom,
            blocked_bloom,
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the cleanup and monitor loops
    ///
    /// The loops hold only the components they read (never the engine
    /// itself), so joining them on `stop` cannot deadlock on ownership.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("engine already running");
            return;
        }

        let running = Arc::clone(&self.running);
        let mitigation = Arc::clone(&self.mitigation);
        let audit = Arc::clone(&self.logger);
        let cleanup = std::thread::Builder::new()
            .name("gw-cleanup".to_string())
            .spawn(move || cleanup_loop(&running, &mitigation, &audit))
            .expect("failed to spawn cleanup thread");

        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let metrics = Arc::clone(&self.metrics);
        let audit = Arc::clone(&self.logger);
        let monitor = std::thread::Builder::new()
            .name("gw-monitor".to_string())
            .spawn(move || monitor_loop(&running, &stats, &metrics, &audit))
            .expect("failed to spawn monitor thread");

        let mut threads = self.threads.lock();
        threads.push(cleanup);
        threads.push(monitor);

        self.logger
            .info("GridWatch", "engine started, monitoring SCADA traffic".to_string());
        info!("gridwatch engine started");
    }

    /// Stop background loops and flush the audit log; idempotent
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.logger.info("GridWatch", "stopping engine".to_string());
        for handle in self.threads.lock().drain(..) {
            if let Err(e) = handle.join() {
                error!("background thread panicked: {:?}", e);
            }
        }
        self.logger.stop();
        info!("gridwatch engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Hot path
    // ========================================================================

    /// Render the verdict for one packet: true = forward, false = drop
    pub fn process_packet(
        &self,
        payload: &[u8],
        source: Ipv4,
        dest: Ipv4,
        source_port: u16,
        dest_port: u16,
    ) -> bool {
        let start = Instant::now();
        self.stats.packet_processed();
        self.stats.bytes(payload.len() as u64);

        let src_key = source.key();

        // Fast path 1: trusted sources skip everything
        if self.whitelist_bloom.contains(src_key) {
            self.stats.packet_allowed();
            self.metrics.throughput().record(payload.len() as u64);
            self.record_latency(start);
            return true;
        }

        // Fast path 2: bloom probe, confirmed against the ledger because
        // the filter can report false positives
        if self.blocked_bloom.contains(src_key) && self.mitigation.is_blocked(source) {
            self.stats.packet_dropped();
            self.record_latency(start);
            return false;
        }

        let record = self.build_record(payload, source, dest, source_port, dest_port);

        // Governor sheds sources already over their rate budget
        if self.mitigation.should_drop_packet(&record) {
            self.stats.packet_dropped();
            self.record_latency(start);
            return false;
        }

        let analysis_start = Instant::now();
        let alerts = self.analyzer.analyze(&record);
        self.metrics
            .threat_latency()
            .record(analysis_start.elapsed().as_nanos() as u64);

        let mut drop = false;
        for alert in &alerts {
            self.stats.threat_detected();
            self.logger
                .critical("ThreatDetector", alert.description.clone(), alert.clone());

            let action = self.mitigation.mitigate(alert);
            if action != MitigationAction::LogOnly {
                self.stats.threat_mitigated();
            }
            if action == MitigationAction::BlockIp {
                self.blocked_bloom.add(src_key);
            }
            if action.drops_packet() {
                drop = true;
            }
        }

        if drop {
            self.stats.packet_dropped();
        } else {
            self.stats.packet_allowed();
            self.metrics.throughput().record(payload.len() as u64);
        }
        self.record_latency(start);

        !drop
    }

    fn build_record(
        &self,
        payload: &[u8],
        source: Ipv4,
        dest: Ipv4,
        source_port: u16,
        dest_port: u16,
    ) -> PacketRecord {
        let mut record = PacketRecord::new(source, dest, source_port, dest_port, payload.len());

        if record.protocol == ProtocolTag::ModbusTcp {
            match self.parser.parse(payload) {
                Ok(frame) => record.modbus = Some(frame),
                Err(_) => record.malformed = true,
            }
        }

        record
    }

    #[inline]
    fn record_latency(&self, start: Instant) {
        self.metrics
            .packet_latency()
            .record(start.elapsed().as_nanos() as u64);
    }

    // ========================================================================
    // Control surface
    // ========================================================================

    /// Block an endpoint for the configured auto-block duration
    pub fn block_ip(&self, ip: Ipv4, reason: AttackType) -> bool {
        self.block_ip_for(
            ip,
            reason,
            Some(Duration::from_secs(self.config.auto_block_duration)),
        )
    }

    /// Block an endpoint for a specific duration (`None` = permanent)
    pub fn block_ip_for(&self, ip: Ipv4, reason: AttackType, duration: Option<Duration>) -> bool {
        if self.mitigation.block_ip(ip, reason, duration) {
            self.blocked_bloom.add(ip.key());
            self.logger
                .warning("ManualControl", format!("endpoint blocked: {}", ip));
            true
        } else {
            false
        }
    }

    pub fn unblock_ip(&self, ip: Ipv4) -> bool {
        let removed = self.mitigation.unblock_ip(ip);
        if removed {
            self.logger
                .info("ManualControl", format!("endpoint unblocked: {}", ip));
        }
        removed
    }

    pub fn is_blocked(&self, ip: Ipv4) -> bool {
        self.mitigation.is_blocked(ip)
    }

    pub fn add_whitelist(&self, ip: Ipv4) {
        self.mitigation.add_whitelist(ip);
        self.whitelist_bloom.add(ip.key());
        self.logger
            .info("ManualControl", format!("endpoint whitelisted: {}", ip));
    }

    /// Remove a whitelist entry and rebuild the fast path from the
    /// authoritative set (bloom bits cannot be cleared individually)
    pub fn remove_whitelist(&self, ip: Ipv4) -> bool {
        if !self.mitigation.remove_whitelist(ip) {
            return false;
        }
        self.whitelist_bloom.clear();
        for remaining in self.mitigation.whitelist().snapshot() {
            self.whitelist_bloom.add(remaining.key());
        }
        self.logger
            .info("ManualControl", format!("endpoint un-whitelisted: {}", ip));
        true
    }

    pub fn statistics_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn list_blocked_ips(&self) -> Vec<BlockEntry> {
        self.mitigation.blocked_ips()
    }

    /// Sweep expired blocks and idle endpoint state now
    pub fn cleanup(&self) -> (usize, usize) {
        self.mitigation.cleanup()
    }

    pub fn logger(&self) -> &Arc<AuditLogger> {
        &self.logger
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn tracked_endpoints(&self) -> usize {
        self.analyzer.tracked_endpoints()
    }

}

// ============================================================================
// Background loops
// ============================================================================

fn cleanup_loop(running: &AtomicBool, mitigation: &MitigationEngine, audit: &AuditLogger) {
    while sleep_while_running(running, CLEANUP_INTERVAL) {
        let (expired, retired) = mitigation.cleanup();
        audit.info(
            "Cleanup",
            format!(
                "periodic cleanup: {} blocks expired, {} endpoints retired",
                expired, retired
            ),
        );
    }
}

fn monitor_loop(
    running: &AtomicBool,
    stats: &Statistics,
    metrics: &MetricsManager,
    audit: &AuditLogger,
) {
    while sleep_while_running(running, MONITOR_INTERVAL) {
        let stats = stats.snapshot();
        let metrics = metrics.snapshot();
        audit.info(
            "Monitor",
            format!(
                "stats: {} pkts ({:.1} pps) | {} threats ({:.2}/min) | latency: {:.2} µs | {} active blocks",
                stats.packets_processed,
                stats.packets_per_second,
                stats.threats_detected,
                stats.threat_rate_per_minute,
                metrics.packet_latency.avg_us,
                stats.active_blocks
            ),
        );
    }
}

impl Drop for GridWatch {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep in short ticks so shutdown is observed promptly; returns false
/// once the running flag clears
fn sleep_while_running(running: &AtomicBool, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        std::thread::sleep(remaining.min(Duration::from_millis(100)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::build_frame;

    fn temp_log(tag: &str) -> String {
        std::env::temp_dir()
            .join(format!("gridwatch-engine-{}-{}.log", tag, std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    fn make_engine(config: DetectionConfig, tag: &str) -> Arc<GridWatch> {
        GridWatch::new(config, &temp_log(tag)).unwrap()
    }

    fn read_frame() -> Vec<u8> {
        // Read Holding Registers, address 0, quantity 8
        build_frame(1, 1, 0x03, &[0x00, 0x00, 0x00, 0x08])
    }

    fn write_frame() -> Vec<u8> {
        // Write Multiple Registers, address 0, quantity 1, 2 data bytes
        build_frame(1, 1, 0x10, &[0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x2A])
    }

    const MASTER: Ipv4 = Ipv4::new(192, 168, 1, 10);
    const PLC: Ipv4 = Ipv4::new(192, 168, 1, 100);

    #[test]
    fn test_scenario_whitelisted_master_reads() {
        let config = DetectionConfig {
            whitelisted_ips: vec![MASTER],
            ..DetectionConfig::default()
        };
        let engine = make_engine(config, "whitelisted");

        let frame = read_frame();
        for _ in 0..50 {
            assert!(engine.process_packet(&frame, MASTER, PLC, 45000, 502));
        }

        let stats = engine.statistics_snapshot();
        assert_eq!(stats.packets_allowed, 50);
        assert_eq!(stats.packets_dropped, 0);
        assert_eq!(stats.threats_detected, 0);
        assert_eq!(stats.active_blocks, 0);
    }

    #[test]
    fn test_scenario_port_scan_is_blocked() {
        let config = DetectionConfig {
            port_scan_threshold: 10,
            port_scan_window: 10,
            ..DetectionConfig::default()
        };
        let engine = make_engine(config, "portscan");
        let scanner = Ipv4::new(10, 0, 0, 50);

        // Port 502 sits inside the scanned range, so carry a well-formed
        // frame to keep the malformed-frame rule out of the picture
        let frame = read_frame();
        let mut last_verdict = true;
        for port in 500..520u16 {
            last_verdict = engine.process_packet(&frame, scanner, PLC, 45000, port);
        }

        // The widening scan escalates and the source ends up blocked
        assert!(!last_verdict);
        assert!(engine.is_blocked(scanner));
        let blocked = engine.list_blocked_ips();
        let entry = blocked.iter().find(|e| e.endpoint == scanner).unwrap();
        assert_eq!(entry.reason, AttackType::PortScan);

        let stats = engine.statistics_snapshot();
        assert!(stats.threats_detected > 0);

        // Anything after the block is dropped on the fast path
        assert!(!engine.process_packet(&[0u8; 40], scanner, PLC, 45000, 600));
    }

    #[test]
    fn test_scenario_dos_flood() {
        let config = DetectionConfig {
            dos_packet_threshold: 500,
            dos_window: 5,
            ..DetectionConfig::default()
        };
        let engine = make_engine(config, "flood");
        let attacker = Ipv4::new(10, 0, 0, 66);
        let frame = read_frame();

        for _ in 0..2000 {
            engine.process_packet(&frame, attacker, PLC, 45000, 502);
        }

        let stats = engine.statistics_snapshot();
        assert!(
            stats.packets_dropped >= 1400,
            "only {} dropped",
            stats.packets_dropped
        );
        assert!(engine.is_blocked(attacker));
        let entry = engine
            .list_blocked_ips()
            .into_iter()
            .find(|e| e.endpoint == attacker)
            .unwrap();
        assert_eq!(entry.reason, AttackType::DosFlood);
    }

    #[test]
    fn test_scenario_unauthorized_writes() {
        let config = DetectionConfig {
            write_read_ratio_threshold: 3.0,
            ..DetectionConfig::default()
        };
        let engine = make_engine(config, "writes");
        let rogue = Ipv4::new(203, 0, 113, 45);
        let frame = write_frame();

        let mut verdicts = Vec::new();
        for _ in 0..10 {
            verdicts.push(engine.process_packet(&frame, rogue, PLC, 45000, 502));
        }

        // writes/(reads+1) crosses 3.0 on the third write; from there the
        // source is blocked and everything is dropped
        assert_eq!(&verdicts[..2], &[true, true]);
        assert!(verdicts[2..].iter().all(|v| !v));
        assert!(engine.is_blocked(rogue));
    }

    #[test]
    fn test_scenario_malformed_frame() {
        let engine = make_engine(DetectionConfig::default(), "malformed");
        let source = Ipv4::new(10, 0, 0, 33);

        // Valid layout but protocol id 0x0001
        let mut frame = read_frame();
        frame[3] = 0x01;

        let allowed = engine.process_packet(&frame, source, PLC, 45000, 502);
        assert!(!allowed);

        let stats = engine.statistics_snapshot();
        assert_eq!(stats.threats_detected, 1);
        assert_eq!(stats.packets_dropped, 1);
    }

    #[test]
    fn test_scenario_block_expiry() {
        let engine = make_engine(DetectionConfig::default(), "expiry");
        let ip = Ipv4::new(10, 0, 0, 77);

        assert!(engine.block_ip_for(ip, AttackType::None, Some(Duration::from_secs(2))));
        assert!(engine.is_blocked(ip));
        let before = engine.statistics_snapshot().active_blocks;

        std::thread::sleep(Duration::from_millis(2100));
        engine.cleanup();

        assert!(!engine.is_blocked(ip));
        assert_eq!(engine.statistics_snapshot().active_blocks, before - 1);
    }

    #[test]
    fn test_verdict_counters_always_balance() {
        let config = DetectionConfig {
            port_scan_threshold: 5,
            dos_packet_threshold: 50,
            ..DetectionConfig::default()
        };
        let engine = make_engine(config, "balance");

        let frame = read_frame();
        for i in 0..300u16 {
            let source = Ipv4::new(10, 0, (i % 4) as u8, 1);
            engine.process_packet(&frame, source, PLC, 45000, 500 + (i % 30));
        }

        let stats = engine.statistics_snapshot();
        assert_eq!(
            stats.packets_allowed + stats.packets_dropped,
            stats.packets_processed
        );
    }

    #[test]
    fn test_blocked_endpoint_always_dropped() {
        let engine = make_engine(DetectionConfig::default(), "blocked-drop");
        let ip = Ipv4::new(10, 0, 0, 40);

        engine.block_ip(ip, AttackType::DosFlood);
        for _ in 0..10 {
            assert!(!engine.process_packet(&read_frame(), ip, PLC, 45000, 502));
        }
    }

    #[test]
    fn test_whitelisted_endpoint_cannot_be_blocked() {
        let engine = make_engine(DetectionConfig::default(), "wl-noblock");
        let ip = Ipv4::new(192, 168, 1, 20);

        engine.add_whitelist(ip);
        assert!(!engine.block_ip(ip, AttackType::PortScan));
        assert!(!engine.is_blocked(ip));
        assert!(engine.process_packet(&read_frame(), ip, PLC, 45000, 502));
    }

    #[test]
    fn test_remove_whitelist_rebuilds_fast_path() {
        let config = DetectionConfig {
            whitelisted_ips: vec![MASTER, Ipv4::new(192, 168, 1, 11)],
            write_read_ratio_threshold: 2.0,
            ..DetectionConfig::default()
        };
        let engine = make_engine(config, "wl-remove");

        assert!(engine.remove_whitelist(MASTER));
        assert!(!engine.remove_whitelist(MASTER));

        // The remaining entry still takes the fast path; the removed one is
        // subject to the write rule again
        let frame = write_frame();
        for _ in 0..5 {
            engine.process_packet(&frame, MASTER, PLC, 45000, 502);
        }
        assert!(engine.is_blocked(MASTER));
        assert!(!engine.is_blocked(Ipv4::new(192, 168, 1, 11)));
    }

    #[test]
    fn test_blacklisted_ips_blocked_from_start() {
        let bad = Ipv4::new(198, 51, 100, 7);
        let config = DetectionConfig {
            blacklisted_ips: vec![bad],
            ..DetectionConfig::default()
        };
        let engine = make_engine(config, "blacklist");

        assert!(engine.is_blocked(bad));
        assert!(!engine.process_packet(&read_frame(), bad, PLC, 45000, 502));
        let entry = &engine.list_blocked_ips()[0];
        assert!(entry.permanent);
    }

    #[test]
    fn test_unblock_restores_traffic() {
        let engine = make_engine(DetectionConfig::default(), "unblock");
        let ip = Ipv4::new(10, 0, 0, 41);

        engine.block_ip(ip, AttackType::None);
        assert!(!engine.process_packet(&read_frame(), ip, PLC, 45000, 502));

        assert!(engine.unblock_ip(ip));
        assert!(engine.process_packet(&read_frame(), ip, PLC, 45000, 502));
    }

    #[test]
    fn test_non_modbus_traffic_passes_untouched() {
        let engine = make_engine(DetectionConfig::default(), "plain");
        let ip = Ipv4::new(10, 0, 0, 42);

        // Arbitrary payload on a non-industrial port parses nothing
        assert!(engine.process_packet(b"GET / HTTP/1.1\r\n", ip, PLC, 45000, 8080));
        assert_eq!(engine.statistics_snapshot().threats_detected, 0);
    }

    #[test]
    fn test_start_stop_idempotent() {
        let engine = make_engine(DetectionConfig::default(), "lifecycle");

        engine.start();
        assert!(engine.is_running());
        engine.start(); // no-op

        engine.stop();
        assert!(!engine.is_running());
        engine.stop(); // no-op
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DetectionConfig {
            dos_packet_threshold: 0,
            ..DetectionConfig::default()
        };
        assert!(GridWatch::new(config, &temp_log("invalid")).is_err());
    }

    #[test]
    fn test_latency_recorded_on_all_paths() {
        let config = DetectionConfig {
            whitelisted_ips: vec![MASTER],
            ..DetectionConfig::default()
        };
        let engine = make_engine(config, "latency");
        let blocked = Ipv4::new(10, 0, 0, 43);
        engine.block_ip(blocked, AttackType::None);

        engine.process_packet(&read_frame(), MASTER, PLC, 45000, 502); // allow
        engine.process_packet(&read_frame(), blocked, PLC, 45000, 502); // drop
        engine.process_packet(&read_frame(), Ipv4::new(10, 0, 0, 44), PLC, 45000, 502);

        let metrics = engine.metrics_snapshot();
        assert_eq!(metrics.packet_latency.samples, 3);
    }
}
