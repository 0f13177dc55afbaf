//! Behavioral analyzer
//!
//! Builds rolling per-source state and evaluates the detection rules in a
//! fixed order, emitting every alert a packet triggers:
//!
//! 1. Malformed frame
//! 2. Port scan
//! 3. DoS flood (packets or bytes)
//! 4. Unauthorized write ratio
//! 5. Protocol exception storm
//! 6. Packet size anomaly
//!
//! The analyzer never blocks on I/O; one shard mutex is the only lock the
//! hot path takes.

pub mod endpoint;

use std::sync::Arc;

use crate::config::DetectionConfig;
use crate::core::{AttackType, PacketRecord, Severity, ThreatAlert};
use crate::whitelist::Whitelist;

pub use endpoint::{EndpointState, EndpointTable, SizeStats, TokenBucket, ENDPOINT_IDLE_SECS};

/// Samples required before size anomalies are scored
const SIZE_WARMUP_SAMPLES: u64 = 30;

pub struct BehavioralAnalyzer {
    config: Arc<DetectionConfig>,
    table: Arc<EndpointTable>,
    whitelist: Arc<Whitelist>,
}

impl BehavioralAnalyzer {
    pub fn new(
        config: Arc<DetectionConfig>,
        table: Arc<EndpointTable>,
        whitelist: Arc<Whitelist>,
    ) -> Self {
        Self {
            config,
            table,
            whitelist,
        }
    }

    /// Evaluate all detection rules against one packet
    pub fn analyze(&self, record: &PacketRecord) -> Vec<ThreatAlert> {
        let mut alerts = Vec::new();
        let now = record.timestamp.timestamp().max(0) as u64;
        let cfg = &self.config;

        // Rule 1: malformed frame, flagged by the parser
        if record.malformed {
            alerts.push(ThreatAlert::new(
                record.source,
                record.dest,
                AttackType::MalformedFrame,
                Severity::High,
                1.0,
                format!("malformed Modbus/TCP frame from {}", record.source),
            ));
        }

        let whitelisted = self.whitelist.contains(record.source.key());

        self.table.with_state(record.source.key(), now, |state| {
            // Rule 2: port scan over distinct destination ports
            let distinct =
                state.record_port(record.dest_port, now, cfg.port_scan_window) as u32;
            if distinct >= cfg.port_scan_threshold {
                // A scan that keeps widening past twice the threshold is no
                // longer reconnaissance noise
                let severity = if distinct >= 2 * cfg.port_scan_threshold {
                    Severity::High
                } else {
                    Severity::Medium
                };
                alerts.push(ThreatAlert::new(
                    record.source,
                    record.dest,
                    AttackType::PortScan,
                    severity,
                    distinct as f64 / cfg.port_scan_threshold as f64,
                    format!(
                        "port scan: {} distinct ports in {}s from {}",
                        distinct, cfg.port_scan_window, record.source
                    ),
                ));
            }

            // Rule 3: DoS flood by packet or byte rate
            state.packets.record_at(now, 1);
            state.bytes.record_at(now, record.size_bytes as u64);
            let pkts = state.packets.sum_at(now, cfg.dos_window);
            let bytes = state.bytes.sum_at(now, cfg.dos_window);
            if pkts >= cfg.dos_packet_threshold as u64 || bytes >= cfg.dos_byte_threshold {
                let severity = if pkts >= 2 * cfg.dos_packet_threshold as u64
                    || bytes >= 2 * cfg.dos_byte_threshold
                {
                    Severity::Critical
                } else {
                    Severity::High
                };
                let confidence = (pkts as f64 / cfg.dos_packet_threshold as f64)
                    .max(bytes as f64 / cfg.dos_byte_threshold as f64);
                alerts.push(ThreatAlert::new(
                    record.source,
                    record.dest,
                    AttackType::DosFlood,
                    severity,
                    confidence,
                    format!(
                        "flood from {}: {} packets / {} bytes in {}s",
                        record.source, pkts, bytes, cfg.dos_window
                    ),
                ));
            }

            if let Some(frame) = &record.modbus {
                // Rule 4: write-heavy masters that never read
                if frame.is_read() {
                    state.record_read(now);
                }
                if frame.is_write() {
                    state.record_write(now);
                    let ratio = state.write_read_ratio(now, cfg.dos_window);
                    if ratio >= cfg.write_read_ratio_threshold && !whitelisted {
                        alerts.push(ThreatAlert::new(
                            record.source,
                            record.dest,
                            AttackType::UnauthorizedWrite,
                            Severity::High,
                            ratio / cfg.write_read_ratio_threshold,
                            format!(
                                "unauthorized writes from {}: write/read ratio {:.2} (function {:#04x})",
                                record.source,
                                ratio,
                                frame.function()
                            ),
                        ));
                    }
                }

                // Rule 5: protocol exception storm
                if frame.is_exception {
                    state.exceptions.record_at(now, 1);
                    let exceptions = state.exceptions.sum_at(now, cfg.dos_window);
                    if exceptions >= cfg.exception_rate_threshold as u64 {
                        alerts.push(ThreatAlert::new(
                            record.source,
                            record.dest,
                            AttackType::ProtocolExceptionStorm,
                            Severity::Medium,
                            exceptions as f64 / cfg.exception_rate_threshold as f64,
                            format!(
                                "{} Modbus exceptions in {}s involving {}",
                                exceptions, cfg.dos_window, record.source
                            ),
                        ));
                    }
                }
            }

            // Rule 6: packet size anomaly after warmup
            state.size_stats.update(record.size_bytes as f64);
            if state.size_stats.count() >= SIZE_WARMUP_SAMPLES {
                let stddev = state.size_stats.stddev();
                let deviation = (record.size_bytes as f64 - state.size_stats.mean()).abs();
                let limit = cfg.packet_size_deviation_threshold * stddev;
                if deviation > limit {
                    let confidence = if limit > 0.0 { deviation / limit } else { 1.0 };
                    alerts.push(ThreatAlert::new(
                        record.source,
                        record.dest,
                        AttackType::SizeAnomaly,
                        Severity::Low,
                        confidence,
                        format!(
                            "packet size {}B deviates from endpoint mean {:.0}B (stddev {:.1})",
                            record.size_bytes,
                            state.size_stats.mean(),
                            stddev
                        ),
                    ));
                }
            }
        });

        alerts
    }

    pub fn table(&self) -> &Arc<EndpointTable> {
        &self.table
    }

    /// Endpoints currently tracked
    pub fn tracked_endpoints(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Ipv4;
    use crate::modbus::{build_frame, ModbusParser};

    fn analyzer_with(config: DetectionConfig) -> BehavioralAnalyzer {
        let config = Arc::new(config);
        let table = Arc::new(EndpointTable::new((*config).clone()));
        BehavioralAnalyzer::new(config, table, Arc::new(Whitelist::new()))
    }

    fn make_record(src: Ipv4, dest_port: u16, size: usize) -> PacketRecord {
        PacketRecord::new(src, Ipv4::new(192, 168, 1, 100), 45000, dest_port, size)
    }

    fn make_modbus_record(src: Ipv4, function: u8) -> PacketRecord {
        let payload = build_frame(1, 1, function, &[0x00, 0x01, 0x00, 0x01]);
        let mut record = make_record(src, 502, payload.len());
        record.modbus = Some(ModbusParser::new().parse(&payload).unwrap());
        record
    }

    #[test]
    fn test_benign_traffic_produces_no_alerts() {
        let analyzer = analyzer_with(DetectionConfig::default());
        let src = Ipv4::new(10, 0, 0, 1);

        for _ in 0..20 {
            let alerts = analyzer.analyze(&make_modbus_record(src, 0x03));
            assert!(alerts.is_empty(), "unexpected alerts: {:?}", alerts);
        }
    }

    #[test]
    fn test_malformed_flag_alerts_with_full_confidence() {
        let analyzer = analyzer_with(DetectionConfig::default());
        let mut record = make_record(Ipv4::new(10, 0, 0, 2), 502, 12);
        record.malformed = true;

        let alerts = analyzer.analyze(&record);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].attack_type, AttackType::MalformedFrame);
        assert_eq!(alerts[0].severity, Severity::High);
        assert_eq!(alerts[0].confidence, 1.0);
    }

    #[test]
    fn test_port_scan_fires_at_threshold() {
        let config = DetectionConfig {
            port_scan_threshold: 10,
            port_scan_window: 10,
            ..DetectionConfig::default()
        };
        let analyzer = analyzer_with(config);
        let src = Ipv4::new(10, 0, 0, 50);

        let mut first_alert_at = None;
        for (i, port) in (500..520u16).enumerate() {
            let alerts = analyzer.analyze(&make_record(src, port, 64));
            if first_alert_at.is_none()
                && alerts.iter().any(|a| a.attack_type == AttackType::PortScan)
            {
                first_alert_at = Some(i + 1);
            }
        }
        assert_eq!(first_alert_at, Some(10));
    }

    #[test]
    fn test_port_scan_escalates_past_double_threshold() {
        let config = DetectionConfig {
            port_scan_threshold: 5,
            ..DetectionConfig::default()
        };
        let analyzer = analyzer_with(config);
        let src = Ipv4::new(10, 0, 0, 51);

        let mut last = Vec::new();
        for port in 0..10u16 {
            last = analyzer.analyze(&make_record(src, 1000 + port, 64));
        }
        let scan = last
            .iter()
            .find(|a| a.attack_type == AttackType::PortScan)
            .expect("scan alert");
        assert_eq!(scan.severity, Severity::High);
        assert_eq!(scan.confidence, 1.0);
    }

    #[test]
    fn test_dos_flood_packet_threshold_and_escalation() {
        let config = DetectionConfig {
            dos_packet_threshold: 50,
            dos_window: 5,
            ..DetectionConfig::default()
        };
        let analyzer = analyzer_with(config);
        let src = Ipv4::new(10, 0, 0, 66);

        let mut high_seen = false;
        let mut critical_seen = false;
        for _ in 0..120 {
            for alert in analyzer.analyze(&make_record(src, 502, 64)) {
                if alert.attack_type == AttackType::DosFlood {
                    match alert.severity {
                        Severity::High => high_seen = true,
                        Severity::Critical => critical_seen = true,
                        _ => {}
                    }
                }
            }
        }
        assert!(high_seen, "flood never reached HIGH");
        assert!(critical_seen, "flood never escalated to CRITICAL");
    }

    #[test]
    fn test_dos_flood_byte_threshold() {
        let config = DetectionConfig {
            dos_byte_threshold: 10_000,
            dos_packet_threshold: 1_000_000,
            ..DetectionConfig::default()
        };
        let analyzer = analyzer_with(config);
        let src = Ipv4::new(10, 0, 0, 67);

        let mut flood_seen = false;
        for _ in 0..10 {
            for alert in analyzer.analyze(&make_record(src, 502, 1500)) {
                flood_seen |= alert.attack_type == AttackType::DosFlood;
            }
        }
        assert!(flood_seen);
    }

    #[test]
    fn test_unauthorized_write_ratio() {
        let config = DetectionConfig {
            write_read_ratio_threshold: 3.0,
            ..DetectionConfig::default()
        };
        let analyzer = analyzer_with(config);
        let src = Ipv4::new(203, 0, 113, 45);

        let mut first_alert_at = None;
        for i in 0..10 {
            let alerts = analyzer.analyze(&make_modbus_record(src, 0x10));
            if first_alert_at.is_none()
                && alerts
                    .iter()
                    .any(|a| a.attack_type == AttackType::UnauthorizedWrite)
            {
                first_alert_at = Some(i + 1);
            }
        }
        // writes/(reads+1) crosses 3.0 on the third pure write
        assert_eq!(first_alert_at, Some(3));
    }

    #[test]
    fn test_whitelisted_master_exempt_from_write_rule() {
        let config = Arc::new(DetectionConfig {
            write_read_ratio_threshold: 3.0,
            ..DetectionConfig::default()
        });
        let table = Arc::new(EndpointTable::new((*config).clone()));
        let whitelist = Arc::new(Whitelist::new());
        let src = Ipv4::new(192, 168, 1, 10);
        whitelist.add(src);

        let analyzer = BehavioralAnalyzer::new(config, table, whitelist);
        for _ in 0..10 {
            let alerts = analyzer.analyze(&make_modbus_record(src, 0x10));
            assert!(!alerts
                .iter()
                .any(|a| a.attack_type == AttackType::UnauthorizedWrite));
        }
    }

    #[test]
    fn test_reads_do_not_alert() {
        let config = DetectionConfig {
            write_read_ratio_threshold: 1.0,
            ..DetectionConfig::default()
        };
        let analyzer = analyzer_with(config);
        let src = Ipv4::new(10, 0, 0, 70);

        for _ in 0..20 {
            let alerts = analyzer.analyze(&make_modbus_record(src, 0x04));
            assert!(alerts.is_empty());
        }
    }

    #[test]
    fn test_exception_storm() {
        let config = DetectionConfig {
            exception_rate_threshold: 5,
            ..DetectionConfig::default()
        };
        let analyzer = analyzer_with(config);
        let src = Ipv4::new(10, 0, 0, 80);

        let mut storm_at = None;
        for i in 0..8 {
            // Exception response: function 0x83, exception code 0x02
            let payload = build_frame(1, 1, 0x83, &[0x02]);
            let mut record = make_record(src, 502, payload.len());
            record.modbus = Some(ModbusParser::new().parse(&payload).unwrap());

            let alerts = analyzer.analyze(&record);
            if storm_at.is_none()
                && alerts
                    .iter()
                    .any(|a| a.attack_type == AttackType::ProtocolExceptionStorm)
            {
                storm_at = Some(i + 1);
            }
        }
        assert_eq!(storm_at, Some(5));
    }

    #[test]
    fn test_size_anomaly_after_warmup() {
        let analyzer = analyzer_with(DetectionConfig::default());
        let src = Ipv4::new(10, 0, 0, 90);

        // Warmup with steady small frames
        for _ in 0..40 {
            let alerts = analyzer.analyze(&make_record(src, 502, 100));
            assert!(!alerts
                .iter()
                .any(|a| a.attack_type == AttackType::SizeAnomaly));
        }

        let alerts = analyzer.analyze(&make_record(src, 502, 10_000));
        let anomaly = alerts
            .iter()
            .find(|a| a.attack_type == AttackType::SizeAnomaly)
            .expect("size anomaly");
        assert_eq!(anomaly.severity, Severity::Low);
    }

    #[test]
    fn test_alerts_preserve_rule_order() {
        let config = DetectionConfig {
            port_scan_threshold: 1,
            dos_packet_threshold: 1,
            ..DetectionConfig::default()
        };
        let analyzer = analyzer_with(config);
        let mut record = make_record(Ipv4::new(10, 0, 0, 99), 502, 64);
        record.malformed = true;

        let alerts = analyzer.analyze(&record);
        let kinds: Vec<AttackType> = alerts.iter().map(|a| a.attack_type).collect();
        assert_eq!(
            kinds,
            vec![
                AttackType::MalformedFrame,
                AttackType::PortScan,
                AttackType::DosFlood
            ]
        );
    }
}
