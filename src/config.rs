//! Engine configuration
//!
//! Detection thresholds are immutable once the engine is constructed. The
//! optional config file is line-oriented `key=value` with `#` comments, the
//! format the field deployments already use; unknown keys are warned about
//! and skipped.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::Ipv4;

/// Detection thresholds and mitigation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Distinct destination ports within `port_scan_window` before alerting
    pub port_scan_threshold: u32,
    /// Port scan window in seconds
    pub port_scan_window: u64,

    /// Packets within `dos_window` before a flood alert
    pub dos_packet_threshold: u32,
    /// Bytes within `dos_window` before a flood alert
    pub dos_byte_threshold: u64,
    /// DoS window in seconds
    pub dos_window: u64,

    /// writes/(reads+1) ratio before an unauthorized-write alert
    pub write_read_ratio_threshold: f64,
    /// Protocol exceptions within `dos_window` before a storm alert
    pub exception_rate_threshold: u32,
    /// Standard deviations from the endpoint mean before a size alert
    pub packet_size_deviation_threshold: f64,

    /// Install blocks automatically on high-severity alerts
    pub auto_block_enabled: bool,
    /// Auto-block duration in seconds
    pub auto_block_duration: u64,
    /// Ledger capacity; the oldest non-permanent block is evicted on overflow
    pub max_concurrent_blocks: u32,

    pub whitelisted_ips: Vec<Ipv4>,
    pub blacklisted_ips: Vec<Ipv4>,
    pub monitored_ports: Vec<u16>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            port_scan_threshold: 10,
            port_scan_window: 10,
            dos_packet_threshold: 1000,
            dos_byte_threshold: 10_000_000,
            dos_window: 5,
            write_read_ratio_threshold: 5.0,
            exception_rate_threshold: 10,
            packet_size_deviation_threshold: 3.0,
            auto_block_enabled: true,
            auto_block_duration: 3600,
            max_concurrent_blocks: 1000,
            whitelisted_ips: Vec::new(),
            blacklisted_ips: Vec::new(),
            monitored_ports: vec![502, 20000],
        }
    }
}

impl DetectionConfig {
    /// Relaxed thresholds for noisy networks
    pub fn conservative() -> Self {
        Self {
            dos_packet_threshold: 2000,
            port_scan_threshold: 20,
            write_read_ratio_threshold: 10.0,
            auto_block_duration: 1800,
            ..Self::default()
        }
    }

    /// Tight thresholds and long blocks
    pub fn aggressive() -> Self {
        Self {
            dos_packet_threshold: 500,
            port_scan_threshold: 5,
            write_read_ratio_threshold: 2.0,
            auto_block_duration: 7200,
            ..Self::default()
        }
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.port_scan_threshold == 0 {
            bail!("port_scan_threshold must be positive");
        }
        if self.port_scan_window == 0 || self.dos_window == 0 {
            bail!("detection windows must be positive");
        }
        if self.dos_packet_threshold == 0 || self.dos_byte_threshold == 0 {
            bail!("DoS thresholds must be positive");
        }
        if self.write_read_ratio_threshold <= 0.0 {
            bail!("write_read_ratio_threshold must be positive");
        }
        if self.packet_size_deviation_threshold <= 0.0 {
            bail!("packet_size_deviation_threshold must be positive");
        }
        if self.max_concurrent_blocks == 0 {
            bail!("max_concurrent_blocks must be positive");
        }
        Ok(())
    }
}

/// Full application configuration: detection plus runtime wiring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub detection: DetectionConfig,
    /// Worker thread count; 0 selects the CPU count
    pub worker_threads: usize,
    pub log_file: String,
    pub interface: String,
    pub bpf_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            detection: DetectionConfig::default(),
            worker_threads: 0,
            log_file: "gridwatch.log".to_string(),
            interface: "any".to_string(),
            bpf_filter: "tcp port 502".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a `key=value` file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
        Self::parse(&content)
    }

    /// Parse `key=value` lines; `#` starts a comment
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = line.split_once('=').with_context(|| {
                format!("line {}: expected key=value, got {:?}", lineno + 1, raw)
            })?;
            let key = key.trim();
            let value = value.trim();

            let ctx = || format!("line {}: invalid value for {}: {:?}", lineno + 1, key, value);
            let det = &mut config.detection;

            match key {
                "port_scan_threshold" => det.port_scan_threshold = value.parse().with_context(ctx)?,
                "port_scan_window" => det.port_scan_window = value.parse().with_context(ctx)?,
                "dos_packet_threshold" => {
                    det.dos_packet_threshold = value.parse().with_context(ctx)?
                }
                "dos_byte_threshold" => det.dos_byte_threshold = value.parse().with_context(ctx)?,
                "dos_window" => det.dos_window = value.parse().with_context(ctx)?,
                "write_read_ratio_threshold" => {
                    det.write_read_ratio_threshold = value.parse().with_context(ctx)?
                }
                "exception_rate_threshold" => {
                    det.exception_rate_threshold = value.parse().with_context(ctx)?
                }
                "packet_size_deviation_threshold" => {
                    det.packet_size_deviation_threshold = value.parse().with_context(ctx)?
                }
                "auto_block_enabled" => {
                    det.auto_block_enabled = parse_bool(value).with_context(ctx)?
                }
                "auto_block_duration" => det.auto_block_duration = value.parse().with_context(ctx)?,
                "max_concurrent_blocks" => {
                    det.max_concurrent_blocks = value.parse().with_context(ctx)?
                }
                "whitelisted_ips" => det.whitelisted_ips = parse_list(value).with_context(ctx)?,
                "blacklisted_ips" => det.blacklisted_ips = parse_list(value).with_context(ctx)?,
                "monitored_ports" => det.monitored_ports = parse_list(value).with_context(ctx)?,
                "worker_threads" => config.worker_threads = value.parse().with_context(ctx)?,
                "log_file" => config.log_file = value.to_string(),
                "interface" => config.interface = value.to_string(),
                "bpf_filter" => config.bpf_filter = value.to_string(),
                other => warn!("ignoring unknown config key {:?}", other),
            }
        }

        config.detection.validate()?;
        Ok(config)
    }

    /// Write the configuration back out as a commented template
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(&path, self.render())
            .with_context(|| format!("failed to write config file: {}", path.as_ref().display()))
    }

    fn render(&self) -> String {
        let det = &self.detection;
        let mut out = String::new();
        out.push_str("# gridwatch configuration\n\n");
        out.push_str("# Detection thresholds (windows and durations in seconds)\n");
        out.push_str(&format!("port_scan_threshold={}\n", det.port_scan_threshold));
        out.push_str(&format!("port_scan_window={}\n", det.port_scan_window));
        out.push_str(&format!("dos_packet_threshold={}\n", det.dos_packet_threshold));
        out.push_str(&format!("dos_byte_threshold={}\n", det.dos_byte_threshold));
        out.push_str(&format!("dos_window={}\n", det.dos_window));
        out.push_str(&format!(
            "write_read_ratio_threshold={}\n",
            det.write_read_ratio_threshold
        ));
        out.push_str(&format!(
            "exception_rate_threshold={}\n",
            det.exception_rate_threshold
        ));
        out.push_str(&format!(
            "packet_size_deviation_threshold={}\n",
            det.packet_size_deviation_threshold
        ));
        out.push_str("\n# Mitigation\n");
        out.push_str(&format!("auto_block_enabled={}\n", det.auto_block_enabled));
        out.push_str(&format!("auto_block_duration={}\n", det.auto_block_duration));
        out.push_str(&format!(
            "max_concurrent_blocks={}\n",
            det.max_concurrent_blocks
        ));
        out.push_str(&format!(
            "whitelisted_ips={}\n",
            join_list(&det.whitelisted_ips)
        ));
        out.push_str(&format!(
            "blacklisted_ips={}\n",
            join_list(&det.blacklisted_ips)
        ));
        out.push_str(&format!(
            "monitored_ports={}\n",
            join_list(&det.monitored_ports)
        ));
        out.push_str("\n# Runtime\n");
        out.push_str(&format!("worker_threads={}\n", self.worker_threads));
        out.push_str(&format!("log_file={}\n", self.log_file));
        out.push_str(&format!("interface={}\n", self.interface));
        out.push_str(&format!("bpf_filter={}\n", self.bpf_filter));
        out
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => bail!("expected boolean, got {:?}", other),
    }
}

fn parse_list<T>(value: &str) -> Result<Vec<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<T>().map_err(Into::into))
        .collect()
}

fn join_list<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
