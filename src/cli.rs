//! Command-line interface
//!
//! Wires the engine, worker pool and capture adapter together for the
//! `gridwatch` binary and runs until interrupted.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::capture::{list_interfaces, CaptureConfig, PacketCapture};
use crate::config::AppConfig;
use crate::engine::GridWatch;
use crate::workers::WorkerPool;

#[derive(Debug, Parser)]
#[command(name = "gridwatch")]
#[command(version, about = "Inline IDS/IPS engine for SCADA (Modbus/TCP) networks")]
pub struct Cli {
    /// List available capture interfaces and exit
    #[arg(long)]
    pub list_interfaces: bool,

    /// Capture interface
    #[arg(short, long)]
    pub interface: Option<String>,

    /// BPF capture filter
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Worker threads (0 = CPU count)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Audit log file
    #[arg(short, long)]
    pub log: Option<PathBuf>,

    /// TCP port to capture (rewrites the default filter)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Configuration file (key=value lines, # comments)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose output: debug diagnostics plus the audit log on stdout
    #[arg(short, long)]
    pub verbose: bool,
}

/// Resolve the effective configuration: file first, flags override
pub fn effective_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    if let Some(interface) = &cli.interface {
        config.interface = interface.clone();
    }
    if let Some(threads) = cli.threads {
        config.worker_threads = threads;
    }
    if let Some(log) = &cli.log {
        config.log_file = log.to_string_lossy().into_owned();
    }
    if let Some(filter) = &cli.filter {
        config.bpf_filter = filter.clone();
    } else if let Some(port) = cli.port {
        config.bpf_filter = format!("tcp port {}", port);
    }
    if let Some(port) = cli.port {
        if !config.detection.monitored_ports.contains(&port) {
            config.detection.monitored_ports.push(port);
        }
    }

    Ok(config)
}

/// Run the engine until interrupted
pub fn run(cli: Cli) -> Result<()> {
    if cli.list_interfaces {
        print_interfaces()?;
        return Ok(());
    }

    let config = effective_config(&cli)?;

    let engine = GridWatch::new(config.detection.clone(), &config.log_file)?;
    engine.logger().set_console_output(cli.verbose);
    engine.start();

    let pool = Arc::new(WorkerPool::new(Arc::clone(&engine), config.worker_threads));
    pool.start();

    let capture = PacketCapture::new(
        Arc::clone(&pool),
        CaptureConfig {
            interface: config.interface.clone(),
            filter: config.bpf_filter.clone(),
            ..CaptureConfig::default()
        },
    );
    // A capture device that cannot be opened is fatal
    capture.start()?;

    println!(
        "gridwatch monitoring {} (filter: {}) with {} workers, logging to {}",
        config.interface,
        config.bpf_filter,
        pool.num_workers(),
        config.log_file
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("failed to install signal handler")?;

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("interrupt received, shutting down");
    capture.stop();
    pool.stop();
    engine.stop();

    let stats = engine.statistics_snapshot();
    let cap_stats = capture.stats();
    println!(
        "\n{} frames captured, {} packets processed, {} allowed, {} dropped, {} threats, {} active blocks",
        cap_stats.captured,
        stats.packets_processed,
        stats.packets_allowed,
        stats.packets_dropped,
        stats.threats_detected,
        stats.active_blocks
    );

    Ok(())
}

fn print_interfaces() -> Result<()> {
    let interfaces = list_interfaces()?;
    if interfaces.is_empty() {
        println!("no capture interfaces found (insufficient privileges?)");
        return Ok(());
    }

    println!("available capture interfaces:");
    for (i, iface) in interfaces.iter().enumerate() {
        print!("  [{}] {}", i, iface.name);
        if let Some(desc) = &iface.description {
            print!(" - {}", desc);
        }
        println!();
        for addr in &iface.addresses {
            println!("      {}", addr);
        }
    }
    Ok(())
}
