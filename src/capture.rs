//! Live packet acquisition
//!
//! Opens a pcap handle on the configured interface, applies the BPF filter
//! and feeds stripped TCP payloads to the worker pool. Only IPv4/TCP frames
//! with a payload make it through; everything else is filtered here, before
//! the engine sees it. A capture that cannot be opened is fatal to the
//! caller, per the deployment contract.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use pcap::{Capture, Device, Linktype};
use tracing::{error, info, warn};

use crate::core::Ipv4;
use crate::workers::WorkerPool;

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub interface: String,
    /// BPF filter applied to the handle
    pub filter: String,
    pub snaplen: i32,
    pub promiscuous: bool,
    pub timeout_ms: i32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: "any".to_string(),
            filter: "tcp port 502".to_string(),
            snaplen: 65_536,
            promiscuous: true,
            timeout_ms: 1000,
        }
    }
}

/// One capturable device, for `--list-interfaces`
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub name: String,
    pub description: Option<String>,
    pub addresses: Vec<String>,
}

/// Enumerate capture devices with their addresses
pub fn list_interfaces() -> Result<Vec<InterfaceInfo>> {
    let devices = Device::list().context("failed to enumerate capture devices")?;
    Ok(devices
        .into_iter()
        .map(|dev| InterfaceInfo {
            name: dev.name,
            description: dev.desc,
            addresses: dev.addresses.iter().map(|a| a.addr.to_string()).collect(),
        })
        .collect())
}

#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    /// Frames delivered by pcap
    pub captured: u64,
    /// Payloads handed to the worker pool
    pub submitted: u64,
    /// Non-IPv4/TCP frames, empty payloads, and queue-full rejections
    pub discarded: u64,
}

struct CaptureCounters {
    captured: CachePadded<AtomicU64>,
    submitted: CachePadded<AtomicU64>,
    discarded: CachePadded<AtomicU64>,
}

/// Background capture thread feeding the worker pool
pub struct PacketCapture {
    pool: Arc<WorkerPool>,
    config: CaptureConfig,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<CaptureCounters>,
}

impl PacketCapture {
    pub fn new(pool: Arc<WorkerPool>, config: CaptureConfig) -> Self {
        Self {
            pool,
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            counters: Arc::new(CaptureCounters {
                captured: CachePadded::new(AtomicU64::new(0)),
                submitted: CachePadded::new(AtomicU64::new(0)),
                discarded: CachePadded::new(AtomicU64::new(0)),
            }),
        }
    }

    /// Open the device and start capturing; errors here are fatal
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut cap = Capture::from_device(self.config.interface.as_str())
            .with_context(|| format!("failed to open device {:?}", self.config.interface))?
            .promisc(self.config.promiscuous)
            .snaplen(self.config.snaplen)
            .timeout(self.config.timeout_ms)
            .open()
            .with_context(|| format!("failed to activate capture on {:?}", self.config.interface))?;

        cap.filter(&self.config.filter, true)
            .with_context(|| format!("failed to apply BPF filter {:?}", self.config.filter))?;

        let link_offset = match cap.get_datalink() {
            Linktype::ETHERNET => 14,
            Linktype::LINUX_SLL => 16,
            other => {
                warn!("unsupported datalink {:?}, assuming ethernet framing", other);
                14
            }
        };

        info!(
            "capture started on {:?} with filter {:?}",
            self.config.interface, self.config.filter
        );

        let pool = Arc::clone(&self.pool);
        let running = Arc::clone(&self.running);
        let counters = Arc::clone(&self.counters);

        let handle = std::thread::Builder::new()
            .name("gw-capture".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    match cap.next_packet() {
                        Ok(packet) => {
                            counters.captured.fetch_add(1, Ordering::Relaxed);
                            match strip_frame(packet.data, link_offset) {
                                Some(stripped) => {
                                    let submitted = pool
                                        .submit(
                                            stripped.payload,
                                            stripped.source,
                                            stripped.dest,
                                            stripped.source_port,
                                            stripped.dest_port,
                                        )
                                        .is_some();
                                    if submitted {
                                        counters.submitted.fetch_add(1, Ordering::Relaxed);
                                    } else {
                                        counters.discarded.fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                                None => {
                                    counters.discarded.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                        Err(pcap::Error::TimeoutExpired) => {}
                        Err(e) => {
                            error!("capture error: {}", e);
                            break;
                        }
                    }
                }
                info!("capture loop exited");
            })
            .expect("failed to spawn capture thread");

        *self.thread.lock() = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        let stats = self.stats();
        info!(
            "capture stopped: {} captured, {} submitted, {} discarded",
            stats.captured, stats.submitted, stats.discarded
        );
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            captured: self.counters.captured.load(Ordering::Relaxed),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PacketCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A frame reduced to the fields the engine consumes
#[derive(Debug, PartialEq, Eq)]
struct StrippedFrame {
    payload: Vec<u8>,
    source: Ipv4,
    dest: Ipv4,
    source_port: u16,
    dest_port: u16,
}

/// Strip link/IPv4/TCP headers; `None` for anything the engine does not
/// consume (non-IPv4, non-TCP, truncated, or payload-less frames)
fn strip_frame(data: &[u8], link_offset: usize) -> Option<StrippedFrame> {
    let ip = data.get(link_offset..)?;
    if ip.len() < 20 {
        return None;
    }

    // IPv4 only; version nibble then header length in 32-bit words
    if (ip[0] >> 4) != 4 {
        return None;
    }
    let ip_header_len = ((ip[0] & 0x0F) as usize) * 4;
    if ip_header_len < 20 || ip.len() < ip_header_len {
        return None;
    }

    // TCP is protocol 6
    if ip[9] != 6 {
        return None;
    }

    let source = Ipv4::new(ip[12], ip[13], ip[14], ip[15]);
    let dest = Ipv4::new(ip[16], ip[17], ip[18], ip[19]);

    let tcp = ip.get(ip_header_len..)?;
    if tcp.len() < 20 {
        return None;
    }

    let source_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dest_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    let tcp_header_len = ((tcp[12] >> 4) as usize) * 4;
    if tcp_header_len < 20 || tcp.len() <= tcp_header_len {
        return None;
    }

    Some(StrippedFrame {
        payload: tcp[tcp_header_len..].to_vec(),
        source,
        dest,
        source_port,
        dest_port,
    })
}
