//! gridwatch — inline IDS/IPS engine for SCADA (Modbus/TCP) networks
//!
//! The engine observes TCP traffic carrying industrial protocols and
//! renders a per-packet ALLOW/DROP verdict while building behavioral state
//! on source endpoints and installing mitigations.
//!
//! # Architecture
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Capture   │────▶│  MPMC queue  │────▶│   Workers    │
//! │   (pcap)    │     │  (lock-free) │     │  (N threads) │
//! └─────────────┘     └──────────────┘     └──────┬───────┘
//!                                                 │ process_packet
//!                                                 ▼
//!             whitelist bloom ─▶ blocklist bloom ─▶ Modbus parse
//!                                                 │
//!                governor ─▶ behavioral analyzer ─▶ mitigation
//!                                                 │
//!                                              verdict
//! ```
//!
//! Supporting state: sharded per-source behavior (`analyzer`), the block
//! ledger with expiry (`mitigation`), atomic statistics and latency
//! histograms (`metrics`), and an asynchronous audit logger (`logger`).

pub mod analyzer;
pub mod bloom;
pub mod capture;
pub mod cli;
pub mod config;
pub mod core;
pub mod engine;
pub mod lockfree;
pub mod logger;
pub mod metrics;
pub mod mitigation;
pub mod modbus;
pub mod sliding;
pub mod whitelist;
pub mod workers;

pub use crate::config::{AppConfig, DetectionConfig};
pub use crate::core::{AttackType, Ipv4, PacketRecord, ProtocolTag, Severity, ThreatAlert};
pub use crate::engine::GridWatch;
pub use crate::mitigation::{BlockEntry, MitigationAction};
pub use crate::modbus::{ModbusFrame, ModbusParser};
pub use crate::workers::WorkerPool;
