//! Canonical packet record
//!
//! The acquisition layer hands the engine a TCP payload plus addressing.
//! Everything downstream (governor, analyzer, mitigation) works on this
//! record rather than raw bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::modbus::ModbusFrame;

use super::ipv4::Ipv4;

/// Industrial protocol carried by the packet, derived from the port pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolTag {
    Unknown,
    ModbusTcp,
    /// Recognized by port only; no frame inspection is performed
    Dnp3,
}

/// Well-known DNP3 server port (tagged only, never parsed)
pub const DNP3_PORT: u16 = 20000;

impl ProtocolTag {
    /// Classify by the well-known server port on either side
    pub fn from_ports(source_port: u16, dest_port: u16) -> Self {
        if source_port == crate::modbus::MODBUS_TCP_PORT
            || dest_port == crate::modbus::MODBUS_TCP_PORT
        {
            ProtocolTag::ModbusTcp
        } else if source_port == DNP3_PORT || dest_port == DNP3_PORT {
            ProtocolTag::Dnp3
        } else {
            ProtocolTag::Unknown
        }
    }
}

/// One observed packet, as seen by the verdict pipeline
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub source: Ipv4,
    pub dest: Ipv4,
    pub source_port: u16,
    pub dest_port: u16,
    pub size_bytes: usize,
    pub timestamp: DateTime<Utc>,
    pub protocol: ProtocolTag,
    /// Set when a protocol parse was attempted and failed
    pub malformed: bool,
    pub modbus: Option<ModbusFrame>,
}

impl PacketRecord {
    pub fn new(
        source: Ipv4,
        dest: Ipv4,
        source_port: u16,
        dest_port: u16,
        size_bytes: usize,
    ) -> Self {
        Self {
            source,
            dest,
            source_port,
            dest_port,
            size_bytes,
            timestamp: Utc::now(),
            protocol: ProtocolTag::from_ports(source_port, dest_port),
            malformed: false,
            modbus: None,
        }
    }
}
