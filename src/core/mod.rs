//! Core value types shared across the engine
//!
//! - `Ipv4`: endpoint address with its canonical u32 key form
//! - `PacketRecord`: one observed packet as seen by the verdict pipeline
//! - `ThreatAlert`: a detected threat emitted by the analyzer

pub mod alert;
pub mod ipv4;
pub mod packet;

pub use alert::{AttackType, Severity, ThreatAlert};
pub use ipv4::Ipv4;
pub use packet::{PacketRecord, ProtocolTag};
