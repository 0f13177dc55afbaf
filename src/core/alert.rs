//! Threat alerts emitted by the behavioral analyzer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ipv4::Ipv4;

/// Attack classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackType {
    None,
    PortScan,
    DosFlood,
    UnauthorizedWrite,
    MalformedFrame,
    ProtocolExceptionStorm,
    SizeAnomaly,
}

impl std::fmt::Display for AttackType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttackType::None => "NONE",
            AttackType::PortScan => "PORT_SCAN",
            AttackType::DosFlood => "DOS_FLOOD",
            AttackType::UnauthorizedWrite => "UNAUTHORIZED_WRITE",
            AttackType::MalformedFrame => "MALFORMED_FRAME",
            AttackType::ProtocolExceptionStorm => "PROTOCOL_EXCEPTION_STORM",
            AttackType::SizeAnomaly => "SIZE_ANOMALY",
        };
        write!(f, "{}", s)
    }
}

/// Alert severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

/// A detected threat, tied to the source endpoint that caused it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAlert {
    pub source: Ipv4,
    pub dest: Ipv4,
    pub attack_type: AttackType,
    pub severity: Severity,
    /// Ratio of observed value to detection threshold, clipped to [0, 1]
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

impl ThreatAlert {
    pub fn new(
        source: Ipv4,
        dest: Ipv4,
        attack_type: AttackType,
        severity: Severity,
        confidence: f64,
        description: String,
    ) -> Self {
        Self {
            source,
            dest,
            attack_type,
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: Utc::now(),
            description,
        }
    }
}
