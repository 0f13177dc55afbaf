//! Mitigation engine
//!
//! Decides the response to each threat alert and enforces it:
//!
//! | Severity | Action |
//! |----------|--------|
//! | Low      | log only |
//! | Medium   | rate-limit the source governor for five minutes |
//! | High     | drop + block for `auto_block_duration` |
//! | Critical | drop + permanent block |
//!
//! Blocks live in a ledger keyed by the IPv4 u32 key. Re-blocking extends
//! the expiry and counts a violation; three violations inside an hour
//! promote the entry to permanent. The ledger is capped at
//! `max_concurrent_blocks`; on overflow the oldest non-permanent entry is
//! evicted. Whitelisted endpoints are never blocked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::analyzer::{EndpointTable, ENDPOINT_IDLE_SECS};
use crate::config::DetectionConfig;
use crate::core::{AttackType, Ipv4, PacketRecord, Severity, ThreatAlert};
use crate::metrics::Statistics;
use crate::whitelist::Whitelist;

/// How long a rate-limit restriction stays on the governor
const RATE_LIMIT_DURATION: Duration = Duration::from_secs(300);

/// Violations inside this window promote a block to permanent
const VIOLATION_WINDOW_SECS: i64 = 3600;

/// Violations needed for permanent promotion
const VIOLATION_LIMIT: usize = 3;

/// Response chosen for a threat alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationAction {
    LogOnly,
    RateLimit,
    DropPacket,
    BlockIp,
}

impl MitigationAction {
    /// Whether the triggering packet is dropped
    pub fn drops_packet(&self) -> bool {
        matches!(self, MitigationAction::DropPacket | MitigationAction::BlockIp)
    }
}

impl std::fmt::Display for MitigationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MitigationAction::LogOnly => "LOG_ONLY",
            MitigationAction::RateLimit => "RATE_LIMIT",
            MitigationAction::DropPacket => "DROP_PACKET",
            MitigationAction::BlockIp => "BLOCK_IP",
        };
        write!(f, "{}", s)
    }
}

/// One enforced block
#[derive(Debug, Clone, Serialize)]
pub struct BlockEntry {
    pub endpoint: Ipv4,
    pub reason: AttackType,
    pub installed_at: DateTime<Utc>,
    /// `None` means permanent
    pub expires_at: Option<DateTime<Utc>>,
    pub violation_count: u32,
    pub permanent: bool,
    #[serde(skip)]
    recent_violations: Vec<DateTime<Utc>>,
}

impl BlockEntry {
    fn new(endpoint: Ipv4, reason: AttackType, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            endpoint,
            reason,
            installed_at: Utc::now(),
            expires_at,
            violation_count: 1,
            permanent: expires_at.is_none(),
            recent_violations: vec![Utc::now()],
        }
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        !self.permanent && matches!(self.expires_at, Some(expiry) if now >= expiry)
    }

    /// Record another violation, extending the block; promotes to permanent
    /// after repeated violations inside the window
    fn record_violation(&mut self, now: DateTime<Utc>, extend_to: Option<DateTime<Utc>>) {
        self.violation_count += 1;
        self.recent_violations.push(now);
        self.recent_violations
            .retain(|t| (now - *t).num_seconds() < VIOLATION_WINDOW_SECS);

        if self.recent_violations.len() >= VIOLATION_LIMIT {
            self.permanent = true;
            self.expires_at = None;
        } else if !self.permanent {
            match (self.expires_at, extend_to) {
                (Some(current), Some(new)) if new > current => self.expires_at = Some(new),
                (_, None) => {
                    self.permanent = true;
                    self.expires_at = None;
                }
                _ => {}
            }
        }
    }
}

type BlockCallback = Box<dyn Fn(&ThreatAlert, MitigationAction) + Send + Sync>;

pub struct MitigationEngine {
    config: Arc<DetectionConfig>,
    ledger: RwLock<HashMap<u32, BlockEntry>>,
    table: Arc<EndpointTable>,
    whitelist: Arc<Whitelist>,
    stats: Arc<Statistics>,
    /// Handlers run synchronously under this lock on every mitigation; they
    /// must not call back into the packet path
    callbacks: Mutex<Vec<BlockCallback>>,
}

impl MitigationEngine {
    pub fn new(
        config: Arc<DetectionConfig>,
        table: Arc<EndpointTable>,
        whitelist: Arc<Whitelist>,
        stats: Arc<Statistics>,
    ) -> Self {
        Self {
            config,
            ledger: RwLock::new(HashMap::new()),
            table,
            whitelist,
            stats,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn register_callback(&self, callback: BlockCallback) {
        self.callbacks.lock().push(callback);
    }

    fn notify(&self, alert: &ThreatAlert, action: MitigationAction) {
        for callback in self.callbacks.lock().iter() {
            callback(alert, action);
        }
    }

    /// Pre-analysis governor: true means shed this packet
    pub fn should_drop_packet(&self, record: &PacketRecord) -> bool {
        let now = record.timestamp.timestamp().max(0) as u64;
        self.table
            .with_state(record.source.key(), now, |state| !state.governor.try_consume())
    }

    /// Authoritative block lookup; expired entries are removed on the spot
    pub fn is_blocked(&self, ip: Ipv4) -> bool {
        self.is_blocked_at(ip, Utc::now())
    }

    pub fn is_blocked_at(&self, ip: Ipv4, now: DateTime<Utc>) -> bool {
        let key = ip.key();
        {
            let ledger = self.ledger.read();
            match ledger.get(&key) {
                None => return false,
                Some(entry) if !entry.expired(now) => return true,
                Some(_) => {}
            }
        }

        // Lazily drop the expired entry
        let mut ledger = self.ledger.write();
        if let Some(entry) = ledger.get(&key) {
            if entry.expired(now) {
                ledger.remove(&key);
                self.stats.block_released();
                return false;
            }
            return true;
        }
        false
    }

    /// Choose and enforce the response for an alert
    pub fn mitigate(&self, alert: &ThreatAlert) -> MitigationAction {
        let action = if self.whitelist.contains(alert.source.key()) {
            MitigationAction::LogOnly
        } else {
            match alert.severity {
                Severity::Low => MitigationAction::LogOnly,
                Severity::Medium => {
                    self.rate_limit(alert.source, alert.timestamp.timestamp().max(0) as u64);
                    MitigationAction::RateLimit
                }
                Severity::High => {
                    if self.config.auto_block_enabled {
                        self.install_block(
                            alert.source,
                            alert.attack_type,
                            Some(Duration::from_secs(self.config.auto_block_duration)),
                        );
                        MitigationAction::BlockIp
                    } else {
                        MitigationAction::DropPacket
                    }
                }
                Severity::Critical => {
                    if self.config.auto_block_enabled {
                        self.install_block(alert.source, alert.attack_type, None);
                        MitigationAction::BlockIp
                    } else {
                        MitigationAction::DropPacket
                    }
                }
            }
        };

        self.notify(alert, action);
        action
    }

    /// Shrink the source's governor for the restriction interval
    fn rate_limit(&self, ip: Ipv4, now: u64) {
        self.table.with_state(ip.key(), now, |state| {
            state.governor.restrict(RATE_LIMIT_DURATION);
        });
        debug!("rate limit applied to {}", ip);
    }

    /// Install or extend a block; returns false when suppressed or refused
    pub fn block_ip(&self, ip: Ipv4, reason: AttackType, duration: Option<Duration>) -> bool {
        if !self.install_block(ip, reason, duration) {
            return false;
        }

        let alert = ThreatAlert::new(
            ip,
            ip,
            reason,
            Severity::High,
            1.0,
            format!("block installed for {}", ip),
        );
        self.notify(&alert, MitigationAction::BlockIp);
        true
    }

    fn install_block(&self, ip: Ipv4, reason: AttackType, duration: Option<Duration>) -> bool {
        if self.whitelist.contains(ip.key()) {
            warn!("refusing to block whitelisted endpoint {}", ip);
            return false;
        }

        let now = Utc::now();
        let expires_at = duration.and_then(|d| {
            chrono::Duration::from_std(d)
                .ok()
                .map(|d| now + d)
        });

        let mut ledger = self.ledger.write();

        if let Some(entry) = ledger.get_mut(&ip.key()) {
            entry.record_violation(now, expires_at);
            return true;
        }

        // Capacity: evict the oldest non-permanent entry to make room
        if ledger.len() >= self.config.max_concurrent_blocks as usize {
            let victim = ledger
                .values()
                .filter(|e| !e.permanent)
                .min_by_key(|e| e.installed_at)
                .map(|e| e.endpoint.key());
            match victim {
                Some(key) => {
                    ledger.remove(&key);
                    self.stats.block_released();
                }
                None => {
                    warn!("block ledger full of permanent entries, cannot block {}", ip);
                    return false;
                }
            }
        }

        ledger.insert(ip.key(), BlockEntry::new(ip, reason, expires_at));
        self.stats.block_installed();
        true
    }

    /// Remove a block; returns false if none existed
    pub fn unblock_ip(&self, ip: Ipv4) -> bool {
        let removed = self.ledger.write().remove(&ip.key()).is_some();
        if removed {
            self.stats.block_released();
        }
        removed
    }

    pub fn add_whitelist(&self, ip: Ipv4) -> bool {
        // An existing block contradicts the new trust; clear it
        self.unblock_ip(ip);
        self.whitelist.add(ip)
    }

    pub fn remove_whitelist(&self, ip: Ipv4) -> bool {
        self.whitelist.remove(ip)
    }

    pub fn whitelist(&self) -> &Arc<Whitelist> {
        &self.whitelist
    }

    /// Active blocks, oldest first
    pub fn blocked_ips(&self) -> Vec<BlockEntry> {
        let mut entries: Vec<BlockEntry> = self.ledger.read().values().cloned().collect();
        entries.sort_by_key(|e| e.installed_at);
        entries
    }

    pub fn active_block_count(&self) -> usize {
        self.ledger.read().len()
    }

    /// Sweep expired blocks and retire idle endpoint state
    pub fn cleanup(&self) -> (usize, usize) {
        self.cleanup_at(Utc::now())
    }

    pub fn cleanup_at(&self, now: DateTime<Utc>) -> (usize, usize) {
        let expired = {
            let mut ledger = self.ledger.write();
            let before = ledger.len();
            ledger.retain(|_, entry| !entry.expired(now));
            before - ledger.len()
        };
        for _ in 0..expired {
            self.stats.block_released();
        }

        let retired = self
            .table
            .retire_idle(now.timestamp().max(0) as u64, ENDPOINT_IDLE_SECS);

        if expired > 0 || retired > 0 {
            debug!("cleanup: {} blocks expired, {} endpoints retired", expired, retired);
        }
        (expired, retired)
    }
}
