//! IPv4 address value type
//!
//! Endpoints are identified by IPv4 address throughout the engine. The
//! canonical key form is the big-endian u32, used by the bloom filters,
//! the endpoint shards and the block ledger.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An IPv4 address as four octets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ipv4(pub [u8; 4]);

impl Ipv4 {
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    /// Canonical 32-bit big-endian key
    #[inline]
    pub fn key(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    #[inline]
    pub fn from_key(key: u32) -> Self {
        Self(key.to_be_bytes())
    }

    pub fn octets(&self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Display for Ipv4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Error returned when parsing an IPv4 address from text fails
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid IPv4 address: {0}")]
pub struct ParseIpv4Error(pub String);

impl FromStr for Ipv4 {
    type Err = ParseIpv4Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 4];
        let mut parts = s.split('.');

        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseIpv4Error(s.to_string()))?;
            *octet = part
                .parse::<u8>()
                .map_err(|_| ParseIpv4Error(s.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(ParseIpv4Error(s.to_string()));
        }

        Ok(Self(octets))
    }
}

impl From<Ipv4Addr> for Ipv4 {
    fn from(addr: Ipv4Addr) -> Self {
        Self(addr.octets())
    }
}

impl From<Ipv4> for Ipv4Addr {
    fn from(ip: Ipv4) -> Self {
        Ipv4Addr::from(ip.0)
    }
}
