//! Shared whitelist
//!
//! The authoritative set of trusted endpoints, consulted by the mitigation
//! engine (block suppression) and the analyzer (unauthorized-write rule).
//! The engine's whitelist bloom filter is only a fast path rebuilt from
//! this set.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::core::Ipv4;

#[derive(Debug, Default)]
pub struct Whitelist {
    set: RwLock<HashSet<u32>>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ips(ips: &[Ipv4]) -> Self {
        Self {
            set: RwLock::new(ips.iter().map(Ipv4::key).collect()),
        }
    }

    /// Returns false if the endpoint was already whitelisted
    pub fn add(&self, ip: Ipv4) -> bool {
        self.set.write().insert(ip.key())
    }

    /// Returns false if the endpoint was not whitelisted
    pub fn remove(&self, ip: Ipv4) -> bool {
        self.set.write().remove(&ip.key())
    }

    pub fn contains(&self, key: u32) -> bool {
        self.set.read().contains(&key)
    }

    pub fn len(&self) -> usize {
        self.set.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Ipv4> {
        let mut ips: Vec<Ipv4> = self.set.read().iter().copied().map(Ipv4::from_key).collect();
        ips.sort();
        ips
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove_contains() {
        let wl = Whitelist::new();
        let ip = Ipv4::new(192, 168, 1, 10);

        assert!(wl.add(ip));
        assert!(!wl.add(ip));
        assert!(wl.contains(ip.key()));

        assert!(wl.remove(ip));
        assert!(!wl.remove(ip));
        assert!(!wl.contains(ip.key()));
    }

    #[test]
    fn test_from_config_ips() {
        let ips = vec![Ipv4::new(10, 0, 0, 1), Ipv4::new(10, 0, 0, 2)];
        let wl = Whitelist::from_ips(&ips);
        assert_eq!(wl.len(), 2);
        assert_eq!(wl.snapshot(), ips);
    }
}
