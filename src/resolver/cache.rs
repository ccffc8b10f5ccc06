//! Resolved address cache
//!
//! Maps `(host, port)` to the addresses name resolution returned, in
//! order. Addresses that failed to connect are marked bad for a cooldown
//! and are skipped while a good address remains.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

#[derive(Debug, Clone)]
struct AddrEntry {
    addr: IpAddr,
    bad_until: Option<Instant>,
}

impl AddrEntry {
    fn is_good(&self, now: Instant) -> bool {
        match self.bad_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

/// Cache of resolved addresses with good/bad marking
#[derive(Debug, Default)]
pub struct DnsCache {
    entries: HashMap<(String, u16), Vec<AddrEntry>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `addr` for `(host, port)` unless it is already known
    pub fn put(&mut self, host: &str, addr: IpAddr, port: u16) {
        let entries = self.entries.entry((host.to_string(), port)).or_default();
        if !entries.iter().any(|e| e.addr == addr) {
            entries.push(AddrEntry {
                addr,
                bad_until: None,
            });
        }
    }

    pub fn put_all(&mut self, host: &str, addrs: &[IpAddr], port: u16) {
        for addr in addrs {
            self.put(host, *addr, port);
        }
    }

    /// First good address
    pub fn find(&self, host: &str, port: u16, now: Instant) -> Option<IpAddr> {
        self.entries
            .get(&(host.to_string(), port))?
            .iter()
            .find(|e| e.is_good(now))
            .map(|e| e.addr)
    }

    /// Every good address in resolution order
    pub fn find_all(&self, host: &str, port: u16, now: Instant) -> Vec<IpAddr> {
        self.entries
            .get(&(host.to_string(), port))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.is_good(now))
                    .map(|e| e.addr)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark `addr` bad until `until`. Unknown addresses are added first.
    pub fn mark_bad(&mut self, host: &str, addr: IpAddr, port: u16, until: Instant) {
        let entries = self.entries.entry((host.to_string(), port)).or_default();
        match entries.iter_mut().find(|e| e.addr == addr) {
            Some(entry) => entry.bad_until = Some(until),
            None => entries.push(AddrEntry {
                addr,
                bad_until: Some(until),
            }),
        }
        tracing::debug!("Marked {} bad for {}:{}", addr, host, port);
    }

    pub fn is_bad(&self, host: &str, addr: IpAddr, port: u16, now: Instant) -> bool {
        self.entries
            .get(&(host.to_string(), port))
            .and_then(|entries| entries.iter().find(|e| e.addr == addr))
            .map(|e| !e.is_good(now))
            .unwrap_or(false)
    }

    pub fn remove(&mut self, host: &str, port: u16) {
        self.entries.remove(&(host.to_string(), port));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_put_keeps_order_and_dedups() {
        let mut cache = DnsCache::new();
        let now = Instant::now();
        cache.put_all("example.com", &[ip("192.0.2.1"), ip("192.0.2.2")], 80);
        cache.put("example.com", ip("192.0.2.1"), 80);

        assert_eq!(
            cache.find_all("example.com", 80, now),
            vec![ip("192.0.2.1"), ip("192.0.2.2")]
        );
        assert!(cache.find_all("example.com", 443, now).is_empty());
    }

    #[test]
    fn test_bad_address_skipped_until_cooldown_ends() {
        let mut cache = DnsCache::new();
        let now = Instant::now();
        cache.put_all("example.com", &[ip("192.0.2.1"), ip("192.0.2.2")], 80);
        cache.mark_bad("example.com", ip("192.0.2.1"), 80, now + Duration::from_secs(300));

        assert_eq!(cache.find("example.com", 80, now), Some(ip("192.0.2.2")));
        assert!(cache.is_bad("example.com", ip("192.0.2.1"), 80, now));

        let later = now + Duration::from_secs(301);
        assert_eq!(cache.find("example.com", 80, later), Some(ip("192.0.2.1")));
        assert!(!cache.is_bad("example.com", ip("192.0.2.1"), 80, later));
    }
}
