//! Name resolution
//!
//! [`NameResolutionManager`] runs one [`AsyncNameResolver`] per enabled
//! address family (IPv6 first, then IPv4) and folds their states into a
//! single status for the connecting task. An IPv4 answer is enough to
//! start connecting; a late IPv6 answer is still picked up afterwards.

mod async_resolver;
mod cache;
mod command;

pub use async_resolver::{
    AddressFamily, AsyncNameResolver, ResolverPool, ResolverStatus, Resolve, SystemResolver,
};
pub use cache::DnsCache;
pub use command::{ResolveCallback, ResolveCommand};

use crate::engine::TaskId;
use std::net::IpAddr;

/// Coordinates per-family resolvers for one hostname
#[derive(Debug, Default)]
pub struct NameResolutionManager {
    resolvers: Vec<AsyncNameResolver>,
    ipv4: bool,
    ipv6: bool,
    started: bool,
}

impl NameResolutionManager {
    /// Manager with both families enabled
    pub fn new() -> Self {
        Self {
            resolvers: Vec::new(),
            ipv4: true,
            ipv6: true,
            started: false,
        }
    }

    pub fn set_ipv4(&mut self, enabled: bool) {
        self.ipv4 = enabled;
    }

    pub fn set_ipv6(&mut self, enabled: bool) {
        self.ipv6 = enabled;
    }

    /// Start resolving `hostname`. With no family enabled nothing starts
    /// and [`status`](Self::status) reports `Error`.
    pub fn resolve(&mut self, hostname: &str, pool: &ResolverPool, waiter: TaskId) {
        self.reset();
        self.started = true;
        if self.ipv6 {
            self.resolvers
                .push(pool.resolve(hostname, AddressFamily::Ipv6, waiter));
        }
        if self.ipv4 {
            self.resolvers
                .push(pool.resolve(hostname, AddressFamily::Ipv4, waiter));
        }
        if self.resolvers.is_empty() {
            tracing::debug!("{} no address family enabled for {}", waiter, hostname);
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn num_resolvers(&self) -> usize {
        self.resolvers.len()
    }

    /// Aggregate status
    ///
    /// `Success` once IPv4 succeeds, or once every family has concluded with
    /// at least one success. `Error` once every family failed (or none was
    /// enabled). `InProgress` otherwise.
    pub fn status(&self) -> ResolverStatus {
        if self.resolvers.is_empty() {
            return ResolverStatus::Error;
        }
        let mut success = 0;
        let mut error = 0;
        let mut ipv4_success = false;
        for resolver in &self.resolvers {
            match resolver.status() {
                ResolverStatus::Success => {
                    success += 1;
                    if resolver.family() == AddressFamily::Ipv4 {
                        ipv4_success = true;
                    }
                }
                ResolverStatus::Error => error += 1,
                ResolverStatus::InProgress => {}
            }
        }
        let n = self.resolvers.len();
        if success > 0 && (ipv4_success || success + error == n) {
            ResolverStatus::Success
        } else if error == n {
            ResolverStatus::Error
        } else {
            ResolverStatus::InProgress
        }
    }

    /// Addresses resolved so far, IPv6 results before IPv4
    pub fn resolved_addresses(&self) -> Vec<IpAddr> {
        let mut addrs = Vec::new();
        for resolver in &self.resolvers {
            if resolver.status() == ResolverStatus::Success {
                for addr in resolver.addresses() {
                    if !addrs.contains(&addr) {
                        addrs.push(addr);
                    }
                }
            }
        }
        addrs
    }

    /// Whether any family is still resolving
    pub fn in_flight(&self) -> bool {
        self.resolvers
            .iter()
            .any(|r| r.status() == ResolverStatus::InProgress)
    }

    /// Error message of the last failed family
    pub fn last_error(&self) -> String {
        if self.started && self.resolvers.is_empty() {
            return "no address family enabled".to_string();
        }
        self.resolvers
            .iter()
            .rev()
            .find(|r| r.status() == ResolverStatus::Error)
            .map(|r| r.error())
            .unwrap_or_default()
    }

    /// Drop all resolvers. In-flight lookups finish unobserved.
    pub fn reset(&mut self) {
        self.resolvers.clear();
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ResolverNotifier;
    use parking_lot::{Condvar, Mutex};
    use std::io;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    /// IPv4 answers immediately, IPv6 blocks until released
    #[derive(Debug, Default)]
    struct GatedResolver {
        released: Mutex<bool>,
        cond: Condvar,
        v6_fails: bool,
    }

    impl GatedResolver {
        fn release(&self) {
            *self.released.lock() = true;
            self.cond.notify_all();
        }
    }

    impl Resolve for GatedResolver {
        fn lookup(&self, _hostname: &str, family: AddressFamily) -> io::Result<Vec<IpAddr>> {
            match family {
                AddressFamily::Ipv4 => Ok(vec!["192.0.2.10".parse().unwrap()]),
                AddressFamily::Ipv6 => {
                    let mut released = self.released.lock();
                    while !*released {
                        self.cond.wait(&mut released);
                    }
                    if self.v6_fails {
                        Err(io::Error::new(io::ErrorKind::NotFound, "NXDOMAIN"))
                    } else {
                        Ok(vec!["2001:db8::10".parse().unwrap()])
                    }
                }
            }
        }
    }

    fn pool(backend: Arc<GatedResolver>) -> ResolverPool {
        ResolverPool::new(backend, 4, ResolverNotifier::detached()).unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_ipv4_success_short_circuits_while_ipv6_in_flight() {
        let backend = Arc::new(GatedResolver::default());
        let pool = pool(Arc::clone(&backend));
        let mut manager = NameResolutionManager::new();
        manager.resolve("dual.example", &pool, TaskId::next());
        assert_eq!(manager.num_resolvers(), 2);

        wait_until(|| manager.status() != ResolverStatus::InProgress);
        assert_eq!(manager.status(), ResolverStatus::Success);
        assert!(manager.in_flight());
        assert_eq!(
            manager.resolved_addresses(),
            vec!["192.0.2.10".parse::<IpAddr>().unwrap()]
        );

        // the late IPv6 answer is ordered first
        backend.release();
        wait_until(|| !manager.in_flight());
        assert_eq!(
            manager.resolved_addresses(),
            vec![
                "2001:db8::10".parse::<IpAddr>().unwrap(),
                "192.0.2.10".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn test_ipv6_only_success_waits_for_all_families() {
        let backend = Arc::new(GatedResolver::default());
        backend.release();
        let pool = pool(backend);
        let mut manager = NameResolutionManager::new();
        manager.set_ipv4(false);
        manager.resolve("v6.example", &pool, TaskId::next());

        wait_until(|| manager.status() != ResolverStatus::InProgress);
        assert_eq!(manager.status(), ResolverStatus::Success);
    }

    #[test]
    fn test_mixed_outcome_is_success() {
        let backend = Arc::new(GatedResolver {
            v6_fails: true,
            ..Default::default()
        });
        backend.release();
        let pool = pool(backend);
        let mut manager = NameResolutionManager::new();
        manager.resolve("dual.example", &pool, TaskId::next());

        wait_until(|| !manager.in_flight());
        assert_eq!(manager.status(), ResolverStatus::Success);
        assert_eq!(manager.last_error(), "NXDOMAIN");
    }

    #[test]
    fn test_all_families_failed_is_error() {
        let backend = Arc::new(GatedResolver {
            v6_fails: true,
            ..Default::default()
        });
        backend.release();
        let pool = pool(backend);
        let mut manager = NameResolutionManager::new();
        manager.set_ipv4(false);
        manager.resolve("missing.example", &pool, TaskId::next());

        wait_until(|| manager.status() != ResolverStatus::InProgress);
        assert_eq!(manager.status(), ResolverStatus::Error);
        assert!(manager.resolved_addresses().is_empty());
    }

    #[test]
    fn test_no_family_enabled_is_immediate_error() {
        let backend = Arc::new(GatedResolver::default());
        let pool = pool(backend);
        let mut manager = NameResolutionManager::new();
        manager.set_ipv4(false);
        manager.set_ipv6(false);
        manager.resolve("example.com", &pool, TaskId::next());

        assert!(manager.started());
        assert_eq!(manager.num_resolvers(), 0);
        assert_eq!(manager.status(), ResolverStatus::Error);
        assert_eq!(manager.last_error(), "no address family enabled");
    }

    #[test]
    fn test_reset() {
        let backend = Arc::new(GatedResolver::default());
        backend.release();
        let pool = pool(backend);
        let mut manager = NameResolutionManager::new();
        manager.resolve("example.com", &pool, TaskId::next());
        manager.reset();
        assert!(!manager.started());
        assert_eq!(manager.num_resolvers(), 0);
    }
}
