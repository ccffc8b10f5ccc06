//! Per-family asynchronous name resolution
//!
//! Lookups are blocking calls, so they run on a small helper thread pool.
//! The result is published into shared state and the waiting task is woken
//! through the scheduler's [`ResolverNotifier`].

use crate::engine::{ResolverNotifier, TaskId};
use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        Self::of(addr) == *self
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ipv4 => write!(f, "IPv4"),
            Self::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// Status of a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverStatus {
    InProgress,
    Success,
    Error,
}

/// Blocking lookup backend
///
/// Called on a helper thread, never on the scheduler thread.
pub trait Resolve: Send + Sync + std::fmt::Debug {
    fn lookup(&self, hostname: &str, family: AddressFamily) -> io::Result<Vec<IpAddr>>;
}

/// Lookup through the operating system resolver
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn lookup(&self, hostname: &str, family: AddressFamily) -> io::Result<Vec<IpAddr>> {
        let mut addrs: Vec<IpAddr> = Vec::new();
        for sa in (hostname, 0u16).to_socket_addrs()? {
            let ip = sa.ip();
            if family.matches(&ip) && !addrs.contains(&ip) {
                addrs.push(ip);
            }
        }
        Ok(addrs)
    }
}

#[derive(Debug)]
struct ResolveState {
    status: ResolverStatus,
    addrs: Vec<IpAddr>,
    error: String,
}

/// One in-flight lookup for one address family
#[derive(Debug, Clone)]
pub struct AsyncNameResolver {
    family: AddressFamily,
    hostname: String,
    state: Arc<Mutex<ResolveState>>,
}

impl AsyncNameResolver {
    fn new(hostname: &str, family: AddressFamily) -> Self {
        Self {
            family,
            hostname: hostname.to_string(),
            state: Arc::new(Mutex::new(ResolveState {
                status: ResolverStatus::InProgress,
                addrs: Vec::new(),
                error: String::new(),
            })),
        }
    }

    fn complete(&self, result: io::Result<Vec<IpAddr>>) {
        let mut state = self.state.lock();
        match result {
            Ok(addrs) => {
                let addrs: Vec<IpAddr> = addrs
                    .into_iter()
                    .filter(|a| self.family.matches(a))
                    .collect();
                if addrs.is_empty() {
                    state.status = ResolverStatus::Error;
                    state.error = format!("no {} address found", self.family);
                } else {
                    state.status = ResolverStatus::Success;
                    state.addrs = addrs;
                }
            }
            Err(e) => {
                state.status = ResolverStatus::Error;
                state.error = e.to_string();
            }
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn status(&self) -> ResolverStatus {
        self.state.lock().status
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.state.lock().addrs.clone()
    }

    pub fn error(&self) -> String {
        self.state.lock().error.clone()
    }
}

/// Helper thread pool running blocking lookups
pub struct ResolverPool {
    runtime: Option<tokio::runtime::Runtime>,
    backend: Arc<dyn Resolve>,
    notifier: ResolverNotifier,
}

impl ResolverPool {
    pub fn new(backend: Arc<dyn Resolve>, threads: usize, notifier: ResolverNotifier) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .max_blocking_threads(threads.max(1))
            .thread_name("gosh-resolver")
            .build()
            .map_err(|e| EngineError::Internal(format!("Failed to start resolver pool: {}", e)))?;
        Ok(Self {
            runtime: Some(runtime),
            backend,
            notifier,
        })
    }

    /// Start a lookup; `waiter` is woken when it concludes
    pub fn resolve(&self, hostname: &str, family: AddressFamily, waiter: TaskId) -> AsyncNameResolver {
        let resolver = AsyncNameResolver::new(hostname, family);
        let Some(runtime) = &self.runtime else {
            resolver.complete(Err(io::Error::new(
                io::ErrorKind::Other,
                "resolver pool is shut down",
            )));
            return resolver;
        };

        let job = resolver.clone();
        let backend = Arc::clone(&self.backend);
        let notifier = self.notifier.clone();
        tracing::debug!("{} resolving {} ({})", waiter, hostname, family);
        runtime.spawn_blocking(move || {
            let result = backend.lookup(&job.hostname, job.family);
            job.complete(result);
            notifier.notify(waiter);
        });
        resolver
    }
}

impl std::fmt::Debug for ResolverPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverPool")
            .field("backend", &self.backend)
            .field("running", &self.runtime.is_some())
            .finish()
    }
}

impl Drop for ResolverPool {
    fn drop(&mut self) {
        // do not wait for lookups stuck in the system resolver
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[derive(Debug)]
    struct StaticResolver(Vec<IpAddr>);

    impl Resolve for StaticResolver {
        fn lookup(&self, _hostname: &str, _family: AddressFamily) -> io::Result<Vec<IpAddr>> {
            Ok(self.0.clone())
        }
    }

    fn wait_for(resolver: &AsyncNameResolver) -> ResolverStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        while resolver.status() == ResolverStatus::InProgress && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        resolver.status()
    }

    #[test]
    fn test_family_filtering() {
        let backend = Arc::new(StaticResolver(vec![
            "192.0.2.1".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
        ]));
        let notifier = ResolverNotifier::detached();
        let pool = ResolverPool::new(backend, 2, notifier.clone()).unwrap();
        let waiter = TaskId::next();

        let v6 = pool.resolve("example.com", AddressFamily::Ipv6, waiter);
        assert_eq!(wait_for(&v6), ResolverStatus::Success);
        assert_eq!(v6.addresses(), vec!["2001:db8::1".parse::<IpAddr>().unwrap()]);

        let v4 = pool.resolve("example.com", AddressFamily::Ipv4, waiter);
        assert_eq!(wait_for(&v4), ResolverStatus::Success);
        assert_eq!(v4.addresses(), vec!["192.0.2.1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_empty_answer_is_error() {
        let backend = Arc::new(StaticResolver(vec!["192.0.2.1".parse().unwrap()]));
        let notifier = ResolverNotifier::detached();
        let pool = ResolverPool::new(backend, 1, notifier.clone()).unwrap();
        let waiter = TaskId::next();

        let v6 = pool.resolve("v4only.example", AddressFamily::Ipv6, waiter);
        assert_eq!(wait_for(&v6), ResolverStatus::Error);
        assert!(!v6.error().is_empty());

        // give the helper thread time to publish the completion
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut drained = Vec::new();
        while drained.is_empty() && Instant::now() < deadline {
            drained = notifier.drain();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(drained, vec![waiter]);
    }

    #[test]
    fn test_system_resolver_localhost() {
        let addrs = SystemResolver
            .lookup("127.0.0.1", AddressFamily::Ipv4)
            .unwrap();
        assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
