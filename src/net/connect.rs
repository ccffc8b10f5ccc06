//! Primary connect command
//!
//! States: `Idle` → `ResolvingName` → `Connecting` (→ `AwaitingBackup`) →
//! hand-off. Each attempt carries its own deadline; a failed address is
//! marked bad in the DNS cache and the next candidate is tried. Once the
//! primary attempt has been pending for the backup delay, a backup attempt
//! against the other address family is raced alongside it.

use super::backup::{BackupConnectCommand, BackupConnectInfo, BackupPolicy, RaceSide};
use super::{poll_established, ConnectProgress, Transport};
use crate::config::EngineConfig;
use crate::engine::{SchedulerHandle, SocketCheck, Step, Task, TaskCore, TaskKind};
use crate::error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result};
use crate::protocol::GroupId;
use crate::resolver::{AddressFamily, NameResolutionManager, ResolverStatus};
use crate::tls::{TlsHandshakeCommand, TlsSession};
use mio::net::TcpStream;
use mio::Interest;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::{Host, Url};

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub uri: String,
    pub host: String,
    pub port: u16,
    /// URI scheme, used as the server statistics protocol key
    pub protocol: String,
    pub tls: bool,
}

impl ConnectTarget {
    /// Target for a download URI
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)?;
        let tls = match url.scheme() {
            "http" | "ftp" | "ws" => false,
            "https" | "ftps" | "wss" => true,
            other => {
                return Err(EngineError::protocol(
                    ProtocolErrorKind::UnsupportedScheme,
                    format!("Unsupported scheme: {}", other),
                ))
            }
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => {
                return Err(EngineError::protocol(
                    ProtocolErrorKind::InvalidUrl,
                    format!("No host in {}", uri),
                ))
            }
        };
        let port = url
            .port_or_known_default()
            .or(if url.scheme() == "ftps" { Some(990) } else { None })
            .ok_or_else(|| {
                EngineError::protocol(ProtocolErrorKind::InvalidUrl, format!("No port in {}", uri))
            })?;
        Ok(Self {
            uri: uri.to_string(),
            host,
            port,
            protocol: url.scheme().to_string(),
            tls,
        })
    }

    /// Raw TCP target, e.g. a peer or tracker address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            uri: format!("{}:{}", host, port),
            host,
            port,
            protocol: "tcp".to_string(),
            tls: false,
        }
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// The host when it is already an address
    pub fn ip_literal(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

/// An established connection ready for a protocol client
#[derive(Debug)]
pub struct Connection {
    pub transport: Transport,
    pub target: ConnectTarget,
    pub peer: SocketAddr,
    /// The backup attempt won the race
    pub via_backup: bool,
}

/// Receives the outcome of connection establishment
pub trait ConnectionConsumer {
    /// Take over the connection; returns the protocol tasks to schedule
    fn on_connected(
        self: Box<Self>,
        conn: Connection,
        h: &mut SchedulerHandle,
    ) -> Result<Vec<Box<dyn Task>>>;

    /// Decide what to do with a failure. Returning the error finishes the
    /// connect task with it; returning tasks (e.g. a retry against the next
    /// mirror) schedules them instead.
    fn on_failed(
        self: Box<Self>,
        target: Option<ConnectTarget>,
        err: EngineError,
        h: &mut SchedulerHandle,
    ) -> Result<Vec<Box<dyn Task>>> {
        let _ = (target, h);
        Err(err)
    }
}

struct Attempt {
    socket: TcpStream,
    addr: SocketAddr,
    check: SocketCheck,
    started: Instant,
    deadline: Instant,
}

enum ConnectState {
    Idle,
    ResolvingName { deadline: Instant },
    Connecting(Attempt),
    AwaitingBackup { deadline: Instant },
}

/// Resolves and connects one target, racing a backup when useful
pub struct ConnectCommand {
    core: TaskCore,
    target: Option<ConnectTarget>,
    consumer: Option<Box<dyn ConnectionConsumer>>,
    resolver: NameResolutionManager,
    candidates: VecDeque<IpAddr>,
    tried: Vec<IpAddr>,
    state: ConnectState,
    backup: Option<Arc<BackupConnectInfo>>,
    policy: BackupPolicy,
    connect_timeout: Duration,
    timeout: Duration,
    cooldown: Duration,
    last_failure: String,
}

impl ConnectCommand {
    /// Connect to a fixed target
    pub fn new(
        target: ConnectTarget,
        group: Option<GroupId>,
        consumer: Box<dyn ConnectionConsumer>,
        config: &EngineConfig,
    ) -> Self {
        let mut cmd = Self::build(group, consumer, config);
        cmd.target = Some(target);
        cmd
    }

    /// Connect to the next URI the group's selector picks
    pub fn for_group(group: GroupId, consumer: Box<dyn ConnectionConsumer>, config: &EngineConfig) -> Self {
        Self::build(Some(group), consumer, config)
    }

    fn build(group: Option<GroupId>, consumer: Box<dyn ConnectionConsumer>, config: &EngineConfig) -> Self {
        Self {
            core: TaskCore::new(TaskKind::Connect, group),
            target: None,
            consumer: Some(consumer),
            resolver: NameResolutionManager::new(),
            candidates: VecDeque::new(),
            tried: Vec::new(),
            state: ConnectState::Idle,
            backup: None,
            policy: BackupPolicy::new(config.network.backup_connect_delay()),
            connect_timeout: config.network.connect_timeout(),
            timeout: config.network.timeout(),
            cooldown: config.network.bad_address_cooldown(),
            last_failure: String::new(),
        }
    }

    pub fn target(&self) -> Option<&ConnectTarget> {
        self.target.as_ref()
    }

    /// Current state, for diagnostics
    pub fn state_name(&self) -> &'static str {
        match self.state {
            ConnectState::Idle => "idle",
            ConnectState::ResolvingName { .. } => "resolving",
            ConnectState::Connecting(_) => "connecting",
            ConnectState::AwaitingBackup { .. } => "awaiting-backup",
        }
    }

    /// Addresses attempted so far, in order
    pub fn tried_addresses(&self) -> &[IpAddr] {
        &self.tried
    }

    fn host_port(&self) -> Result<(String, u16)> {
        self.target
            .as_ref()
            .map(|t| (t.host.clone(), t.port))
            .ok_or_else(|| EngineError::Internal("connect target not selected".to_string()))
    }

    fn start(&mut self, h: &mut SchedulerHandle, now: Instant) -> Result<Step> {
        let id = self.core.id();
        let target = match self.target.clone() {
            Some(target) => target,
            None => {
                let gid = self
                    .core
                    .group()
                    .ok_or_else(|| EngineError::Internal("no target and no group".to_string()))?;
                let Some(uri) = h.groups_mut().select_uri(gid) else {
                    let err = EngineError::network(
                        NetworkErrorKind::AllAddressesFailed,
                        "no URI left to try",
                    );
                    return self.fail(h, err);
                };
                match ConnectTarget::from_uri(&uri) {
                    Ok(target) => target,
                    Err(err) => {
                        h.groups_mut().record_uri_result(gid, &uri, err.result_code());
                        return self.fail(h, err);
                    }
                }
            }
        };
        tracing::info!("{} connecting to {}", id, target.uri);
        self.target = Some(target.clone());

        if let Some(ip) = target.ip_literal() {
            self.candidates = VecDeque::from([ip]);
            return self.connect_next(h, now);
        }

        let cached = h.dns_cache().find_all(&target.host, target.port, now);
        if !cached.is_empty() {
            tracing::debug!("{} using cached addresses for {}: {:?}", id, target.host, cached);
            self.candidates = cached.into();
            return self.connect_next(h, now);
        }

        h.families().apply(&mut self.resolver);
        self.resolver.resolve(&target.host, h.resolver(), id);
        let deadline = now + self.timeout;
        h.io().set_timer(id, deadline);
        self.state = ConnectState::ResolvingName { deadline };
        self.poll_resolution(h, now, deadline)
    }

    fn poll_resolution(&mut self, h: &mut SchedulerHandle, now: Instant, deadline: Instant) -> Result<Step> {
        let id = self.core.id();
        let (host, port) = self.host_port()?;
        match self.resolver.status() {
            ResolverStatus::InProgress => {
                if now >= deadline {
                    let err = EngineError::network(
                        NetworkErrorKind::Timeout,
                        format!("name resolution for {} timed out", host),
                    );
                    return self.fail(h, err);
                }
                Ok(Step::Continue)
            }
            ResolverStatus::Error => {
                let err = EngineError::name_resolution(host, self.resolver.last_error());
                self.fail(h, err)
            }
            ResolverStatus::Success => {
                let addrs = self.resolver.resolved_addresses();
                tracing::info!("{} name resolution complete: {} -> {:?}", id, host, addrs);
                h.dns_cache().put_all(&host, &addrs, port);
                let families = h.families();
                self.candidates = addrs.into_iter().filter(|a| families.allows(a)).collect();
                h.io().clear_timers(id);
                self.connect_next(h, now)
            }
        }
    }

    /// Prefer the first candidate not marked bad, falling back to the first
    fn next_candidate(&mut self, h: &mut SchedulerHandle, now: Instant, host: &str, port: u16) -> Option<IpAddr> {
        let cache = h.dns_cache();
        let good = self
            .candidates
            .iter()
            .position(|ip| !cache.is_bad(host, *ip, port, now));
        match good {
            Some(i) => self.candidates.remove(i),
            None => self.candidates.pop_front(),
        }
    }

    fn connect_next(&mut self, h: &mut SchedulerHandle, now: Instant) -> Result<Step> {
        let id = self.core.id();
        let (host, port) = self.host_port()?;
        loop {
            let Some(ip) = self.next_candidate(h, now, &host, port) else {
                let mut message = format!("all addresses of {} failed", host);
                if !self.last_failure.is_empty() {
                    message = format!("{} ({})", message, self.last_failure);
                }
                let err = EngineError::network(NetworkErrorKind::AllAddressesFailed, message);
                return self.fail(h, err);
            };
            self.tried.push(ip);
            let addr = SocketAddr::new(ip, port);
            tracing::debug!("{} dialing {}", id, addr);

            let mut socket = match h.dialer().dial(addr) {
                Ok(socket) => socket,
                Err(e) => {
                    self.mark_bad(h, &host, ip, port, now, &e.to_string());
                    continue;
                }
            };
            let mut check = SocketCheck::new();
            if let Err(e) = check.set(h.io(), id, &mut socket, Interest::WRITABLE) {
                self.mark_bad(h, &host, ip, port, now, &e.to_string());
                continue;
            }

            let deadline = now + self.connect_timeout;
            h.io().set_timer(id, deadline);
            if self.backup.is_none() {
                h.io().set_timer(id, self.policy.due_at(now));
            }
            self.state = ConnectState::Connecting(Attempt {
                socket,
                addr,
                check,
                started: now,
                deadline,
            });
            return Ok(Step::Continue);
        }
    }

    fn poll_connect(&mut self, h: &mut SchedulerHandle, now: Instant) -> Result<Step> {
        if self.backup_won() {
            return self.adopt_backup(h);
        }
        let ConnectState::Connecting(attempt) = &self.state else {
            return Ok(Step::Continue);
        };
        let (addr, started, deadline) = (attempt.addr, attempt.started, attempt.deadline);

        match poll_established(&attempt.socket) {
            ConnectProgress::Established => {
                let won = self
                    .backup
                    .as_ref()
                    .map(|info| info.try_claim(RaceSide::Primary))
                    .unwrap_or(true);
                if !won {
                    return self.adopt_backup(h);
                }
                let Some(socket) = self.take_attempt(h) else {
                    return Ok(Step::Continue);
                };
                self.finish(h, socket, addr, false)
            }
            ConnectProgress::Failed(e) => {
                self.take_attempt(h);
                let (host, port) = self.host_port()?;
                self.mark_bad(h, &host, addr.ip(), port, now, &e.to_string());
                self.after_attempt_failed(h, now)
            }
            ConnectProgress::Pending => {
                if now >= deadline {
                    self.take_attempt(h);
                    let (host, port) = self.host_port()?;
                    self.mark_bad(h, &host, addr.ip(), port, now, "connect timed out");
                    self.mark_server_error(h);
                    return self.after_attempt_failed(h, now);
                }
                self.maybe_spawn_backup(h, now, started, addr);
                Ok(Step::Continue)
            }
        }
    }

    fn after_attempt_failed(&mut self, h: &mut SchedulerHandle, now: Instant) -> Result<Step> {
        if let Some(info) = &self.backup {
            if info.winner() == Some(RaceSide::Backup) {
                return self.adopt_backup(h);
            }
            if !info.backup_failed() && !info.is_cancelled() {
                // keep the racing backup instead of failing the command
                let deadline = now + self.connect_timeout;
                h.io().set_timer(self.core.id(), deadline);
                self.state = ConnectState::AwaitingBackup { deadline };
                return Ok(Step::Continue);
            }
        }
        self.connect_next(h, now)
    }

    fn poll_backup(&mut self, h: &mut SchedulerHandle, now: Instant, deadline: Instant) -> Result<Step> {
        if self.backup_won() {
            return self.adopt_backup(h);
        }
        let backup_over = self
            .backup
            .as_ref()
            .map(|info| info.backup_failed() || info.is_cancelled())
            .unwrap_or(true);
        if backup_over {
            return self.connect_next(h, now);
        }
        if now >= deadline {
            let err = EngineError::network(NetworkErrorKind::Timeout, "backup connect timed out");
            return self.fail(h, err);
        }
        Ok(Step::Continue)
    }

    fn backup_won(&self) -> bool {
        self.backup
            .as_ref()
            .map(|info| info.winner() == Some(RaceSide::Backup))
            .unwrap_or(false)
    }

    fn maybe_spawn_backup(&mut self, h: &mut SchedulerHandle, now: Instant, started: Instant, current: SocketAddr) {
        if !self.policy.should_spawn(started, now, self.backup.is_some(), true) {
            return;
        }
        let Some(alternate) = self.take_alternate(h, current.ip()) else {
            return;
        };
        let info = Arc::new(BackupConnectInfo::new(SocketAddr::new(alternate, current.port())));
        tracing::debug!(
            "{} primary to {} still pending, starting backup to {}",
            self.core.id(),
            current,
            info.alternate()
        );
        h.schedule(Box::new(BackupConnectCommand::new(
            self.core.group(),
            self.core.id(),
            Arc::clone(&info),
            self.connect_timeout,
        )));
        self.backup = Some(info);
    }

    /// First usable address of the other family, including answers that
    /// arrived after connecting started
    fn take_alternate(&mut self, h: &mut SchedulerHandle, current: IpAddr) -> Option<IpAddr> {
        let other = match AddressFamily::of(&current) {
            AddressFamily::Ipv4 => AddressFamily::Ipv6,
            AddressFamily::Ipv6 => AddressFamily::Ipv4,
        };
        let families = h.families();
        if let Some(i) = self
            .candidates
            .iter()
            .position(|ip| other.matches(ip) && families.allows(ip))
        {
            return self.candidates.remove(i);
        }
        let late = self
            .resolver
            .resolved_addresses()
            .into_iter()
            .find(|ip| other.matches(ip) && families.allows(ip) && !self.tried.contains(ip))?;
        if let Ok((host, port)) = self.host_port() {
            h.dns_cache().put(&host, late, port);
        }
        Some(late)
    }

    fn take_attempt(&mut self, h: &mut SchedulerHandle) -> Option<TcpStream> {
        match std::mem::replace(&mut self.state, ConnectState::Idle) {
            ConnectState::Connecting(mut attempt) => {
                if let Err(e) = attempt.check.disable(h.io(), &mut attempt.socket) {
                    tracing::debug!("{} deregister failed: {}", self.core.id(), e);
                }
                Some(attempt.socket)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    fn adopt_backup(&mut self, h: &mut SchedulerHandle) -> Result<Step> {
        let info = self
            .backup
            .clone()
            .ok_or_else(|| EngineError::Internal("no backup to adopt".to_string()))?;
        let socket = info
            .take_socket()
            .ok_or_else(|| EngineError::Internal("backup won without a socket".to_string()))?;
        // our own attempt lost
        drop(self.take_attempt(h));
        self.finish(h, socket, info.alternate(), true)
    }

    fn mark_bad(&mut self, h: &mut SchedulerHandle, host: &str, ip: IpAddr, port: u16, now: Instant, reason: &str) {
        tracing::warn!(
            "{} connect to {} failed: {}",
            self.core.id(),
            SocketAddr::new(ip, port),
            reason
        );
        h.dns_cache().mark_bad(host, ip, port, now + self.cooldown);
        self.last_failure = reason.to_string();
    }

    fn mark_server_error(&self, h: &mut SchedulerHandle) {
        if let Some(target) = &self.target {
            h.groups_mut()
                .server_stats_mut()
                .get_or_create(&target.host, &target.protocol)
                .set_error();
        }
    }

    fn finish(&mut self, h: &mut SchedulerHandle, socket: TcpStream, addr: SocketAddr, via_backup: bool) -> Result<Step> {
        let id = self.core.id();
        let group = self.core.group();
        h.io().clear_timers(id);
        let target = self
            .target
            .clone()
            .ok_or_else(|| EngineError::Internal("connected without a target".to_string()))?;

        h.dns_cache().put(&target.host, addr.ip(), target.port);
        if let Some(gid) = group {
            h.groups_mut().record_connected_address(gid, &target.uri, addr);
        }
        tracing::info!(
            "{} connection established to {}{}",
            id,
            addr,
            if via_backup { " (backup)" } else { "" }
        );

        if target.tls {
            let ctx = match h.tls_context() {
                Ok(ctx) => ctx,
                Err(err) => return self.fail(h, err),
            };
            let session = match TlsSession::client(&ctx, socket, &target.host) {
                Ok(session) => session,
                Err(err) => return self.fail(h, err),
            };
            let consumer = self
                .consumer
                .take()
                .ok_or_else(|| EngineError::Internal("connection consumer missing".to_string()))?;
            h.schedule(Box::new(TlsHandshakeCommand::new(
                group,
                session,
                target,
                addr,
                via_backup,
                consumer,
                self.timeout,
            )));
            return Ok(Step::Done);
        }

        let consumer = self
            .consumer
            .take()
            .ok_or_else(|| EngineError::Internal("connection consumer missing".to_string()))?;
        let conn = Connection {
            transport: Transport::Plain(socket),
            target,
            peer: addr,
            via_backup,
        };
        for task in consumer.on_connected(conn, h)? {
            h.schedule(task);
        }
        Ok(Step::Done)
    }

    /// Drop sockets and stop a racing backup
    fn abandon(&mut self, h: &mut SchedulerHandle) {
        drop(self.take_attempt(h));
        if let Some(info) = &self.backup {
            info.cancel();
        }
        h.io().clear_timers(self.core.id());
    }

    fn fail(&mut self, h: &mut SchedulerHandle, err: EngineError) -> Result<Step> {
        self.abandon(h);
        let id = self.core.id();
        if let Some(target) = &self.target {
            tracing::warn!("{} {}: {}", id, target.uri, err);
            if let Some(gid) = self.core.group() {
                h.groups_mut()
                    .record_uri_result(gid, &target.uri, err.result_code());
            }
            if matches!(err, EngineError::Network { .. } | EngineError::NameResolution { .. }) {
                self.mark_server_error(h);
            }
        } else {
            tracing::warn!("{} {}", id, err);
        }

        match self.consumer.take() {
            Some(consumer) => {
                for task in consumer.on_failed(self.target.clone(), err, h)? {
                    h.schedule(task);
                }
                Ok(Step::Done)
            }
            None => Err(err),
        }
    }
}

impl Task for ConnectCommand {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn step(&mut self, h: &mut SchedulerHandle) -> Result<Step> {
        if h.should_stop(self.core.group()) {
            tracing::debug!("{} halt requested, abandoning connect", self.core.id());
            self.abandon(h);
            return Ok(Step::Done);
        }
        let now = h.now();
        match self.state {
            ConnectState::Idle => self.start(h, now),
            ConnectState::ResolvingName { deadline } => self.poll_resolution(h, now, deadline),
            ConnectState::Connecting(_) => self.poll_connect(h, now),
            ConnectState::AwaitingBackup { deadline } => self.poll_backup(h, now, deadline),
        }
    }
}
