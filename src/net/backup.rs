//! Backup connection racing
//!
//! When the primary connect attempt has been pending for the backup delay
//! and an address of the other family is available, a backup attempt is
//! started against it. Whichever side connects first claims the race; the
//! loser closes its own socket and never touches the shared slot.

use super::{poll_established, ConnectProgress};
use crate::engine::{SchedulerHandle, SocketCheck, Step, Task, TaskCore, TaskId, TaskKind};
use crate::error::{EngineError, NetworkErrorKind, Result};
use crate::protocol::GroupId;
use mio::net::TcpStream;
use mio::Interest;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const UNCLAIMED: u8 = 0;
const PRIMARY: u8 = 1;
const BACKUP: u8 = 2;

/// Side of a connection race
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceSide {
    Primary,
    Backup,
}

impl RaceSide {
    fn code(&self) -> u8 {
        match self {
            Self::Primary => PRIMARY,
            Self::Backup => BACKUP,
        }
    }
}

/// State shared between a primary attempt and its backup
#[derive(Debug)]
pub struct BackupConnectInfo<S = TcpStream> {
    alternate: SocketAddr,
    winner: AtomicU8,
    cancel: AtomicBool,
    backup_failed: AtomicBool,
    socket: Mutex<Option<S>>,
}

impl<S> BackupConnectInfo<S> {
    pub fn new(alternate: SocketAddr) -> Self {
        Self {
            alternate,
            winner: AtomicU8::new(UNCLAIMED),
            cancel: AtomicBool::new(false),
            backup_failed: AtomicBool::new(false),
            socket: Mutex::new(None),
        }
    }

    /// Address the backup dials
    pub fn alternate(&self) -> SocketAddr {
        self.alternate
    }

    /// Claim the race. Exactly one side ever gets `true`; the claim also
    /// cancels the other side.
    pub fn try_claim(&self, side: RaceSide) -> bool {
        let won = self
            .winner
            .compare_exchange(UNCLAIMED, side.code(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.cancel.store(true, Ordering::Release);
        }
        won
    }

    /// Claim for the backup and publish its socket. Returns the socket back
    /// when the primary already won.
    pub fn install(&self, socket: S) -> std::result::Result<(), S> {
        if self.try_claim(RaceSide::Backup) {
            *self.socket.lock() = Some(socket);
            Ok(())
        } else {
            Err(socket)
        }
    }

    /// Take the backup's socket. Only meaningful for the primary owner
    /// after the backup won.
    pub fn take_socket(&self) -> Option<S> {
        self.socket.lock().take()
    }

    pub fn winner(&self) -> Option<RaceSide> {
        match self.winner.load(Ordering::Acquire) {
            PRIMARY => Some(RaceSide::Primary),
            BACKUP => Some(RaceSide::Backup),
            _ => None,
        }
    }

    /// Stop the backup without either side winning
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn mark_backup_failed(&self) {
        self.backup_failed.store(true, Ordering::Release);
    }

    pub fn backup_failed(&self) -> bool {
        self.backup_failed.load(Ordering::Acquire)
    }
}

/// When to start a backup attempt
#[derive(Debug, Clone, Copy)]
pub struct BackupPolicy {
    delay: Duration,
}

impl BackupPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Instant at which a primary attempt started at `started` becomes
    /// eligible for a backup
    pub fn due_at(&self, started: Instant) -> Instant {
        started + self.delay
    }

    pub fn should_spawn(
        &self,
        started: Instant,
        now: Instant,
        already_spawned: bool,
        has_alternate: bool,
    ) -> bool {
        !already_spawned && has_alternate && now >= self.due_at(started)
    }
}

/// Connect attempt against the alternate address of a pending primary
pub struct BackupConnectCommand {
    core: TaskCore,
    main: TaskId,
    info: Arc<BackupConnectInfo>,
    socket: Option<TcpStream>,
    check: SocketCheck,
    connect_timeout: Duration,
    deadline: Option<Instant>,
}

impl BackupConnectCommand {
    pub fn new(
        group: Option<GroupId>,
        main: TaskId,
        info: Arc<BackupConnectInfo>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            core: TaskCore::new(TaskKind::Connect, group),
            main,
            info,
            socket: None,
            check: SocketCheck::new(),
            connect_timeout,
            deadline: None,
        }
    }

    fn close_socket(&mut self, h: &mut SchedulerHandle) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = self.check.disable(h.io(), &mut socket) {
                tracing::debug!("{} deregister failed: {}", self.core.id(), e);
            }
        }
    }

    /// Failures of the backup are not reported to the group
    fn give_up(&mut self, h: &mut SchedulerHandle, reason: &str) -> Step {
        tracing::debug!(
            "{} backup connection to {} failed: {}",
            self.core.id(),
            self.info.alternate(),
            reason
        );
        self.close_socket(h);
        self.info.mark_backup_failed();
        h.wake_now(self.main);
        Step::Done
    }
}

impl Task for BackupConnectCommand {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn step(&mut self, h: &mut SchedulerHandle) -> Result<Step> {
        if self.info.is_cancelled() || h.should_stop(self.core.group()) {
            tracing::debug!("{} backup connection canceled", self.core.id());
            self.close_socket(h);
            return Ok(Step::Done);
        }

        let id = self.core.id();
        let now = h.now();

        if self.socket.is_none() {
            let addr = self.info.alternate();
            tracing::info!("{} trying backup connection to {}", id, addr);
            let mut socket = match h.dialer().dial(addr) {
                Ok(socket) => socket,
                Err(e) => return Ok(self.give_up(h, &e.to_string())),
            };
            if let Err(e) = self.check.set(h.io(), id, &mut socket, Interest::WRITABLE) {
                return Ok(self.give_up(h, &e.to_string()));
            }
            self.socket = Some(socket);
            let deadline = now + self.connect_timeout;
            self.deadline = Some(deadline);
            h.io().set_timer(id, deadline);
        }

        let progress = match &self.socket {
            Some(socket) => poll_established(socket),
            None => {
                return Err(EngineError::Internal(
                    "backup socket missing".to_string(),
                ))
            }
        };
        match progress {
            ConnectProgress::Established => {
                let Some(mut socket) = self.socket.take() else {
                    return Ok(Step::Done);
                };
                if let Err(e) = self.check.disable(h.io(), &mut socket) {
                    return Ok(self.give_up(h, &e.to_string()));
                }
                match self.info.install(socket) {
                    Ok(()) => {
                        tracing::info!(
                            "{} using backup connection to {}",
                            id,
                            self.info.alternate()
                        );
                        h.wake_now(self.main);
                    }
                    Err(_loser) => {
                        tracing::debug!("{} primary connected first, dropping backup", id);
                    }
                }
                Ok(Step::Done)
            }
            ConnectProgress::Failed(e) => Ok(self.give_up(h, &e.to_string())),
            ConnectProgress::Pending => {
                if self.deadline.map(|d| now >= d).unwrap_or(false) {
                    let err = EngineError::network(NetworkErrorKind::Timeout, "connect timed out");
                    return Ok(self.give_up(h, &err.to_string()));
                }
                Ok(Step::Continue)
            }
        }
    }
}
