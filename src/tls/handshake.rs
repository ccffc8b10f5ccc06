//! Client TLS handshake task
//!
//! Steps a [`TlsSession`] until the handshake completes, waiting on the
//! readiness direction the session asks for. Failures and the handshake
//! timeout are handed to the connection consumer; stalled or dropped
//! handshakes also mark the server as failing in the server statistics.

use super::{HandshakeStatus, TlsSession};
use crate::engine::{SchedulerHandle, SocketCheck, Step, Task, TaskCore, TaskKind};
use crate::error::{EngineError, NetworkErrorKind, Result, TlsErrorKind};
use crate::net::{ConnectTarget, Connection, ConnectionConsumer, Transport};
use crate::protocol::GroupId;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Drives a client TLS handshake on a freshly connected socket, then hands
/// the session to the connection consumer
pub struct TlsHandshakeCommand {
    core: TaskCore,
    session: Option<TlsSession>,
    target: ConnectTarget,
    peer: SocketAddr,
    via_backup: bool,
    consumer: Option<Box<dyn ConnectionConsumer>>,
    check: SocketCheck,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl TlsHandshakeCommand {
    pub fn new(
        group: Option<GroupId>,
        session: TlsSession,
        target: ConnectTarget,
        peer: SocketAddr,
        via_backup: bool,
        consumer: Box<dyn ConnectionConsumer>,
        timeout: Duration,
    ) -> Self {
        Self {
            core: TaskCore::new(TaskKind::Handshake, group),
            session: Some(session),
            target,
            peer,
            via_backup,
            consumer: Some(consumer),
            check: SocketCheck::new(),
            timeout,
            deadline: None,
        }
    }

    fn release(&mut self, h: &mut SchedulerHandle) -> Option<TlsSession> {
        let mut session = self.session.take()?;
        if let Err(e) = self.check.disable(h.io(), session.socket_mut()) {
            tracing::debug!("{} deregister failed: {}", self.core.id(), e);
        }
        h.io().clear_timers(self.core.id());
        Some(session)
    }

    fn fail(&mut self, h: &mut SchedulerHandle, err: EngineError) -> Result<Step> {
        drop(self.release(h));
        tracing::warn!(
            "{} TLS handshake with {} ({}) failed: {}",
            self.core.id(),
            self.target.host,
            self.peer,
            err
        );
        if let Some(gid) = self.core.group() {
            h.groups_mut()
                .record_uri_result(gid, &self.target.uri, err.result_code());
        }
        // a peer that stalls or drops the handshake counts against the server
        if matches!(
            err,
            EngineError::Network { .. }
                | EngineError::Tls {
                    kind: TlsErrorKind::Io,
                    ..
                }
        ) {
            h.groups_mut()
                .server_stats_mut()
                .get_or_create(&self.target.host, &self.target.protocol)
                .set_error();
        }
        match self.consumer.take() {
            Some(consumer) => {
                for task in consumer.on_failed(Some(self.target.clone()), err, h)? {
                    h.schedule(task);
                }
                Ok(Step::Done)
            }
            None => Err(err),
        }
    }
}

impl Task for TlsHandshakeCommand {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn step(&mut self, h: &mut SchedulerHandle) -> Result<Step> {
        let id = self.core.id();
        if h.should_stop(self.core.group()) {
            drop(self.release(h));
            return Ok(Step::Done);
        }

        let now = h.now();
        let deadline = match self.deadline {
            Some(deadline) => deadline,
            None => {
                let deadline = now + self.timeout;
                self.deadline = Some(deadline);
                h.io().set_timer(id, deadline);
                deadline
            }
        };

        let Some(session) = self.session.as_mut() else {
            return Err(EngineError::Internal("TLS session missing".to_string()));
        };
        match session.handshake() {
            Ok(HandshakeStatus::WouldBlock(want)) => {
                if now >= deadline {
                    let err = EngineError::network(NetworkErrorKind::Timeout, "TLS handshake timed out");
                    return self.fail(h, err);
                }
                if let Err(e) = self.check.set(h.io(), id, session.socket_mut(), want.interest()) {
                    return self.fail(h, e.into());
                }
                Ok(Step::Continue)
            }
            Ok(HandshakeStatus::Complete(version)) => {
                tracing::info!(
                    "{} TLS handshake with {} complete ({})",
                    id,
                    self.target.host,
                    version
                );
                let session = self
                    .release(h)
                    .ok_or_else(|| EngineError::Internal("TLS session missing".to_string()))?;
                let consumer = self
                    .consumer
                    .take()
                    .ok_or_else(|| EngineError::Internal("connection consumer missing".to_string()))?;
                let conn = Connection {
                    transport: Transport::Tls(Box::new(session)),
                    target: self.target.clone(),
                    peer: self.peer,
                    via_backup: self.via_backup,
                };
                for task in consumer.on_connected(conn, h)? {
                    h.schedule(task);
                }
                Ok(Step::Done)
            }
            Err(err) => self.fail(h, err),
        }
    }
}
