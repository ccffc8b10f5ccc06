//! Stand-alone name resolution
//!
//! [`ResolveCommand`] looks a host up without connecting to it. IP literals
//! and DNS cache hits complete on the first step; otherwise the lookup runs
//! on the resolver pool and the callback receives the addresses, or a
//! name-resolution error once the network timeout passes.

use super::{NameResolutionManager, ResolverStatus};
use crate::engine::{SchedulerHandle, Step, Task, TaskCore, TaskKind};
use crate::error::{EngineError, Result};
use crate::protocol::GroupId;
use std::net::IpAddr;
use std::time::Instant;

/// Receives the addresses (or the failure) and returns follow-up tasks
pub type ResolveCallback =
    Box<dyn FnOnce(Result<Vec<IpAddr>>, &mut SchedulerHandle) -> Result<Vec<Box<dyn Task>>>>;

/// Resolves a hostname without connecting, e.g. for UDP endpoints
pub struct ResolveCommand {
    core: TaskCore,
    hostname: String,
    port: u16,
    manager: NameResolutionManager,
    callback: Option<ResolveCallback>,
    deadline: Option<Instant>,
}

impl ResolveCommand {
    pub fn new(hostname: impl Into<String>, port: u16, group: Option<GroupId>, callback: ResolveCallback) -> Self {
        Self {
            core: TaskCore::new(TaskKind::Resolve, group),
            hostname: hostname.into(),
            port,
            manager: NameResolutionManager::new(),
            callback: Some(callback),
            deadline: None,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    fn complete(&mut self, h: &mut SchedulerHandle, outcome: Result<Vec<IpAddr>>) -> Result<Step> {
        h.io().clear_timers(self.core.id());
        let Some(callback) = self.callback.take() else {
            return Ok(Step::Done);
        };
        for task in callback(outcome, h)? {
            h.schedule(task);
        }
        Ok(Step::Done)
    }
}

impl Task for ResolveCommand {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TaskCore {
        &mut self.core
    }

    fn step(&mut self, h: &mut SchedulerHandle) -> Result<Step> {
        let id = self.core.id();
        if h.should_stop(self.core.group()) {
            h.io().clear_timers(id);
            return Ok(Step::Done);
        }
        let now = h.now();

        if let Ok(ip) = self.hostname.parse::<IpAddr>() {
            return self.complete(h, Ok(vec![ip]));
        }

        let deadline = match self.deadline {
            Some(deadline) => deadline,
            None => {
                let cached = h.dns_cache().find_all(&self.hostname, self.port, now);
                if !cached.is_empty() {
                    return self.complete(h, Ok(cached));
                }
                h.families().apply(&mut self.manager);
                self.manager.resolve(&self.hostname, h.resolver(), id);
                let deadline = now + h.config().network.timeout();
                self.deadline = Some(deadline);
                h.io().set_timer(id, deadline);
                deadline
            }
        };

        match self.manager.status() {
            ResolverStatus::InProgress if now >= deadline => {
                let err = EngineError::name_resolution(self.hostname.clone(), "timed out");
                tracing::warn!("{} {}", id, err);
                self.complete(h, Err(err))
            }
            ResolverStatus::InProgress => Ok(Step::Continue),
            ResolverStatus::Success => {
                let addrs = self.manager.resolved_addresses();
                tracing::info!("{} name resolution complete: {} -> {:?}", id, self.hostname, addrs);
                h.dns_cache().put_all(&self.hostname, &addrs, self.port);
                self.complete(h, Ok(addrs))
            }
            ResolverStatus::Error => {
                let err = EngineError::name_resolution(self.hostname.clone(), self.manager.last_error());
                tracing::warn!("{} {}", id, err);
                self.complete(h, Err(err))
            }
        }
    }
}
