//! Context passed to every task step
//!
//! The handle owns everything a task may touch besides its own state: the
//! readiness registry, the group manager, the DNS cache, the resolver pool
//! and the shared configuration. Tasks never hold a reference to the engine
//! itself.

use super::{IoRegistry, Readiness, Task, TaskId};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::group::GroupManager;
use crate::net::{AddressFamilies, Dialer};
use crate::protocol::GroupId;
use crate::resolver::{DnsCache, ResolverPool};
use crate::tls::TlsContext;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

pub struct SchedulerHandle {
    pub(crate) io: IoRegistry,
    pub(crate) groups: GroupManager,
    dns_cache: DnsCache,
    resolver: ResolverPool,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    dialer: Arc<dyn Dialer>,
    families: AddressFamilies,
    tls_client: Option<Arc<TlsContext>>,
    pub(crate) pending: Vec<Box<dyn Task>>,
    pub(crate) woken: HashSet<TaskId>,
    pub(crate) no_wait: bool,
    pub(crate) halt_requested: bool,
}

impl SchedulerHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        io: IoRegistry,
        groups: GroupManager,
        resolver: ResolverPool,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
        dialer: Arc<dyn Dialer>,
        families: AddressFamilies,
        tls_client: Option<Arc<TlsContext>>,
    ) -> Self {
        Self {
            io,
            groups,
            dns_cache: DnsCache::new(),
            resolver,
            config,
            clock,
            dialer,
            families,
            tls_client,
            pending: Vec::new(),
            woken: HashSet::new(),
            no_wait: false,
            halt_requested: false,
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn io(&mut self) -> &mut IoRegistry {
        &mut self.io
    }

    pub fn readiness(&self, task: TaskId) -> Readiness {
        self.io.readiness(task)
    }

    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut GroupManager {
        &mut self.groups
    }

    pub fn dns_cache(&mut self) -> &mut DnsCache {
        &mut self.dns_cache
    }

    pub fn resolver(&self) -> &ResolverPool {
        &self.resolver
    }

    pub fn families(&self) -> AddressFamilies {
        self.families
    }

    pub fn dialer(&self) -> &dyn Dialer {
        self.dialer.as_ref()
    }

    /// Client TLS context, built from the TLS options on first use
    pub fn tls_context(&mut self) -> Result<Arc<TlsContext>> {
        if let Some(ctx) = &self.tls_client {
            return Ok(Arc::clone(ctx));
        }
        let ctx = Arc::new(TlsContext::client(&self.config.tls)?);
        self.tls_client = Some(Arc::clone(&ctx));
        Ok(ctx)
    }

    pub fn set_tls_context(&mut self, ctx: Arc<TlsContext>) {
        self.tls_client = Some(ctx);
    }

    /// Queue a task for the next pass. A task that belongs to a group is
    /// counted against it until it finishes.
    pub fn schedule(&mut self, task: Box<dyn Task>) {
        if let Some(gid) = task.group() {
            self.groups.increase_num_command(gid);
        }
        tracing::trace!("{} scheduled ({:?})", task.id(), task.kind());
        self.pending.push(task);
    }

    /// Step `task` on the next pass regardless of its status
    pub fn wake(&mut self, task: TaskId) {
        self.woken.insert(task);
    }

    /// Like [`wake`](Self::wake), and skip the next readiness wait
    pub fn wake_now(&mut self, task: TaskId) {
        self.woken.insert(task);
        self.no_wait = true;
    }

    /// Make the next readiness wait return immediately
    pub fn set_no_wait(&mut self) {
        self.no_wait = true;
    }

    pub fn no_wait(&self) -> bool {
        self.no_wait
    }

    pub fn is_halt_requested(&self) -> bool {
        self.halt_requested
    }

    /// Whether a task owned by `group` must wind down. Tasks without a
    /// group follow the engine halt flag.
    pub fn should_stop(&self, group: Option<GroupId>) -> bool {
        match group {
            Some(gid) => self.groups.should_stop(gid),
            None => self.halt_requested,
        }
    }

    /// Activate waiting groups; their initial tasks join the next pass.
    /// Returns how many tasks were created.
    pub fn fill_from_waiting_queue(&mut self) -> usize {
        let tasks = self.groups.fill_from_waiting_queue();
        let n = tasks.len();
        // already counted by the group manager
        self.pending.extend(tasks);
        n
    }

    /// Finalize stopped groups and refill freed slots. Returns how many
    /// groups were removed.
    pub fn remove_stopped_groups(&mut self) -> usize {
        let removed = self.groups.remove_stopped_groups();
        if removed > 0 {
            self.fill_from_waiting_queue();
        }
        removed
    }

    /// Bookkeeping for a task that will not be stepped again
    pub(crate) fn task_finished(&mut self, task: &dyn Task) {
        let id = task.id();
        self.io.release_task(id);
        self.woken.remove(&id);
        if let Some(gid) = task.group() {
            self.groups.decrease_num_command(gid);
        }
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("pending", &self.pending.len())
            .field("woken", &self.woken.len())
            .field("no_wait", &self.no_wait)
            .field("halt_requested", &self.halt_requested)
            .field("families", &self.families)
            .finish()
    }
}
