//! Download Engine - the cooperative scheduler
//!
//! The engine owns the readiness multiplexer and two queues: ordinary tasks
//! and routine tasks that run on every pass. One call to
//! [`DownloadEngine::run_once`] is one tick:
//!
//! 1. step every task that is due (all of them on a refresh pass),
//! 2. step every routine task,
//! 3. finalize stopped groups and admit waiting ones,
//! 4. wait for readiness, bounded by the nearest timer.
//!
//! Everything runs on the calling thread. Blocking name lookups are pushed
//! to helper threads that wake the multiplexer when they finish.

mod handle;
mod io;
mod task;

pub use handle::SchedulerHandle;
pub use io::{IoRegistry, Readiness, ResolverNotifier, SocketCheck};
pub use task::{Step, Task, TaskCore, TaskId, TaskKind, TaskStatus};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::group::{DownloadGroup, GroupManager};
use crate::net::{AddressFamilies, Dialer, TcpDialer};
use crate::protocol::GroupId;
use crate::resolver::{Resolve, ResolverPool, SystemResolver};
use crate::tls::TlsContext;
use io::WAKER_TOKEN;
use mio::{Events, Poll, Waker};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Capacity of the multiplexer event buffer
const EVENT_CAPACITY: usize = 1024;

/// Builder for [`DownloadEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    dialer: Option<Arc<dyn Dialer>>,
    resolver: Option<Arc<dyn Resolve>>,
    families: Option<AddressFamilies>,
    tls_context: Option<Arc<TlsContext>>,
}

impl EngineBuilder {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            clock: None,
            dialer: None,
            resolver: None,
            families: None,
            tls_context: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Backend used by the helper threads for blocking lookups
    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Override the probed address families
    pub fn families(mut self, families: AddressFamilies) -> Self {
        self.families = Some(families);
        self
    }

    /// Client TLS context to use instead of one built from the TLS options
    pub fn tls_context(mut self, ctx: Arc<TlsContext>) -> Self {
        self.tls_context = Some(ctx);
        self
    }

    pub fn build(self) -> Result<DownloadEngine> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let poll = Poll::new().map_err(|e| EngineError::Internal(format!("create poll: {}", e)))?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|e| EngineError::Internal(format!("create waker: {}", e)))?;
        let notifier = ResolverNotifier::new(Arc::new(waker));
        let registry = poll
            .registry()
            .try_clone()
            .map_err(|e| EngineError::Internal(format!("clone registry: {}", e)))?;
        let io = IoRegistry::new(registry, notifier.clone());

        let backend = self.resolver.unwrap_or_else(|| Arc::new(SystemResolver));
        let resolver = ResolverPool::new(backend, config.network.async_dns_threads, notifier)?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let dialer = self.dialer.unwrap_or_else(|| Arc::new(TcpDialer));
        let families = self
            .families
            .unwrap_or_else(|| AddressFamilies::probe(&config.network));

        let groups = GroupManager::new(Arc::clone(&config), Arc::clone(&clock));
        let handle = SchedulerHandle::new(
            io,
            groups,
            resolver,
            Arc::clone(&config),
            Arc::clone(&clock),
            dialer,
            families,
            self.tls_context,
        );

        let now = clock.now();
        tracing::info!(
            "Engine ready: max_concurrent_downloads={} refresh_interval={:?}",
            config.max_concurrent_downloads,
            config.refresh_interval()
        );

        Ok(DownloadEngine {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            queue: VecDeque::new(),
            routine: VecDeque::new(),
            refresh_interval: config.refresh_interval(),
            last_refresh: now,
            handle,
        })
    }
}

/// The main download engine
pub struct DownloadEngine {
    poll: Poll,
    events: Events,
    queue: VecDeque<Box<dyn Task>>,
    routine: VecDeque<Box<dyn Task>>,
    refresh_interval: Duration,
    last_refresh: Instant,
    handle: SchedulerHandle,
}

impl DownloadEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Engine with the system clock, dialer and resolver
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Queue a group for admission and return its id
    pub fn add_group(&mut self, group: DownloadGroup) -> GroupId {
        self.handle.groups.add_waiting(group)
    }

    /// Add a task outside of any step
    pub fn schedule(&mut self, task: Box<dyn Task>) {
        self.handle.schedule(task);
    }

    /// Add a task that is stepped on every pass
    pub fn add_routine(&mut self, task: Box<dyn Task>) {
        self.routine.push_back(task);
    }

    pub fn set_no_wait(&mut self) {
        self.handle.set_no_wait();
    }

    pub fn set_refresh_interval(&mut self, interval: Duration) {
        self.refresh_interval = interval;
    }

    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut SchedulerHandle {
        &mut self.handle
    }

    pub fn groups(&self) -> &GroupManager {
        &self.handle.groups
    }

    pub fn groups_mut(&mut self) -> &mut GroupManager {
        &mut self.handle.groups
    }

    /// Tasks in the ordinary queue, including ones scheduled but not yet
    /// stepped
    pub fn num_tasks(&self) -> usize {
        self.queue.len() + self.handle.pending.len()
    }

    /// Ask every group to stop gracefully
    pub fn request_halt(&mut self) {
        tracing::info!("Halt requested");
        self.handle.groups.halt();
        self.halt_common();
    }

    /// Stop every group without waiting for graceful shutdown steps
    pub fn force_halt(&mut self) {
        tracing::info!("Forced halt requested");
        self.handle.groups.force_halt();
        self.halt_common();
    }

    fn halt_common(&mut self) {
        self.handle.halt_requested = true;
        self.handle.no_wait = true;
        // next tick steps every task so each one observes the halt
        self.refresh_interval = Duration::ZERO;
    }

    /// Run until no task is left and every group has been finalized
    pub fn run(&mut self) -> Result<()> {
        self.handle.fill_from_waiting_queue();
        self.absorb_pending();
        while self.has_work() {
            self.run_once()?;
        }
        tracing::info!("Engine finished");
        Ok(())
    }

    /// Whether another tick would do anything
    pub fn has_work(&self) -> bool {
        !self.queue.is_empty()
            || !self.routine.is_empty()
            || !self.handle.pending.is_empty()
            || !self.handle.groups.downloads_finished()
    }

    /// Run a single tick
    pub fn run_once(&mut self) -> Result<()> {
        self.absorb_pending();

        let now = self.handle.now();
        let refresh_all = now.saturating_duration_since(self.last_refresh) >= self.refresh_interval;
        if refresh_all {
            self.refresh_interval = self.handle.config().refresh_interval();
            self.last_refresh = now;
        }

        let due = self.handle.io.take_due_timers(now);
        execute(&mut self.queue, &mut self.handle, refresh_all, &due);
        execute(&mut self.routine, &mut self.handle, true, &due);

        self.after_each_iteration();
        self.handle.io.clear_events();

        if !self.queue.is_empty() || !self.handle.groups.downloads_finished() {
            self.wait_for_events()?;
        }
        self.handle.no_wait = false;
        Ok(())
    }

    fn after_each_iteration(&mut self) {
        self.handle.remove_stopped_groups();
        // dependency-blocked groups get another chance every tick
        self.handle.fill_from_waiting_queue();
        self.absorb_pending();
    }

    fn absorb_pending(&mut self) {
        self.queue.extend(self.handle.pending.drain(..));
    }

    fn wait_timeout(&self) -> Duration {
        if self.handle.no_wait {
            return Duration::ZERO;
        }
        let now = self.handle.now();
        let refresh_at = self.last_refresh + self.refresh_interval;
        let mut timeout = refresh_at.saturating_duration_since(now);
        if let Some(deadline) = self.handle.io.next_deadline() {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
        timeout
    }

    fn wait_for_events(&mut self) -> Result<()> {
        let timeout = self.wait_timeout();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(EngineError::Internal(format!("poll: {}", e))),
        }
        self.handle.io.dispatch(&self.events);
        Ok(())
    }
}

impl std::fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("queue", &self.queue.len())
            .field("routine", &self.routine.len())
            .field("refresh_interval", &self.refresh_interval)
            .field("handle", &self.handle)
            .finish()
    }
}

/// Step the tasks currently in `queue` once each, in order.
///
/// Tasks are popped from the front and pushed to the back, so tasks
/// scheduled during this pass are not stepped until the next one.
fn execute(
    queue: &mut VecDeque<Box<dyn Task>>,
    handle: &mut SchedulerHandle,
    all: bool,
    due: &HashSet<TaskId>,
) {
    let n = queue.len();
    for _ in 0..n {
        let Some(mut task) = queue.pop_front() else {
            break;
        };
        let id = task.id();
        let ready = all
            || matches!(
                task.status(),
                TaskStatus::Active | TaskStatus::OneShotRealtime
            )
            || handle.woken.contains(&id)
            || due.contains(&id)
            || handle.io.has_event(id);
        if !ready {
            queue.push_back(task);
            continue;
        }

        handle.woken.remove(&id);
        task.core_mut().transit();
        match task.step(handle) {
            Ok(Step::Done) => {
                tracing::trace!("{} done", id);
                handle.task_finished(task.as_ref());
            }
            Ok(Step::Continue) => queue.push_back(task),
            Ok(Step::ContinueNow) => {
                task.core_mut().wake_now();
                handle.no_wait = true;
                queue.push_back(task);
            }
            Err(e) => {
                match task.group() {
                    Some(gid) => {
                        tracing::error!("{} GID#{} failed: {}", id, gid, e);
                        handle.groups.on_task_error(gid, &e);
                    }
                    None => tracing::error!("{} failed: {}", id, e),
                }
                handle.task_finished(task.as_ref());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::group::{GroupContext, GroupDriver};

    struct CountingTask {
        core: TaskCore,
        steps: usize,
        limit: usize,
    }

    impl CountingTask {
        fn new(group: Option<GroupId>, limit: usize) -> Self {
            Self {
                core: TaskCore::new(TaskKind::ProtocolStep, group).with_status(TaskStatus::Active),
                steps: 0,
                limit,
            }
        }
    }

    impl Task for CountingTask {
        fn core(&self) -> &TaskCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut TaskCore {
            &mut self.core
        }

        fn step(&mut self, _h: &mut SchedulerHandle) -> Result<Step> {
            self.steps += 1;
            if self.steps >= self.limit {
                Ok(Step::Done)
            } else {
                Ok(Step::Continue)
            }
        }
    }

    struct FailingTask {
        core: TaskCore,
    }

    impl Task for FailingTask {
        fn core(&self) -> &TaskCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut TaskCore {
            &mut self.core
        }

        fn step(&mut self, _h: &mut SchedulerHandle) -> Result<Step> {
            Err(EngineError::Internal("boom".to_string()))
        }
    }

    struct OneTask {
        limit: usize,
    }

    impl GroupDriver for OneTask {
        fn create_initial_tasks(&mut self, ctx: &GroupContext) -> Result<Vec<Box<dyn Task>>> {
            Ok(vec![Box::new(CountingTask::new(Some(ctx.gid), self.limit))])
        }
    }

    fn engine() -> DownloadEngine {
        DownloadEngine::builder(EngineConfig::default().refresh_interval_ms(10))
            .clock(Arc::new(ManualClock::new()))
            .families(AddressFamilies::all())
            .build()
            .unwrap()
    }

    #[test]
    fn test_active_tasks_step_until_done() {
        let mut engine = engine();
        engine.schedule(Box::new(CountingTask::new(None, 3)));
        engine.set_no_wait();
        engine.run().unwrap();
        assert_eq!(engine.num_tasks(), 0);
    }

    #[test]
    fn test_halted_task_is_left_alone_until_refresh() {
        let mut engine = engine();
        let mut task = CountingTask::new(None, 1);
        task.core.set_status(TaskStatus::Halted);
        engine.schedule(Box::new(task));

        engine.set_refresh_interval(Duration::from_secs(3600));
        engine.set_no_wait();
        engine.run_once().unwrap();
        assert_eq!(engine.num_tasks(), 1);
    }

    #[test]
    fn test_task_error_does_not_stop_the_loop() {
        let mut engine = engine();
        let core = TaskCore::new(TaskKind::ProtocolStep, None);
        engine.schedule(Box::new(FailingTask { core }));
        engine.schedule(Box::new(CountingTask::new(None, 2)));
        engine.set_no_wait();
        engine.run().unwrap();
        assert_eq!(engine.num_tasks(), 0);
    }

    #[test]
    fn test_group_finishes_when_its_tasks_are_done() {
        let mut engine = engine();
        let config = Arc::new(EngineConfig::default());
        let gid = engine.add_group(DownloadGroup::new(
            config,
            vec!["http://example.com/a".to_string()],
            Box::new(OneTask { limit: 2 }),
        ));
        engine.set_no_wait();
        engine.run().unwrap();

        let results = engine.groups().results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].gid, gid);
        assert!(!engine.groups().is_active(gid));
    }

    #[test]
    fn test_halt_steps_every_task() {
        let mut engine = engine();
        engine.set_refresh_interval(Duration::from_secs(3600));
        let mut task = CountingTask::new(None, 1);
        task.core.set_status(TaskStatus::Halted);
        engine.schedule(Box::new(task));
        engine.set_no_wait();
        engine.run_once().unwrap();
        engine.request_halt();
        engine.run_once().unwrap();
        assert_eq!(engine.num_tasks(), 0);
        assert!(engine.handle().is_halt_requested());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let result = DownloadEngine::builder(EngineConfig::default().max_concurrent_downloads(0)).build();
        assert!(result.is_err());
    }
}
