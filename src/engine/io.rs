//! Readiness bookkeeping for the scheduler
//!
//! Sockets are registered with the multiplexer on behalf of a task; every
//! token maps back to the task that owns it. Timers and helper-thread
//! completions are folded into the same per-task [`Readiness`] so a task
//! only has to ask one question when it is stepped.

use super::TaskId;
use mio::event::{Event, Source};
use mio::{Events, Interest, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Instant;

/// Token reserved for the cross-thread waker
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// What happened to a task since its last step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub closed: bool,
    /// A name resolution started by this task has concluded
    pub resolved: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn merge(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.error |= other.error;
        self.closed |= other.closed;
        self.resolved |= other.resolved;
    }

    fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            closed: event.is_read_closed() || event.is_write_closed(),
            resolved: false,
        }
    }
}

/// Cross-thread completion channel for helper threads
///
/// Helper threads push the waiting task and wake the multiplexer.
#[derive(Debug, Clone)]
pub struct ResolverNotifier {
    completed: Arc<Mutex<Vec<TaskId>>>,
    waker: Option<Arc<Waker>>,
}

impl ResolverNotifier {
    pub(crate) fn new(waker: Arc<Waker>) -> Self {
        Self {
            completed: Arc::new(Mutex::new(Vec::new())),
            waker: Some(waker),
        }
    }

    /// Notifier that records completions without waking anything
    pub fn detached() -> Self {
        Self {
            completed: Arc::new(Mutex::new(Vec::new())),
            waker: None,
        }
    }

    pub fn notify(&self, task: TaskId) {
        self.completed.lock().push(task);
        if let Some(waker) = &self.waker {
            if let Err(e) = waker.wake() {
                tracing::warn!("Failed to wake the event loop for {}: {}", task, e);
            }
        }
    }

    pub(crate) fn drain(&self) -> Vec<TaskId> {
        std::mem::take(&mut *self.completed.lock())
    }
}

/// Socket, timer and completion registry
#[derive(Debug)]
pub struct IoRegistry {
    registry: Registry,
    next_token: usize,
    owners: HashMap<Token, TaskId>,
    by_task: HashMap<TaskId, Vec<Token>>,
    timers: BTreeSet<(Instant, TaskId)>,
    events: HashMap<TaskId, Readiness>,
    notifier: ResolverNotifier,
}

impl IoRegistry {
    pub(crate) fn new(registry: Registry, notifier: ResolverNotifier) -> Self {
        Self {
            registry,
            next_token: WAKER_TOKEN.0 + 1,
            owners: HashMap::new(),
            by_task: HashMap::new(),
            timers: BTreeSet::new(),
            events: HashMap::new(),
            notifier,
        }
    }

    /// Register `source` for `task` and return its token
    pub fn register<S: Source + ?Sized>(
        &mut self,
        task: TaskId,
        source: &mut S,
        interest: Interest,
    ) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.registry.register(source, token, interest)?;
        self.owners.insert(token, task);
        self.by_task.entry(task).or_default().push(token);
        Ok(token)
    }

    /// Change the interest of an already registered source
    pub fn reregister<S: Source + ?Sized>(
        &mut self,
        token: Token,
        source: &mut S,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(source, token, interest)
    }

    /// Remove `source` from the multiplexer. Must be called before a socket
    /// is handed to another task.
    pub fn deregister<S: Source + ?Sized>(&mut self, token: Token, source: &mut S) -> io::Result<()> {
        if let Some(task) = self.owners.remove(&token) {
            if let Some(tokens) = self.by_task.get_mut(&task) {
                tokens.retain(|t| *t != token);
            }
        }
        self.registry.deregister(source)
    }

    /// Wake `task` at `at` even without readiness
    pub fn set_timer(&mut self, task: TaskId, at: Instant) {
        self.timers.insert((at, task));
    }

    /// Drop every pending timer of `task`
    pub fn clear_timers(&mut self, task: TaskId) {
        self.timers.retain(|(_, t)| *t != task);
    }

    pub fn notifier(&self) -> &ResolverNotifier {
        &self.notifier
    }

    /// Readiness collected for `task` in the current tick
    pub fn readiness(&self, task: TaskId) -> Readiness {
        self.events.get(&task).copied().unwrap_or_default()
    }

    pub(crate) fn has_event(&self, task: TaskId) -> bool {
        self.events.contains_key(&task)
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.first().map(|(at, _)| *at)
    }

    /// Fold multiplexer events into per-task readiness
    pub(crate) fn dispatch(&mut self, events: &Events) {
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            if let Some(task) = self.owners.get(&event.token()) {
                self.events
                    .entry(*task)
                    .or_default()
                    .merge(Readiness::from_event(event));
            }
        }
        // completions may arrive without a wake-up being observed yet
        for task in self.notifier.drain() {
            self.events.entry(task).or_default().resolved = true;
        }
    }

    /// Pop every timer due at `now`
    pub(crate) fn take_due_timers(&mut self, now: Instant) -> HashSet<TaskId> {
        let mut due = HashSet::new();
        while let Some(&(at, task)) = self.timers.first() {
            if at > now {
                break;
            }
            self.timers.remove(&(at, task));
            due.insert(task);
        }
        due
    }

    pub(crate) fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Forget every token, timer and event of a finished task
    pub(crate) fn release_task(&mut self, task: TaskId) {
        if let Some(tokens) = self.by_task.remove(&task) {
            for token in tokens {
                self.owners.remove(&token);
            }
        }
        self.clear_timers(task);
        self.events.remove(&task);
    }

    pub fn registered_count(&self) -> usize {
        self.owners.len()
    }
}

/// Current registration of one socket
///
/// Registers on first use, re-registers when the interest changes and is
/// a no-op when it does not.
#[derive(Debug, Default)]
pub struct SocketCheck {
    token: Option<Token>,
    interest: Option<Interest>,
}

impl SocketCheck {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<S: Source + ?Sized>(
        &mut self,
        io: &mut IoRegistry,
        task: TaskId,
        source: &mut S,
        interest: Interest,
    ) -> io::Result<()> {
        match self.token {
            Some(_) if self.interest == Some(interest) => Ok(()),
            Some(token) => {
                io.reregister(token, source, interest)?;
                self.interest = Some(interest);
                Ok(())
            }
            None => {
                let token = io.register(task, source, interest)?;
                self.token = Some(token);
                self.interest = Some(interest);
                Ok(())
            }
        }
    }

    pub fn disable<S: Source + ?Sized>(&mut self, io: &mut IoRegistry, source: &mut S) -> io::Result<()> {
        self.interest = None;
        match self.token.take() {
            Some(token) => io.deregister(token, source),
            None => Ok(()),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.token.is_some()
    }
}
