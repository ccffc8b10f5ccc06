//! Cooperative tasks
//!
//! A task is a resumable unit of work stepped by the scheduler. Each step
//! does a bounded amount of non-blocking work and reports whether the task
//! is done or wants to be stepped again.

use super::SchedulerHandle;
use crate::error::Result;
use crate::protocol::GroupId;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique task identifier (the "CUID" in log lines)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocate the next task ID
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CUID#{}", self.0)
    }
}

/// Scheduling status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Stepped on every tick
    Active,
    /// Stepped on the next tick once, then back to its base status
    OneShotRealtime,
    /// Parked until a readiness event, a timer, a wake-up or a refresh pass
    Halted,
}

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The task is finished and is dropped
    Done,
    /// Re-queue at the back and wait for the next trigger
    Continue,
    /// Re-queue and run again on the next tick without blocking
    ContinueNow,
}

/// Closed set of task kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// Establish a TCP connection (primary or backup)
    Connect,
    /// Resolve a host name
    Resolve,
    /// Drive a TLS handshake
    Handshake,
    /// Protocol-specific work owned by a collaborator
    ProtocolStep,
}

/// State shared by every task implementation
#[derive(Debug, Clone)]
pub struct TaskCore {
    id: TaskId,
    kind: TaskKind,
    group: Option<GroupId>,
    status: TaskStatus,
    base_status: TaskStatus,
}

impl TaskCore {
    /// New tasks run once on the next tick, then park
    pub fn new(kind: TaskKind, group: Option<GroupId>) -> Self {
        Self {
            id: TaskId::next(),
            kind,
            group,
            status: TaskStatus::OneShotRealtime,
            base_status: TaskStatus::Halted,
        }
    }

    /// Set the initial status
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.set_status(status);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Change the status. `OneShotRealtime` is transient and keeps the base
    /// status it falls back to.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        if status != TaskStatus::OneShotRealtime {
            self.base_status = status;
        }
    }

    /// Request one more step on the next tick
    pub fn wake_now(&mut self) {
        self.status = TaskStatus::OneShotRealtime;
    }

    /// Called by the scheduler right before stepping
    pub(crate) fn transit(&mut self) {
        if self.status == TaskStatus::OneShotRealtime {
            self.status = self.base_status;
        }
    }
}

/// A cooperative task
pub trait Task {
    fn core(&self) -> &TaskCore;

    fn core_mut(&mut self) -> &mut TaskCore;

    /// Do a bounded amount of non-blocking work.
    ///
    /// An `Err` finishes the task; the error is reported to the owning
    /// group and never stops the scheduler.
    fn step(&mut self, h: &mut SchedulerHandle) -> Result<Step>;

    fn id(&self) -> TaskId {
        self.core().id()
    }

    fn kind(&self) -> TaskKind {
        self.core().kind()
    }

    fn group(&self) -> Option<GroupId> {
        self.core().group()
    }

    fn status(&self) -> TaskStatus {
        self.core().status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("CUID#"));
    }

    #[test]
    fn test_one_shot_falls_back_to_base_status() {
        let mut core = TaskCore::new(TaskKind::Connect, None);
        assert_eq!(core.status(), TaskStatus::OneShotRealtime);
        core.transit();
        assert_eq!(core.status(), TaskStatus::Halted);

        core.set_status(TaskStatus::Active);
        core.wake_now();
        assert_eq!(core.status(), TaskStatus::OneShotRealtime);
        core.transit();
        assert_eq!(core.status(), TaskStatus::Active);
    }

    #[test]
    fn test_with_status() {
        let core = TaskCore::new(TaskKind::ProtocolStep, None).with_status(TaskStatus::Active);
        assert_eq!(core.status(), TaskStatus::Active);
        let mut core = core;
        core.transit();
        assert_eq!(core.status(), TaskStatus::Active);
    }
}
