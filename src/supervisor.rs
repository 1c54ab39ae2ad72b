//! Restart bookkeeping for supervised tasks.
//!
//! Every long-running task (stream reader, sinks, aggregation sources) is
//! wrapped in a restart loop. [`Supervisor`] is the per-task state behind
//! that loop: the current lifecycle state, the consecutive-failure count,
//! and the restart metric. Tasks without a failure limit restart forever;
//! a task constructed with a limit goes [`TaskState::Failed`] once the limit
//! is hit without an intervening success, and its supervisor treats that as
//! fatal.

use metrics::counter;

use crate::metrics::TASK_RESTARTS_TOTAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    /// Between a failed run and its restart.
    Backoff,
    /// Terminal: the consecutive-failure limit was exceeded.
    Failed,
    Stopped,
}

#[derive(Debug)]
pub struct Supervisor {
    component: &'static str,
    state: TaskState,
    consecutive_failures: u32,
    failure_limit: Option<u32>,
}

impl Supervisor {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            state: TaskState::Running,
            consecutive_failures: 0,
            failure_limit: None,
        }
    }

    /// Like [`Supervisor::new`], but the task becomes [`TaskState::Failed`]
    /// after `limit` consecutive failed runs.
    pub fn with_failure_limit(component: &'static str, limit: u32) -> Self {
        Self {
            failure_limit: Some(limit),
            ..Self::new(component)
        }
    }

    /// Record a finished run that will be restarted, counting it toward the
    /// restart metric. A failed run bumps the consecutive-failure count.
    pub fn task_restarted(&mut self, failed: bool) -> TaskState {
        counter!(TASK_RESTARTS_TOTAL, "component" => self.component).increment(1);
        if failed {
            self.consecutive_failures += 1;
            self.state = match self.failure_limit {
                Some(limit) if self.consecutive_failures >= limit => TaskState::Failed,
                _ => TaskState::Backoff,
            };
        } else {
            self.consecutive_failures = 0;
            self.state = TaskState::Running;
        }
        self.state
    }

    /// Record a successful unit of work without a restart.
    pub fn task_succeeded(&mut self) {
        self.consecutive_failures = 0;
        self.state = TaskState::Running;
    }

    pub fn stop(&mut self) {
        self.state = TaskState::Stopped;
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn component(&self) -> &'static str {
        self.component
    }
}
