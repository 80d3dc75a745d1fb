//! Tasks: independently progressing units of workflow execution.
//!
//! The main workflow body is the root task; `WorkflowCtx::spawn` creates
//! sub-tasks. Each task owns its nesting-prefix stack (the open step ids
//! that namespace its event ids) and consumes only its own records from
//! the shared window. Task ids are minted by the same counter mechanism as
//! step ids, so replay reconstructs the same task topology.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{WorkflowError, WorkflowFault, WorkflowResult};

/// Lifecycle of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Actively replaying or executing.
    Running,
    /// Unwound cleanly while waiting for data; resumable.
    Suspended,
    /// Finished with a value.
    Completed,
    /// Finished with a recorded fault.
    Errored,
    /// Torn down by its parent.
    Cancelled,
}

/// How a task ended, visible to its parent and the run loop.
#[derive(Debug, Clone)]
pub(crate) enum TaskTermination {
    Completed(Value),
    Suspended,
    Faulted(WorkflowFault),
    Cancelled,
    Fatal(String),
}

impl TaskTermination {
    pub(crate) fn status(&self) -> TaskStatus {
        match self {
            Self::Completed(_) => TaskStatus::Completed,
            Self::Suspended => TaskStatus::Suspended,
            Self::Faulted(_) | Self::Fatal(_) => TaskStatus::Errored,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// Per-task mutable state: the nesting prefix and the cancel flag.
#[derive(Debug)]
pub(crate) struct TaskState {
    pub(crate) id: String,
    prefix: Mutex<Vec<String>>,
    cancelled: AtomicBool,
}

impl TaskState {
    pub(crate) fn new(id: String) -> Self {
        Self {
            id,
            prefix: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Dot-join the task id, open step ids and `name` into a counter key.
    pub(crate) fn prefixed(&self, name: &str) -> String {
        let prefix = self.prefix.lock();
        let mut path = String::with_capacity(self.id.len() + name.len() + 1);
        path.push_str(&self.id);
        for segment in prefix.iter() {
            path.push('.');
            path.push_str(segment);
        }
        path.push('.');
        path.push_str(name);
        path
    }

    pub(crate) fn push_prefix(&self, event_id: &str) {
        // The prefix carries the full event id so sibling invocations of
        // the same step namespace their children differently.
        let segment = event_id
            .rsplit_once('.')
            .map_or(event_id, |(_, tail)| tail)
            .to_string();
        self.prefix.lock().push(segment);
    }

    pub(crate) fn pop_prefix(&self) {
        self.prefix.lock().pop();
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Registry entry for one task within a run.
pub(crate) struct TaskEntry {
    pub(crate) state: Arc<TaskState>,
    pub(crate) term: Arc<watch::Sender<Option<TaskTermination>>>,
    pub(crate) abort: Mutex<Option<tokio::task::AbortHandle>>,
}

impl TaskEntry {
    /// Record a termination unless a final one is already in place.
    /// Cancellation overrides a suspension: a cancelled task will not be
    /// resumed.
    pub(crate) fn finish(&self, termination: TaskTermination) {
        self.term.send_if_modified(|current| match current {
            None => {
                *current = Some(termination);
                true
            }
            Some(TaskTermination::Suspended)
                if matches!(termination, TaskTermination::Cancelled) =>
            {
                *current = Some(termination);
                true
            }
            Some(_) => false,
        });
    }
}

impl std::fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEntry")
            .field("id", &self.state.id)
            .finish()
    }
}

/// Handle to a spawned sub-task.
///
/// Joining does not need the context: the result is reconstructed
/// deterministically by the child's own replay.
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) task_id: String,
    pub(crate) term_rx: watch::Receiver<Option<TaskTermination>>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl TaskHandle {
    /// Id of the spawned task.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the task to finish and return its value.
    ///
    /// A suspended child suspends the joiner too; a faulted child re-raises
    /// its fault here; a cancelled child joins as a `task_cancelled` fault.
    ///
    /// # Errors
    ///
    /// Propagates the child's suspension, fault, or fatal engine error.
    pub async fn join(&self) -> WorkflowResult<Value> {
        let mut rx = self.term_rx.clone();
        let vanished = || {
            WorkflowError::Fatal(crate::error::HistorianError::Corrupt(format!(
                "task '{}' vanished without terminating",
                self.task_id
            )))
        };
        let termination = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| vanished())?
            .clone()
            .ok_or_else(vanished)?;

        match termination {
            TaskTermination::Completed(value) => Ok(value),
            TaskTermination::Suspended => Err(WorkflowError::Suspended),
            TaskTermination::Faulted(fault) => Err(WorkflowError::Fault(fault)),
            TaskTermination::Cancelled => Err(WorkflowError::Fault(WorkflowFault::new(
                "task_cancelled",
                format!("task '{}' was cancelled", self.task_id),
            ))),
            TaskTermination::Fatal(message) => Err(WorkflowError::Fatal(
                crate::error::HistorianError::Divergence(message),
            )),
        }
    }
}
