//! Replay gate: ordered consumption of the recorded window.
//!
//! At the start of a run the history log is frozen into a window. Tasks
//! run concurrently, but each may only consume the record at the head of
//! the window, and only when that record carries its own task id — so
//! tasks advance in exactly the relative order they did on the original
//! run. External records at the head are applied to the resource table by
//! whichever puller reaches them. Once the window is exhausted every task
//! switches to live execution and appends new records instead.
//!
//! Ghost tasks are record streams whose owning task will never run this
//! time (they were spawned inside a step that is being skipped wholesale);
//! their records are drained passively so the window can finish.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{HistorianError, WorkflowError, WorkflowResult};
use crate::record::{HistoryRecord, EXTERNAL_TASK};
use crate::resource::ResourceHub;

struct Cursor {
    pos: usize,
    ghosts: HashSet<String>,
}

/// Gate over one run's frozen replay window.
pub(crate) struct ReplayGate {
    window: Vec<HistoryRecord>,
    cursor: Mutex<Cursor>,
    bump: watch::Sender<u64>,
    drained: watch::Sender<bool>,
    halted: AtomicBool,
    hub: Arc<ResourceHub>,
}

impl ReplayGate {
    pub(crate) fn new(window: Vec<HistoryRecord>, hub: Arc<ResourceHub>) -> Self {
        let empty = window.is_empty();
        let (bump, _) = watch::channel(0);
        let (drained, _) = watch::channel(empty);
        Self {
            window,
            cursor: Mutex::new(Cursor {
                pos: 0,
                ghosts: HashSet::new(),
            }),
            bump,
            drained,
            halted: AtomicBool::new(false),
            hub,
        }
    }

    /// Pull the next record belonging to `task_id`, waiting until it is at
    /// the head of the window. Returns `None` once the window is exhausted,
    /// which is the signal to switch to live execution.
    pub(crate) async fn pull_for(
        &self,
        task_id: &str,
    ) -> WorkflowResult<Option<HistoryRecord>> {
        loop {
            let mut rx = self.bump.subscribe();
            {
                let mut cursor = self.cursor.lock();
                let before = cursor.pos;
                self.advance_passive(&mut cursor)?;
                if self.halted.load(Ordering::Acquire) {
                    return Err(WorkflowError::Suspended);
                }
                if cursor.pos >= self.window.len() {
                    if cursor.pos != before {
                        self.note_progress(&cursor);
                    }
                    return Ok(None);
                }
                let head = &self.window[cursor.pos];
                if head.task_id() == task_id {
                    let record = head.clone();
                    cursor.pos += 1;
                    self.note_progress(&cursor);
                    return Ok(Some(record));
                }
                if cursor.pos != before {
                    self.note_progress(&cursor);
                }
            }
            let _ = rx.changed().await;
        }
    }

    /// True if the window still holds a `StepEnd` for this task and event.
    pub(crate) fn has_step_end(&self, task_id: &str, event_id: &str) -> bool {
        let cursor = self.cursor.lock();
        self.window[cursor.pos..].iter().any(|r| {
            matches!(
                r,
                HistoryRecord::StepEnd { task_id: t, event_id: e, .. }
                    if t == task_id && e == event_id
            )
        })
    }

    /// Mark a task id as a ghost so its records drain passively.
    pub(crate) fn mark_ghost(&self, task_id: &str) {
        self.cursor.lock().ghosts.insert(task_id.to_string());
        self.bump.send_modify(|v| *v += 1);
    }

    /// Stop replay: wake every waiter and make further pulls suspend.
    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.bump.send_modify(|v| *v += 1);
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Observer for "the window is fully consumed".
    pub(crate) fn drained_receiver(&self) -> watch::Receiver<bool> {
        self.drained.subscribe()
    }

    /// Drain any trailing external or ghost records after all tasks
    /// finished. A leftover record owned by a real task means the run
    /// diverged from history.
    pub(crate) fn drain_rest(&self) -> Result<(), HistorianError> {
        let mut cursor = self.cursor.lock();
        self.advance_passive(&mut cursor)?;
        if cursor.pos < self.window.len() {
            let head = &self.window[cursor.pos];
            return Err(HistorianError::Divergence(format!(
                "task '{}' never consumed its recorded {} '{}'",
                head.task_id(),
                head.record_type(),
                head.event_id()
            )));
        }
        self.note_progress(&cursor);
        Ok(())
    }

    /// Advance past external and ghost records at the head, applying their
    /// effects to the resource table.
    fn advance_passive(&self, cursor: &mut Cursor) -> Result<(), HistorianError> {
        while cursor.pos < self.window.len() {
            let head = &self.window[cursor.pos];
            let owner = head.task_id();
            if owner == EXTERNAL_TASK {
                self.hub.replay_record(head)?;
                cursor.pos += 1;
                continue;
            }
            if cursor.ghosts.contains(owner) {
                match head {
                    HistoryRecord::TaskSpawned { event_id, .. } => {
                        cursor.ghosts.insert(event_id.clone());
                    }
                    HistoryRecord::TaskCancelled { target, .. } => {
                        cursor.ghosts.insert(target.clone());
                    }
                    HistoryRecord::ResourceCreated { .. }
                    | HistoryRecord::ResourceRemoved { .. }
                    | HistoryRecord::ResourceEvent { .. } => {
                        self.hub.replay_record(head)?;
                    }
                    HistoryRecord::StepStart { .. } | HistoryRecord::StepEnd { .. } => {}
                }
                cursor.pos += 1;
                continue;
            }
            break;
        }
        Ok(())
    }

    fn note_progress(&self, cursor: &Cursor) {
        if cursor.pos >= self.window.len() {
            let _ = self.drained.send(true);
        }
        self.bump.send_modify(|v| *v += 1);
    }
}

impl std::fmt::Debug for ReplayGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayGate")
            .field("window", &self.window.len())
            .field("pos", &self.cursor.lock().pos)
            .field("halted", &self.is_halted())
            .finish()
    }
}
