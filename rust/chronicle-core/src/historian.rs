//! The Historian: owner of one workflow's history and the manager-facing
//! surface.
//!
//! A Historian binds a workflow function to its durable history log. Each
//! call to [`Historian::run`] advances the workflow as far as it can go:
//! already-recorded outcomes are consumed without re-executing side
//! effects, then genuinely new work runs live, until the workflow
//! completes, faults, or every task is parked waiting for data. External
//! callers deliver that data through [`Historian::record_external_event`]
//! and observe progress through [`Historian::get_resources`] and
//! [`Historian::stream_resources`].
//!
//! # Example
//!
//! ```rust,ignore
//! use chronicle_core::prelude::*;
//!
//! let store = FileBlobStore::new("./data/workflows").await?;
//! let historian = Historian::new(
//!     "greeter",
//!     store,
//!     |ctx| Box::pin(async move {
//!         let inbox = ctx.queue("inbox", None).await?;
//!         let name = inbox.get(&ctx).await?;
//!         let greeting = ctx.step("greet", || async move {
//!             Ok(format!("hello, {}", name.as_str().unwrap_or("?")))
//!         }).await?;
//!         inbox.remove(&ctx).await?;
//!         Ok(serde_json::Value::String(greeting))
//!     }),
//!     serde_json::Value::Null,
//!     HistorianConfig::default(),
//! ).await?;
//!
//! assert!(matches!(historian.run().await?, RunOutcome::Suspended));
//! historian.record_external_event("inbox", None, "put", vec!["world".into()]).await?;
//! let outcome = historian.run().await?; // Completed("hello, world")
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::backends::BlobStore;
use crate::context::{TaskFuture, WorkflowCtx};
use crate::error::HistorianError;
use crate::gate::ReplayGate;
use crate::history::HistoryLog;
use crate::ids::IdGenerator;
use crate::record::{EventScope, HistoryRecord, EXTERNAL_TASK};
use crate::resource::{ApplyError, ResourceHub, ResourceSnapshot};
use crate::task::{TaskEntry, TaskState, TaskTermination};

/// Boxed workflow entry point.
pub type WorkflowFn = dyn Fn(WorkflowCtx) -> TaskFuture + Send + Sync;

/// Lifecycle of a workflow as observed by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    /// Never run yet.
    Pending,
    /// A run is in progress.
    Running,
    /// Parked; every task is waiting for data or a suspend was requested.
    Suspended,
    /// Finished with a value.
    Completed,
    /// Finished with a recorded fault.
    Errored,
    /// Deleted or cancelled.
    Cancelled,
}

/// How a single `run` call ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The workflow finished and produced its value.
    Completed(Value),
    /// Every task is parked; deliver external events and run again.
    Suspended,
    /// The workflow raised a fault; it will re-raise on every resume.
    Errored(crate::error::WorkflowFault),
    /// The workflow was cancelled mid-run.
    Cancelled,
}

/// What happens to history when a workflow is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    /// Delete every blob.
    #[default]
    Discard,
    /// Fold the history into a single archive blob, then delete the rest.
    Archive,
}

/// Tunables for one Historian.
#[derive(Debug, Clone)]
pub struct HistorianConfig {
    /// Drop records of step-scoped resources once the step finishes.
    pub prune_finished_steps: bool,
    /// History disposition on delete.
    pub cancel_policy: CancelPolicy,
    /// Buffer size for resource-change broadcasts.
    pub stream_capacity: usize,
}

impl Default for HistorianConfig {
    fn default() -> Self {
        Self {
            prune_finished_steps: true,
            cancel_policy: CancelPolicy::Discard,
            stream_capacity: 64,
        }
    }
}

/// State shared by every task of one run.
pub(crate) struct RunShared {
    pub(crate) workflow_id: String,
    pub(crate) input: Value,
    pub(crate) ids: Mutex<IdGenerator>,
    pub(crate) gate: ReplayGate,
    pub(crate) hub: Arc<ResourceHub>,
    pub(crate) log: Arc<tokio::sync::Mutex<HistoryLog>>,
    pub(crate) tasks: Mutex<HashMap<String, Arc<TaskEntry>>>,
    pub(crate) config: HistorianConfig,
    suspend: AtomicBool,
    fatal: Mutex<Option<HistorianError>>,
}

impl RunShared {
    pub(crate) fn next_id(&self, name: &str) -> String {
        self.ids.lock().next_id(name)
    }

    pub(crate) async fn append(&self, record: HistoryRecord) -> Result<(), HistorianError> {
        self.log.lock().await.append(record).await
    }

    /// Append a `StepEnd` and prune its span if pruning is enabled.
    pub(crate) async fn append_step_end(
        &self,
        record: HistoryRecord,
    ) -> Result<(), HistorianError> {
        let mut log = self.log.lock().await;
        log.append(record).await?;
        if self.config.prune_finished_steps {
            let end_idx = log.records().len() - 1;
            log.prune_finished_step(end_idx).await?;
        }
        Ok(())
    }

    pub(crate) fn spawn_task<F>(self: &Arc<Self>, task_id: String, f: F) -> crate::task::TaskHandle
    where
        F: FnOnce(WorkflowCtx) -> TaskFuture + Send + 'static,
    {
        let state = Arc::new(TaskState::new(task_id.clone()));
        let (term_tx, term_rx) = watch::channel(None);
        let entry = Arc::new(TaskEntry {
            state: Arc::clone(&state),
            term: Arc::new(term_tx),
            abort: Mutex::new(None),
        });
        self.tasks.lock().insert(task_id.clone(), Arc::clone(&entry));

        let ctx = WorkflowCtx {
            shared: Arc::clone(self),
            task: Arc::clone(&state),
        };
        let future = f(ctx);

        let shared = Arc::clone(self);
        let task_entry = Arc::clone(&entry);
        let handle = tokio::spawn(async move {
            let termination = match future.await {
                Ok(value) => TaskTermination::Completed(value),
                Err(crate::error::WorkflowError::Suspended) => {
                    if task_entry.state.is_cancelled() {
                        TaskTermination::Cancelled
                    } else {
                        TaskTermination::Suspended
                    }
                }
                Err(crate::error::WorkflowError::Fault(fault)) => {
                    TaskTermination::Faulted(fault)
                }
                Err(crate::error::WorkflowError::Fatal(err)) => {
                    let message = err.to_string();
                    shared.note_fatal(err);
                    TaskTermination::Fatal(message)
                }
            };
            tracing::debug!(
                task_id = %task_entry.state.id,
                status = ?termination.status(),
                "task finished"
            );
            task_entry.finish(termination);
        });
        let abort = handle.abort_handle();
        {
            let mut slot = entry.abort.lock();
            *slot = Some(abort);
        }
        if entry.state.is_cancelled() {
            // Cancelled before the abort handle was registered.
            if let Some(abort) = entry.abort.lock().as_ref() {
                abort.abort();
            }
        }

        crate::task::TaskHandle { task_id, term_rx }
    }

    /// Cancel a task by id: mark it, record its termination, abort it.
    pub(crate) fn apply_cancel(&self, target: &str) {
        let entry = self.tasks.lock().get(target).cloned();
        if let Some(entry) = entry {
            entry.state.cancel();
            entry.finish(TaskTermination::Cancelled);
            if let Some(abort) = entry.abort.lock().as_ref() {
                abort.abort();
            }
            tracing::debug!(task_id = target, "task cancelled");
        }
    }

    pub(crate) fn suspend_requested(&self) -> bool {
        self.suspend.load(Ordering::Acquire)
    }

    fn request_suspend(&self) {
        self.suspend.store(true, Ordering::Release);
        self.gate.halt();
    }

    fn note_fatal(&self, err: HistorianError) {
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        drop(slot);
        // Stop the other tasks; the run is over.
        self.gate.halt();
    }

    fn take_fatal(&self) -> Option<HistorianError> {
        self.fatal.lock().take()
    }

    fn cancel_all(&self) {
        let entries: Vec<Arc<TaskEntry>> = self.tasks.lock().values().cloned().collect();
        for entry in entries {
            entry.state.cancel();
            entry.finish(TaskTermination::Cancelled);
            if let Some(abort) = entry.abort.lock().as_ref() {
                abort.abort();
            }
        }
        self.gate.halt();
    }

    fn receivers(&self) -> Vec<watch::Receiver<Option<TaskTermination>>> {
        self.tasks
            .lock()
            .values()
            .map(|entry| entry.term.subscribe())
            .collect()
    }

    fn terminations(&self) -> HashMap<String, Option<TaskTermination>> {
        self.tasks
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.term.borrow().clone()))
            .collect()
    }
}

impl std::fmt::Debug for RunShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunShared")
            .field("workflow_id", &self.workflow_id)
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}

/// Replay engine instance for one workflow.
pub struct Historian {
    workflow_id: String,
    workflow: Arc<WorkflowFn>,
    log: Arc<tokio::sync::Mutex<HistoryLog>>,
    hub: Arc<ResourceHub>,
    config: HistorianConfig,
    status_tx: watch::Sender<WorkflowStatus>,
    current: Mutex<Option<Arc<RunShared>>>,
}

impl Historian {
    /// Bind `workflow` to the history stored for `workflow_id`.
    ///
    /// Loads any existing history, so the same constructor serves both
    /// first starts and resumes after a process restart. `input` is
    /// persisted on first run; a resumed run replays with the stored
    /// input.
    ///
    /// # Errors
    ///
    /// Returns an error if existing history cannot be read.
    pub async fn new<F>(
        workflow_id: impl Into<String>,
        store: impl BlobStore + 'static,
        workflow: F,
        input: Value,
        config: HistorianConfig,
    ) -> Result<Self, HistorianError>
    where
        F: Fn(WorkflowCtx) -> TaskFuture + Send + Sync + 'static,
    {
        let workflow_id = workflow_id.into();
        let store: Arc<dyn BlobStore> = Arc::new(store);
        let log = HistoryLog::load(store, workflow_id.clone(), input).await?;

        let initial = if log.records().is_empty() {
            WorkflowStatus::Pending
        } else {
            WorkflowStatus::Suspended
        };
        let (status_tx, _) = watch::channel(initial);

        Ok(Self {
            workflow_id,
            workflow: Arc::new(workflow),
            log: Arc::new(tokio::sync::Mutex::new(log)),
            hub: Arc::new(ResourceHub::new(config.stream_capacity)),
            config,
            status_tx,
            current: Mutex::new(None),
        })
    }

    /// Workflow id this Historian owns.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> WorkflowStatus {
        *self.status_tx.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<WorkflowStatus> {
        self.status_tx.subscribe()
    }

    /// Snapshot of the full history, oldest first.
    pub async fn history(&self) -> Vec<HistoryRecord> {
        self.log.lock().await.records().to_vec()
    }

    /// Advance the workflow: replay recorded outcomes, then run new work
    /// until it completes, faults, or every task is parked.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failures, on a replay divergence, or if
    /// a run is already in progress.
    pub async fn run(&self) -> Result<RunOutcome, HistorianError> {
        let shared = self.begin_run().await?;

        tracing::info!(
            workflow_id = %self.workflow_id,
            "starting workflow run"
        );
        self.status_tx.send_replace(WorkflowStatus::Running);

        let workflow = Arc::clone(&self.workflow);
        shared.spawn_task(self.workflow_id.clone(), move |ctx| workflow(ctx));

        // Wait until every task, including ones spawned mid-run, finishes.
        loop {
            let receivers = shared.receivers();
            let waited = receivers.len();
            for mut rx in receivers {
                let _ = rx.wait_for(Option::is_some).await;
            }
            if shared.tasks.lock().len() == waited {
                break;
            }
        }

        let outcome = self.conclude(&shared);
        *self.current.lock() = None;

        match &outcome {
            Ok(RunOutcome::Completed(_)) => {
                self.status_tx.send_replace(WorkflowStatus::Completed);
                tracing::info!(workflow_id = %self.workflow_id, "workflow completed");
            }
            Ok(RunOutcome::Suspended) => {
                self.status_tx.send_replace(WorkflowStatus::Suspended);
                tracing::info!(workflow_id = %self.workflow_id, "workflow suspended");
            }
            Ok(RunOutcome::Errored(fault)) => {
                self.status_tx.send_replace(WorkflowStatus::Errored);
                tracing::warn!(
                    workflow_id = %self.workflow_id,
                    kind = %fault.kind,
                    "workflow errored"
                );
            }
            Ok(RunOutcome::Cancelled) => {
                self.status_tx.send_replace(WorkflowStatus::Cancelled);
            }
            Err(err) => {
                self.status_tx.send_replace(WorkflowStatus::Errored);
                tracing::error!(
                    workflow_id = %self.workflow_id,
                    error = %err,
                    "workflow run failed"
                );
            }
        }
        outcome
    }

    /// Request a cooperative park for shutdown. Tasks unwind at their next
    /// engine call and the in-flight `run` returns `Suspended` with the
    /// log in a consistent, resumable state.
    pub fn suspend(&self) {
        if let Some(shared) = self.current.lock().as_ref() {
            tracing::info!(workflow_id = %self.workflow_id, "suspend requested");
            shared.request_suspend();
        }
    }

    /// Resources currently visible to `identity`: public ones plus those
    /// scoped to it. Re-derived from live state on every call.
    #[must_use]
    pub fn get_resources(&self, identity: Option<&str>) -> HashMap<String, ResourceSnapshot> {
        self.hub.snapshot(identity)
    }

    /// Deliver an action from an external caller to a visible resource.
    ///
    /// The event is applied to the live resource and recorded once;
    /// replay re-applies it verbatim at the same log position. Returns the
    /// action result (e.g. the identity minted by an identity-queue put).
    ///
    /// # Errors
    ///
    /// Rejects identity violations and unknown resources without recording
    /// anything; `NotReady` reports an action with no data to satisfy it.
    pub async fn record_external_event(
        &self,
        name: &str,
        identity: Option<&str>,
        action: &str,
        args: Vec<Value>,
    ) -> Result<Value, HistorianError> {
        self.await_external_window().await;

        // The log lock spans apply and append so the recorded position
        // matches the order the effect hit the resource table.
        let mut log = self.log.lock().await;
        let key = self.hub.resolve_external(name, identity)?;
        let result = self
            .hub
            .apply_live(&key, action, &args)
            .map_err(|err| match err {
                ApplyError::NotReady => HistorianError::NotReady {
                    name: name.to_string(),
                    action: action.to_string(),
                },
                ApplyError::InvalidAction => HistorianError::InvalidAction {
                    name: name.to_string(),
                    action: action.to_string(),
                },
                ApplyError::Unknown | ApplyError::Exists | ApplyError::Mismatch(_) => {
                    HistorianError::UnknownResource {
                        name: name.to_string(),
                        identity: identity.map(str::to_string),
                    }
                }
            })?;

        let event_id = log.next_external_id(&key.name, action);
        log.append(HistoryRecord::ResourceEvent {
            timestamp: chrono::Utc::now(),
            task_id: EXTERNAL_TASK.to_string(),
            event_id: event_id.clone(),
            scope: EventScope::External,
            name: key.name.clone(),
            identity: key.identity.clone(),
            action: action.to_string(),
            args,
            result: result.clone(),
        })
        .await?;
        drop(log);

        tracing::debug!(
            workflow_id = %self.workflow_id,
            resource = name,
            action,
            event_id = %event_id,
            "recorded external event"
        );
        Ok(result.unwrap_or(Value::Null))
    }

    /// Lazily yield resource snapshots visible to `identity`: one up
    /// front, then one per change. Restartable per call; ends when the
    /// workflow completes, errors, suspends, or is cancelled.
    pub fn stream_resources(
        &self,
        identity: Option<String>,
    ) -> impl Stream<Item = HashMap<String, ResourceSnapshot>> + Send {
        let hub = Arc::clone(&self.hub);
        let mut changes = hub.subscribe();
        let mut status_rx = self.status_tx.subscribe();

        enum Tick {
            Snapshot,
            Final,
            Quiet,
            End,
        }

        async_stream::stream! {
            yield hub.snapshot(identity.as_deref());
            if is_settled(*status_rx.borrow_and_update()) {
                return;
            }
            loop {
                let tick = tokio::select! {
                    received = changes.recv() => match received {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Tick::Snapshot,
                        Err(broadcast::error::RecvError::Closed) => Tick::End,
                    },
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            Tick::End
                        } else if is_settled(*status_rx.borrow_and_update()) {
                            Tick::Final
                        } else {
                            Tick::Quiet
                        }
                    }
                };
                match tick {
                    Tick::Snapshot => yield hub.snapshot(identity.as_deref()),
                    Tick::Final => {
                        yield hub.snapshot(identity.as_deref());
                        break;
                    }
                    Tick::Quiet => {}
                    Tick::End => break,
                }
            }
        }
    }

    /// Tear the workflow down and dispose of its history per the
    /// configured [`CancelPolicy`].
    ///
    /// # Errors
    ///
    /// Returns an error if history disposal fails; effects already durably
    /// recorded are not rolled back.
    pub async fn delete(&self) -> Result<(), HistorianError> {
        if let Some(shared) = self.current.lock().take() {
            shared.cancel_all();
        }
        let mut log = self.log.lock().await;
        match self.config.cancel_policy {
            CancelPolicy::Discard => log.discard().await?,
            CancelPolicy::Archive => log.archive().await?,
        }
        drop(log);
        self.hub.reset();
        self.status_tx.send_replace(WorkflowStatus::Cancelled);
        tracing::info!(
            workflow_id = %self.workflow_id,
            policy = ?self.config.cancel_policy,
            "workflow deleted"
        );
        Ok(())
    }

    // ---- internals -------------------------------------------------------

    async fn begin_run(&self) -> Result<Arc<RunShared>, HistorianError> {
        let window = self.log.lock().await.records().to_vec();
        let input = self.log.lock().await.input().clone();

        let mut current = self.current.lock();
        if current.is_some() {
            return Err(HistorianError::AlreadyRunning(self.workflow_id.clone()));
        }

        // Resources are rebuilt from history as replay passes over it.
        self.hub.reset();

        let shared = Arc::new(RunShared {
            workflow_id: self.workflow_id.clone(),
            input,
            ids: Mutex::new(IdGenerator::new()),
            gate: ReplayGate::new(window, Arc::clone(&self.hub)),
            hub: Arc::clone(&self.hub),
            log: Arc::clone(&self.log),
            tasks: Mutex::new(HashMap::new()),
            config: self.config.clone(),
            suspend: AtomicBool::new(false),
            fatal: Mutex::new(None),
        });
        *current = Some(Arc::clone(&shared));
        Ok(shared)
    }

    fn conclude(&self, shared: &RunShared) -> Result<RunOutcome, HistorianError> {
        if let Some(fatal) = shared.take_fatal() {
            return Err(fatal);
        }

        // Apply any trailing external records the tasks never reached,
        // unless replay was cut short on purpose.
        if !shared.gate.is_halted() {
            shared.gate.drain_rest()?;
        }

        let terminations = shared.terminations();
        let root = terminations
            .get(&self.workflow_id)
            .cloned()
            .flatten()
            .ok_or_else(|| {
                HistorianError::Corrupt("root task never terminated".to_string())
            })?;

        if let TaskTermination::Faulted(fault) = &root {
            return Ok(RunOutcome::Errored(fault.clone()));
        }
        for termination in terminations.values().flatten() {
            if let TaskTermination::Faulted(fault) = termination {
                return Ok(RunOutcome::Errored(fault.clone()));
            }
        }
        let any_suspended = terminations
            .values()
            .flatten()
            .any(|t| matches!(t, TaskTermination::Suspended));
        if any_suspended {
            return Ok(RunOutcome::Suspended);
        }
        match root {
            TaskTermination::Completed(value) => Ok(RunOutcome::Completed(value)),
            TaskTermination::Cancelled => Ok(RunOutcome::Cancelled),
            TaskTermination::Suspended => Ok(RunOutcome::Suspended),
            TaskTermination::Faulted(fault) => Ok(RunOutcome::Errored(fault)),
            TaskTermination::Fatal(message) => Err(HistorianError::Divergence(message)),
        }
    }

    /// Hold external deliveries while a run is still replaying its window,
    /// so externally driven mutations cannot interleave with state
    /// reconstruction.
    async fn await_external_window(&self) {
        loop {
            let drained = {
                let current = self.current.lock();
                match current.as_ref() {
                    None => return,
                    Some(shared) => shared.gate.drained_receiver(),
                }
            };
            if *drained.borrow() {
                return;
            }
            let mut drained = drained;
            let mut status_rx = self.status_tx.subscribe();
            tokio::select! {
                _ = drained.changed() => {}
                _ = status_rx.changed() => {}
            }
        }
    }
}

impl std::fmt::Debug for Historian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Historian")
            .field("workflow_id", &self.workflow_id)
            .field("status", &self.status())
            .finish()
    }
}

fn is_settled(status: WorkflowStatus) -> bool {
    matches!(
        status,
        WorkflowStatus::Completed
            | WorkflowStatus::Suspended
            | WorkflowStatus::Errored
            | WorkflowStatus::Cancelled
    )
}
