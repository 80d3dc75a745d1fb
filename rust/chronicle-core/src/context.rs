//! Workflow context: the explicit handle every step and resource call
//! goes through.
//!
//! There is no ambient lookup of "the current workflow"; the context is
//! passed into the workflow body and cloned into sub-tasks, carrying a
//! reference to the run it belongs to and to the task executing it.
//!
//! # Replay
//!
//! Every operation first asks the replay gate for this task's next
//! recorded record. While records remain, outcomes come from history:
//! finished steps return their cached result without invoking the body,
//! resource actions are re-applied and asserted equal against what was
//! recorded. Once the window is exhausted the same calls execute live and
//! append new records.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{HistorianError, WorkflowError, WorkflowResult};
use crate::historian::RunShared;
use crate::record::{EventScope, HistoryRecord};
use crate::resource::{ApplyError, ResourceKey, ResourceKind};
use crate::task::{TaskHandle, TaskState};
use crate::version::VersionTag;

/// Boxed future returned by workflow and task bodies.
pub type TaskFuture = BoxFuture<'static, WorkflowResult<Value>>;

/// Handle passed to workflow code for steps, resources and sub-tasks.
#[derive(Clone)]
pub struct WorkflowCtx {
    pub(crate) shared: Arc<RunShared>,
    pub(crate) task: Arc<TaskState>,
}

impl WorkflowCtx {
    /// Id of the workflow this run belongs to.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.shared.workflow_id
    }

    /// Id of the task executing this context.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    /// The workflow input recorded on first start.
    #[must_use]
    pub fn input(&self) -> &Value {
        &self.shared.input
    }

    /// Run `f` as a step: executed at most once, its outcome cached in
    /// history and returned verbatim on every replay.
    ///
    /// Nested steps namespace their ids under this one, so sibling calls
    /// to the same step name stay distinct without caller cooperation. A
    /// fault from `f` is recorded and re-raised here on every replay; it
    /// is not retried. Suspension passes through without closing the step,
    /// so a resumed run re-enters the body and replays its sub-records.
    ///
    /// # Errors
    ///
    /// Propagates suspension, the step's recorded fault, or an engine
    /// failure.
    pub async fn step<T, F, Fut>(&self, name: &str, f: F) -> WorkflowResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = WorkflowResult<T>>,
    {
        self.ensure_active()?;
        let event_id = self.shared.next_id(&self.task.prefixed(name));

        match self.shared.gate.pull_for(&self.task.id).await? {
            None => {
                self.shared
                    .append(HistoryRecord::StepStart {
                        timestamp: Utc::now(),
                        task_id: self.task.id.clone(),
                        event_id: event_id.clone(),
                    })
                    .await?;
                self.enter(&event_id, f).await
            }
            Some(HistoryRecord::StepStart {
                event_id: recorded, ..
            }) => {
                if recorded != event_id {
                    return Err(self.divergence(format!(
                        "expected step '{event_id}', history recorded '{recorded}'"
                    )));
                }
                if self.shared.gate.has_step_end(&self.task.id, &event_id) {
                    let (result, error) = self.skip_recorded_step(&event_id).await?;
                    match error {
                        Some(fault) => Err(WorkflowError::Fault(fault)),
                        None => Ok(serde_json::from_value(
                            result.unwrap_or(Value::Null),
                        )
                        .map_err(HistorianError::Serde)?),
                    }
                } else {
                    // The step was open when the workflow suspended;
                    // re-enter the body and replay its sub-records.
                    self.enter(&event_id, f).await
                }
            }
            Some(other) => Err(self.divergence(format!(
                "expected step '{event_id}', history recorded {} '{}'",
                other.record_type(),
                other.event_id()
            ))),
        }
    }

    /// Spawn a named sub-task running `f` concurrently.
    ///
    /// The task id is minted deterministically, and the spawn itself is
    /// recorded so replay reconstructs the same task topology.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn spawn<F>(&self, name: &str, f: F) -> WorkflowResult<TaskHandle>
    where
        F: FnOnce(WorkflowCtx) -> TaskFuture + Send + 'static,
    {
        self.ensure_active()?;
        let task_id = self.shared.next_id(&self.task.prefixed(name));

        match self.shared.gate.pull_for(&self.task.id).await? {
            None => {
                self.shared
                    .append(HistoryRecord::TaskSpawned {
                        timestamp: Utc::now(),
                        task_id: self.task.id.clone(),
                        event_id: task_id.clone(),
                    })
                    .await?;
            }
            Some(HistoryRecord::TaskSpawned {
                event_id: recorded, ..
            }) => {
                if recorded != task_id {
                    return Err(self.divergence(format!(
                        "expected spawn of '{task_id}', history recorded '{recorded}'"
                    )));
                }
            }
            Some(other) => {
                return Err(self.divergence(format!(
                    "expected spawn of '{task_id}', history recorded {} '{}'",
                    other.record_type(),
                    other.event_id()
                )));
            }
        }

        Ok(self.shared.spawn_task(task_id, f))
    }

    /// Cancel a spawned task. The cancellation is recorded, so replay does
    /// not re-attempt it.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn cancel_task(&self, handle: &TaskHandle) -> WorkflowResult<()> {
        self.ensure_active()?;
        let event_id = self
            .shared
            .next_id(&self.task.prefixed(&format!("cancel.{}", handle.task_id)));

        match self.shared.gate.pull_for(&self.task.id).await? {
            None => {
                self.shared.apply_cancel(&handle.task_id);
                self.shared
                    .append(HistoryRecord::TaskCancelled {
                        timestamp: Utc::now(),
                        task_id: self.task.id.clone(),
                        event_id,
                        target: handle.task_id.clone(),
                    })
                    .await?;
                Ok(())
            }
            Some(HistoryRecord::TaskCancelled {
                event_id: recorded,
                target,
                ..
            }) => {
                if recorded != event_id || target != handle.task_id {
                    return Err(self.divergence(format!(
                        "expected cancel '{event_id}' of '{}', history recorded '{recorded}' of '{target}'",
                        handle.task_id
                    )));
                }
                self.shared.apply_cancel(&handle.task_id);
                Ok(())
            }
            Some(other) => Err(self.divergence(format!(
                "expected cancel of '{}', history recorded {} '{}'",
                handle.task_id,
                other.record_type(),
                other.event_id()
            ))),
        }
    }

    /// Version active for a labelled region: the recorded tag on replay,
    /// `deployed` (recorded now) on first reach.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn get_version(&self, label: &str, deployed: &str) -> WorkflowResult<VersionTag> {
        let deployed = deployed.to_string();
        let recorded: String = self
            .step(&format!("{label}.version"), || async move { Ok(deployed) })
            .await?;
        Ok(VersionTag::new(recorded))
    }

    /// Create a state cell holding `initial`.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn state(
        &self,
        name: &str,
        identity: Option<String>,
        initial: Value,
    ) -> WorkflowResult<StateHandle> {
        let key = self
            .create_resource(ResourceKind::State, name, identity, Some(initial))
            .await?;
        Ok(StateHandle { key })
    }

    /// Create a FIFO queue.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn queue(&self, name: &str, identity: Option<String>) -> WorkflowResult<QueueHandle> {
        let key = self
            .create_resource(ResourceKind::Queue, name, identity, None)
            .await?;
        Ok(QueueHandle { key })
    }

    /// Create a boolean event flag.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn event(&self, name: &str, identity: Option<String>) -> WorkflowResult<EventHandle> {
        let key = self
            .create_resource(ResourceKind::Event, name, identity, None)
            .await?;
        Ok(EventHandle { key })
    }

    /// Create a public identity queue, where external `put`s mint the
    /// identity of the contributor.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn identity_queue(&self, name: &str) -> WorkflowResult<IdentityQueueHandle> {
        let key = self
            .create_resource(ResourceKind::IdentityQueue, name, None, None)
            .await?;
        Ok(IdentityQueueHandle { key })
    }

    // ---- internals -------------------------------------------------------

    async fn enter<T, F, Fut>(&self, event_id: &str, f: F) -> WorkflowResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = WorkflowResult<T>>,
    {
        self.task.push_prefix(event_id);
        let outcome = f().await;
        self.task.pop_prefix();

        match outcome {
            Ok(value) => {
                let recorded = serde_json::to_value(&value).map_err(HistorianError::Serde)?;
                self.shared
                    .append_step_end(HistoryRecord::StepEnd {
                        timestamp: Utc::now(),
                        task_id: self.task.id.clone(),
                        event_id: event_id.to_string(),
                        result: Some(recorded),
                        error: None,
                    })
                    .await?;
                Ok(value)
            }
            Err(WorkflowError::Fault(fault)) => {
                self.shared
                    .append_step_end(HistoryRecord::StepEnd {
                        timestamp: Utc::now(),
                        task_id: self.task.id.clone(),
                        event_id: event_id.to_string(),
                        result: None,
                        error: Some(fault.clone()),
                    })
                    .await?;
                Err(WorkflowError::Fault(fault))
            }
            // Suspension leaves the step open for re-entry on resume;
            // fatal errors must not be recorded as workflow outcomes.
            Err(other) => Err(other),
        }
    }

    /// Consume a finished step's span from the window without running its
    /// body, re-applying resource effects as they pass.
    async fn skip_recorded_step(
        &self,
        event_id: &str,
    ) -> WorkflowResult<(Option<Value>, Option<crate::error::WorkflowFault>)> {
        loop {
            let record = self
                .shared
                .gate
                .pull_for(&self.task.id)
                .await?
                .ok_or_else(|| {
                    WorkflowError::Fatal(HistorianError::Corrupt(format!(
                        "history ended inside finished step '{event_id}'"
                    )))
                })?;

            match &record {
                HistoryRecord::StepEnd {
                    event_id: eid,
                    result,
                    error,
                    ..
                } if eid == event_id => {
                    return Ok((result.clone(), error.clone()));
                }
                HistoryRecord::StepStart { .. } | HistoryRecord::StepEnd { .. } => {}
                HistoryRecord::TaskSpawned {
                    event_id: child, ..
                } => {
                    // The spawning code will not run; drain the child's
                    // records passively instead.
                    self.shared.gate.mark_ghost(child);
                }
                HistoryRecord::TaskCancelled { target, .. } => {
                    self.shared.apply_cancel(target);
                    self.shared.gate.mark_ghost(target);
                }
                HistoryRecord::ResourceCreated { .. }
                | HistoryRecord::ResourceRemoved { .. }
                | HistoryRecord::ResourceEvent { .. } => {
                    self.shared.hub.replay_record(&record)?;
                }
            }
        }
    }

    async fn create_resource(
        &self,
        kind: ResourceKind,
        name: &str,
        identity: Option<String>,
        initial: Option<Value>,
    ) -> WorkflowResult<ResourceKey> {
        self.ensure_active()?;
        let event_id = self
            .shared
            .next_id(&self.task.prefixed(&format!("{name}.create")));
        let key = ResourceKey::new(name, identity.clone());

        match self.shared.gate.pull_for(&self.task.id).await? {
            None => {
                // The log lock spans apply and append so record order
                // matches the order effects hit the resource table.
                let mut log = self.shared.log.lock().await;
                self.shared
                    .hub
                    .create_live(&key, kind, initial.clone())
                    .map_err(|err| self.apply_error(&key, "create", err))?;
                log.append(HistoryRecord::ResourceCreated {
                    timestamp: Utc::now(),
                    task_id: self.task.id.clone(),
                    event_id,
                    resource: kind,
                    name: name.to_string(),
                    identity,
                    initial,
                })
                .await?;
                Ok(key)
            }
            Some(record) => match &record {
                HistoryRecord::ResourceCreated {
                    event_id: recorded,
                    resource,
                    ..
                } => {
                    if *recorded != event_id || *resource != kind {
                        return Err(self.divergence(format!(
                            "expected creation '{event_id}' of {kind:?} '{name}', history recorded '{recorded}'"
                        )));
                    }
                    self.shared.hub.replay_record(&record)?;
                    Ok(key)
                }
                other => Err(self.divergence(format!(
                    "expected creation of '{name}', history recorded {} '{}'",
                    other.record_type(),
                    other.event_id()
                ))),
            },
        }
    }

    async fn remove_resource(&self, key: &ResourceKey) -> WorkflowResult<()> {
        self.ensure_active()?;
        let event_id = self
            .shared
            .next_id(&self.task.prefixed(&format!("{}.remove", key.name)));

        match self.shared.gate.pull_for(&self.task.id).await? {
            None => {
                let mut log = self.shared.log.lock().await;
                self.shared
                    .hub
                    .remove_live(key)
                    .map_err(|err| self.apply_error(key, "remove", err))?;
                log.append(HistoryRecord::ResourceRemoved {
                    timestamp: Utc::now(),
                    task_id: self.task.id.clone(),
                    event_id,
                    name: key.name.clone(),
                    identity: key.identity.clone(),
                })
                .await?;
                Ok(())
            }
            Some(record) => match &record {
                HistoryRecord::ResourceRemoved {
                    event_id: recorded, ..
                } => {
                    if *recorded != event_id {
                        return Err(self.divergence(format!(
                            "expected removal '{event_id}', history recorded '{recorded}'"
                        )));
                    }
                    self.shared.hub.replay_record(&record)?;
                    Ok(())
                }
                other => Err(self.divergence(format!(
                    "expected removal of '{}', history recorded {} '{}'",
                    key.name,
                    other.record_type(),
                    other.event_id()
                ))),
            },
        }
    }

    async fn resource_action(
        &self,
        key: &ResourceKey,
        action: &str,
        args: Vec<Value>,
    ) -> WorkflowResult<Option<Value>> {
        self.ensure_active()?;
        let event_id = self
            .shared
            .next_id(&self.task.prefixed(&format!("{}.{action}", key.name)));

        match self.shared.gate.pull_for(&self.task.id).await? {
            None => {
                let mut log = self.shared.log.lock().await;
                let result = match self.shared.hub.apply_live(key, action, &args) {
                    Ok(result) => result,
                    // No data ready: unwind cleanly without recording, so
                    // the resumed run retries this exact action.
                    Err(ApplyError::NotReady) => return Err(WorkflowError::Suspended),
                    Err(err) => return Err(self.apply_error(key, action, err)),
                };
                log.append(HistoryRecord::ResourceEvent {
                    timestamp: Utc::now(),
                    task_id: self.task.id.clone(),
                    event_id,
                    scope: EventScope::Internal,
                    name: key.name.clone(),
                    identity: key.identity.clone(),
                    action: action.to_string(),
                    args,
                    result: result.clone(),
                })
                .await?;
                Ok(result)
            }
            Some(record) => match &record {
                HistoryRecord::ResourceEvent {
                    event_id: recorded,
                    scope: EventScope::Internal,
                    action: recorded_action,
                    args: recorded_args,
                    result,
                    ..
                } => {
                    if *recorded != event_id
                        || recorded_action != action
                        || *recorded_args != args
                    {
                        return Err(self.divergence(format!(
                            "expected '{action}' '{event_id}' on '{}', history recorded '{recorded_action}' '{recorded}'",
                            key.name
                        )));
                    }
                    let result = result.clone();
                    self.shared.hub.replay_record(&record)?;
                    Ok(result)
                }
                other => Err(self.divergence(format!(
                    "expected '{action}' on '{}', history recorded {} '{}'",
                    key.name,
                    other.record_type(),
                    other.event_id()
                ))),
            },
        }
    }

    fn ensure_active(&self) -> WorkflowResult<()> {
        if self.task.is_cancelled() || self.shared.suspend_requested() {
            return Err(WorkflowError::Suspended);
        }
        Ok(())
    }

    fn divergence(&self, message: String) -> WorkflowError {
        WorkflowError::Fatal(HistorianError::Divergence(format!(
            "task '{}': {message}",
            self.task.id
        )))
    }

    fn apply_error(&self, key: &ResourceKey, action: &str, err: ApplyError) -> WorkflowError {
        let historian = match err {
            ApplyError::NotReady => HistorianError::NotReady {
                name: key.name.clone(),
                action: action.to_string(),
            },
            ApplyError::InvalidAction => HistorianError::InvalidAction {
                name: key.name.clone(),
                action: action.to_string(),
            },
            ApplyError::Unknown => HistorianError::UnknownResource {
                name: key.name.clone(),
                identity: key.identity.clone(),
            },
            ApplyError::Exists => HistorianError::ResourceExists {
                name: key.name.clone(),
                identity: key.identity.clone(),
            },
            ApplyError::Mismatch(message) => HistorianError::Divergence(message),
        };
        WorkflowError::Fatal(historian)
    }
}

impl std::fmt::Debug for WorkflowCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowCtx")
            .field("workflow_id", &self.shared.workflow_id)
            .field("task_id", &self.task.id)
            .finish()
    }
}

/// Handle to a state cell.
///
/// Handles carry only the resource address; every action takes the context
/// of the task performing it, so a handle can be shared with spawned
/// sub-tasks and each task's events land under its own id.
#[derive(Debug, Clone)]
pub struct StateHandle {
    key: ResourceKey,
}

impl StateHandle {
    /// Read the current value.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn get(&self, ctx: &WorkflowCtx) -> WorkflowResult<Value> {
        Ok(ctx
            .resource_action(&self.key, "get", vec![])
            .await?
            .unwrap_or(Value::Null))
    }

    /// Replace the value.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn set(&self, ctx: &WorkflowCtx, value: Value) -> WorkflowResult<()> {
        ctx.resource_action(&self.key, "set", vec![value]).await?;
        Ok(())
    }

    /// Destroy the cell on normal scope exit. Skipped automatically when a
    /// suspension unwinds past it, so the resource survives to the resume.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn remove(self, ctx: &WorkflowCtx) -> WorkflowResult<()> {
        ctx.remove_resource(&self.key).await
    }
}

/// Handle to a FIFO queue.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    key: ResourceKey,
}

impl QueueHandle {
    /// Append a value.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn put(&self, ctx: &WorkflowCtx, value: Value) -> WorkflowResult<()> {
        ctx.resource_action(&self.key, "put", vec![value]).await?;
        Ok(())
    }

    /// Pop the oldest value, suspending if the queue is empty.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn get(&self, ctx: &WorkflowCtx) -> WorkflowResult<Value> {
        Ok(ctx
            .resource_action(&self.key, "get", vec![])
            .await?
            .unwrap_or(Value::Null))
    }

    /// Destroy the queue on normal scope exit.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn remove(self, ctx: &WorkflowCtx) -> WorkflowResult<()> {
        ctx.remove_resource(&self.key).await
    }
}

/// Handle to an event flag.
#[derive(Debug, Clone)]
pub struct EventHandle {
    key: ResourceKey,
}

impl EventHandle {
    /// Set the flag.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn set(&self, ctx: &WorkflowCtx) -> WorkflowResult<()> {
        ctx.resource_action(&self.key, "set", vec![]).await?;
        Ok(())
    }

    /// Clear the flag.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn clear(&self, ctx: &WorkflowCtx) -> WorkflowResult<()> {
        ctx.resource_action(&self.key, "clear", vec![]).await?;
        Ok(())
    }

    /// Return once the flag is set, suspending while it is not.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn wait(&self, ctx: &WorkflowCtx) -> WorkflowResult<()> {
        ctx.resource_action(&self.key, "wait", vec![]).await?;
        Ok(())
    }

    /// Destroy the flag on normal scope exit.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn remove(self, ctx: &WorkflowCtx) -> WorkflowResult<()> {
        ctx.remove_resource(&self.key).await
    }
}

/// Handle to an identity queue.
#[derive(Debug, Clone)]
pub struct IdentityQueueHandle {
    key: ResourceKey,
}

impl IdentityQueueHandle {
    /// Append a value, minting and returning a fresh identity for the
    /// contributor.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn put(&self, ctx: &WorkflowCtx, value: Value) -> WorkflowResult<String> {
        let result = ctx.resource_action(&self.key, "put", vec![value]).await?;
        result
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                WorkflowError::Fatal(HistorianError::Corrupt(
                    "identity put returned no identity".to_string(),
                ))
            })
    }

    /// Pop the oldest `(identity, value)` pair, suspending when empty.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn get(&self, ctx: &WorkflowCtx) -> WorkflowResult<(String, Value)> {
        let result = ctx
            .resource_action(&self.key, "get", vec![])
            .await?
            .unwrap_or(Value::Null);
        let identity = result[0].as_str().map(str::to_string).ok_or_else(|| {
            WorkflowError::Fatal(HistorianError::Corrupt(
                "identity get returned no identity".to_string(),
            ))
        })?;
        Ok((identity, result[1].clone()))
    }

    /// Destroy the queue on normal scope exit.
    ///
    /// # Errors
    ///
    /// Propagates suspension or an engine failure.
    pub async fn remove(self, ctx: &WorkflowCtx) -> WorkflowResult<()> {
        ctx.remove_resource(&self.key).await
    }
}
