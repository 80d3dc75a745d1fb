//! The append-only history log.
//!
//! Holds the ordered record list in memory and mirrors every change to a
//! [`BlobStore`]: one index blob per workflow (ordered record keys plus the
//! recorded workflow input) and one JSON blob per record, keyed by a
//! content hash of `(timestamp, event_id, type)`. Construction from an
//! existing store reconstructs the list in index order, which is what makes
//! a resumed process replay identically.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::backends::BlobStore;
use crate::error::HistorianError;
use crate::record::{EventScope, HistoryRecord, EXTERNAL_TASK};

/// Ordered, durable record log for one workflow.
pub struct HistoryLog {
    store: Arc<dyn BlobStore>,
    workflow_id: String,
    records: Vec<HistoryRecord>,
    keys: Vec<String>,
    input: Value,
}

impl HistoryLog {
    /// Load the log for `workflow_id`, reconstructing record order from the
    /// persisted index, or start empty if nothing is stored yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the index or a record blob cannot be read or
    /// parsed.
    pub async fn load(
        store: Arc<dyn BlobStore>,
        workflow_id: impl Into<String>,
        input: Value,
    ) -> Result<Self, HistorianError> {
        let workflow_id = workflow_id.into();
        let index_key = index_key(&workflow_id);

        let exists = store
            .has_blob(&index_key)
            .await
            .map_err(HistorianError::Storage)?;
        if !exists {
            return Ok(Self {
                store,
                workflow_id,
                records: Vec::new(),
                keys: Vec::new(),
                input,
            });
        }

        let index = store
            .read_blob(&index_key)
            .await
            .map_err(HistorianError::Storage)?;
        let keys: Vec<String> = index["records"]
            .as_array()
            .ok_or_else(|| HistorianError::Corrupt("index has no record list".to_string()))?
            .iter()
            .map(|key| {
                key.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| HistorianError::Corrupt("non-string record key".to_string()))
            })
            .collect::<Result<_, _>>()?;

        let recorded_input = index.get("input").cloned().unwrap_or(Value::Null);
        if !recorded_input.is_null() && recorded_input != input {
            tracing::warn!(
                workflow_id = %workflow_id,
                "stored input differs from the supplied one; replaying with the stored input"
            );
        }
        let input = if recorded_input.is_null() {
            input
        } else {
            recorded_input
        };

        let mut records = Vec::with_capacity(keys.len());
        for key in &keys {
            let document = store
                .read_blob(key)
                .await
                .map_err(HistorianError::Storage)?;
            records.push(serde_json::from_value(document)?);
        }

        tracing::debug!(
            workflow_id = %workflow_id,
            records = records.len(),
            "loaded history"
        );

        Ok(Self {
            store,
            workflow_id,
            records,
            keys,
            input,
        })
    }

    /// Workflow this log belongs to.
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// The workflow input, as recorded on first run.
    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// All records in log order.
    #[must_use]
    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    /// Iterate records oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.records.iter()
    }

    /// Iterate records newest first.
    pub fn iter_rev(&self) -> impl Iterator<Item = &HistoryRecord> {
        self.records.iter().rev()
    }

    /// Append a record and persist it.
    ///
    /// # Errors
    ///
    /// Returns an error if the record or index cannot be written.
    pub async fn append(&mut self, record: HistoryRecord) -> Result<(), HistorianError> {
        let key = record.blob_key();
        self.store
            .write_blob(&key, &serde_json::to_value(&record)?)
            .await
            .map_err(HistorianError::Storage)?;
        self.records.push(record);
        self.keys.push(key);
        self.persist_index().await
    }

    /// Remove the first record equal to `record`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob or index cannot be updated.
    pub async fn remove(&mut self, record: &HistoryRecord) -> Result<bool, HistorianError> {
        let Some(idx) = self.records.iter().position(|r| r == record) else {
            return Ok(false);
        };
        self.remove_indices(&[idx]).await?;
        Ok(true)
    }

    /// Prune resource records made unobservable by a finished step.
    ///
    /// Given the index of a `StepEnd`, removes every record strictly between
    /// it and its `StepStart` that references a resource both created and
    /// removed inside that span by the same task. Resources created outside
    /// the span keep their records: a concurrent task may still replay them
    /// in order. A span resource touched by another task is left intact and
    /// flagged, since its creating scope is ambiguous.
    ///
    /// # Errors
    ///
    /// Returns an error if blob deletion or the index rewrite fails.
    pub async fn prune_finished_step(
        &mut self,
        end_idx: usize,
    ) -> Result<usize, HistorianError> {
        let Some(HistoryRecord::StepEnd {
            task_id, event_id, ..
        }) = self.records.get(end_idx)
        else {
            return Ok(0);
        };
        let task_id = task_id.clone();
        let event_id = event_id.clone();

        let Some(start_idx) = self.records[..end_idx].iter().rposition(|r| {
            matches!(r, HistoryRecord::StepStart { event_id: eid, .. } if *eid == event_id)
        }) else {
            return Ok(0);
        };

        let span = &self.records[start_idx + 1..end_idx];

        let created: HashSet<(String, Option<String>)> = span
            .iter()
            .filter(|r| r.task_id() == task_id)
            .filter_map(|r| match r {
                HistoryRecord::ResourceCreated { name, identity, .. } => {
                    Some((name.clone(), identity.clone()))
                }
                _ => None,
            })
            .collect();
        let removed: HashSet<(String, Option<String>)> = span
            .iter()
            .filter(|r| r.task_id() == task_id)
            .filter_map(|r| match r {
                HistoryRecord::ResourceRemoved { name, identity, .. } => {
                    Some((name.clone(), identity.clone()))
                }
                _ => None,
            })
            .collect();
        let mut prunable: HashSet<(String, Option<String>)> =
            created.intersection(&removed).cloned().collect();

        // A step-scoped resource touched by another task has an ambiguous
        // creating scope; keep its records and say so.
        for record in span {
            if record.task_id() == task_id || record.task_id() == EXTERNAL_TASK {
                continue;
            }
            if let Some((name, identity)) = record.resource_ref() {
                let key = (name.to_string(), identity.map(str::to_string));
                if prunable.remove(&key) {
                    tracing::warn!(
                        workflow_id = %self.workflow_id,
                        resource = name,
                        step = %event_id,
                        "step-scoped resource was touched by another task; keeping its records"
                    );
                }
            }
        }

        if prunable.is_empty() {
            return Ok(0);
        }

        let doomed: Vec<usize> = (start_idx + 1..end_idx)
            .filter(|&idx| {
                self.records[idx].resource_ref().is_some_and(|(name, identity)| {
                    prunable.contains(&(name.to_string(), identity.map(str::to_string)))
                })
            })
            .collect();

        let count = doomed.len();
        self.remove_indices(&doomed).await?;

        tracing::debug!(
            workflow_id = %self.workflow_id,
            step = %event_id,
            pruned = count,
            "pruned step-scoped resource records"
        );
        Ok(count)
    }

    /// Next unique id for an external event on `name`/`action`.
    #[must_use]
    pub fn next_external_id(&self, name: &str, action: &str) -> String {
        let count = self
            .records
            .iter()
            .filter(|r| match r {
                HistoryRecord::ResourceEvent {
                    scope: EventScope::External,
                    name: n,
                    action: a,
                    ..
                } => n == name && a == action,
                _ => false,
            })
            .count();
        format!("{name}.{action}_{count}")
    }

    /// Delete every blob belonging to this workflow.
    ///
    /// # Errors
    ///
    /// Returns an error if a blob cannot be deleted.
    pub async fn discard(&mut self) -> Result<(), HistorianError> {
        for key in &self.keys {
            self.store
                .delete_blob(key)
                .await
                .map_err(HistorianError::Storage)?;
        }
        self.store
            .delete_blob(&index_key(&self.workflow_id))
            .await
            .map_err(HistorianError::Storage)?;
        self.records.clear();
        self.keys.clear();
        Ok(())
    }

    /// Fold the full history into a single archive blob, then delete the
    /// per-record blobs and the live index.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive write or the cleanup fails.
    pub async fn archive(&mut self) -> Result<(), HistorianError> {
        let archive = json!({
            "workflow_id": self.workflow_id,
            "input": self.input,
            "archived_at": chrono::Utc::now(),
            "records": serde_json::to_value(&self.records)?,
        });
        self.store
            .write_blob(&format!("archive:{}", self.workflow_id), &archive)
            .await
            .map_err(HistorianError::Storage)?;
        self.discard().await
    }

    async fn remove_indices(&mut self, indices: &[usize]) -> Result<(), HistorianError> {
        let doomed: HashSet<usize> = indices.iter().copied().collect();
        for &idx in indices {
            self.store
                .delete_blob(&self.keys[idx])
                .await
                .map_err(HistorianError::Storage)?;
        }
        let mut kept_records = Vec::with_capacity(self.records.len() - doomed.len());
        let mut kept_keys = Vec::with_capacity(self.keys.len() - doomed.len());
        for (idx, (record, key)) in self
            .records
            .drain(..)
            .zip(self.keys.drain(..))
            .enumerate()
        {
            if !doomed.contains(&idx) {
                kept_records.push(record);
                kept_keys.push(key);
            }
        }
        self.records = kept_records;
        self.keys = kept_keys;
        self.persist_index().await
    }

    async fn persist_index(&self) -> Result<(), HistorianError> {
        let index = json!({
            "workflow_id": self.workflow_id,
            "input": self.input,
            "records": self.keys,
        });
        self.store
            .write_blob(&index_key(&self.workflow_id), &index)
            .await
            .map_err(HistorianError::Storage)
    }
}

impl std::fmt::Debug for HistoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryLog")
            .field("workflow_id", &self.workflow_id)
            .field("records", &self.records.len())
            .finish()
    }
}

fn index_key(workflow_id: &str) -> String {
    format!("index:{workflow_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryBlobStore;
    use crate::record::EventScope;
    use crate::resource::ResourceKind;
    use chrono::Utc;

    fn step_start(task: &str, event: &str) -> HistoryRecord {
        HistoryRecord::StepStart {
            timestamp: Utc::now(),
            task_id: task.to_string(),
            event_id: event.to_string(),
        }
    }

    fn step_end(task: &str, event: &str) -> HistoryRecord {
        HistoryRecord::StepEnd {
            timestamp: Utc::now(),
            task_id: task.to_string(),
            event_id: event.to_string(),
            result: Some(json!(null)),
            error: None,
        }
    }

    fn created(task: &str, event: &str, name: &str) -> HistoryRecord {
        HistoryRecord::ResourceCreated {
            timestamp: Utc::now(),
            task_id: task.to_string(),
            event_id: event.to_string(),
            resource: ResourceKind::Queue,
            name: name.to_string(),
            identity: None,
            initial: None,
        }
    }

    fn removed(task: &str, event: &str, name: &str) -> HistoryRecord {
        HistoryRecord::ResourceRemoved {
            timestamp: Utc::now(),
            task_id: task.to_string(),
            event_id: event.to_string(),
            name: name.to_string(),
            identity: None,
        }
    }

    fn touched(task: &str, event: &str, name: &str) -> HistoryRecord {
        HistoryRecord::ResourceEvent {
            timestamp: Utc::now(),
            task_id: task.to_string(),
            event_id: event.to_string(),
            scope: EventScope::Internal,
            name: name.to_string(),
            identity: None,
            action: "put".to_string(),
            args: vec![json!("x")],
            result: None,
        }
    }

    async fn log_with(records: Vec<HistoryRecord>) -> (HistoryLog, Arc<InMemoryBlobStore>) {
        let store = Arc::new(InMemoryBlobStore::new());
        let mut log = HistoryLog::load(store.clone(), "wf", Value::Null)
            .await
            .unwrap();
        for record in records {
            log.append(record).await.unwrap();
        }
        (log, store)
    }

    #[tokio::test]
    async fn reload_reconstructs_record_order() {
        let (log, store) = log_with(vec![
            step_start("wf", "wf.outer_0"),
            created("wf", "wf.scratch.create_0", "scratch"),
            step_end("wf", "wf.outer_0"),
        ])
        .await;
        let original: Vec<HistoryRecord> = log.records().to_vec();

        let reloaded = HistoryLog::load(store, "wf", Value::Null).await.unwrap();
        assert_eq!(reloaded.records(), original.as_slice());
    }

    #[tokio::test]
    async fn pruning_drops_step_scoped_resource_records() {
        let (mut log, store) = log_with(vec![
            step_start("wf", "wf.outer_0"),
            created("wf", "wf.scratch.create_0", "scratch"),
            touched("wf", "wf.scratch.put_0", "scratch"),
            removed("wf", "wf.scratch.remove_0", "scratch"),
            step_end("wf", "wf.outer_0"),
        ])
        .await;

        let pruned = log.prune_finished_step(4).await.unwrap();
        assert_eq!(pruned, 3);
        assert_eq!(log.records().len(), 2);
        assert!(log.iter().all(|r| r.resource_ref().is_none()));

        // Removal is durable: a reload sees the pruned log.
        let reloaded = HistoryLog::load(store, "wf", Value::Null).await.unwrap();
        assert_eq!(reloaded.records().len(), 2);
    }

    #[tokio::test]
    async fn pruning_keeps_outside_created_resources() {
        let (mut log, _store) = log_with(vec![
            created("wf", "wf.board.create_0", "board"),
            step_start("wf", "wf.outer_0"),
            touched("wf", "wf.board.put_0", "board"),
            step_end("wf", "wf.outer_0"),
        ])
        .await;

        let pruned = log.prune_finished_step(3).await.unwrap();
        assert_eq!(pruned, 0);
        assert_eq!(log.records().len(), 4);
    }

    #[tokio::test]
    async fn pruning_keeps_resources_touched_by_other_tasks() {
        let (mut log, _store) = log_with(vec![
            step_start("wf", "wf.outer_0"),
            created("wf", "wf.scratch.create_0", "scratch"),
            touched("wf.helper_0", "wf.helper_0.scratch.get_0", "scratch"),
            removed("wf", "wf.scratch.remove_0", "scratch"),
            step_end("wf", "wf.outer_0"),
        ])
        .await;

        let pruned = log.prune_finished_step(4).await.unwrap();
        assert_eq!(pruned, 0);
        assert_eq!(log.records().len(), 5);
    }

    #[tokio::test]
    async fn unremoved_resources_are_not_pruned() {
        // A fault unwound the step before its scratch queue was removed;
        // the resource is still live, so its records must stay.
        let (mut log, _store) = log_with(vec![
            step_start("wf", "wf.outer_0"),
            created("wf", "wf.scratch.create_0", "scratch"),
            touched("wf", "wf.scratch.put_0", "scratch"),
            step_end("wf", "wf.outer_0"),
        ])
        .await;

        let pruned = log.prune_finished_step(3).await.unwrap();
        assert_eq!(pruned, 0);
    }

    #[tokio::test]
    async fn remove_deletes_record_and_blob() {
        let (mut log, store) = log_with(vec![
            step_start("wf", "wf.a_0"),
            step_start("wf", "wf.b_0"),
        ])
        .await;
        let doomed = log.records()[0].clone();

        assert!(log.remove(&doomed).await.unwrap());
        assert_eq!(log.records().len(), 1);
        assert_eq!(log.records()[0].event_id(), "wf.b_0");
        assert!(!store.has_blob(&doomed.blob_key()).await.unwrap());

        // Removing something already gone is not an error.
        assert!(!log.remove(&doomed).await.unwrap());
    }

    #[tokio::test]
    async fn external_ids_count_per_name_and_action() {
        let (mut log, _store) = log_with(vec![]).await;
        assert_eq!(log.next_external_id("commands", "put"), "commands.put_0");

        log.append(HistoryRecord::ResourceEvent {
            timestamp: Utc::now(),
            task_id: EXTERNAL_TASK.to_string(),
            event_id: "commands.put_0".to_string(),
            scope: EventScope::External,
            name: "commands".to_string(),
            identity: None,
            action: "put".to_string(),
            args: vec![json!("a")],
            result: None,
        })
        .await
        .unwrap();

        assert_eq!(log.next_external_id("commands", "put"), "commands.put_1");
        assert_eq!(log.next_external_id("commands", "get"), "commands.get_0");
    }

    #[tokio::test]
    async fn discard_removes_every_blob() {
        let (mut log, store) = log_with(vec![step_start("wf", "wf.a_0")]).await;
        assert!(store.len() > 0);
        log.discard().await.unwrap();
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn archive_folds_history_into_one_blob() {
        let (mut log, store) = log_with(vec![step_start("wf", "wf.a_0")]).await;
        log.archive().await.unwrap();
        assert_eq!(store.len(), 1);
        let archive = store.read_blob("archive:wf").await.unwrap();
        assert_eq!(archive["workflow_id"], "wf");
        assert_eq!(archive["records"][0]["type"], "step_start");
    }
}
