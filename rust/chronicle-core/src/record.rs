//! History record types.
//!
//! Records are immutable once written. Each one is persisted as a JSON
//! document with a `type` tag, an ISO-8601 UTC timestamp, the id of the
//! task that produced it and the unique event id of the operation, plus
//! type-specific fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::WorkflowFault;
use crate::resource::ResourceKind;

/// Task id stamped on records produced by external callers.
///
/// External events form a pseudo-task: they are interleaved into the same
/// ordered stream as task records and re-applied at the same log position
/// during replay.
pub const EXTERNAL_TASK: &str = "external";

/// Namespace for content-hashed record blob keys.
const RECORD_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6f0c_8a7e_41d2_4f3b_9b6a_2d5e_8c1f_7a90);

/// Direction a resource event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    /// Performed by workflow code; asserted equal against history on replay.
    Internal,
    /// Delivered by an outside caller; recorded once, replayed verbatim.
    External,
}

/// One entry in the append-only history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryRecord {
    /// A step began executing.
    StepStart {
        timestamp: DateTime<Utc>,
        task_id: String,
        event_id: String,
    },

    /// A step finished, with its cached result or recorded fault.
    ///
    /// Absent for a step that was open when the workflow suspended; resume
    /// re-enters that step body and replays its sub-records.
    StepEnd {
        timestamp: DateTime<Utc>,
        task_id: String,
        event_id: String,
        result: Option<Value>,
        error: Option<WorkflowFault>,
    },

    /// A resource came into existence.
    ResourceCreated {
        timestamp: DateTime<Utc>,
        task_id: String,
        event_id: String,
        resource: ResourceKind,
        name: String,
        identity: Option<String>,
        initial: Option<Value>,
    },

    /// A resource was destroyed on normal scope exit.
    ResourceRemoved {
        timestamp: DateTime<Utc>,
        task_id: String,
        event_id: String,
        name: String,
        identity: Option<String>,
    },

    /// An action performed on a resource, from inside or outside.
    ResourceEvent {
        timestamp: DateTime<Utc>,
        task_id: String,
        event_id: String,
        scope: EventScope,
        name: String,
        identity: Option<String>,
        action: String,
        args: Vec<Value>,
        result: Option<Value>,
    },

    /// A sub-task was spawned; `event_id` is the new task's id.
    TaskSpawned {
        timestamp: DateTime<Utc>,
        task_id: String,
        event_id: String,
    },

    /// A sub-task was cancelled by `task_id`, so replay does not re-attempt it.
    TaskCancelled {
        timestamp: DateTime<Utc>,
        task_id: String,
        event_id: String,
        target: String,
    },
}

impl HistoryRecord {
    /// Timestamp the record was written.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::StepStart { timestamp, .. }
            | Self::StepEnd { timestamp, .. }
            | Self::ResourceCreated { timestamp, .. }
            | Self::ResourceRemoved { timestamp, .. }
            | Self::ResourceEvent { timestamp, .. }
            | Self::TaskSpawned { timestamp, .. }
            | Self::TaskCancelled { timestamp, .. } => *timestamp,
        }
    }

    /// Id of the task that produced the record.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::StepStart { task_id, .. }
            | Self::StepEnd { task_id, .. }
            | Self::ResourceCreated { task_id, .. }
            | Self::ResourceRemoved { task_id, .. }
            | Self::ResourceEvent { task_id, .. }
            | Self::TaskSpawned { task_id, .. }
            | Self::TaskCancelled { task_id, .. } => task_id,
        }
    }

    /// Unique event id of the operation the record describes.
    #[must_use]
    pub fn event_id(&self) -> &str {
        match self {
            Self::StepStart { event_id, .. }
            | Self::StepEnd { event_id, .. }
            | Self::ResourceCreated { event_id, .. }
            | Self::ResourceRemoved { event_id, .. }
            | Self::ResourceEvent { event_id, .. }
            | Self::TaskSpawned { event_id, .. }
            | Self::TaskCancelled { event_id, .. } => event_id,
        }
    }

    /// Record type tag, matching the serialized `type` field.
    #[must_use]
    pub fn record_type(&self) -> &'static str {
        match self {
            Self::StepStart { .. } => "step_start",
            Self::StepEnd { .. } => "step_end",
            Self::ResourceCreated { .. } => "resource_created",
            Self::ResourceRemoved { .. } => "resource_removed",
            Self::ResourceEvent { .. } => "resource_event",
            Self::TaskSpawned { .. } => "task_spawned",
            Self::TaskCancelled { .. } => "task_cancelled",
        }
    }

    /// The `(name, identity)` pair of the resource this record touches.
    #[must_use]
    pub fn resource_ref(&self) -> Option<(&str, Option<&str>)> {
        match self {
            Self::ResourceCreated { name, identity, .. }
            | Self::ResourceRemoved { name, identity, .. }
            | Self::ResourceEvent { name, identity, .. } => {
                Some((name.as_str(), identity.as_deref()))
            }
            _ => None,
        }
    }

    /// True for events delivered by external callers.
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Self::ResourceEvent {
                scope: EventScope::External,
                ..
            }
        )
    }

    /// Content-hashed storage key for this record's blob.
    #[must_use]
    pub fn blob_key(&self) -> String {
        let material = format!(
            "{}|{}|{}",
            self.timestamp().to_rfc3339(),
            self.event_id(),
            self.record_type()
        );
        Uuid::new_v5(&RECORD_KEY_NAMESPACE, material.as_bytes()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> HistoryRecord {
        HistoryRecord::ResourceEvent {
            timestamp: Utc::now(),
            task_id: "wf".to_string(),
            event_id: "wf.commands.put_0".to_string(),
            scope: EventScope::External,
            name: "commands".to_string(),
            identity: None,
            action: "put".to_string(),
            args: vec![json!("hello")],
            result: None,
        }
    }

    #[test]
    fn records_serialize_with_type_tag() {
        let json = serde_json::to_value(sample_event()).unwrap();
        assert_eq!(json["type"], "resource_event");
        assert_eq!(json["scope"], "external");
        assert_eq!(json["action"], "put");
        assert_eq!(json["args"][0], "hello");
    }

    #[test]
    fn records_round_trip_through_json() {
        let record = sample_event();
        let json = serde_json::to_value(&record).unwrap();
        let back: HistoryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn blob_keys_distinguish_record_types() {
        let ts = Utc::now();
        let start = HistoryRecord::StepStart {
            timestamp: ts,
            task_id: "wf".to_string(),
            event_id: "wf.greet_0".to_string(),
        };
        let end = HistoryRecord::StepEnd {
            timestamp: ts,
            task_id: "wf".to_string(),
            event_id: "wf.greet_0".to_string(),
            result: Some(json!("hi")),
            error: None,
        };
        assert_ne!(start.blob_key(), end.blob_key());
        // Same content, same key.
        assert_eq!(start.blob_key(), start.clone().blob_key());
    }
}
