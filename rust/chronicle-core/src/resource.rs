//! Resource model: state, queue, event and identity-queue primitives.
//!
//! Resources mediate all interaction between a workflow and the outside
//! world. Each one is addressed by `(name, identity)`: a `None` identity is
//! globally public, anything else scopes the resource privately to that
//! caller. Every action — whether performed by workflow code or delivered
//! by an external caller — is stamped into the history log, so the table
//! can be rebuilt record-for-record on replay.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::error::HistorianError;
use crate::record::HistoryRecord;

/// The four resource primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A single mutable value: `get` / `set`.
    State,
    /// A FIFO of values: `put` / `get`; `get` suspends when empty.
    Queue,
    /// A boolean flag: `set` / `clear` / `wait`; `wait` suspends when unset.
    Event,
    /// A FIFO of `(identity, value)` pairs; `put` mints a fresh identity.
    IdentityQueue,
}

/// Address of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub name: String,
    pub identity: Option<String>,
}

impl ResourceKey {
    /// Build a key from a name and optional identity.
    #[must_use]
    pub fn new(name: impl Into<String>, identity: Option<String>) -> Self {
        Self {
            name: name.into(),
            identity,
        }
    }
}

/// Shallow, externally visible view of one live resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    /// Resource name.
    pub name: String,
    /// Owning identity; `None` is public.
    pub identity: Option<String>,
    /// Resource type.
    pub kind: ResourceKind,
    /// Kind-specific view: state value, queue depth, or event flag.
    pub view: Value,
}

/// Why an action could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ApplyError {
    /// No data to satisfy the action right now.
    NotReady,
    /// The action is not defined for this resource kind.
    InvalidAction,
    /// No resource lives at the key.
    Unknown,
    /// A resource already lives at the key.
    Exists,
    /// A replayed action's outcome disagrees with the recorded one.
    Mismatch(String),
}

/// Live value of one resource.
#[derive(Debug, Clone)]
enum ResourceCell {
    State { value: Value },
    Queue { items: VecDeque<Value> },
    Event { set: bool },
    IdentityQueue { items: VecDeque<(String, Value)> },
}

impl ResourceCell {
    fn new(kind: ResourceKind, initial: Option<Value>) -> Self {
        match kind {
            ResourceKind::State => Self::State {
                value: initial.unwrap_or(Value::Null),
            },
            ResourceKind::Queue => Self::Queue {
                items: VecDeque::new(),
            },
            ResourceKind::Event => Self::Event { set: false },
            ResourceKind::IdentityQueue => Self::IdentityQueue {
                items: VecDeque::new(),
            },
        }
    }

    fn kind(&self) -> ResourceKind {
        match self {
            Self::State { .. } => ResourceKind::State,
            Self::Queue { .. } => ResourceKind::Queue,
            Self::Event { .. } => ResourceKind::Event,
            Self::IdentityQueue { .. } => ResourceKind::IdentityQueue,
        }
    }

    fn view(&self) -> Value {
        match self {
            Self::State { value } => value.clone(),
            Self::Queue { items } => json!({ "depth": items.len() }),
            Self::Event { set } => json!({ "set": set }),
            Self::IdentityQueue { items } => json!({ "depth": items.len() }),
        }
    }

    /// Apply an action live, computing a fresh result.
    fn apply_live(&mut self, action: &str, args: &[Value]) -> Result<Option<Value>, ApplyError> {
        match (self, action) {
            (Self::State { value }, "get") => Ok(Some(value.clone())),
            (Self::State { value }, "set") => {
                *value = args.first().cloned().unwrap_or(Value::Null);
                Ok(None)
            }
            (Self::Queue { items }, "put") => {
                items.push_back(args.first().cloned().unwrap_or(Value::Null));
                Ok(None)
            }
            (Self::Queue { items }, "get") => items.pop_front().map(Some).ok_or(ApplyError::NotReady),
            (Self::Event { set }, "set") => {
                *set = true;
                Ok(None)
            }
            (Self::Event { set }, "clear") => {
                *set = false;
                Ok(None)
            }
            (Self::Event { set }, "wait") => {
                if *set {
                    Ok(None)
                } else {
                    Err(ApplyError::NotReady)
                }
            }
            (Self::IdentityQueue { items }, "put") => {
                let identity = uuid::Uuid::new_v4().to_string();
                items.push_back((identity.clone(), args.first().cloned().unwrap_or(Value::Null)));
                Ok(Some(Value::String(identity)))
            }
            (Self::IdentityQueue { items }, "get") => items
                .pop_front()
                .map(|(identity, value)| Some(json!([identity, value])))
                .ok_or(ApplyError::NotReady),
            _ => Err(ApplyError::InvalidAction),
        }
    }

    /// Re-apply a recorded action, asserting its outcome against history.
    fn apply_replayed(
        &mut self,
        action: &str,
        args: &[Value],
        recorded: Option<&Value>,
    ) -> Result<(), ApplyError> {
        match (self, action) {
            (Self::State { value }, "get") => {
                if recorded != Some(&*value) {
                    return Err(ApplyError::Mismatch(format!(
                        "state get saw {value}, history recorded {recorded:?}"
                    )));
                }
                Ok(())
            }
            (Self::State { value }, "set") => {
                *value = args.first().cloned().unwrap_or(Value::Null);
                Ok(())
            }
            (Self::Queue { items }, "put") => {
                items.push_back(args.first().cloned().unwrap_or(Value::Null));
                Ok(())
            }
            (Self::Queue { items }, "get") => {
                let popped = items.pop_front().ok_or(ApplyError::NotReady)?;
                if recorded != Some(&popped) {
                    return Err(ApplyError::Mismatch(format!(
                        "queue get popped {popped}, history recorded {recorded:?}"
                    )));
                }
                Ok(())
            }
            (Self::Event { set }, "set") => {
                *set = true;
                Ok(())
            }
            (Self::Event { set }, "clear") => {
                *set = false;
                Ok(())
            }
            (Self::Event { set }, "wait") => {
                if *set {
                    Ok(())
                } else {
                    Err(ApplyError::Mismatch(
                        "event wait replayed against an unset flag".to_string(),
                    ))
                }
            }
            (Self::IdentityQueue { items }, "put") => {
                // The minted identity is authoritative from the record.
                let identity = recorded
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ApplyError::Mismatch(
                            "identity put record carries no identity".to_string(),
                        )
                    })?
                    .to_string();
                items.push_back((identity, args.first().cloned().unwrap_or(Value::Null)));
                Ok(())
            }
            (Self::IdentityQueue { items }, "get") => {
                let (identity, value) = items.pop_front().ok_or(ApplyError::NotReady)?;
                let popped = json!([identity, value]);
                if recorded != Some(&popped) {
                    return Err(ApplyError::Mismatch(format!(
                        "identity get popped {popped}, history recorded {recorded:?}"
                    )));
                }
                Ok(())
            }
            _ => Err(ApplyError::InvalidAction),
        }
    }
}

/// Table of currently live resources.
#[derive(Debug, Default)]
struct ResourceTable {
    cells: HashMap<ResourceKey, ResourceCell>,
}

/// Shared resource state for one workflow: the live table plus a change
/// broadcast that feeds `stream_resources` subscribers.
///
/// The table survives across runs — resources left alive by a suspension
/// stay visible to external callers — and is rebuilt from history at the
/// start of every run.
pub(crate) struct ResourceHub {
    table: Mutex<ResourceTable>,
    changes: broadcast::Sender<()>,
}

impl ResourceHub {
    pub(crate) fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity);
        Self {
            table: Mutex::new(ResourceTable::default()),
            changes,
        }
    }

    /// Drop all live resources; replay rebuilds the table.
    pub(crate) fn reset(&self) {
        self.table.lock().cells.clear();
        let _ = self.changes.send(());
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }

    pub(crate) fn create_live(
        &self,
        key: &ResourceKey,
        kind: ResourceKind,
        initial: Option<Value>,
    ) -> Result<(), ApplyError> {
        let mut table = self.table.lock();
        if table.cells.contains_key(key) {
            return Err(ApplyError::Exists);
        }
        table
            .cells
            .insert(key.clone(), ResourceCell::new(kind, initial));
        drop(table);
        let _ = self.changes.send(());
        Ok(())
    }

    pub(crate) fn remove_live(&self, key: &ResourceKey) -> Result<(), ApplyError> {
        let removed = self.table.lock().cells.remove(key);
        if removed.is_none() {
            return Err(ApplyError::Unknown);
        }
        let _ = self.changes.send(());
        Ok(())
    }

    pub(crate) fn apply_live(
        &self,
        key: &ResourceKey,
        action: &str,
        args: &[Value],
    ) -> Result<Option<Value>, ApplyError> {
        let mut table = self.table.lock();
        let cell = table.cells.get_mut(key).ok_or(ApplyError::Unknown)?;
        let result = cell.apply_live(action, args)?;
        drop(table);
        let _ = self.changes.send(());
        Ok(result)
    }

    /// Re-apply one recorded record to the live table during replay.
    pub(crate) fn replay_record(&self, record: &HistoryRecord) -> Result<(), HistorianError> {
        match record {
            HistoryRecord::ResourceCreated {
                resource,
                name,
                identity,
                initial,
                ..
            } => {
                let key = ResourceKey::new(name.clone(), identity.clone());
                self.create_live(&key, *resource, initial.clone())
                    .map_err(|err| divergence(record, &err))
            }
            HistoryRecord::ResourceRemoved { name, identity, .. } => {
                let key = ResourceKey::new(name.clone(), identity.clone());
                self.remove_live(&key).map_err(|err| divergence(record, &err))
            }
            HistoryRecord::ResourceEvent {
                name,
                identity,
                action,
                args,
                result,
                ..
            } => {
                let key = ResourceKey::new(name.clone(), identity.clone());
                let mut table = self.table.lock();
                let cell = table
                    .cells
                    .get_mut(&key)
                    .ok_or_else(|| divergence(record, &ApplyError::Unknown))?;
                cell.apply_replayed(action, args, result.as_ref())
                    .map_err(|err| divergence(record, &err))?;
                drop(table);
                let _ = self.changes.send(());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Resolve the key an external caller may act on: its own private
    /// resource first, then the public one; anything else is a violation.
    pub(crate) fn resolve_external(
        &self,
        name: &str,
        identity: Option<&str>,
    ) -> Result<ResourceKey, HistorianError> {
        let table = self.table.lock();
        let exact = ResourceKey::new(name, identity.map(str::to_string));
        if table.cells.contains_key(&exact) {
            return Ok(exact);
        }
        let public = ResourceKey::new(name, None);
        if table.cells.contains_key(&public) {
            return Ok(public);
        }
        if table.cells.keys().any(|key| key.name == name) {
            return Err(HistorianError::IdentityViolation {
                name: name.to_string(),
                identity: identity.map(str::to_string),
            });
        }
        Err(HistorianError::UnknownResource {
            name: name.to_string(),
            identity: identity.map(str::to_string),
        })
    }

    /// Snapshot the resources visible to `identity`, re-derived on every
    /// call. Public entries are shadowed by a same-named private one.
    pub(crate) fn snapshot(&self, identity: Option<&str>) -> HashMap<String, ResourceSnapshot> {
        let table = self.table.lock();
        let mut out = HashMap::new();
        for (key, cell) in table
            .cells
            .iter()
            .filter(|(key, _)| key.identity.is_none())
        {
            out.insert(key.name.clone(), snapshot_of(key, cell));
        }
        if identity.is_some() {
            for (key, cell) in table
                .cells
                .iter()
                .filter(|(key, _)| key.identity.as_deref() == identity)
            {
                out.insert(key.name.clone(), snapshot_of(key, cell));
            }
        }
        out
    }

    pub(crate) fn contains(&self, key: &ResourceKey) -> bool {
        self.table.lock().cells.contains_key(key)
    }
}

impl std::fmt::Debug for ResourceHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHub")
            .field("live", &self.table.lock().cells.len())
            .finish()
    }
}

fn snapshot_of(key: &ResourceKey, cell: &ResourceCell) -> ResourceSnapshot {
    ResourceSnapshot {
        name: key.name.clone(),
        identity: key.identity.clone(),
        kind: cell.kind(),
        view: cell.view(),
    }
}

fn divergence(record: &HistoryRecord, err: &ApplyError) -> HistorianError {
    HistorianError::Divergence(format!(
        "replaying {} '{}' failed: {err:?}",
        record.record_type(),
        record.event_id()
    ))
}
