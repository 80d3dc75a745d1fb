//! Error taxonomy for the replay engine.
//!
//! Three channels are kept strictly apart:
//!
//! - [`WorkflowError::Suspended`] is a control signal, not a failure. It
//!   unwinds a task cleanly when a resource action has no data ready and is
//!   caught once at the task boundary.
//! - [`WorkflowFault`] is an exception raised by workflow code. It is
//!   recorded with a stable kind tag, message and details, and re-raised
//!   identically on every replay until the workflow is deleted.
//! - [`HistorianError`] is an engine-level failure: storage I/O, a replay
//!   divergence, or a rejected external request. These halt loudly and are
//!   never recorded into history.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result type threaded through workflow code and engine calls.
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Error channel seen by workflow bodies.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The task cannot proceed without data it does not yet have.
    ///
    /// Propagate with `?`; the engine catches it at the task boundary and
    /// parks the workflow for a later resume.
    #[error("workflow suspended")]
    Suspended,

    /// An exception raised by workflow code, recorded and replayed.
    #[error(transparent)]
    Fault(#[from] WorkflowFault),

    /// An engine failure that must halt the run.
    #[error(transparent)]
    Fatal(#[from] HistorianError),
}

/// A recorded workflow exception.
///
/// Faults are serialized into the history log as `{kind, message, details}`
/// and re-raised with identical content whenever the failing step is
/// replayed. Typed errors are recovered through an [`ErrorRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WorkflowFault {
    /// Stable tag identifying the error class.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Structured payload for typed reconstruction.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl WorkflowFault {
    /// Create a fault with a kind tag and message.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: Value::Null,
        }
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

impl From<anyhow::Error> for WorkflowFault {
    fn from(err: anyhow::Error) -> Self {
        Self::new("error", err.to_string())
    }
}

/// Engine-level failures.
#[derive(Debug, thiserror::Error)]
pub enum HistorianError {
    /// A replayed internal event disagrees with what history recorded.
    ///
    /// This is a programming error in the workflow (non-determinism); the
    /// run halts rather than silently diverge.
    #[error("replay diverged from history: {0}")]
    Divergence(String),

    /// An external actor tried to act on a resource scoped to a different
    /// identity. Rejected immediately, never recorded.
    #[error("identity violation: resource '{name}' is not visible to {identity:?}")]
    IdentityViolation {
        name: String,
        identity: Option<String>,
    },

    /// No live resource matches the requested name and identity.
    #[error("unknown resource '{name}' for identity {identity:?}")]
    UnknownResource {
        name: String,
        identity: Option<String>,
    },

    /// An external action had no data to satisfy it (e.g. `get` on an
    /// empty queue). External callers do not suspend; they get this error.
    #[error("resource '{name}' has no data ready for '{action}'")]
    NotReady { name: String, action: String },

    /// The action is not defined for this resource type.
    #[error("action '{action}' is not valid for resource '{name}'")]
    InvalidAction { name: String, action: String },

    /// A resource with this name and identity already exists.
    #[error("resource '{name}' already exists for identity {identity:?}")]
    ResourceExists {
        name: String,
        identity: Option<String>,
    },

    /// A run is already in progress for this workflow.
    #[error("workflow '{0}' is already running")]
    AlreadyRunning(String),

    /// Persisted history could not be read back.
    #[error("corrupt history: {0}")]
    Corrupt(String),

    /// Record (de)serialization failed.
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),

    /// Blob storage failure, propagated from the backend without retry.
    #[error("storage: {0}")]
    Storage(#[source] anyhow::Error),
}

type FaultDecoder =
    dyn Fn(&WorkflowFault) -> Box<dyn std::error::Error + Send + Sync> + Send + Sync;

/// Registry mapping stable fault kinds to typed error decoders.
///
/// Workflow callers register each recoverable error type once under its
/// kind tag; [`ErrorRegistry::decode`] turns a recorded fault back into the
/// typed error. Unregistered kinds decode to the generic [`WorkflowFault`]
/// carrying the original message.
#[derive(Default)]
pub struct ErrorRegistry {
    decoders: HashMap<String, Box<FaultDecoder>>,
}

impl ErrorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for a fault kind.
    pub fn register<F>(&mut self, kind: impl Into<String>, decoder: F)
    where
        F: Fn(&WorkflowFault) -> Box<dyn std::error::Error + Send + Sync>
            + Send
            + Sync
            + 'static,
    {
        self.decoders.insert(kind.into(), Box::new(decoder));
    }

    /// Decode a recorded fault into its registered error type.
    #[must_use]
    pub fn decode(&self, fault: &WorkflowFault) -> Box<dyn std::error::Error + Send + Sync> {
        match self.decoders.get(&fault.kind) {
            Some(decoder) => decoder(fault),
            None => Box::new(fault.clone()),
        }
    }
}

impl std::fmt::Debug for ErrorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRegistry")
            .field("kinds", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("payment declined: {code}")]
    struct PaymentDeclined {
        code: i64,
    }

    #[test]
    fn fault_round_trips_through_json() {
        let fault = WorkflowFault::new("payment_declined", "card rejected")
            .with_details(serde_json::json!({ "code": 51 }));
        let json = serde_json::to_value(&fault).unwrap();
        let back: WorkflowFault = serde_json::from_value(json).unwrap();
        assert_eq!(back, fault);
    }

    #[test]
    fn registry_decodes_registered_kind() {
        let mut registry = ErrorRegistry::new();
        registry.register("payment_declined", |fault| {
            Box::new(PaymentDeclined {
                code: fault.details["code"].as_i64().unwrap_or(0),
            })
        });

        let fault = WorkflowFault::new("payment_declined", "card rejected")
            .with_details(serde_json::json!({ "code": 51 }));
        let decoded = registry.decode(&fault);
        assert_eq!(decoded.to_string(), "payment declined: 51");
    }

    #[test]
    fn registry_falls_back_to_generic_fault() {
        let registry = ErrorRegistry::new();
        let fault = WorkflowFault::new("unregistered", "mystery failure");
        let decoded = registry.decode(&fault);
        assert_eq!(decoded.to_string(), "unregistered: mystery failure");
    }
}
