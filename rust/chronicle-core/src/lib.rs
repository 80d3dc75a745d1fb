//! Chronicle: a durable workflow replay engine.
//!
//! This crate lets a long-running, checkpointable program be suspended at
//! any point — process crash, deliberate shutdown, or a voluntary yield
//! while waiting for external input — and later resumed from exactly where
//! it left off, by deterministically replaying a recorded history of its
//! past decisions instead of re-executing side effects.
//!
//! # Architecture
//!
//! - Every **step** and resource action gets a deterministic id derived
//!   from its nesting path and an invocation counter, so replay can tell
//!   the 1st, 2nd and 3rd call to the same operation apart.
//! - The **history log** is an ordered, append-only sequence of immutable
//!   records, mirrored to a pluggable [`backends::BlobStore`].
//! - The **step engine** returns cached historical results instead of
//!   re-invoking side-effecting functions.
//! - **Resources** (state, queue, event, identity-queue) mediate all
//!   interaction with the outside world, scoped by `(name, identity)`.
//! - The **task scheduler** interleaves concurrently progressing
//!   sub-workflows against one shared history, gating each task on its own
//!   records in log order.
//! - **Suspension** is a clean unwind threaded through `Result`, never a
//!   crash, so the log is always left resumable.
//! - **Versioning** records the version active when a guarded region was
//!   first reached, keeping old histories replayable after redeploys.
//!
//! # Usage
//!
//! ```rust,ignore
//! use chronicle_core::prelude::*;
//!
//! let store = FileBlobStore::new("./data/workflows").await?;
//! let historian = Historian::new(
//!     "demo",
//!     store,
//!     |ctx| Box::pin(async move {
//!         let inbox = ctx.queue("inbox", None).await?;
//!         let item = inbox.get(&ctx).await?; // suspends until delivered
//!         inbox.remove(&ctx).await?;
//!         Ok(item)
//!     }),
//!     serde_json::Value::Null,
//!     HistorianConfig::default(),
//! ).await?;
//!
//! // First run parks on the empty queue; deliver and resume.
//! historian.run().await?;
//! historian.record_external_event("inbox", None, "put", vec!["hi".into()]).await?;
//! let outcome = historian.run().await?;
//! ```

pub mod backends;
pub mod context;
pub mod error;
pub mod historian;
pub mod history;
pub mod ids;
pub mod record;
pub mod resource;
pub mod task;
pub mod version;

mod gate;

// Re-exports
pub use context::WorkflowCtx;
pub use error::{WorkflowError, WorkflowFault, WorkflowResult};
pub use historian::{Historian, HistorianConfig, RunOutcome, WorkflowStatus};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backends::{BlobStore, InMemoryBlobStore};
    #[cfg(feature = "fs-backend")]
    pub use crate::backends::FileBlobStore;
    pub use crate::context::{
        EventHandle, IdentityQueueHandle, QueueHandle, StateHandle, TaskFuture, WorkflowCtx,
    };
    pub use crate::error::{
        ErrorRegistry, HistorianError, WorkflowError, WorkflowFault, WorkflowResult,
    };
    pub use crate::historian::{
        CancelPolicy, Historian, HistorianConfig, RunOutcome, WorkflowStatus,
    };
    pub use crate::record::{EventScope, HistoryRecord};
    pub use crate::resource::{ResourceKind, ResourceSnapshot};
    pub use crate::task::{TaskHandle, TaskStatus};
    pub use crate::version::VersionTag;
}
