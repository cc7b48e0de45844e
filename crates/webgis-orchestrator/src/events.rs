//! Push notifications for observers (tree widgets, status bars, logs).
//!
//! Emitted through a `tokio::sync::broadcast` channel after every state
//! transition. Observers subscribe and drop their receiver whenever they like;
//! the orchestrator never waits on them.

use crate::job::{BatchId, JobId, JobState};
use crate::tracker::{OperationKey, OperationKind};
use serde::Serialize;
use webgis_core::ResourceId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A lock was granted and a record is now visible through `query`.
    OperationStarted {
        key: OperationKey,
        kind: OperationKind,
    },
    /// The record for `key` went away.
    OperationFinished {
        key: OperationKey,
        kind: OperationKind,
    },
    JobStateChanged {
        batch: BatchId,
        job: JobId,
        state: JobState,
    },
    /// A cached resource (or the children list of one) changed.
    TreeChanged { id: ResourceId },
    /// The main resource of a job is in the tree and may be selected.
    ResourceReady { batch: BatchId, id: ResourceId },
    BatchCompleted { batch: BatchId, failures: usize },
}
