//! Jobs: the unit of work the scheduler dispatches and the reconciler applies

use crate::tracker::Token;
use serde::Serialize;
use std::sync::Arc;
use webgis_core::{
    Error, LayerSource, MetadataEntry, NodeData, NodeSpec, ResourceId, ServiceKind, StyleSource,
};

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Identity of an admitted intent. Doubles as the synthetic operation key for multi-item intents.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// Lifecycle of a job as seen by the UI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Admitted, waiting for a concurrency permit.
    Queued,
    /// Remote call issued.
    Running,
    /// Waiting out the backoff before retry `attempt`.
    Retrying { attempt: u32 },
    Done,
}

/// What a job asks of the remote service.
#[derive(Clone, Debug)]
pub enum JobPayload {
    CreateNode { parent: ResourceId, spec: NodeSpec },
    Delete { id: ResourceId, recursive: bool },
    Rename { id: ResourceId, name: String },
    Move { id: ResourceId, new_parent: ResourceId },
    Copy { id: ResourceId, new_parent: ResourceId },
    ImportLayer { parent: ResourceId, source: LayerSource },
    Publish { layer: ResourceId, parent: ResourceId, service: ServiceKind },
    UpdateStyle { id: ResourceId, style: StyleSource },
    UpdateMetadata { id: ResourceId, entries: Vec<MetadataEntry> },
    OverwriteLayer { id: ResourceId, source: LayerSource },
    ListChildren { parent: ResourceId },
}

impl JobPayload {
    /// Resource this payload is about, for reports.
    pub fn primary_target(&self) -> ResourceId {
        match self {
            Self::CreateNode { parent, .. }
            | Self::ImportLayer { parent, .. }
            | Self::ListChildren { parent } => *parent,
            Self::Delete { id, .. }
            | Self::Rename { id, .. }
            | Self::Move { id, .. }
            | Self::Copy { id, .. }
            | Self::UpdateStyle { id, .. }
            | Self::UpdateMetadata { id, .. }
            | Self::OverwriteLayer { id, .. } => *id,
            Self::Publish { layer, .. } => *layer,
        }
    }
}

/// A confirmed remote change, replayed onto the tree by the reconciler.
#[derive(Clone, Debug, PartialEq)]
pub enum TreeChange {
    Inserted(NodeData),
    Removed { id: ResourceId, recursive: bool },
    Renamed { id: ResourceId, name: String },
    Moved { id: ResourceId, new_parent: ResourceId },
    MetadataUpdated { id: ResourceId, entries: Vec<MetadataEntry> },
    /// Content replaced remotely; `metadata` lists what the remote rewrote alongside.
    ContentUpdated { id: ResourceId, metadata: Vec<MetadataEntry> },
    ChildrenListed { parent: ResourceId, children: Vec<NodeData> },
}

/// Successful job result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobOutput {
    pub changes: Vec<TreeChange>,
    /// Resource the user should be pointed at once the job is reconciled.
    pub main_resource: Option<ResourceId>,
}

/// Resolution of a job after dispatch.
#[derive(Clone, Debug)]
pub enum JobOutcome {
    Succeeded(JobOutput),
    Failed(Error),
    /// Never reached the remote: cancelled by the user.
    Cancelled,
    /// Never reached the remote: a sibling failed under fail-fast semantics.
    Aborted,
}

/// A unit of work with its targets, payload and the tokens it holds.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub batch: BatchId,
    /// Human label of the item (layer name, resource name).
    pub item: String,
    /// Ordered resource identities touched by the job.
    pub targets: Vec<ResourceId>,
    pub payload: JobPayload,
    /// Shared with sibling jobs locking the same resource; released when the last holder resolves.
    pub tokens: Vec<Arc<Token>>,
}
