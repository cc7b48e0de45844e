//! Operation state tracker: which resource is busy with what.
//!
//! `try_acquire` is the single serialization point between operations. It never
//! blocks: a conflicting request gets [`Busy`] immediately and the caller decides
//! whether to queue or reject. Structural operations (delete, move, copy) lock the
//! whole cached subtree and keep its ancestors busy, so neither a rename below nor
//! a rename above can race a delete.

use crate::events::OrchestratorEvent;
use crate::job::BatchId;
use crate::tree::ResourceTree;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;
use webgis_core::{Error, ResourceId};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Creating,
    Deleting,
    Renaming,
    Moving,
    Importing,
    ImportingProject,
    Copying,
    PublishingWfs,
    PublishingWms,
    CreatingWebMap,
    UpdatingStyle,
    CreatingStyle,
    UpdatingMetadata,
    UpdatingLayer,
    Loading,
}

impl OperationKind {
    /// Row status shown next to a busy resource.
    pub fn label(self) -> &'static str {
        match self {
            Self::Creating => "Resource is being created",
            Self::Deleting => "Resource is being deleted",
            Self::Renaming => "Resource is being renamed",
            Self::Moving => "Resource is being moved",
            Self::Importing => "Layer is being imported",
            Self::ImportingProject => "Project is being imported",
            Self::Copying => "Resource is being copied",
            Self::PublishingWfs => "WFS service is being created",
            Self::PublishingWms => "WMS service is being created",
            Self::CreatingWebMap => "Web map is being created",
            Self::UpdatingStyle => "Style for layer is being updated",
            Self::CreatingStyle => "Style for layer is being created",
            Self::UpdatingMetadata => "Metadata is being updated",
            Self::UpdatingLayer => "Resource is being updated",
            Self::Loading => "Loading...",
        }
    }

    pub fn default_scope(self) -> LockScope {
        match self {
            Self::Deleting | Self::Moving | Self::Copying => LockScope::Subtree,
            _ => LockScope::Node,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    Node,
    /// Excludes every operation below it, and any operation above it.
    Subtree,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum OperationKey {
    Resource(ResourceId),
    Batch(BatchId),
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resource(id) => write!(f, "resource {}", id),
            Self::Batch(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperationRecord {
    pub key: OperationKey,
    pub kind: OperationKind,
    pub scope: LockScope,
    pub batch: Option<BatchId>,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
    #[serde(skip)]
    serial: u64,
}

/// One lock in an all-or-nothing acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockRequest {
    pub id: ResourceId,
    pub kind: OperationKind,
    pub scope: LockScope,
}

impl LockRequest {
    pub fn new(id: ResourceId, kind: OperationKind) -> Self {
        Self {
            id,
            kind,
            scope: kind.default_scope(),
        }
    }

    pub fn node(id: ResourceId, kind: OperationKind) -> Self {
        Self {
            id,
            kind,
            scope: LockScope::Node,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("resource {requested} is busy: {holder} ({kind})")]
pub struct Busy {
    pub requested: ResourceId,
    pub holder: OperationKey,
    pub kind: OperationKind,
}

impl From<Busy> for Error {
    fn from(busy: Busy) -> Self {
        Error::Conflict(busy.to_string())
    }
}

#[derive(Default)]
struct TrackerState {
    records: HashMap<OperationKey, OperationRecord>,
    last_errors: HashMap<ResourceId, Error>,
}

struct TrackerInner {
    state: Mutex<TrackerState>,
    serial: AtomicU64,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl TrackerInner {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, key: OperationKey, serial: u64) -> bool {
        let released = {
            let mut state = self.lock();
            match state.records.get(&key) {
                Some(record) if record.serial == serial => state.records.remove(&key),
                _ => None,
            }
        };
        match released {
            Some(record) => {
                debug!(key = %key, kind = ?record.kind, "Operation released");
                let _ = self.events.send(OrchestratorEvent::OperationFinished {
                    key,
                    kind: record.kind,
                });
                true
            }
            None => false,
        }
    }
}

/// Proof of an admitted operation. Released explicitly or when dropped.
pub struct Token {
    key: OperationKey,
    kind: OperationKind,
    serial: u64,
    inner: Arc<TrackerInner>,
}

impl Token {
    pub fn key(&self) -> OperationKey {
        self.key
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("serial", &self.serial)
            .finish()
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.inner.release(self.key, self.serial);
    }
}

/// Cheaply cloneable handle over the shared operation table.
#[derive(Clone)]
pub struct OperationStateTracker {
    inner: Arc<TrackerInner>,
}

impl Default for OperationStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationStateTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self::with_events(events)
    }

    pub fn with_events(events: broadcast::Sender<OrchestratorEvent>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                state: Mutex::new(TrackerState::default()),
                serial: AtomicU64::new(1),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.inner.events.subscribe()
    }

    /// Acquire a single lock with the kind's default scope.
    pub fn try_acquire(
        &self,
        tree: &ResourceTree,
        id: ResourceId,
        kind: OperationKind,
    ) -> Result<Token, Busy> {
        let mut tokens = self.try_acquire_all(tree, &[LockRequest::new(id, kind)], None)?;
        Ok(tokens.remove(0))
    }

    /// All-or-nothing acquisition. On conflict nothing is held and the first clash is returned.
    ///
    /// Requests for the same identity are merged (first kind wins, widest scope wins).
    pub fn try_acquire_all(
        &self,
        tree: &ResourceTree,
        requests: &[LockRequest],
        batch: Option<BatchId>,
    ) -> Result<Vec<Token>, Busy> {
        let mut merged: Vec<LockRequest> = Vec::with_capacity(requests.len());
        for request in requests {
            match merged.iter_mut().find(|m| m.id == request.id) {
                Some(existing) => {
                    if request.scope == LockScope::Subtree {
                        existing.scope = LockScope::Subtree;
                    }
                }
                None => merged.push(*request),
            }
        }

        let mut state = self.inner.lock();
        let mut granted: Vec<(OperationKey, u64, OperationKind)> = Vec::new();
        for request in &merged {
            if let Some(busy) = find_conflict(&state.records, tree, request, &granted) {
                for (key, _, _) in &granted {
                    state.records.remove(key);
                }
                debug!(id = %request.id, holder = %busy.holder, "Acquisition refused");
                return Err(busy);
            }
            let serial = self.inner.serial.fetch_add(1, Ordering::Relaxed);
            let key = OperationKey::Resource(request.id);
            state.records.insert(
                key,
                OperationRecord {
                    key,
                    kind: request.kind,
                    scope: request.scope,
                    batch,
                    started_at: Utc::now(),
                    cancelled: false,
                    serial,
                },
            );
            granted.push((key, serial, request.kind));
        }
        drop(state);

        Ok(granted
            .into_iter()
            .map(|(key, serial, kind)| self.issue(key, serial, kind))
            .collect())
    }

    /// Register the synthetic record of a multi-item intent. Never conflicts.
    pub fn register_batch(&self, batch: BatchId, kind: OperationKind) -> Token {
        let serial = self.inner.serial.fetch_add(1, Ordering::Relaxed);
        let key = OperationKey::Batch(batch);
        self.inner.lock().records.insert(
            key,
            OperationRecord {
                key,
                kind,
                scope: LockScope::Node,
                batch: Some(batch),
                started_at: Utc::now(),
                cancelled: false,
                serial,
            },
        );
        self.issue(key, serial, kind)
    }

    /// Idempotent. Returns whether this call released the record.
    pub fn release(&self, token: &Token) -> bool {
        self.inner.release(token.key, token.serial)
    }

    pub fn query(&self, id: ResourceId) -> Option<OperationRecord> {
        self.query_key(OperationKey::Resource(id))
    }

    pub fn query_key(&self, key: OperationKey) -> Option<OperationRecord> {
        self.inner.lock().records.get(&key).cloned()
    }

    pub fn is_busy(&self, id: ResourceId) -> bool {
        self.query(id).is_some()
    }

    /// Every live record, oldest first.
    pub fn active(&self) -> Vec<OperationRecord> {
        let mut records: Vec<OperationRecord> = self.inner.lock().records.values().cloned().collect();
        records.sort_by_key(|r| r.serial);
        records
    }

    /// Flag every record owned by `batch` as cancelled.
    pub fn mark_cancelled(&self, batch: BatchId) -> usize {
        let mut state = self.inner.lock();
        let mut flagged = 0;
        for record in state.records.values_mut() {
            if record.batch == Some(batch) && !record.cancelled {
                record.cancelled = true;
                flagged += 1;
            }
        }
        flagged
    }

    /// Remember the last failure on a resource so the UI can flag the row.
    pub fn record_failure(&self, id: ResourceId, error: Error) {
        self.inner.lock().last_errors.insert(id, error);
    }

    pub fn clear_failure(&self, id: ResourceId) {
        self.inner.lock().last_errors.remove(&id);
    }

    pub fn last_error(&self, id: ResourceId) -> Option<Error> {
        self.inner.lock().last_errors.get(&id).cloned()
    }

    fn issue(&self, key: OperationKey, serial: u64, kind: OperationKind) -> Token {
        let _ = self
            .inner
            .events
            .send(OrchestratorEvent::OperationStarted { key, kind });
        Token {
            key,
            kind,
            serial,
            inner: self.inner.clone(),
        }
    }
}

/// A request clashes with a holder of the same id, a subtree holder above or below it,
/// or, when it is itself subtree-scoped, with any holder below it. Locks granted
/// earlier in the same acquisition never clash with each other.
fn find_conflict(
    records: &HashMap<OperationKey, OperationRecord>,
    tree: &ResourceTree,
    request: &LockRequest,
    granted: &[(OperationKey, u64, OperationKind)],
) -> Option<Busy> {
    let busy = |holder: &OperationRecord| Busy {
        requested: request.id,
        holder: holder.key,
        kind: holder.kind,
    };
    let foreign = |id: ResourceId| {
        let key = OperationKey::Resource(id);
        if granted.iter().any(|(own, _, _)| *own == key) {
            return None;
        }
        records.get(&key)
    };

    if let Some(holder) = records.get(&OperationKey::Resource(request.id)) {
        return Some(busy(holder));
    }
    for ancestor in tree.ancestors(request.id) {
        if let Some(holder) = foreign(ancestor) {
            if holder.scope == LockScope::Subtree {
                return Some(busy(holder));
            }
        }
    }
    for descendant in tree.descendants(request.id) {
        if let Some(holder) = foreign(descendant) {
            if request.scope == LockScope::Subtree || holder.scope == LockScope::Subtree {
                return Some(busy(holder));
            }
        }
    }
    None
}
