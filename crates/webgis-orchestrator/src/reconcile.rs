//! Reconciliation engine: applies resolved jobs to the tree and the tracker.
//!
//! Runs on the scheduler's reconcile loop, one completion at a time. On success
//! the confirmed change is replayed onto the tree; on failure the tree is left
//! alone and the error goes into the batch's failure report. Tokens are released
//! only after the tree reflects the outcome.

use crate::events::OrchestratorEvent;
use crate::intent::FollowUp;
use crate::job::{BatchId, Job, JobId, JobOutcome, JobOutput, TreeChange};
use crate::report::{BatchReport, FailureEntry, JobSuccess, SkipReason, SkippedJob};
use crate::tracker::{LockRequest, OperationKind, OperationStateTracker, Token};
use crate::tree::ResourceTree;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webgis_core::{Error, ResourceId};

/// Per-batch accounting kept until every job of the batch has resolved.
pub struct BatchLedger {
    pub report: BatchReport,
    pub pending: usize,
    pub abort_on_first_failure: bool,
    /// Fires when the user cancels the handle.
    pub cancel: CancellationToken,
    /// Fires on the first failure of a fail-fast batch.
    pub abort: CancellationToken,
    /// Synthetic batch record, released with the report.
    pub batch_token: Option<Token>,
    pub follow_up: Option<FollowUp>,
    pub reply: Option<oneshot::Sender<BatchReport>>,
}

/// Second stage of a batch, ready to be dispatched by the scheduler.
pub struct StageReady {
    pub batch: BatchId,
    pub group: ResourceId,
    pub token: Arc<Token>,
    pub follow_up: FollowUp,
    pub cancel: CancellationToken,
    pub abort: CancellationToken,
}

pub struct ReconciliationEngine {
    tree: Arc<RwLock<ResourceTree>>,
    tracker: OperationStateTracker,
    events: broadcast::Sender<OrchestratorEvent>,
    /// Jobs already replayed onto the tree, forgotten when their batch completes.
    applied: HashMap<JobId, BatchId>,
    batches: HashMap<BatchId, BatchLedger>,
}

impl ReconciliationEngine {
    pub fn new(
        tree: Arc<RwLock<ResourceTree>>,
        tracker: OperationStateTracker,
        events: broadcast::Sender<OrchestratorEvent>,
    ) -> Self {
        Self {
            tree,
            tracker,
            events,
            applied: HashMap::new(),
            batches: HashMap::new(),
        }
    }

    pub fn register(&mut self, batch: BatchId, ledger: BatchLedger) {
        debug!(batch = %batch, jobs = ledger.pending, "Batch registered");
        self.batches.insert(batch, ledger);
    }

    /// Account for jobs added to a batch after registration (second stage).
    pub fn extend(&mut self, batch: BatchId, jobs: usize) {
        if let Some(ledger) = self.batches.get_mut(&batch) {
            ledger.pending += jobs;
        }
    }

    pub fn pending_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn remembered_jobs(&self) -> usize {
        self.applied.len()
    }

    /// Apply one resolved job. Returns a second stage to dispatch, if the job unlocked one.
    pub fn reconcile(&mut self, job: Job, outcome: JobOutcome) -> Option<StageReady> {
        let batch = job.batch;
        let cancelled = self
            .batches
            .get(&batch)
            .is_some_and(|l| l.cancel.is_cancelled());
        let mut stage = None;

        match outcome {
            JobOutcome::Succeeded(output) => {
                let tree_handle = self.tree.clone();
                let mut tree = write_tree(&tree_handle);
                let warnings = self.apply_locked(&mut tree, batch, job.id, &output);
                let follow_up = self.batches.get_mut(&batch).and_then(|l| l.follow_up.take());
                stage = match (follow_up, output.main_resource) {
                    (Some(follow_up), Some(group)) => {
                        self.prepare_stage(&tree, batch, group, follow_up)
                    }
                    (Some(follow_up), None) => {
                        self.skip_follow_up(batch, &follow_up);
                        None
                    }
                    (None, _) => None,
                };
                drop(tree);

                for target in &job.targets {
                    self.tracker.clear_failure(*target);
                }
                if let (Some(resource), false) = (output.main_resource, cancelled) {
                    let _ = self
                        .events
                        .send(OrchestratorEvent::ResourceReady { batch, id: resource });
                }
                info!(job = %job.id, item = %job.item, late_cancel = cancelled, "Job succeeded");
                if let Some(ledger) = self.batches.get_mut(&batch) {
                    ledger.report.warnings.extend(warnings);
                    ledger.report.succeeded.push(JobSuccess {
                        job: job.id,
                        item: job.item.clone(),
                        resource: output.main_resource,
                        cancelled_late: cancelled,
                    });
                }
            }

            JobOutcome::Failed(error) => {
                let target = job.payload.primary_target();
                warn!(job = %job.id, item = %job.item, error = %error, "Job failed");
                self.tracker.record_failure(target, error.clone());
                if let Some(ledger) = self.batches.get_mut(&batch) {
                    if ledger.abort_on_first_failure && !ledger.abort.is_cancelled() {
                        info!(batch = %batch, "Fail-fast batch aborting unstarted jobs");
                        ledger.abort.cancel();
                    }
                    ledger.report.failures.push(FailureEntry {
                        job: job.id,
                        target,
                        item: job.item.clone(),
                        error,
                    });
                }
                if let Some(follow_up) = self.batches.get_mut(&batch).and_then(|l| l.follow_up.take()) {
                    self.skip_follow_up(batch, &follow_up);
                }
            }

            JobOutcome::Cancelled => self.skip_job(&job, SkipReason::Cancelled),
            JobOutcome::Aborted => self.skip_job(&job, SkipReason::Aborted),
        }

        // Tokens go last: the tree already reflects the outcome when the lock disappears.
        drop(job);

        if let Some(ready) = &stage {
            self.extend(ready.batch, ready.follow_up.layers.len());
        }
        self.resolve_one(batch);
        stage
    }

    /// Replay a successful output onto the tree. A job id is applied at most once
    /// while its batch is live.
    pub fn apply_success(&mut self, batch: BatchId, job: JobId, output: &JobOutput) -> Vec<String> {
        let tree_handle = self.tree.clone();
        let mut tree = write_tree(&tree_handle);
        self.apply_locked(&mut tree, batch, job, output)
    }

    fn apply_locked(
        &mut self,
        tree: &mut ResourceTree,
        batch: BatchId,
        job: JobId,
        output: &JobOutput,
    ) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.applied.insert(job, batch).is_some() {
            debug!(job = %job, "Outcome already applied");
            return warnings;
        }
        for change in &output.changes {
            if let Err(e) = self.apply_change(tree, change) {
                warn!(job = %job, error = %e, "Could not mirror confirmed change");
                warnings.push(format!("{}: {}", job, e));
            }
        }
        warnings
    }

    fn apply_change(&self, tree: &mut ResourceTree, change: &TreeChange) -> Result<(), Error> {
        match change {
            TreeChange::Inserted(data) => {
                if tree.contains(data.id) {
                    return Ok(());
                }
                let parent = data
                    .parent
                    .ok_or_else(|| Error::invalid_intent(format!("resource {} has no parent", data.id)))?;
                tree.insert(parent, data.clone())?;
                self.notify(parent);
            }
            TreeChange::Removed { id, .. } => {
                if !tree.contains(*id) {
                    return Ok(());
                }
                let parent = tree.get(*id)?.parent;
                // The remote already removed the whole subtree.
                for gone in tree.remove(*id, true)? {
                    self.tracker.clear_failure(gone);
                }
                if let Some(parent) = parent {
                    self.notify(parent);
                }
            }
            TreeChange::Renamed { id, name } => {
                tree.rename(*id, name)?;
                self.notify(*id);
            }
            TreeChange::Moved { id, new_parent } => {
                let old_parent = tree.get(*id)?.parent;
                tree.move_node(*id, *new_parent)?;
                if let Some(old_parent) = old_parent {
                    self.notify(old_parent);
                }
                self.notify(*new_parent);
            }
            TreeChange::MetadataUpdated { id, entries } => {
                tree.update_metadata(*id, entries)?;
                self.notify(*id);
            }
            TreeChange::ContentUpdated { id, metadata } => {
                if metadata.is_empty() {
                    tree.touch(*id)?;
                } else {
                    tree.update_metadata(*id, metadata)?;
                }
                self.notify(*id);
            }
            TreeChange::ChildrenListed { parent, children } => {
                for child in children {
                    if !tree.contains(child.id) {
                        let mut child = child.clone();
                        child.parent = Some(*parent);
                        tree.insert(*parent, child)?;
                    }
                }
                tree.mark_children_loaded(*parent)?;
                self.notify(*parent);
            }
        }
        Ok(())
    }

    fn prepare_stage(
        &mut self,
        tree: &ResourceTree,
        batch: BatchId,
        group: ResourceId,
        follow_up: FollowUp,
    ) -> Option<StageReady> {
        // Locked while the tree is still write-held, so nobody can grab the new group first.
        let (cancel, abort) = match self.batches.get(&batch) {
            Some(ledger) => (ledger.cancel.clone(), ledger.abort.clone()),
            None => return None,
        };
        let request = LockRequest::new(group, OperationKind::Importing);
        match self.tracker.try_acquire_all(tree, &[request], Some(batch)) {
            Ok(tokens) => tokens.into_iter().next().map(|token| StageReady {
                batch,
                group,
                token: Arc::new(token),
                follow_up,
                cancel,
                abort,
            }),
            Err(busy) => {
                warn!(batch = %batch, error = %busy, "Could not lock the new group");
                if let Some(ledger) = self.batches.get_mut(&batch) {
                    ledger.report.warnings.push(busy.to_string());
                }
                self.skip_follow_up(batch, &follow_up);
                None
            }
        }
    }

    fn skip_job(&mut self, job: &Job, reason: SkipReason) {
        debug!(job = %job.id, reason = ?reason, "Job skipped");
        if let Some(ledger) = self.batches.get_mut(&job.batch) {
            ledger.report.skipped.push(SkippedJob {
                job: Some(job.id),
                item: job.item.clone(),
                reason,
            });
        }
        if let Some(follow_up) = self.batches.get_mut(&job.batch).and_then(|l| l.follow_up.take()) {
            self.skip_follow_up(job.batch, &follow_up);
        }
    }

    fn skip_follow_up(&mut self, batch: BatchId, follow_up: &FollowUp) {
        if let Some(ledger) = self.batches.get_mut(&batch) {
            ledger
                .report
                .skipped
                .extend(follow_up.layers.iter().map(|layer| SkippedJob {
                    job: None,
                    item: layer.display_name.clone(),
                    reason: SkipReason::DependencyFailed,
                }));
        }
    }

    fn resolve_one(&mut self, batch: BatchId) {
        let done = match self.batches.get_mut(&batch) {
            Some(ledger) => {
                ledger.pending = ledger.pending.saturating_sub(1);
                ledger.pending == 0
            }
            None => false,
        };
        if done {
            self.finish(batch);
        }
    }

    fn finish(&mut self, batch: BatchId) {
        let Some(mut ledger) = self.batches.remove(&batch) else {
            return;
        };
        drop(ledger.batch_token.take());
        self.applied.retain(|_, owner| *owner != batch);
        let report = ledger.report;
        info!(
            batch = %batch,
            succeeded = report.succeeded.len(),
            failed = report.failures.len(),
            skipped = report.skipped.len(),
            "Batch completed: {}",
            report.failures.summary()
        );
        let _ = self.events.send(OrchestratorEvent::BatchCompleted {
            batch,
            failures: report.failures.len(),
        });
        if let Some(reply) = ledger.reply.take() {
            if reply.send(report).is_err() {
                warn!(batch = %batch, "Handle dropped before the report was consumed");
            }
        }
    }

    fn notify(&self, id: ResourceId) {
        let _ = self.events.send(OrchestratorEvent::TreeChanged { id });
    }
}

fn write_tree(tree: &RwLock<ResourceTree>) -> RwLockWriteGuard<'_, ResourceTree> {
    tree.write().unwrap_or_else(PoisonError::into_inner)
}
