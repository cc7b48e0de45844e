//! Job scheduler: admission control and concurrent execution of jobs.
//!
//! `submit` plans the intent against the cached tree, takes every lock the
//! intent needs in one all-or-nothing step, and spawns one task per job. Jobs
//! suspend only around the remote call; a semaphore bounds how many remote calls
//! are in flight. Every resolved job is sent back to a single reconcile loop,
//! the only place the tree is written, which hands the batch report to the
//! caller's [`Handle`] once the last job of the batch is in.

use crate::events::OrchestratorEvent;
use crate::intent::{self, follow_up_jobs, Intent, PlannedJob};
use crate::job::{BatchId, Job, JobId, JobOutcome, JobOutput, JobPayload, JobState, TreeChange};
use crate::reconcile::{BatchLedger, ReconciliationEngine, StageReady};
use crate::remote::RemoteResourceClient;
use crate::report::BatchReport;
use crate::retry::with_retry;
use crate::tracker::{OperationKey, OperationRecord, OperationStateTracker, Token};
use crate::tree::ResourceTree;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tokio::sync::{broadcast, mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use webgis_core::{
    Error, OrchestratorConfig, ResourceId, Result, RetryConfig, SchedulerConfig,
};

/// Per-submission overrides of the configured defaults.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchOptions {
    pub abort_on_first_failure: Option<bool>,
}

impl BatchOptions {
    pub fn fail_fast() -> Self {
        Self {
            abort_on_first_failure: Some(true),
        }
    }
}

enum LoopMessage {
    Register {
        batch: BatchId,
        ledger: BatchLedger,
    },
    Completed {
        job: Job,
        outcome: JobOutcome,
        /// Held until the outcome is reconciled, so a fail-fast abort is visible
        /// to the next queued job before it can start.
        permit: Option<OwnedSemaphorePermit>,
    },
    Shutdown,
}

/// State shared by `submit` and the reconcile loop for spawning jobs.
struct Dispatcher {
    remote: Arc<dyn RemoteResourceClient>,
    retry: RetryConfig,
    permits: Arc<Semaphore>,
    loop_tx: mpsc::UnboundedSender<LoopMessage>,
    events: broadcast::Sender<OrchestratorEvent>,
    job_states: DashMap<JobId, JobState>,
    next_job: AtomicU64,
}

impl Dispatcher {
    fn make_job(
        &self,
        batch: BatchId,
        planned: PlannedJob,
        tokens: &HashMap<ResourceId, Arc<Token>>,
    ) -> Job {
        let id = JobId(self.next_job.fetch_add(1, Ordering::Relaxed));
        let held = planned
            .targets
            .iter()
            .filter_map(|target| tokens.get(target).cloned())
            .collect();
        Job {
            id,
            batch,
            item: planned.item,
            targets: planned.targets,
            payload: planned.payload,
            tokens: held,
        }
    }

    fn set_state(&self, job: &Job, state: JobState) {
        self.job_states.insert(job.id, state);
        let _ = self.events.send(OrchestratorEvent::JobStateChanged {
            batch: job.batch,
            job: job.id,
            state,
        });
    }

    fn spawn(self: &Arc<Self>, job: Job, cancel: CancellationToken, abort: CancellationToken) {
        self.set_state(&job, JobState::Queued);
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run(job, cancel, abort).await });
    }

    /// `abort` is a child of `cancel`, so it fires on either.
    async fn run(self: Arc<Self>, job: Job, cancel: CancellationToken, abort: CancellationToken) {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.complete(job, JobOutcome::Cancelled, None),
            _ = abort.cancelled() => return self.complete(job, JobOutcome::Aborted, None),
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return self.complete(job, JobOutcome::Failed(Error::Shutdown), None),
            },
        };
        // Checked again: the permit may have been granted in the same tick as the signal.
        if cancel.is_cancelled() {
            return self.complete(job, JobOutcome::Cancelled, Some(permit));
        }
        if abort.is_cancelled() {
            return self.complete(job, JobOutcome::Aborted, Some(permit));
        }

        self.set_state(&job, JobState::Running);
        debug!(job = %job.id, item = %job.item, "Remote call issued");
        let result = with_retry(
            &self.retry,
            &abort,
            |attempt| self.set_state(&job, JobState::Retrying { attempt }),
            |_| self.set_state(&job, JobState::Running),
            || execute(self.remote.as_ref(), &job.payload),
        )
        .await;
        self.set_state(&job, JobState::Done);

        let outcome = match result {
            Ok(output) => JobOutcome::Succeeded(output),
            Err(e) => JobOutcome::Failed(e),
        };
        self.complete(job, outcome, Some(permit));
    }

    fn complete(&self, job: Job, outcome: JobOutcome, permit: Option<OwnedSemaphorePermit>) {
        // If the loop is gone the job is dropped here, which releases its tokens.
        let _ = self.loop_tx.send(LoopMessage::Completed {
            job,
            outcome,
            permit,
        });
    }

    fn dispatch_stage(self: &Arc<Self>, stage: StageReady) {
        let tokens = HashMap::from([(stage.group, stage.token)]);
        let jobs = follow_up_jobs(stage.group, &stage.follow_up);
        info!(batch = %stage.batch, group = %stage.group, jobs = jobs.len(), "Dispatching second stage");
        for planned in jobs {
            let job = self.make_job(stage.batch, planned, &tokens);
            self.spawn(job, stage.cancel.clone(), stage.abort.clone());
        }
    }
}

/// Perform the remote side of a job and describe the confirmed change.
async fn execute(remote: &dyn RemoteResourceClient, payload: &JobPayload) -> Result<JobOutput> {
    let output = match payload {
        JobPayload::CreateNode { parent, spec } => {
            let node = remote.create_node(*parent, spec.clone()).await?;
            inserted(node, *parent)
        }
        JobPayload::Delete { id, recursive } => {
            remote.delete_node(*id, *recursive).await?;
            JobOutput {
                changes: vec![TreeChange::Removed {
                    id: *id,
                    recursive: *recursive,
                }],
                main_resource: None,
            }
        }
        JobPayload::Rename { id, name } => {
            remote.rename_node(*id, name).await?;
            edited(*id, TreeChange::Renamed {
                id: *id,
                name: name.clone(),
            })
        }
        JobPayload::Move { id, new_parent } => {
            remote.move_node(*id, *new_parent).await?;
            edited(*id, TreeChange::Moved {
                id: *id,
                new_parent: *new_parent,
            })
        }
        JobPayload::Copy { id, new_parent } => {
            let node = remote.copy_node(*id, *new_parent).await?;
            inserted(node, *new_parent)
        }
        JobPayload::ImportLayer { parent, source } => {
            let node = remote.import_layer(*parent, source.clone()).await?;
            inserted(node, *parent)
        }
        JobPayload::Publish {
            layer,
            parent,
            service,
        } => {
            let descriptor = remote.publish_service(*layer, *parent, *service).await?;
            debug!(url = %descriptor.url, "Service published");
            inserted(descriptor.node, *parent)
        }
        JobPayload::UpdateStyle { id, style } => {
            let metadata = remote.update_style(*id, style.clone()).await?;
            edited(*id, TreeChange::ContentUpdated { id: *id, metadata })
        }
        JobPayload::OverwriteLayer { id, source } => {
            let metadata = remote.overwrite_layer(*id, source.clone()).await?;
            edited(*id, TreeChange::ContentUpdated { id: *id, metadata })
        }
        JobPayload::UpdateMetadata { id, entries } => {
            remote.update_metadata(*id, entries).await?;
            edited(*id, TreeChange::MetadataUpdated {
                id: *id,
                entries: entries.clone(),
            })
        }
        JobPayload::ListChildren { parent } => {
            let children = remote.list_children(*parent).await?;
            JobOutput {
                changes: vec![TreeChange::ChildrenListed {
                    parent: *parent,
                    children,
                }],
                main_resource: None,
            }
        }
    };
    Ok(output)
}

fn inserted(mut node: webgis_core::NodeData, parent: ResourceId) -> JobOutput {
    node.parent.get_or_insert(parent);
    let id = node.id;
    JobOutput {
        changes: vec![TreeChange::Inserted(node)],
        main_resource: Some(id),
    }
}

fn edited(id: ResourceId, change: TreeChange) -> JobOutput {
    JobOutput {
        changes: vec![change],
        main_resource: Some(id),
    }
}

async fn reconcile_loop(
    mut rx: mpsc::UnboundedReceiver<LoopMessage>,
    mut engine: ReconciliationEngine,
    dispatcher: Arc<Dispatcher>,
) {
    info!("Reconcile loop started");
    while let Some(message) = rx.recv().await {
        match message {
            LoopMessage::Register { batch, ledger } => engine.register(batch, ledger),
            LoopMessage::Completed {
                job,
                outcome,
                permit,
            } => {
                let job_id = job.id;
                if let Some(stage) = engine.reconcile(job, outcome) {
                    dispatcher.dispatch_stage(stage);
                }
                dispatcher.job_states.remove(&job_id);
                drop(permit);
            }
            LoopMessage::Shutdown => {
                info!(pending = engine.pending_batches(), "Reconcile loop: received Shutdown");
                break;
            }
        }
    }
    info!("Reconcile loop stopped");
}

/// Caller's view of an admitted intent.
pub struct Handle {
    canceller: Canceller,
    reply: oneshot::Receiver<BatchReport>,
}

impl Handle {
    pub fn id(&self) -> BatchId {
        self.canceller.batch
    }

    /// Best-effort, never destructive: jobs that have not issued their remote call
    /// are skipped; calls already in flight finish and are reconciled.
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.canceller.is_cancelled()
    }

    /// Detached canceller, usable while `wait` holds the handle.
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Wait for every job of the batch and take the report.
    pub async fn wait(self) -> Result<BatchReport> {
        self.reply.await.map_err(|_| Error::Shutdown)
    }
}

#[derive(Clone)]
pub struct Canceller {
    batch: BatchId,
    cancel: CancellationToken,
    tracker: OperationStateTracker,
}

impl Canceller {
    pub fn cancel(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let flagged = self.tracker.mark_cancelled(self.batch);
        info!(batch = %self.batch, records = flagged, "Batch cancellation requested");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct JobScheduler {
    tree: Arc<RwLock<ResourceTree>>,
    tracker: OperationStateTracker,
    dispatcher: Arc<Dispatcher>,
    events: broadcast::Sender<OrchestratorEvent>,
    config: SchedulerConfig,
    next_batch: AtomicU64,
}

impl JobScheduler {
    /// Start a scheduler over `tree`. Must be called inside a tokio runtime.
    pub fn new(
        tree: ResourceTree,
        remote: Arc<dyn RemoteResourceClient>,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.scheduler.event_buffer.max(1));
        let tracker = OperationStateTracker::with_events(events.clone());
        let tree = Arc::new(RwLock::new(tree));
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::new(Dispatcher {
            remote,
            retry: config.retry.clone(),
            permits: Arc::new(Semaphore::new(config.scheduler.max_concurrent_jobs.max(1))),
            loop_tx,
            events: events.clone(),
            job_states: DashMap::new(),
            next_job: AtomicU64::new(1),
        });
        let engine = ReconciliationEngine::new(tree.clone(), tracker.clone(), events.clone());
        tokio::spawn(reconcile_loop(loop_rx, engine, dispatcher.clone()));

        Self {
            tree,
            tracker,
            dispatcher,
            events,
            config: config.scheduler,
            next_batch: AtomicU64::new(1),
        }
    }

    pub fn submit(&self, intent: Intent) -> Result<Handle> {
        self.submit_with(intent, BatchOptions::default())
    }

    /// Validate, lock and dispatch. Validation and lock conflicts are returned here;
    /// per-job remote failures only ever show up in the batch report.
    pub fn submit_with(&self, intent: Intent, options: BatchOptions) -> Result<Handle> {
        let batch = BatchId(self.next_batch.fetch_add(1, Ordering::Relaxed));
        let (plan, tokens) = {
            let tree = self.read_tree();
            let plan = intent::plan(&intent, &tree)?;
            let tokens = self
                .tracker
                .try_acquire_all(&tree, &plan.locks, Some(batch))
                .map_err(|busy| {
                    info!(batch = %batch, intent = %intent.label(), error = %busy, "Intent rejected");
                    Error::from(busy)
                })?;
            (plan, tokens)
        };

        let tokens: HashMap<ResourceId, Arc<Token>> = tokens
            .into_iter()
            .filter_map(|token| match token.key() {
                OperationKey::Resource(id) => Some((id, Arc::new(token))),
                OperationKey::Batch(_) => None,
            })
            .collect();
        let jobs: Vec<Job> = plan
            .jobs
            .into_iter()
            .map(|planned| self.dispatcher.make_job(batch, planned, &tokens))
            .collect();
        drop(tokens);

        let cancel = CancellationToken::new();
        let abort = cancel.child_token();
        let (reply_tx, reply_rx) = oneshot::channel();
        let ledger = BatchLedger {
            report: BatchReport::new(batch, intent.label()),
            pending: jobs.len(),
            abort_on_first_failure: options
                .abort_on_first_failure
                .unwrap_or(self.config.abort_on_first_failure),
            cancel: cancel.clone(),
            abort: abort.clone(),
            batch_token: Some(self.tracker.register_batch(batch, plan.kind)),
            follow_up: plan.follow_up,
            reply: Some(reply_tx),
        };
        self.dispatcher
            .loop_tx
            .send(LoopMessage::Register { batch, ledger })
            .map_err(|_| Error::Shutdown)?;

        info!(batch = %batch, intent = %intent.label(), jobs = jobs.len(), "Intent admitted");
        for job in jobs {
            self.dispatcher.spawn(job, cancel.clone(), abort.clone());
        }

        Ok(Handle {
            canceller: Canceller {
                batch,
                cancel,
                tracker: self.tracker.clone(),
            },
            reply: reply_rx,
        })
    }

    /// Read-only view of the cached tree.
    pub fn tree(&self) -> RwLockReadGuard<'_, ResourceTree> {
        self.read_tree()
    }

    pub fn query(&self, id: ResourceId) -> Option<OperationRecord> {
        self.tracker.query(id)
    }

    pub fn query_batch(&self, batch: BatchId) -> Option<OperationRecord> {
        self.tracker.query_key(OperationKey::Batch(batch))
    }

    pub fn active_operations(&self) -> Vec<OperationRecord> {
        self.tracker.active()
    }

    pub fn last_error(&self, id: ResourceId) -> Option<Error> {
        self.tracker.last_error(id)
    }

    pub fn job_state(&self, job: JobId) -> Option<JobState> {
        self.dispatcher.job_states.get(&job).map(|s| *s)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, ResourceTree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        let _ = self.dispatcher.loop_tx.send(LoopMessage::Shutdown);
    }
}
