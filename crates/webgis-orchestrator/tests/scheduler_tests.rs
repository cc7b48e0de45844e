//! End-to-end tests: intents submitted to a scheduler backed by the in-memory remote

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use webgis_core::*;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use webgis_orchestrator::job::{BatchId, Job, JobId, JobOutcome, JobOutput, JobPayload, TreeChange};
use webgis_orchestrator::reconcile::{BatchLedger, ReconciliationEngine};
use webgis_orchestrator::report::BatchReport;
use webgis_orchestrator::{
    BatchOptions, InMemoryRemote, Intent, JobScheduler, JobState, OperationKey, OperationKind,
    OperationStateTracker, OrchestratorEvent, ResourceTree, SkipReason,
};

const ROOT: ResourceId = ResourceId(0);
const PROJECTS: ResourceId = ResourceId(1);
const ARCHIVE: ResourceId = ResourceId(2);
const ROADS: ResourceId = ResourceId(3);
const ROADS_STYLE: ResourceId = ResourceId(4);
const RIVERS: ResourceId = ResourceId(5);
const OLD: ResourceId = ResourceId(6);

fn fixture() -> Vec<NodeData> {
    vec![
        NodeData::new(ROOT, None, ResourceKind::ResourceGroup, "Main"),
        NodeData::new(PROJECTS, Some(ROOT), ResourceKind::ResourceGroup, "Projects"),
        NodeData::new(ARCHIVE, Some(ROOT), ResourceKind::ResourceGroup, "Archive"),
        NodeData::new(ROADS, Some(PROJECTS), ResourceKind::VectorLayer, "roads"),
        NodeData::new(ROADS_STYLE, Some(ROADS), ResourceKind::Style, "roads style"),
        NodeData::new(RIVERS, Some(PROJECTS), ResourceKind::VectorLayer, "rivers"),
        NodeData::new(OLD, Some(ARCHIVE), ResourceKind::ResourceGroup, "old"),
    ]
}

fn config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

fn remote() -> Arc<InMemoryRemote> {
    Arc::new(InMemoryRemote::from_snapshot(fixture()))
}

fn slow_remote(ms: u64) -> Arc<InMemoryRemote> {
    Arc::new(InMemoryRemote::from_snapshot(fixture()).with_latency(Duration::from_millis(ms)))
}

fn scheduler(remote: &Arc<InMemoryRemote>, config: OrchestratorConfig) -> JobScheduler {
    let tree = ResourceTree::from_snapshot(fixture()).unwrap();
    JobScheduler::new(tree, remote.clone(), config)
}

fn layers(names: &[&str]) -> Vec<LayerSource> {
    names
        .iter()
        .map(|name| LayerSource::vector(*name, format!("/data/{}.gpkg", name)))
        .collect()
}

fn child_names(scheduler: &JobScheduler, id: ResourceId) -> Vec<String> {
    scheduler
        .tree()
        .children(id)
        .unwrap()
        .iter()
        .map(|n| n.display_name.clone())
        .collect()
}

fn drain(events: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// ===========================================================================
// Batch imports
// ===========================================================================

#[tokio::test]
async fn batch_import_reports_the_failed_item_and_releases_locks() {
    let remote = remote();
    remote.fail_on_name("B", Error::conflict("layer B already exists"));
    let scheduler = scheduler(&remote, config());

    let handle = scheduler
        .submit(Intent::ImportLayers {
            parent: PROJECTS,
            layers: layers(&["A", "B"]),
        })
        .unwrap();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures.entries()[0];
    assert_eq!(failure.item, "B");
    assert!(matches!(failure.error, Error::Conflict(_)));
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].item, "A");
    assert!(report.is_partial_success());

    let names = child_names(&scheduler, PROJECTS);
    assert!(names.contains(&"A".to_string()));
    assert!(!names.contains(&"B".to_string()));
    assert!(scheduler.query(PROJECTS).is_none());
    assert!(scheduler.active_operations().is_empty());
}

#[tokio::test]
async fn partial_failures_keep_the_successful_layers() {
    let remote = remote();
    remote.fail_on_name("L1", Error::unknown("bad geometry"));
    remote.fail_on_name("L3", Error::access_denied("no write permission"));
    let scheduler = scheduler(&remote, config());

    let report = scheduler
        .submit(Intent::ImportLayers {
            parent: ARCHIVE,
            layers: layers(&["L0", "L1", "L2", "L3", "L4"]),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.succeeded.len(), 3);
    assert_eq!(report.failures.len(), 2);
    assert_eq!(report.failures.summary(), "2 operations failed");
    assert!(report.failures.requires_reauthentication());
    let mut failed: Vec<&str> = report.failures.iter().map(|f| f.item.as_str()).collect();
    failed.sort();
    assert_eq!(failed, vec!["L1", "L3"]);
    assert_eq!(child_names(&scheduler, ARCHIVE), vec!["old", "L0", "L2", "L4"]);
}

#[tokio::test]
async fn no_speculative_insert_before_the_remote_confirms() {
    let remote = slow_remote(40);
    let scheduler = scheduler(&remote, config());

    let handle = scheduler
        .submit(Intent::CreateGroup {
            parent: PROJECTS,
            name: "Survey".into(),
        })
        .unwrap();
    assert!(!child_names(&scheduler, PROJECTS).contains(&"Survey".to_string()));
    assert_eq!(scheduler.query(PROJECTS).unwrap().kind, OperationKind::Creating);
    assert!(scheduler.query_batch(handle.id()).is_some());

    let report = handle.wait().await.unwrap();
    assert!(report.is_success());
    let group = report.main_resource().unwrap();
    let tree = scheduler.tree();
    let node = tree.get(group).unwrap();
    assert_eq!(node.display_name, "Survey");
    assert_eq!(node.parent, Some(PROJECTS));
    assert_eq!(node.revision, 1);
}

#[tokio::test]
async fn fail_fast_aborts_jobs_that_have_not_started() {
    let remote = remote();
    remote.fail_on_name("A", Error::unknown("corrupt file"));
    let mut config = config();
    config.scheduler.max_concurrent_jobs = 1;
    let scheduler = scheduler(&remote, config);

    let report = scheduler
        .submit_with(
            Intent::ImportLayers {
                parent: PROJECTS,
                layers: layers(&["A", "B", "C"]),
            },
            BatchOptions::fail_fast(),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(!report.skipped.is_empty());
    assert!(report.skipped.iter().all(|s| s.reason == SkipReason::Aborted));
    assert_eq!(report.total_jobs(), 3);
    assert!(remote.calls() < 3);
}

#[tokio::test]
async fn without_fail_fast_every_job_is_attempted() {
    let remote = remote();
    remote.fail_on_name("A", Error::unknown("corrupt file"));
    let mut config = config();
    config.scheduler.max_concurrent_jobs = 1;
    let scheduler = scheduler(&remote, config);

    let report = scheduler
        .submit(Intent::ImportLayers {
            parent: PROJECTS,
            layers: layers(&["A", "B", "C"]),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.succeeded.len(), 2);
    assert!(report.skipped.is_empty());
    assert_eq!(remote.calls(), 3);
}

#[tokio::test]
async fn concurrency_ceiling_is_respected() {
    let remote = slow_remote(20);
    let mut config = config();
    config.scheduler.max_concurrent_jobs = 2;
    let scheduler = scheduler(&remote, config);

    let report = scheduler
        .submit(Intent::ImportLayers {
            parent: PROJECTS,
            layers: layers(&["a", "b", "c", "d", "e", "f"]),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.succeeded.len(), 6);
    assert_eq!(remote.max_in_flight(), 2);
}

// ===========================================================================
// Retries
// ===========================================================================

#[tokio::test]
async fn transient_failures_are_retried() {
    let remote = remote();
    remote.fail_on_name_times("flaky", Error::transient("503"), 2);
    let scheduler = scheduler(&remote, config());
    let mut events = scheduler.subscribe();

    let report = scheduler
        .submit(Intent::ImportLayers {
            parent: PROJECTS,
            layers: layers(&["flaky"]),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(remote.calls_for("flaky"), 3);

    // Back to running whenever a retried call goes out.
    let states: Vec<JobState> = drain(&mut events)
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::JobStateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            JobState::Queued,
            JobState::Running,
            JobState::Retrying { attempt: 1 },
            JobState::Running,
            JobState::Retrying { attempt: 2 },
            JobState::Running,
            JobState::Done,
        ]
    );
}

#[tokio::test]
async fn retries_are_bounded() {
    let remote = remote();
    remote.fail_on_name("down", Error::transient("timeout"));
    let mut config = config();
    config.retry.max_retries = 2;
    let scheduler = scheduler(&remote, config);

    let report = scheduler
        .submit(Intent::ImportLayers {
            parent: PROJECTS,
            layers: layers(&["down"]),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.failures.entries()[0].error.code(), "TRANSIENT");
    assert_eq!(remote.calls_for("down"), 3);
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let remote = remote();
    remote.fail_on_name("taken", Error::conflict("exists"));
    let scheduler = scheduler(&remote, config());

    let report = scheduler
        .submit(Intent::ImportLayers {
            parent: PROJECTS,
            layers: layers(&["taken"]),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(remote.calls_for("taken"), 1);
}

// ===========================================================================
// Cancellation
// ===========================================================================

#[tokio::test]
async fn cancel_before_dispatch_skips_every_job() {
    let remote = slow_remote(20);
    let mut config = config();
    config.scheduler.max_concurrent_jobs = 1;
    let scheduler = scheduler(&remote, config);
    let before = scheduler.tree().snapshot();

    let handle = scheduler
        .submit(Intent::ImportLayers {
            parent: PROJECTS,
            layers: layers(&["A", "B", "C"]),
        })
        .unwrap();
    handle.cancel();
    assert!(handle.is_cancelled());
    let report = handle.wait().await.unwrap();

    assert_eq!(report.skipped.len(), 3);
    assert!(report.skipped.iter().all(|s| s.reason == SkipReason::Cancelled));
    assert!(report.failures.is_empty());
    assert!(!report.is_success());
    assert_eq!(remote.calls(), 0);
    assert_eq!(scheduler.tree().snapshot(), before);
}

#[tokio::test]
async fn late_cancel_still_reconciles_the_result() {
    let remote = slow_remote(60);
    let scheduler = scheduler(&remote, config());
    let mut events = scheduler.subscribe();

    let handle = scheduler
        .submit(Intent::CreateGroup {
            parent: ARCHIVE,
            name: "Late".into(),
        })
        .unwrap();
    let canceller = handle.canceller();
    tokio::time::sleep(Duration::from_millis(15)).await;
    canceller.cancel();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.succeeded.len(), 1);
    assert!(report.succeeded[0].cancelled_late);
    assert!(child_names(&scheduler, ARCHIVE).contains(&"Late".to_string()));
    let events = drain(&mut events);
    assert!(!events
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::ResourceReady { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, OrchestratorEvent::BatchCompleted { failures: 0, .. })));
}

#[tokio::test]
async fn cancel_interrupts_backoff() {
    let remote = remote();
    remote.fail_on_name("down", Error::transient("timeout"));
    let mut config = config();
    config.retry.max_retries = 5;
    config.retry.base_delay_ms = 500;
    config.retry.max_delay_ms = 5_000;
    let scheduler = scheduler(&remote, config);

    let handle = scheduler
        .submit(Intent::ImportLayers {
            parent: PROJECTS,
            layers: layers(&["down"]),
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();
    let report = tokio::time::timeout(Duration::from_secs(2), handle.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.failures.entries()[0].error.code(), "TRANSIENT");
    assert_eq!(remote.calls_for("down"), 1);
}

// ===========================================================================
// Admission
// ===========================================================================

#[tokio::test]
async fn overlapping_operations_are_rejected_at_submit() {
    let remote = slow_remote(30);
    let scheduler = scheduler(&remote, config());

    let delete = scheduler
        .submit(Intent::Delete {
            target: PROJECTS,
            recursive: true,
        })
        .unwrap();
    let rename = scheduler.submit(Intent::Rename {
        target: ROADS_STYLE,
        name: "renamed".into(),
    });
    assert!(matches!(rename, Err(Error::Conflict(_))));

    let report = delete.wait().await.unwrap();
    assert!(report.is_success());
    for id in [PROJECTS, ROADS, ROADS_STYLE, RIVERS] {
        assert!(!scheduler.tree().contains(id));
    }
    assert_eq!(remote.len(), 3);
    assert!(scheduler.active_operations().is_empty());
}

#[tokio::test]
async fn parent_cannot_change_while_a_child_is_deleted() {
    let remote = slow_remote(30);
    let scheduler = scheduler(&remote, config());

    let delete = scheduler
        .submit(Intent::Delete {
            target: ROADS,
            recursive: true,
        })
        .unwrap();
    let rename = scheduler.submit(Intent::Rename {
        target: PROJECTS,
        name: "Renamed".into(),
    });
    assert!(matches!(rename, Err(Error::Conflict(_))));

    assert!(delete.wait().await.unwrap().is_success());
    scheduler
        .submit(Intent::Rename {
            target: PROJECTS,
            name: "Renamed".into(),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(scheduler.tree().get(PROJECTS).unwrap().display_name, "Renamed");
}

#[tokio::test]
async fn validation_errors_leave_everything_untouched() {
    let remote = remote();
    let scheduler = scheduler(&remote, config());
    let before = scheduler.tree().snapshot();

    assert_eq!(
        scheduler
            .submit(Intent::Delete {
                target: PROJECTS,
                recursive: false,
            })
            .err(),
        Some(Error::NonEmptyGroup(PROJECTS))
    );
    assert!(matches!(
        scheduler.submit(Intent::Move {
            target: ROOT,
            new_parent: ARCHIVE,
        }),
        Err(Error::InvalidIntent(_))
    ));
    assert_eq!(scheduler.tree().snapshot(), before);
    assert_eq!(remote.calls(), 0);
    assert!(scheduler.active_operations().is_empty());
}

#[tokio::test]
async fn independent_intents_run_side_by_side() {
    let remote = slow_remote(10);
    let scheduler = scheduler(&remote, config());

    let handles = vec![
        scheduler
            .submit(Intent::Rename {
                target: ROADS,
                name: "highways".into(),
            })
            .unwrap(),
        scheduler
            .submit(Intent::Move {
                target: OLD,
                new_parent: PROJECTS,
            })
            .unwrap(),
        scheduler
            .submit(Intent::UpdateMetadata {
                target: RIVERS,
                entries: vec![MetadataEntry::new("owner", "hydro")],
            })
            .unwrap(),
    ];
    let reports = futures::future::join_all(handles.into_iter().map(|h| h.wait())).await;
    assert!(reports.iter().all(|r| r.as_ref().unwrap().is_success()));

    let tree = scheduler.tree();
    assert_eq!(tree.get(ROADS).unwrap().display_name, "highways");
    assert_eq!(tree.get(OLD).unwrap().parent, Some(PROJECTS));
    assert_eq!(tree.get(OLD).unwrap().revision, 2);
    assert_eq!(tree.get(RIVERS).unwrap().metadata["owner"], "hydro");
}

// ===========================================================================
// Individual intents
// ===========================================================================

#[tokio::test]
async fn project_import_creates_group_then_layers() {
    let remote = remote();
    let scheduler = scheduler(&remote, config());

    let report = scheduler
        .submit(Intent::ImportProject {
            parent: ARCHIVE,
            group_name: "Survey 2024".into(),
            layers: layers(&["parcels", "buildings"]),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.succeeded.len(), 3);
    let group = report.main_resource().unwrap();
    assert_eq!(scheduler.tree().get(group).unwrap().display_name, "Survey 2024");
    assert_eq!(child_names(&scheduler, group), vec!["buildings", "parcels"]);
    assert!(scheduler.active_operations().is_empty());
}

#[tokio::test]
async fn project_import_skips_layers_when_the_group_fails() {
    let remote = remote();
    remote.fail_on_name("Survey", Error::conflict("exists"));
    let scheduler = scheduler(&remote, config());

    let report = scheduler
        .submit(Intent::ImportProject {
            parent: ARCHIVE,
            group_name: "Survey".into(),
            layers: layers(&["parcels", "buildings"]),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.skipped.len(), 2);
    assert!(report
        .skipped
        .iter()
        .all(|s| s.reason == SkipReason::DependencyFailed && s.job.is_none()));
    assert_eq!(child_names(&scheduler, ARCHIVE), vec!["old"]);
}

#[tokio::test]
async fn remote_conflict_leaves_the_tree_unchanged_and_flags_the_row() {
    let remote = remote();
    let scheduler = scheduler(&remote, config());

    let report = scheduler
        .submit(Intent::Rename {
            target: RIVERS,
            name: "Roads".into(),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.failures.entries()[0].target, RIVERS);
    assert_eq!(scheduler.tree().get(RIVERS).unwrap().display_name, "rivers");
    assert!(matches!(scheduler.last_error(RIVERS), Some(Error::Conflict(_))));

    // The next successful operation clears the flag.
    scheduler
        .submit(Intent::Rename {
            target: RIVERS,
            name: "streams".into(),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(scheduler.last_error(RIVERS).is_none());
}

#[tokio::test]
async fn copy_adds_a_new_resource_under_the_destination() {
    let remote = remote();
    let scheduler = scheduler(&remote, config());

    let report = scheduler
        .submit(Intent::Copy {
            target: PROJECTS,
            new_parent: ARCHIVE,
        })
        .unwrap()
        .wait()
        .await
        .unwrap();

    let copy = report.main_resource().unwrap();
    assert_ne!(copy, PROJECTS);
    let tree = scheduler.tree();
    assert_eq!(tree.get(copy).unwrap().parent, Some(ARCHIVE));
    assert!(!tree.get(copy).unwrap().children_loaded);
    assert!(tree.contains(PROJECTS));
    assert_eq!(remote.len(), 7 + 4);
}

#[tokio::test]
async fn services_maps_and_styles() {
    let remote = remote();
    let scheduler = scheduler(&remote, config());

    let wfs = scheduler
        .submit(Intent::PublishWfs {
            layer: ROADS,
            max_features: 1000,
        })
        .unwrap()
        .wait()
        .await
        .unwrap();
    let wfs_id = wfs.main_resource().unwrap();
    assert_eq!(scheduler.tree().get(wfs_id).unwrap().kind, ResourceKind::WfsService);
    assert_eq!(scheduler.tree().get(wfs_id).unwrap().parent, Some(PROJECTS));

    let wms = scheduler
        .submit(Intent::PublishWms {
            layer: ROADS,
            style: ROADS_STYLE,
        })
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(wms.is_success());

    let map = scheduler
        .submit(Intent::CreateWebMap {
            source: ROADS,
            style: None,
            name: None,
        })
        .unwrap()
        .wait()
        .await
        .unwrap();
    let map_id = map.main_resource().unwrap();
    assert_eq!(scheduler.tree().get(map_id).unwrap().display_name, "roads map");

    let style = scheduler
        .submit(Intent::CreateStyle {
            layer: RIVERS,
            style: StyleSource::qml("rivers blue", &b"<qgis/>"[..]),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();
    let style_id = style.main_resource().unwrap();
    assert_eq!(scheduler.tree().get(style_id).unwrap().parent, Some(RIVERS));

    scheduler
        .submit(Intent::UpdateStyle {
            style: style_id,
            source: StyleSource::qml("rivers blue", &b"<qgis version=\"3\"/>"[..]),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(scheduler.tree().get(style_id).unwrap().revision, 2);
    // Whatever the remote rewrote on upload is mirrored in the cache.
    assert_eq!(
        scheduler.tree().get(style_id).unwrap().metadata,
        remote.get(style_id).unwrap().metadata
    );
    assert_eq!(scheduler.tree().get(style_id).unwrap().metadata["content_length"], "19");
}

#[tokio::test]
async fn overwrite_layer_replaces_the_source() {
    let remote = slow_remote(10);
    let scheduler = scheduler(&remote, config());

    let handle = scheduler
        .submit(Intent::OverwriteLayer {
            layer: ROADS,
            source: LayerSource::vector("roads", "/data/roads_2024.gpkg"),
        })
        .unwrap();
    let record = scheduler.query(ROADS).unwrap();
    assert_eq!(record.kind, OperationKind::UpdatingLayer);
    assert_eq!(record.kind.label(), "Resource is being updated");

    let report = handle.wait().await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.main_resource(), Some(ROADS));
    assert_eq!(child_names(&scheduler, PROJECTS), vec!["rivers", "roads"]);
    let tree = scheduler.tree();
    let roads = tree.get(ROADS).unwrap();
    assert_eq!(roads.metadata["source"], "/data/roads_2024.gpkg");
    assert_eq!(roads.revision, 2);
    assert_eq!(roads.metadata, remote.get(ROADS).unwrap().metadata);
}

#[tokio::test]
async fn project_import_shows_its_own_status() {
    let remote = slow_remote(10);
    let scheduler = scheduler(&remote, config());

    let handle = scheduler
        .submit(Intent::ImportProject {
            parent: ARCHIVE,
            group_name: "Survey".into(),
            layers: layers(&["parcels"]),
        })
        .unwrap();
    let record = scheduler.query(ARCHIVE).unwrap();
    assert_eq!(record.kind.label(), "Project is being imported");
    assert_eq!(
        scheduler.query_batch(handle.id()).unwrap().kind,
        OperationKind::ImportingProject
    );
    assert!(handle.wait().await.unwrap().is_success());
}

#[tokio::test]
async fn load_children_fills_the_cache_lazily() {
    let remote = remote();
    let tree = ResourceTree::with_root(NodeData::new(ROOT, None, ResourceKind::ResourceGroup, "Main"));
    let scheduler = JobScheduler::new(tree, remote.clone(), config());
    assert!(!scheduler.tree().get(ROOT).unwrap().children_loaded);

    let report = scheduler
        .submit(Intent::LoadChildren { parent: ROOT })
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(child_names(&scheduler, ROOT), vec!["Archive", "Projects"]);
    assert!(scheduler.tree().get(ROOT).unwrap().children_loaded);
    assert!(!scheduler.tree().get(PROJECTS).unwrap().children_loaded);

    // Projects looks empty in the cache, the remote knows better.
    let report = scheduler
        .submit(Intent::Delete {
            target: PROJECTS,
            recursive: false,
        })
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(
        report.failures.entries()[0].error,
        Error::NonEmptyGroup(PROJECTS)
    );
    assert!(scheduler.tree().contains(PROJECTS));
}

// ===========================================================================
// Observation
// ===========================================================================

#[tokio::test]
async fn events_follow_the_job_lifecycle() {
    let remote = remote();
    let scheduler = scheduler(&remote, config());
    let mut events = scheduler.subscribe();

    let report = scheduler
        .submit(Intent::CreateGroup {
            parent: ARCHIVE,
            name: "New".into(),
        })
        .unwrap()
        .wait()
        .await
        .unwrap();
    let group = report.main_resource().unwrap();
    let events = drain(&mut events);

    assert!(events.contains(&OrchestratorEvent::OperationStarted {
        key: OperationKey::Resource(ARCHIVE),
        kind: OperationKind::Creating,
    }));
    assert!(events.contains(&OrchestratorEvent::OperationFinished {
        key: OperationKey::Resource(ARCHIVE),
        kind: OperationKind::Creating,
    }));
    let states: Vec<JobState> = events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::JobStateChanged { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![JobState::Queued, JobState::Running, JobState::Done]);
    assert!(events.contains(&OrchestratorEvent::TreeChanged { id: ARCHIVE }));
    assert!(events.contains(&OrchestratorEvent::ResourceReady {
        batch: report.batch,
        id: group,
    }));
    assert!(matches!(
        events.last(),
        Some(OrchestratorEvent::BatchCompleted { failures: 0, .. })
    ));
}

#[tokio::test]
async fn job_state_is_visible_while_running() {
    let remote = slow_remote(50);
    let scheduler = scheduler(&remote, config());

    let handle = scheduler
        .submit(Intent::Rename {
            target: ROADS,
            name: "highways".into(),
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(scheduler.job_state(JobId(1)), Some(JobState::Running));

    handle.wait().await.unwrap();
    assert_eq!(scheduler.job_state(JobId(1)), None);
}

#[tokio::test]
async fn dropping_the_scheduler_resolves_handles_with_shutdown() {
    let remote = slow_remote(50);
    let scheduler = scheduler(&remote, config());

    let handle = scheduler
        .submit(Intent::CreateGroup {
            parent: ARCHIVE,
            name: "Orphan".into(),
        })
        .unwrap();
    drop(scheduler);
    assert_eq!(handle.wait().await.unwrap_err(), Error::Shutdown);
}

// ===========================================================================
// ReconciliationEngine
// ===========================================================================

fn engine() -> (Arc<RwLock<ResourceTree>>, ReconciliationEngine) {
    let tree = Arc::new(RwLock::new(ResourceTree::from_snapshot(fixture()).unwrap()));
    let (events, _) = broadcast::channel(16);
    let tracker = OperationStateTracker::with_events(events.clone());
    let engine = ReconciliationEngine::new(tree.clone(), tracker, events);
    (tree, engine)
}

#[test]
fn reconciling_the_same_job_twice_is_a_no_op() {
    let (tree, mut engine) = engine();
    let output = JobOutput {
        changes: vec![
            TreeChange::Inserted(NodeData::new(50, Some(PROJECTS), ResourceKind::VectorLayer, "new")),
            TreeChange::Renamed {
                id: ROADS,
                name: "highways".into(),
            },
        ],
        main_resource: Some(ResourceId(50)),
    };

    assert!(engine.apply_success(BatchId(1), JobId(1), &output).is_empty());
    let after_first = tree.read().unwrap().snapshot();
    assert!(engine.apply_success(BatchId(1), JobId(1), &output).is_empty());

    let tree = tree.read().unwrap();
    assert_eq!(tree.snapshot(), after_first);
    assert_eq!(tree.len(), 8);
    assert_eq!(tree.get(ROADS).unwrap().revision, 2);
}

#[test]
fn unmirrorable_changes_become_warnings() {
    let (tree, mut engine) = engine();
    let output = JobOutput {
        changes: vec![TreeChange::Renamed {
            id: ResourceId(404),
            name: "ghost".into(),
        }],
        main_resource: None,
    };

    let warnings = engine.apply_success(BatchId(1), JobId(2), &output);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("404"));
    assert_eq!(tree.read().unwrap().len(), 7);
}

#[test]
fn finished_batches_forget_their_jobs() {
    let (tree, mut engine) = engine();
    let batch = BatchId(7);
    let (reply, mut report) = oneshot::channel();
    let cancel = CancellationToken::new();
    engine.register(
        batch,
        BatchLedger {
            report: BatchReport::new(batch, "rename twice"),
            pending: 2,
            abort_on_first_failure: false,
            abort: cancel.child_token(),
            cancel,
            batch_token: None,
            follow_up: None,
            reply: Some(reply),
        },
    );

    let rename = |id: u64, target: ResourceId, name: &str| {
        let job = Job {
            id: JobId(id),
            batch,
            item: name.to_string(),
            targets: vec![target],
            payload: JobPayload::Rename {
                id: target,
                name: name.to_string(),
            },
            tokens: Vec::new(),
        };
        let outcome = JobOutcome::Succeeded(JobOutput {
            changes: vec![TreeChange::Renamed {
                id: target,
                name: name.to_string(),
            }],
            main_resource: Some(target),
        });
        (job, outcome)
    };

    let (job, outcome) = rename(10, ROADS, "highways");
    assert!(engine.reconcile(job, outcome).is_none());
    assert_eq!(engine.remembered_jobs(), 1);
    assert_eq!(engine.pending_batches(), 1);

    let (job, outcome) = rename(11, RIVERS, "streams");
    assert!(engine.reconcile(job, outcome).is_none());
    assert_eq!(engine.remembered_jobs(), 0);
    assert_eq!(engine.pending_batches(), 0);

    let report = report.try_recv().unwrap();
    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(tree.read().unwrap().get(RIVERS).unwrap().display_name, "streams");
}
