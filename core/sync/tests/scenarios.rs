//! End-to-end sync scenarios against the in-memory remote.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use parcelsync_codec::DeltaOperation;
use parcelsync_common::{Error, Result};
use parcelsync_reclaim::{CleanupPriority, CleanupRegistry, CleanupTask, FixedProbe, ResourceMonitor, ResourceThresholds};
use parcelsync_storage::MemoryStore;
use parcelsync_sync::{
    Connectivity, ConflictStrategy, EventBus, ManualChoice, MemoryRemote, PushOutcome, PushRequest, RemoteApi,
    ResolutionOrigin, RetryConfig, SchedulerConfig, SkipReason, SyncConfig, SyncEngine, SyncScheduler, SyncState,
};

struct Harness {
    store: Arc<MemoryStore>,
    remote: Arc<MemoryRemote>,
    connectivity: Connectivity,
    engine: Arc<SyncEngine>,
}

async fn harness(config: SyncConfig, online: bool) -> Harness {
    harness_with_remote(config, online, MemoryRemote::new()).await
}

async fn harness_with_remote(config: SyncConfig, online: bool, remote: MemoryRemote) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(remote);
    let connectivity = Connectivity::new(online);
    let engine = SyncEngine::new(
        store.clone(),
        remote.clone(),
        connectivity.clone(),
        EventBus::default(),
        config,
    )
    .await
    .unwrap();
    Harness {
        store,
        remote,
        connectivity,
        engine: Arc::new(engine),
    }
}

#[tokio::test]
async fn offline_edits_drain_after_reconnect() {
    let h = harness(SyncConfig::default(), false).await;

    h.engine.write("parcels", "P-1", json!({"zone": "R1", "area": 100})).await.unwrap();
    h.engine.write("parcels", "P-1", json!({"zone": "R2", "area": 100})).await.unwrap();
    h.engine.write("parcels", "P-2", json!({"zone": "C1"})).await.unwrap();

    let report = h.engine.perform_incremental_sync(None).await.unwrap();
    assert_eq!(report.skipped, Some(SkipReason::Offline));
    assert_eq!(h.engine.queue_summary().await.unwrap().pending, 3);

    h.connectivity.set_online(true);
    let report = h.engine.perform_incremental_sync(None).await.unwrap();
    assert_eq!(report.totals().sent, 2);
    assert_eq!(report.totals().errors, 0);
    // One request per document, however many local edits it had.
    assert_eq!(h.remote.push_count(), 2);

    assert_eq!(h.engine.queue_summary().await.unwrap().pending, 0);
    let record = h.engine.get("parcels", "P-1").await.unwrap().unwrap();
    assert!(!record.dirty);
    assert!(record.last_synced.is_some());
    assert_eq!(record.data, json!({"zone": "R2", "area": 100}));
    assert_eq!(h.remote.document("parcels", "P-1"), Some(record.data));
}

#[tokio::test]
async fn server_echo_matches_local_edit() {
    let h = harness(SyncConfig::default(), true).await;
    h.engine.write("parcels", "P-1", json!({"zone": "R1", "owner": {"name": "Ada"}})).await.unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();

    h.engine
        .write("parcels", "P-1", json!({"zone": "R1", "owner": {"name": "Grace"}}))
        .await
        .unwrap();
    let report = h.engine.perform_incremental_sync(None).await.unwrap();
    assert_eq!(report.totals().sent, 1);
    assert_eq!(report.totals().conflicts, 0);

    let record = h.engine.get("parcels", "P-1").await.unwrap().unwrap();
    assert_eq!(record.sync_version, 2);
    assert_eq!(h.remote.document("parcels", "P-1"), Some(record.data));
}

#[tokio::test]
async fn timestamp_wins_takes_later_server_edit() {
    let h = harness(SyncConfig::default(), true).await;
    h.engine.write("parcels", "P-1", json!({"zone": "R1", "owner": "A"})).await.unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();

    h.engine.write("parcels", "P-1", json!({"zone": "R2", "owner": "A"})).await.unwrap();
    h.remote
        .server_edit_at(
            "parcels",
            "P-1",
            Some(json!({"zone": "R3", "owner": "A"})),
            Utc::now() + ChronoDuration::hours(1),
        )
        .unwrap();

    let report = h.engine.perform_incremental_sync(None).await.unwrap();
    assert_eq!(report.totals().conflicts, 1);

    let record = h.engine.get("parcels", "P-1").await.unwrap().unwrap();
    assert_eq!(record.data, json!({"zone": "R3", "owner": "A"}));
    assert_eq!(record.sync_version, 2);
    assert!(!record.dirty);
    assert_eq!(h.engine.queue_summary().await.unwrap().pending, 0);
    assert_eq!(h.engine.stats().conflicts, 1);
}

#[tokio::test]
async fn newer_local_edit_is_rebased_and_resent() {
    let h = harness(SyncConfig::default(), true).await;
    let mut events = h.engine.subscribe();
    h.engine.write("parcels", "P-1", json!({"zone": "R1", "owner": "A"})).await.unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();

    h.remote
        .server_edit_at(
            "parcels",
            "P-1",
            Some(json!({"zone": "R3", "owner": "A"})),
            Utc::now() - ChronoDuration::hours(1),
        )
        .unwrap();
    h.engine.write("parcels", "P-1", json!({"zone": "R2", "owner": "A"})).await.unwrap();

    h.engine.perform_incremental_sync(None).await.unwrap();

    assert_eq!(h.remote.document("parcels", "P-1"), Some(json!({"zone": "R2", "owner": "A"})));
    assert_eq!(h.remote.version("parcels", "P-1"), 3);
    let record = h.engine.get("parcels", "P-1").await.unwrap().unwrap();
    assert_eq!(record.sync_version, 3);
    assert!(!record.dirty);
    assert_eq!(h.engine.queue_summary().await.unwrap().pending, 0);

    let mut resolved = None;
    while let Ok(event) = events.try_recv() {
        if let parcelsync_sync::SyncEvent::ConflictResolved { origin, .. } = event {
            resolved = Some(origin);
        }
    }
    assert_eq!(resolved, Some(ResolutionOrigin::Client));
}

#[tokio::test]
async fn merge_fields_combines_disjoint_edits() {
    let config = SyncConfig::default().with_strategy(ConflictStrategy::MergeFields);
    let h = harness(config, true).await;
    h.engine.write("parcels", "P-1", json!({"zone": "R1", "area": 100})).await.unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();

    h.engine.write("parcels", "P-1", json!({"zone": "R2", "area": 100})).await.unwrap();
    h.remote
        .server_edit("parcels", "P-1", Some(json!({"zone": "R1", "area": 120})))
        .unwrap();

    h.engine.perform_incremental_sync(None).await.unwrap();

    let expected = json!({"zone": "R2", "area": 120});
    assert_eq!(h.remote.document("parcels", "P-1"), Some(expected.clone()));
    assert_eq!(h.engine.get("parcels", "P-1").await.unwrap().unwrap().data, expected);
}

#[tokio::test]
async fn concurrent_trigger_is_rejected_while_syncing() {
    let remote = MemoryRemote::new().with_latency(Duration::from_millis(200));
    let h = harness_with_remote(SyncConfig::default(), true, remote).await;
    for id in ["P-1", "P-2", "P-3"] {
        h.engine.write("parcels", id, json!({"zone": "R1"})).await.unwrap();
    }

    let (first, second) = tokio::join!(
        h.engine.perform_incremental_sync(None),
        h.engine.perform_incremental_sync(None)
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    let (ran, rejected) = if first.skipped.is_none() {
        (first, second)
    } else {
        (second, first)
    };

    assert_eq!(ran.totals().sent, 3);
    assert_eq!(rejected.skipped, Some(SkipReason::InProgress));
    assert_eq!(h.remote.push_count(), 3);
    assert_eq!(h.engine.stats().passes, 1);
}

#[tokio::test]
async fn batch_size_bounds_requests_in_flight() {
    let remote = MemoryRemote::new().with_latency(Duration::from_millis(20));
    let h = harness_with_remote(SyncConfig::default().with_batch_size(2), true, remote).await;
    for id in ["P-1", "P-2", "P-3", "P-4", "P-5"] {
        h.engine.write("parcels", id, json!({"zone": "R1"})).await.unwrap();
    }

    let report = h.engine.perform_incremental_sync(None).await.unwrap();
    assert_eq!(report.totals().sent, 5);
    assert_eq!(h.remote.max_in_flight(), 2);
}

#[tokio::test]
async fn manual_review_persists_until_resolved() {
    let config = SyncConfig::default().with_strategy(ConflictStrategy::MergeFields);
    let h = harness(config.clone(), true).await;
    h.engine.write("parcels", "P-1", json!({"zone": "R1", "tags": ["a"]})).await.unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();

    h.engine.write("parcels", "P-1", json!({"zone": "R1", "tags": ["a", "b"]})).await.unwrap();
    h.remote
        .server_edit("parcels", "P-1", Some(json!({"zone": "R1", "tags": ["a", "c"]})))
        .unwrap();

    let report = h.engine.perform_incremental_sync(None).await.unwrap();
    assert_eq!(report.totals().conflicts, 1);
    assert_eq!(h.engine.stats().manual_reviews, 1);
    assert!(h.engine.get("parcels", "P-1").await.unwrap().unwrap().conflicted);
    assert_eq!(h.engine.queue_summary().await.unwrap().pending, 1);

    // The document is left alone while the review is open.
    let pushes = h.remote.push_count();
    let report = h.engine.perform_incremental_sync(None).await.unwrap();
    assert_eq!(report.totals().skipped, 1);
    assert_eq!(h.remote.push_count(), pushes);

    // A fresh engine over the same store still sees the review.
    let reopened = SyncEngine::new(
        h.store.clone(),
        h.remote.clone(),
        h.connectivity.clone(),
        EventBus::default(),
        config,
    )
    .await
    .unwrap();
    assert_eq!(reopened.client_id(), h.engine.client_id());
    let conflicts = reopened.conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].remote_sync_version, 2);

    let record = reopened
        .resolve_manually(&conflicts[0].id, ManualChoice::KeepLocal)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.conflicted);
    assert!(record.dirty);
    assert!(reopened.conflicts().await.unwrap().is_empty());

    let err = reopened
        .resolve_manually(&conflicts[0].id, ManualChoice::KeepServer)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    reopened.perform_incremental_sync(None).await.unwrap();
    assert_eq!(
        h.remote.document("parcels", "P-1"),
        Some(json!({"zone": "R1", "tags": ["a", "b"]}))
    );
    assert_eq!(reopened.queue_summary().await.unwrap().pending, 0);
}

#[tokio::test]
async fn keep_server_discards_local_changes() {
    let config = SyncConfig::default().with_strategy(ConflictStrategy::MergeFields);
    let h = harness(config, true).await;
    h.engine.write("parcels", "P-1", json!({"tags": ["a"]})).await.unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();

    h.engine.write("parcels", "P-1", json!({"tags": ["b"]})).await.unwrap();
    h.remote.server_edit("parcels", "P-1", Some(json!({"tags": ["c"]}))).unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();

    let conflict = h.engine.conflicts().await.unwrap().remove(0);
    let record = h
        .engine
        .resolve_manually(&conflict.id, ManualChoice::KeepServer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.data, json!({"tags": ["c"]}));
    assert!(!record.dirty);
    assert_eq!(record.sync_version, 2);
    assert_eq!(h.engine.queue_summary().await.unwrap().pending, 0);
}

#[tokio::test]
async fn failures_exhaust_retries_then_recover() {
    let retry = RetryConfig::new(3)
        .with_initial_delay(Duration::ZERO)
        .with_jitter(false);
    let config = SyncConfig::default().with_max_retries(2).with_retry(retry);
    let h = harness(config, true).await;
    h.engine.write("parcels", "P-1", json!({"zone": "R1"})).await.unwrap();
    h.remote.set_offline(true);

    let report = h.engine.perform_incremental_sync(None).await.unwrap();
    assert_eq!(report.totals().errors, 1);
    assert_eq!(h.engine.current_state(), SyncState::Error);
    assert_eq!(h.engine.queue_summary().await.unwrap().pending, 1);

    h.engine.perform_incremental_sync(None).await.unwrap();
    let summary = h.engine.queue_summary().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.pending, 0);

    let record = h.engine.get("parcels", "P-1").await.unwrap().unwrap();
    assert!(record.dirty);
    assert_eq!(record.failure.as_ref().map(|f| f.attempts), Some(2));

    // Failed entries are never retried on their own.
    let pushes = h.remote.push_count();
    h.engine.perform_incremental_sync(None).await.unwrap();
    assert_eq!(h.remote.push_count(), pushes);

    h.remote.set_offline(false);
    assert_eq!(h.engine.retry_failed(None).await.unwrap(), 1);
    h.engine.perform_incremental_sync(None).await.unwrap();

    let record = h.engine.get("parcels", "P-1").await.unwrap().unwrap();
    assert!(!record.dirty);
    assert!(record.failure.is_none());
    assert_eq!(h.engine.current_state(), SyncState::Idle);
}

#[tokio::test]
async fn later_edit_waits_behind_failed_entry() {
    let retry = RetryConfig::new(3)
        .with_initial_delay(Duration::ZERO)
        .with_jitter(false);
    let config = SyncConfig::default().with_max_retries(2).with_retry(retry);
    let h = harness(config, true).await;
    h.engine
        .write("parcels", "P-1", json!({"zone": "R1", "area": 1}))
        .await
        .unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();

    h.remote.set_offline(true);
    h.engine
        .write("parcels", "P-1", json!({"zone": "R2", "area": 1}))
        .await
        .unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();
    assert_eq!(h.engine.queue_summary().await.unwrap().failed, 1);

    h.remote.set_offline(false);
    h.engine
        .write("parcels", "P-1", json!({"zone": "R2", "area": 5}))
        .await
        .unwrap();
    let pushes = h.remote.push_count();
    let report = h.engine.perform_incremental_sync(None).await.unwrap();
    assert!(!report.more_work);
    assert_eq!(report.totals().skipped, 1);
    assert_eq!(h.remote.push_count(), pushes);

    let record = h.engine.get("parcels", "P-1").await.unwrap().unwrap();
    assert_eq!(record.data, json!({"zone": "R2", "area": 5}));
    assert!(record.dirty);
    assert_eq!(
        h.remote.document("parcels", "P-1"),
        Some(json!({"zone": "R1", "area": 1}))
    );

    h.engine.retry_failed(None).await.unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();

    let record = h.engine.get("parcels", "P-1").await.unwrap().unwrap();
    assert!(!record.dirty);
    assert_eq!(
        h.remote.document("parcels", "P-1"),
        Some(json!({"zone": "R2", "area": 5}))
    );
    let summary = h.engine.queue_summary().await.unwrap();
    assert_eq!((summary.pending, summary.failed), (0, 0));
}

/// Answers every push with a conflict whose server delta is an update
/// without changes.
struct EmptyConflicts;

#[async_trait]
impl RemoteApi for EmptyConflicts {
    fn name(&self) -> &str {
        "empty-conflicts"
    }

    async fn push_delta(&self, request: PushRequest) -> Result<PushOutcome> {
        let mut server_delta = request.delta;
        server_delta.operation = DeltaOperation::Update;
        server_delta.changes.clear();
        server_delta.compressed = false;
        server_delta.payload = None;
        server_delta.metadata = None;
        Ok(PushOutcome::Conflict {
            server_delta,
            sync_version: request.sync_version + 1,
        })
    }
}

#[tokio::test]
async fn invalid_server_delta_counts_against_retries() {
    let retry = RetryConfig::new(3)
        .with_initial_delay(Duration::ZERO)
        .with_jitter(false);
    let config = SyncConfig::default().with_max_retries(2).with_retry(retry);
    let engine = SyncEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(EmptyConflicts),
        Connectivity::new(true),
        EventBus::default(),
        config,
    )
    .await
    .unwrap();
    engine.write("parcels", "P-1", json!({"zone": "R1"})).await.unwrap();

    let report = engine.perform_incremental_sync(None).await.unwrap();
    assert_eq!(report.totals().errors, 1);
    let summary = engine.queue_summary().await.unwrap();
    assert_eq!((summary.pending, summary.failed), (1, 0));

    let report = engine.perform_incremental_sync(None).await.unwrap();
    assert!(!report.more_work);
    let summary = engine.queue_summary().await.unwrap();
    assert_eq!((summary.pending, summary.failed), (0, 1));

    let record = engine.get("parcels", "P-1").await.unwrap().unwrap();
    assert!(record.dirty);
    assert_eq!(record.failure.as_ref().map(|f| f.attempts), Some(2));
}

#[tokio::test]
async fn pulled_change_with_pending_edit_goes_through_resolver() {
    let h = harness(SyncConfig::default(), true).await;
    h.engine.write("parcels", "P-1", json!({"zone": "R1"})).await.unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();

    h.engine.write("parcels", "P-1", json!({"zone": "R2"})).await.unwrap();
    h.remote
        .server_edit_at(
            "parcels",
            "P-1",
            Some(json!({"zone": "R3"})),
            Utc::now() + ChronoDuration::hours(1),
        )
        .unwrap();

    assert_eq!(h.engine.pull_remote_changes("parcels").await.unwrap(), 1);
    let record = h.engine.get("parcels", "P-1").await.unwrap().unwrap();
    assert_eq!(record.data, json!({"zone": "R3"}));
    assert!(!record.dirty);
    assert_eq!(h.engine.queue_summary().await.unwrap().pending, 0);
}

#[tokio::test]
async fn mutation_during_pass_stays_dirty() {
    let remote = MemoryRemote::new().with_latency(Duration::from_millis(100));
    let h = harness_with_remote(SyncConfig::default(), true, remote).await;
    h.engine.write("parcels", "P-1", json!({"zone": "R1"})).await.unwrap();

    let engine = h.engine.clone();
    let pass = tokio::spawn(async move { engine.perform_incremental_sync(None).await });
    sleep(Duration::from_millis(30)).await;
    h.engine.write("parcels", "P-1", json!({"zone": "R2"})).await.unwrap();
    let report = pass.await.unwrap().unwrap();
    assert!(report.more_work);

    let record = h.engine.get("parcels", "P-1").await.unwrap().unwrap();
    assert_eq!(record.data, json!({"zone": "R2"}));
    assert!(record.dirty);
    assert_eq!(record.sync_version, 1);

    h.engine.perform_incremental_sync(None).await.unwrap();
    assert_eq!(h.remote.document("parcels", "P-1"), Some(json!({"zone": "R2"})));
    assert!(!h.engine.get("parcels", "P-1").await.unwrap().unwrap().dirty);
}

#[tokio::test(start_paused = true)]
async fn scheduler_coalesces_bursts() {
    let h = harness(SyncConfig::default(), true).await;
    let (scheduler, handle) = SyncScheduler::new(h.engine.clone(), SchedulerConfig::default());
    let task = tokio::spawn(handle.run());

    for id in ["P-1", "P-2", "P-3"] {
        h.engine.write("parcels", id, json!({"zone": "R1"})).await.unwrap();
    }
    sleep(Duration::from_millis(500)).await;
    h.engine.write("parcels", "P-1", json!({"zone": "R2"})).await.unwrap();

    // The last trigger reset the deadline to 1.5 s.
    sleep(Duration::from_millis(800)).await;
    assert_eq!(h.engine.stats().passes, 0);

    sleep(Duration::from_millis(500)).await;
    assert_eq!(h.engine.stats().passes, 1);
    assert_eq!(h.remote.push_count(), 3);
    assert_eq!(h.engine.queue_summary().await.unwrap().pending, 0);

    scheduler.shutdown().await;
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn scheduler_waits_for_connection_to_settle() {
    let h = harness(SyncConfig::default(), false).await;
    let (scheduler, handle) = SyncScheduler::new(h.engine.clone(), SchedulerConfig::default());
    let task = tokio::spawn(handle.run());

    h.engine.write("parcels", "P-1", json!({"zone": "R1"})).await.unwrap();
    sleep(Duration::from_secs(3)).await;
    assert_eq!(h.remote.push_count(), 0);

    // A flap inside the settle window cancels the catch-up pass.
    h.connectivity.set_online(true);
    sleep(Duration::from_secs(1)).await;
    h.connectivity.set_online(false);
    sleep(Duration::from_secs(3)).await;
    assert_eq!(h.remote.push_count(), 0);

    h.connectivity.set_online(true);
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.remote.push_count(), 0);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.remote.push_count(), 1);
    assert!(!h.engine.get("parcels", "P-1").await.unwrap().unwrap().dirty);

    scheduler.shutdown().await;
    task.await.unwrap();
}

struct Broken;

#[async_trait]
impl CleanupTask for Broken {
    async fn cleanup(&self) -> Result<usize> {
        Err(Error::Storage("index corrupted".to_string()))
    }
}

#[tokio::test]
async fn critical_pressure_runs_participants_in_isolation() {
    let h = harness(SyncConfig::default(), true).await;
    h.engine.write("parcels", "P-1", json!({"zone": "R1"})).await.unwrap();
    h.engine.write("parcels", "P-2", json!({"zone": "R2"})).await.unwrap();
    h.engine.perform_incremental_sync(None).await.unwrap();
    h.engine.write("parcels", "P-3", json!({"zone": "R3"})).await.unwrap();

    let registry = Arc::new(CleanupRegistry::new());
    registry.register("broken", CleanupPriority::High, Arc::new(Broken)).unwrap();
    registry
        .register("sync-queue", CleanupPriority::Normal, h.engine.cleanup_participant())
        .unwrap();

    let monitor = ResourceMonitor::new(
        h.engine.cache(),
        h.engine.queue(),
        Arc::new(FixedProbe::new(95.0, 10.0)),
        registry,
        ResourceThresholds::default().with_max_cache_age(Duration::ZERO),
    )
    .unwrap();

    // Let the settled records age past the cutoff.
    sleep(Duration::from_millis(5)).await;
    let report = monitor.handle_pressure().await.unwrap().unwrap();
    assert!(report.aggressive);
    assert_eq!(report.queue_entries, 2);
    assert_eq!(report.participants.len(), 2);
    assert!(report.participants[0].error.is_some());
    assert!(report.participants[1].error.is_none());

    // Settled records are gone; the unsynced one survives.
    assert!(h.engine.get("parcels", "P-1").await.unwrap().is_none());
    assert!(h.engine.get("parcels", "P-3").await.unwrap().unwrap().dirty);
    assert_eq!(h.engine.queue_summary().await.unwrap().pending, 1);
}
