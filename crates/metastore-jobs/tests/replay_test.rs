//! Integration tests for replay runs.
//!
//! - progress is persisted after every page and never decreases
//! - a run ends `COMPLETED` with `processed_records == total_records`
//! - a publish failure ends a run `FAILED` with progress covering only published pages
//! - stop requests end a run `STOPPED`
//! - runs left unfinished by a previous process are failed on recovery

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use common::{record, FlakyPublishTransport, Harness, StaticLegalService, TENANT};
use metastore_core::{
    defaults, AuditEvent, Error, OperationType, PubSubInfo, RecordMetadata, RecordState,
    ReplayFilter, ReplayMetaData, ReplayOperation, ReplayRepository, ReplayRequest, ReplayState,
    RequestContext, Result,
};
use metastore_db::MemoryReplayRepository;
use metastore_jobs::{ChangeNotifier, ReplayConfig, ReplayEvent, ReplayOrchestrator};
use tokio::sync::broadcast;

fn orchestrator(h: &Harness, config: ReplayConfig) -> ReplayOrchestrator {
    ReplayOrchestrator::new(
        h.store.clone(),
        h.replays.clone(),
        h.notifier(),
        h.audit.clone(),
        config,
    )
}

fn request(operation: &str, kinds: &[&str]) -> ReplayRequest {
    ReplayRequest {
        operation: operation.to_string(),
        filter: if kinds.is_empty() {
            None
        } else {
            Some(ReplayFilter {
                kinds: kinds.iter().map(|k| k.to_string()).collect(),
            })
        },
    }
}

/// Collect events for `replay_id` until it finishes.
async fn drain(rx: &mut broadcast::Receiver<ReplayEvent>) -> (Vec<i64>, ReplayState) {
    let mut progress = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("replay did not finish")
            .expect("event channel closed");
        match event {
            ReplayEvent::Progress {
                processed_records, ..
            } => progress.push(processed_records),
            ReplayEvent::Finished { state, .. } => return (progress, state),
            ReplayEvent::Started { .. } => {}
        }
    }
}

#[tokio::test]
async fn test_replay_completes_with_monotonic_progress() {
    let h = Harness::new(StaticLegalService::default()).await;
    let mut records: Vec<RecordMetadata> = (0..23).map(|i| record(&format!("r{:02}", i), &["T"])).collect();
    records[5].status = RecordState::Deleted;
    h.store.seed(TENANT, records).await;
    let replay = orchestrator(&h, ReplayConfig::default().with_batch_size(5).with_parallelism(3));
    let mut events = replay.events();

    let queued = replay
        .start(&RequestContext::new(TENANT), &request("replay", &[]))
        .await
        .unwrap();
    assert_eq!(queued.state, ReplayState::Queued);
    assert_eq!(queued.total_records, 22);
    assert_eq!(queued.processed_records, 0);

    let (progress, state) = drain(&mut events).await;
    assert_eq!(state, ReplayState::Completed);
    assert!(progress.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(progress.last().copied(), Some(22));

    let stored = replay.status(TENANT, queued.replay_id).await.unwrap();
    assert_eq!(stored.state, ReplayState::Completed);
    assert_eq!(stored.processed_records, stored.total_records);

    let published = h.bus.published(TENANT, defaults::RECORDS_CHANGED_TOPIC).await;
    assert_eq!(published.len(), 5);
    let mut ids = h.notified_ids(defaults::RECORDS_CHANGED_TOPIC).await;
    ids.sort();
    assert_eq!(ids.len(), 22);
    assert!(!ids.contains(&"r05".to_string()));
    let first: Vec<PubSubInfo> = serde_json::from_str(&published[0].data).unwrap();
    assert!(first.iter().all(|i| i.op == OperationType::Replay));
}

#[tokio::test]
async fn test_publish_failure_fails_run_with_exact_progress() {
    let h = Harness::new(StaticLegalService::default()).await;
    let records: Vec<RecordMetadata> = (0..10).map(|i| record(&format!("r{:02}", i), &["T"])).collect();
    h.store.seed(TENANT, records).await;
    let transport = Arc::new(FlakyPublishTransport::new(h.bus.clone(), 2));
    let replay = ReplayOrchestrator::new(
        h.store.clone(),
        h.replays.clone(),
        ChangeNotifier::new(transport),
        h.audit.clone(),
        ReplayConfig::default().with_batch_size(2).with_parallelism(1),
    );
    let mut events = replay.events();

    let queued = replay
        .start(&RequestContext::new(TENANT), &request("replay", &[]))
        .await
        .unwrap();
    assert_eq!(queued.total_records, 10);

    let (progress, state) = drain(&mut events).await;
    assert_eq!(state, ReplayState::Failed);
    assert!(progress.windows(2).all(|w| w[0] < w[1]));

    let stored = replay.status(TENANT, queued.replay_id).await.unwrap();
    assert_eq!(stored.state, ReplayState::Failed);
    let notified = h.notified_ids(defaults::RECORDS_CHANGED_TOPIC).await;
    assert_eq!(notified, vec!["r00", "r01", "r02", "r03"]);
    assert_eq!(stored.processed_records, notified.len() as i64);
}

/// Replay repository that refuses every mid-run progress write.
struct ProgressRefusingRepository {
    inner: Arc<MemoryReplayRepository>,
    refused: AtomicUsize,
}

#[async_trait]
impl ReplayRepository for ProgressRefusingRepository {
    async fn save(&self, partition_id: &str, meta: &ReplayMetaData) -> Result<()> {
        if meta.state == ReplayState::InProgress && meta.processed_records > 0 {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(Error::Internal("replay status table unavailable".into()));
        }
        self.inner.save(partition_id, meta).await
    }

    async fn get(&self, partition_id: &str, replay_id: Uuid) -> Result<Option<ReplayMetaData>> {
        self.inner.get(partition_id, replay_id).await
    }

    async fn list_unfinished(&self, partition_id: &str) -> Result<Vec<ReplayMetaData>> {
        self.inner.list_unfinished(partition_id).await
    }
}

#[tokio::test]
async fn test_failed_progress_writes_do_not_stop_run_or_final_count() {
    let h = Harness::new(StaticLegalService::default()).await;
    let records: Vec<RecordMetadata> = (0..6).map(|i| record(&format!("r{:02}", i), &["T"])).collect();
    h.store.seed(TENANT, records).await;
    let replays = Arc::new(ProgressRefusingRepository {
        inner: h.replays.clone(),
        refused: AtomicUsize::new(0),
    });
    let replay = ReplayOrchestrator::new(
        h.store.clone(),
        replays.clone(),
        h.notifier(),
        h.audit.clone(),
        ReplayConfig::default().with_batch_size(2).with_parallelism(1),
    );
    let mut events = replay.events();

    let queued = replay
        .start(&RequestContext::new(TENANT), &request("replay", &[]))
        .await
        .unwrap();
    let (progress, state) = drain(&mut events).await;

    assert_eq!(state, ReplayState::Completed);
    assert_eq!(progress, vec![2, 4, 6]);
    assert_eq!(replays.refused.load(Ordering::SeqCst), 3);
    let stored = replay.status(TENANT, queued.replay_id).await.unwrap();
    assert_eq!(stored.state, ReplayState::Completed);
    assert_eq!(stored.processed_records, 6);
}

#[tokio::test]
async fn test_reindex_with_kind_filter_uses_reindex_topic() {
    let h = Harness::new(StaticLegalService::default()).await;
    h.store
        .seed(
            TENANT,
            vec![
                record("a", &["T"]),
                RecordMetadata::new("b", "osdu:wks:well:1.0.0", ["T"]),
                RecordMetadata::new("c", "osdu:wks:well:1.0.0", ["T"]),
            ],
        )
        .await;
    let replay = orchestrator(&h, ReplayConfig::default());
    let mut events = replay.events();

    let queued = replay
        .start(
            &RequestContext::new(TENANT),
            &request("reindex", &["osdu:wks:well:1.0.0"]),
        )
        .await
        .unwrap();
    assert_eq!(queued.total_records, 2);
    assert_eq!(queued.kind.as_deref(), Some("osdu:wks:well:1.0.0"));

    let (_, state) = drain(&mut events).await;
    assert_eq!(state, ReplayState::Completed);
    assert_eq!(h.notified_ids(defaults::REINDEX_TOPIC).await, vec!["b", "c"]);
    assert!(h.bus.published(TENANT, defaults::RECORDS_CHANGED_TOPIC).await.is_empty());
}

#[tokio::test]
async fn test_empty_tenant_completes_immediately() {
    let h = Harness::new(StaticLegalService::default()).await;
    let replay = orchestrator(&h, ReplayConfig::default());
    let mut events = replay.events();

    let queued = replay
        .start(&RequestContext::new(TENANT), &request("replay", &[]))
        .await
        .unwrap();
    let (progress, state) = drain(&mut events).await;

    assert!(progress.is_empty());
    assert_eq!(state, ReplayState::Completed);
    let stored = replay.status(TENANT, queued.replay_id).await.unwrap();
    assert_eq!((stored.processed_records, stored.total_records), (0, 0));
}

#[tokio::test]
async fn test_stop_ends_run_stopped() {
    let h = Harness::new(StaticLegalService::default()).await;
    h.store
        .seed(TENANT, (0..200).map(|i| record(&format!("r{:03}", i), &["T"])).collect())
        .await;
    let replay = orchestrator(&h, ReplayConfig::default().with_batch_size(1).with_parallelism(1));
    let mut events = replay.events();

    let queued = replay
        .start(&RequestContext::new(TENANT), &request("replay", &[]))
        .await
        .unwrap();
    replay.stop(TENANT, queued.replay_id).await.unwrap();

    let (_, state) = drain(&mut events).await;
    assert_eq!(state, ReplayState::Stopped);
    let stored = replay.status(TENANT, queued.replay_id).await.unwrap();
    assert_eq!(stored.state, ReplayState::Stopped);
    assert!(stored.processed_records < stored.total_records);

    // Terminal runs ignore further stop requests.
    let again = replay.stop(TENANT, queued.replay_id).await.unwrap();
    assert_eq!(again.state, ReplayState::Stopped);
}

#[tokio::test]
async fn test_invalid_requests_are_refused_and_audited() {
    let h = Harness::new(StaticLegalService::default()).await;
    let replay = orchestrator(&h, ReplayConfig::default());
    let ctx = RequestContext::new(TENANT);

    let err = replay.start(&ctx, &request("rewind", &[])).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    let err = replay.start(&ctx, &request("replay", &["k1", "k2"])).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let disabled = orchestrator(&h, ReplayConfig::default().with_enabled(false));
    let err = disabled.start(&ctx, &request("replay", &[])).await.unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let failures = h
        .audit
        .events()
        .into_iter()
        .filter(|(_, e)| matches!(e, AuditEvent::ReplayRequestFailed { .. }))
        .count();
    assert_eq!(failures, 3);
    assert!(h.replays.list_unfinished(TENANT).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_replay_id_is_not_found() {
    let h = Harness::new(StaticLegalService::default()).await;
    let replay = orchestrator(&h, ReplayConfig::default());

    let missing = metastore_core::new_v7();
    assert!(matches!(replay.status(TENANT, missing).await, Err(Error::NotFound(_))));
    assert!(matches!(replay.stop(TENANT, missing).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_recovery_fails_orphaned_runs() {
    let h = Harness::new(StaticLegalService::default()).await;
    let queued = ReplayMetaData::queued(metastore_core::new_v7(), None, ReplayOperation::Replay, 10);
    let mut running = ReplayMetaData::queued(metastore_core::new_v7(), None, ReplayOperation::Reindex, 10);
    running.transition(ReplayState::InProgress).unwrap();
    running.processed_records = 4;
    h.replays.save(TENANT, &queued).await.unwrap();
    h.replays.save(TENANT, &running).await.unwrap();

    let replay = orchestrator(&h, ReplayConfig::default());
    assert_eq!(replay.recover_interrupted(TENANT).await.unwrap(), 2);
    assert_eq!(replay.recover_interrupted(TENANT).await.unwrap(), 0);

    let stored = replay.status(TENANT, running.replay_id).await.unwrap();
    assert_eq!(stored.state, ReplayState::Failed);
    assert_eq!(stored.processed_records, 4);
}

#[tokio::test]
async fn test_stop_on_orphaned_run_marks_it_stopped() {
    let h = Harness::new(StaticLegalService::default()).await;
    let orphan = ReplayMetaData::queued(metastore_core::new_v7(), None, ReplayOperation::Replay, 3);
    h.replays.save(TENANT, &orphan).await.unwrap();

    let replay = orchestrator(&h, ReplayConfig::default());
    let stopped = replay.stop(TENANT, orphan.replay_id).await.unwrap();

    assert_eq!(stopped.state, ReplayState::Stopped);
    let stored = replay.status(TENANT, orphan.replay_id).await.unwrap();
    assert_eq!(stored.state, ReplayState::Stopped);
}
