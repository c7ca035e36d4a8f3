//! Shared fixtures for metastore-jobs integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metastore_core::{
    defaults, Cursor, Error, EventTransport, InvalidTag, LegalService, MessageReceiver,
    OutboundMessage, Page, RecordIdAndKind, RecordMetadata, RecordStore, RequestContext, Result,
    SubscriptionHandle,
};
use metastore_db::{MemoryReplayRepository, MemoryStore, MemoryTransport};
use metastore_jobs::{
    ChangeNotifier, ComplianceChangeOrchestrator, ComplianceConfig, LegalTagChangedReceiver,
    LegalTagConsistencyValidator, RecordingAuditSink,
};

pub const TENANT: &str = "opendes";

/// Legal service answering from a fixed invalid set.
#[derive(Default)]
pub struct StaticLegalService {
    invalid: HashSet<String>,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl StaticLegalService {
    pub fn with_invalid(names: &[&str]) -> Self {
        Self {
            invalid: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LegalService for StaticLegalService {
    async fn invalid_tags(&self, _ctx: &RequestContext, names: &[String]) -> Result<Vec<InvalidTag>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::LegalService("legal service unavailable".into()));
        }
        Ok(names
            .iter()
            .filter(|n| self.invalid.contains(*n))
            .map(|n| InvalidTag {
                name: n.clone(),
                reason: "expired".into(),
            })
            .collect())
    }
}

/// Record store whose upserts fail for records carrying one tag until healed.
pub struct FailingUpsertStore {
    inner: Arc<MemoryStore>,
    poisoned_tag: String,
    healed: AtomicBool,
}

impl FailingUpsertStore {
    pub fn new(inner: Arc<MemoryStore>, poisoned_tag: &str) -> Self {
        Self {
            inner,
            poisoned_tag: poisoned_tag.to_string(),
            healed: AtomicBool::new(false),
        }
    }

    pub fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStore for FailingUpsertStore {
    async fn query_by_legal_tag_name(
        &self,
        partition_id: &str,
        tag: &str,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page<RecordMetadata>> {
        self.inner
            .query_by_legal_tag_name(partition_id, tag, limit, cursor)
            .await
    }

    async fn batch_upsert(&self, partition_id: &str, records: &[RecordMetadata]) -> Result<()> {
        if !self.healed.load(Ordering::SeqCst)
            && records.iter().any(|r| r.has_legal_tag(&self.poisoned_tag))
        {
            return Err(Error::Internal("storage write rejected".into()));
        }
        self.inner.batch_upsert(partition_id, records).await
    }

    async fn delete(&self, partition_id: &str, id: &str) -> Result<()> {
        self.inner.delete(partition_id, id).await
    }

    async fn get(&self, partition_id: &str, id: &str) -> Result<Option<RecordMetadata>> {
        self.inner.get(partition_id, id).await
    }

    async fn count_active(&self, partition_id: &str, kind: Option<&str>) -> Result<i64> {
        self.inner.count_active(partition_id, kind).await
    }

    async fn query_ids_and_kinds(
        &self,
        partition_id: &str,
        kind: Option<&str>,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page<RecordIdAndKind>> {
        self.inner
            .query_ids_and_kinds(partition_id, kind, limit, cursor)
            .await
    }
}

/// Record store whose tag queries are refused with `InvalidInput` until healed.
pub struct RefusingQueryStore {
    inner: Arc<MemoryStore>,
    healed: AtomicBool,
    queries: AtomicUsize,
}

impl RefusingQueryStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            healed: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for RefusingQueryStore {
    async fn query_by_legal_tag_name(
        &self,
        partition_id: &str,
        tag: &str,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page<RecordMetadata>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if !self.healed.load(Ordering::SeqCst) {
            return Err(Error::InvalidInput("cursor rejected by store".into()));
        }
        self.inner
            .query_by_legal_tag_name(partition_id, tag, limit, cursor)
            .await
    }

    async fn batch_upsert(&self, partition_id: &str, records: &[RecordMetadata]) -> Result<()> {
        self.inner.batch_upsert(partition_id, records).await
    }

    async fn delete(&self, partition_id: &str, id: &str) -> Result<()> {
        self.inner.delete(partition_id, id).await
    }

    async fn get(&self, partition_id: &str, id: &str) -> Result<Option<RecordMetadata>> {
        self.inner.get(partition_id, id).await
    }

    async fn count_active(&self, partition_id: &str, kind: Option<&str>) -> Result<i64> {
        self.inner.count_active(partition_id, kind).await
    }

    async fn query_ids_and_kinds(
        &self,
        partition_id: &str,
        kind: Option<&str>,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page<RecordIdAndKind>> {
        self.inner
            .query_ids_and_kinds(partition_id, kind, limit, cursor)
            .await
    }
}

/// Transport that accepts a fixed number of publishes, then fails every one after.
pub struct FlakyPublishTransport {
    inner: MemoryTransport,
    remaining: AtomicUsize,
}

impl FlakyPublishTransport {
    pub fn new(inner: MemoryTransport, successful_publishes: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(successful_publishes),
        }
    }
}

#[async_trait]
impl EventTransport for FlakyPublishTransport {
    async fn topic_exists(&self, partition_id: &str, topic: &str) -> Result<bool> {
        self.inner.topic_exists(partition_id, topic).await
    }

    async fn create_topic(&self, partition_id: &str, topic: &str) -> Result<()> {
        self.inner.create_topic(partition_id, topic).await
    }

    async fn find_subscription(
        &self,
        partition_id: &str,
        topic: &str,
        prefix: &str,
    ) -> Result<Option<String>> {
        self.inner.find_subscription(partition_id, topic, prefix).await
    }

    async fn create_subscription(
        &self,
        partition_id: &str,
        topic: &str,
        name: &str,
    ) -> Result<String> {
        self.inner.create_subscription(partition_id, topic, name).await
    }

    async fn publish(
        &self,
        partition_id: &str,
        topic: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<()> {
        let allowed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(Error::Transport("broker unavailable".into()));
        }
        self.inner.publish(partition_id, topic, messages).await
    }

    async fn subscribe(
        &self,
        partition_id: &str,
        subscription: &str,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<SubscriptionHandle> {
        self.inner.subscribe(partition_id, subscription, receiver).await
    }
}

/// In-memory pipeline for one tenant with the notification topic provisioned.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub bus: MemoryTransport,
    pub replays: Arc<MemoryReplayRepository>,
    pub audit: Arc<RecordingAuditSink>,
    pub legal: Arc<StaticLegalService>,
}

impl Harness {
    pub async fn new(legal: StaticLegalService) -> Self {
        let bus = MemoryTransport::new().with_redelivery_delay(Duration::from_millis(10));
        for topic in [
            defaults::RECORDS_CHANGED_TOPIC,
            defaults::REINDEX_TOPIC,
            defaults::LEGAL_TAGS_CHANGED_TOPIC,
        ] {
            bus.create_topic(TENANT, topic)
                .await
                .expect("create topic");
        }
        Self {
            store: Arc::new(MemoryStore::new()),
            bus,
            replays: Arc::new(MemoryReplayRepository::new()),
            audit: Arc::new(RecordingAuditSink::new()),
            legal: Arc::new(legal),
        }
    }

    pub fn notifier(&self) -> ChangeNotifier {
        ChangeNotifier::new(Arc::new(self.bus.clone()))
    }

    pub fn orchestrator(&self, records: Arc<dyn RecordStore>, page_size: usize) -> ComplianceChangeOrchestrator {
        ComplianceChangeOrchestrator::new(
            records,
            self.store.clone(),
            self.notifier(),
            self.audit.clone(),
            ComplianceConfig::default().with_page_size(page_size),
        )
    }

    pub fn receiver(&self) -> LegalTagChangedReceiver {
        self.receiver_with(self.store.clone())
    }

    /// Receiver whose orchestrator reads and writes records through `records`.
    pub fn receiver_with(&self, records: Arc<dyn RecordStore>) -> LegalTagChangedReceiver {
        LegalTagChangedReceiver::new(
            LegalTagConsistencyValidator::new(self.legal.clone()),
            Arc::new(self.orchestrator(records, defaults::COMPLIANCE_PAGE_SIZE)),
        )
    }

    /// Poll a subscription's `(acked, nacked, dead_lettered, queued)` counters
    /// until `done` holds. Gives up after two seconds.
    pub async fn wait_for_stats<F>(&self, subscription: &str, done: F) -> bool
    where
        F: Fn((u64, u64, usize, usize)) -> bool,
    {
        for _ in 0..200 {
            if done(self.bus.stats(TENANT, subscription).await) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Ids named in every notification published to `topic`, in publish order.
    pub async fn notified_ids(&self, topic: &str) -> Vec<String> {
        let mut ids = Vec::new();
        for message in self.bus.published(TENANT, topic).await {
            let infos: Vec<metastore_core::PubSubInfo> =
                serde_json::from_str(&message.data).expect("notification payload");
            ids.extend(infos.into_iter().map(|i| i.id));
        }
        ids
    }
}

pub fn record(id: &str, tags: &[&str]) -> RecordMetadata {
    RecordMetadata::new(id, "osdu:wks:dataset:1.0.0", tags.iter().copied())
}

pub fn tenant_attributes() -> HashMap<String, String> {
    HashMap::from([
        (metastore_core::context::DATA_PARTITION_ID.to_string(), TENANT.to_string()),
        (metastore_core::context::CORRELATION_ID.to_string(), "corr-1".to_string()),
    ])
}
