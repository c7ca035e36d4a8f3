//! In-process backends for single-node deployments and tests.
//!
//! All state is keyed by partition id first, so tenants never share entries.
//! [`MemoryTransport`] honors the same ack/nack/reject contract as the
//! Postgres bus: acked messages are dropped, nacked messages are redelivered
//! after a delay, and rejected messages are dead-lettered.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use metastore_core::{
    await_decision, defaults, new_v7, AckDecision, AckReplier, Cursor, Error, EventTransport,
    InboundMessage, MessageReceiver, OutboundMessage, Page, RecordIdAndKind, RecordMetadata,
    RecordState, RecordStore, ReplayMetaData, ReplayRepository, Result, SubscriptionHandle,
    TagAssociationIndex,
};

use crate::records::{decode_cursor, paginate};

// =============================================================================
// RECORD STORE + TAG INDEX
// =============================================================================

#[derive(Default)]
struct TenantRecords {
    records: BTreeMap<String, RecordMetadata>,
    tags: BTreeMap<String, BTreeSet<String>>,
}

/// In-memory record store and tag association index.
///
/// One value implements both traits because tag lookups go through the index,
/// the same way the Postgres store joins through `legal_tag_association`.
#[derive(Default)]
pub struct MemoryStore {
    tenants: RwLock<HashMap<String, TenantRecords>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert records and index every tag they carry.
    pub async fn seed(&self, partition_id: &str, records: Vec<RecordMetadata>) {
        let mut tenants = self.tenants.write().await;
        let tenant = tenants.entry(partition_id.to_string()).or_default();
        for record in records {
            for tag in &record.legal.legaltags {
                tenant
                    .tags
                    .entry(tag.clone())
                    .or_default()
                    .insert(record.id.clone());
            }
            tenant.records.insert(record.id.clone(), record);
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn query_by_legal_tag_name(
        &self,
        partition_id: &str,
        tag: &str,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page<RecordMetadata>> {
        let after = decode_cursor(cursor)?;
        let tenants = self.tenants.read().await;
        let Some(tenant) = tenants.get(partition_id) else {
            return Ok(Page::last(Vec::new()));
        };
        let Some(ids) = tenant.tags.get(tag) else {
            return Ok(Page::last(Vec::new()));
        };

        let lower = match after.as_deref() {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let records: Vec<RecordMetadata> = ids
            .range::<str, _>((lower, Bound::Unbounded))
            .take(limit + 1)
            .map(|id| {
                tenant
                    .records
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| RecordMetadata::missing(id.as_str()))
            })
            .collect();
        Ok(paginate(records, limit, |r| r.id.as_str()))
    }

    async fn batch_upsert(&self, partition_id: &str, records: &[RecordMetadata]) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        let tenant = tenants.entry(partition_id.to_string()).or_default();
        for record in records {
            tenant.records.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn delete(&self, partition_id: &str, id: &str) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        if let Some(tenant) = tenants.get_mut(partition_id) {
            tenant.records.remove(id);
            for ids in tenant.tags.values_mut() {
                ids.remove(id);
            }
        }
        Ok(())
    }

    async fn get(&self, partition_id: &str, id: &str) -> Result<Option<RecordMetadata>> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .get(partition_id)
            .and_then(|t| t.records.get(id))
            .cloned())
    }

    async fn count_active(&self, partition_id: &str, kind: Option<&str>) -> Result<i64> {
        let tenants = self.tenants.read().await;
        let count = tenants
            .get(partition_id)
            .map(|t| {
                t.records
                    .values()
                    .filter(|r| is_replayable(r, kind))
                    .count()
            })
            .unwrap_or(0);
        Ok(count as i64)
    }

    async fn query_ids_and_kinds(
        &self,
        partition_id: &str,
        kind: Option<&str>,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page<RecordIdAndKind>> {
        let after = decode_cursor(cursor)?;
        let tenants = self.tenants.read().await;
        let Some(tenant) = tenants.get(partition_id) else {
            return Ok(Page::last(Vec::new()));
        };

        let lower = match after.as_deref() {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        let items: Vec<RecordIdAndKind> = tenant
            .records
            .range::<str, _>((lower, Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| is_replayable(r, kind))
            .take(limit + 1)
            .map(|r| RecordIdAndKind {
                id: r.id.clone(),
                kind: r.kind.clone(),
            })
            .collect();
        Ok(paginate(items, limit, |r| r.id.as_str()))
    }
}

fn is_replayable(record: &RecordMetadata, kind: Option<&str>) -> bool {
    record.status == RecordState::Active && kind.map_or(true, |k| record.kind == k)
}

#[async_trait]
impl TagAssociationIndex for MemoryStore {
    async fn record_tag(&self, partition_id: &str, tag: &str, record_id: &str) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        tenants
            .entry(partition_id.to_string())
            .or_default()
            .tags
            .entry(tag.to_string())
            .or_default()
            .insert(record_id.to_string());
        Ok(())
    }

    async fn prune_tag(&self, partition_id: &str, tag: &str, record_ids: &[String]) -> Result<u64> {
        let mut tenants = self.tenants.write().await;
        let Some(ids) = tenants.get_mut(partition_id).and_then(|t| t.tags.get_mut(tag)) else {
            return Ok(0);
        };
        let removed = record_ids.iter().filter(|id| ids.remove(id.as_str())).count();
        Ok(removed as u64)
    }

    async fn records_for_tag(&self, partition_id: &str, tag: &str) -> Result<Vec<String>> {
        let tenants = self.tenants.read().await;
        Ok(tenants
            .get(partition_id)
            .and_then(|t| t.tags.get(tag))
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }
}

// =============================================================================
// REPLAY STATUS
// =============================================================================

/// In-memory replay status repository. Terminal rows are never overwritten.
#[derive(Default)]
pub struct MemoryReplayRepository {
    runs: RwLock<HashMap<(String, Uuid), ReplayMetaData>>,
}

impl MemoryReplayRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplayRepository for MemoryReplayRepository {
    async fn save(&self, partition_id: &str, meta: &ReplayMetaData) -> Result<()> {
        let mut runs = self.runs.write().await;
        let key = (partition_id.to_string(), meta.replay_id);
        if runs.get(&key).is_some_and(|stored| stored.state.is_terminal()) {
            return Ok(());
        }
        runs.insert(key, meta.clone());
        Ok(())
    }

    async fn get(&self, partition_id: &str, replay_id: Uuid) -> Result<Option<ReplayMetaData>> {
        let runs = self.runs.read().await;
        Ok(runs.get(&(partition_id.to_string(), replay_id)).cloned())
    }

    async fn list_unfinished(&self, partition_id: &str) -> Result<Vec<ReplayMetaData>> {
        let runs = self.runs.read().await;
        let mut unfinished: Vec<ReplayMetaData> = runs
            .iter()
            .filter(|((p, _), meta)| p == partition_id && !meta.state.is_terminal())
            .map(|(_, meta)| meta.clone())
            .collect();
        unfinished.sort_by_key(|m| m.started_at);
        Ok(unfinished)
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

#[derive(Default)]
struct SubscriptionState {
    topic: String,
    queue: VecDeque<InboundMessage>,
    notify: Arc<Notify>,
    acked: u64,
    nacked: u64,
    dead_letters: Vec<InboundMessage>,
}

#[derive(Default)]
struct TenantBus {
    topics: BTreeMap<String, Vec<OutboundMessage>>,
    subscriptions: BTreeMap<String, SubscriptionState>,
}

type SharedBus = Arc<Mutex<HashMap<String, TenantBus>>>;

/// In-process implementation of EventTransport.
///
/// Every published message is also kept in a per-topic history so callers can
/// inspect what was sent without subscribing.
#[derive(Clone)]
pub struct MemoryTransport {
    state: SharedBus,
    redelivery_delay: Duration,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            redelivery_delay: Duration::from_millis(defaults::BUS_POLL_INTERVAL_MS),
        }
    }

    /// Delay before a nacked message becomes deliverable again.
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Enqueue a raw message straight onto a subscription.
    pub async fn deliver(&self, partition_id: &str, subscription: &str, data: String, attributes: HashMap<String, String>) -> Result<String> {
        let mut state = self.state.lock().await;
        let sub = state
            .get_mut(partition_id)
            .and_then(|t| t.subscriptions.get_mut(subscription))
            .ok_or_else(|| {
                Error::NotFound(format!("Subscription {} in {}", subscription, partition_id))
            })?;
        let id = new_v7().to_string();
        sub.queue.push_back(InboundMessage {
            id: id.clone(),
            data,
            attributes,
            delivery_attempt: 0,
        });
        sub.notify.notify_one();
        Ok(id)
    }

    /// Everything published to `topic` so far, in order.
    pub async fn published(&self, partition_id: &str, topic: &str) -> Vec<OutboundMessage> {
        let state = self.state.lock().await;
        state
            .get(partition_id)
            .and_then(|t| t.topics.get(topic))
            .cloned()
            .unwrap_or_default()
    }

    /// `(acked, nacked, dead_lettered, queued)` counters of a subscription.
    pub async fn stats(&self, partition_id: &str, subscription: &str) -> (u64, u64, usize, usize) {
        let state = self.state.lock().await;
        state
            .get(partition_id)
            .and_then(|t| t.subscriptions.get(subscription))
            .map(|s| (s.acked, s.nacked, s.dead_letters.len(), s.queue.len()))
            .unwrap_or_default()
    }

    async fn next_message(&self, partition_id: &str, subscription: &str) -> Option<(Option<InboundMessage>, Arc<Notify>)> {
        let mut state = self.state.lock().await;
        let sub = state
            .get_mut(partition_id)
            .and_then(|t| t.subscriptions.get_mut(subscription))?;
        let message = sub.queue.pop_front().map(|mut m| {
            m.delivery_attempt += 1;
            m
        });
        Some((message, sub.notify.clone()))
    }

    async fn settle(&self, partition_id: &str, subscription: &str, message: InboundMessage, decision: AckDecision) {
        let mut state = self.state.lock().await;
        let Some(sub) = state
            .get_mut(partition_id)
            .and_then(|t| t.subscriptions.get_mut(subscription))
        else {
            return;
        };
        match decision {
            AckDecision::Ack => sub.acked += 1,
            AckDecision::Reject => sub.dead_letters.push(message),
            AckDecision::Nack => {
                sub.nacked += 1;
                let bus = self.state.clone();
                let delay = self.redelivery_delay;
                let partition_id = partition_id.to_string();
                let subscription = subscription.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let mut state = bus.lock().await;
                    if let Some(sub) = state
                        .get_mut(&partition_id)
                        .and_then(|t| t.subscriptions.get_mut(&subscription))
                    {
                        sub.queue.push_back(message);
                        sub.notify.notify_one();
                    }
                });
            }
        }
    }

    async fn pump(
        self,
        partition_id: String,
        subscription: String,
        receiver: Arc<dyn MessageReceiver>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!(
            subsystem = "bus",
            component = "memory_subscriber",
            partition_id = %partition_id,
            subscription = %subscription,
            "Subscription pump started"
        );
        loop {
            let Some((message, notify)) = self.next_message(&partition_id, &subscription).await else {
                break;
            };
            match message {
                Some(message) => {
                    let (replier, rx) = AckReplier::channel();
                    receiver.receive(message.clone(), replier).await;
                    let decision = await_decision(rx).await;
                    debug!(
                        subsystem = "bus",
                        component = "memory_subscriber",
                        message_id = %message.id,
                        decision = ?decision,
                        "Settling message"
                    );
                    self.settle(&partition_id, &subscription, message, decision)
                        .await;
                    if shutdown_rx.try_recv().is_ok() {
                        break;
                    }
                }
                None => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }
        }
    }
}

#[async_trait]
impl EventTransport for MemoryTransport {
    async fn topic_exists(&self, partition_id: &str, topic: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state
            .get(partition_id)
            .is_some_and(|t| t.topics.contains_key(topic)))
    }

    async fn create_topic(&self, partition_id: &str, topic: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .entry(partition_id.to_string())
            .or_default()
            .topics
            .entry(topic.to_string())
            .or_default();
        Ok(())
    }

    async fn find_subscription(
        &self,
        partition_id: &str,
        topic: &str,
        prefix: &str,
    ) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state.get(partition_id).and_then(|t| {
            t.subscriptions
                .iter()
                .find(|(name, sub)| sub.topic == topic && name.starts_with(prefix))
                .map(|(name, _)| name.clone())
        }))
    }

    async fn create_subscription(
        &self,
        partition_id: &str,
        topic: &str,
        name: &str,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        let tenant = state
            .get_mut(partition_id)
            .filter(|t| t.topics.contains_key(topic))
            .ok_or_else(|| Error::NotFound(format!("Topic {} in {}", topic, partition_id)))?;
        tenant
            .subscriptions
            .entry(name.to_string())
            .or_insert_with(|| SubscriptionState {
                topic: topic.to_string(),
                ..Default::default()
            });
        Ok(name.to_string())
    }

    async fn publish(
        &self,
        partition_id: &str,
        topic: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let tenant = state
            .get_mut(partition_id)
            .filter(|t| t.topics.contains_key(topic))
            .ok_or_else(|| {
                Error::Transport(format!("Topic {} does not exist in {}", topic, partition_id))
            })?;

        for sub in tenant.subscriptions.values_mut().filter(|s| s.topic == topic) {
            for message in &messages {
                sub.queue.push_back(InboundMessage {
                    id: new_v7().to_string(),
                    data: message.data.clone(),
                    attributes: message.attributes.clone(),
                    delivery_attempt: 0,
                });
            }
            sub.notify.notify_one();
        }
        if let Some(history) = tenant.topics.get_mut(topic) {
            history.extend(messages);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        partition_id: &str,
        subscription: &str,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<SubscriptionHandle> {
        {
            let state = self.state.lock().await;
            let known = state
                .get(partition_id)
                .is_some_and(|t| t.subscriptions.contains_key(subscription));
            if !known {
                return Err(Error::NotFound(format!(
                    "Subscription {} in {}",
                    subscription, partition_id
                )));
            }
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(self.clone().pump(
            partition_id.to_string(),
            subscription.to_string(),
            receiver,
            shutdown_rx,
        ));
        Ok(SubscriptionHandle::new(subscription.to_string(), shutdown_tx, task))
    }
}
