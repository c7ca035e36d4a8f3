//! Legal tag compliance propagation.
//!
//! For every validated tag change the orchestrator walks the records indexed
//! under that tag page by page. Each page is handled in a fixed order:
//!
//! 1. persist the mutated records
//! 2. prune tag index entries
//! 3. publish change notifications
//! 4. emit an audit event
//!
//! A crash between steps never leaves a notification for metadata that was
//! not persisted. Redelivering the same event is safe: every page re-derives
//! which records still carry the tag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use metastore_core::{
    defaults, AuditEvent, AuditSink, ComplianceChangeInfo, Cursor, Error, LegalCompliance,
    LegalTagChangedCollection, PubSubInfo, RecordMetadata, RecordStore, RequestContext, Result,
    TagAssociationIndex,
};

use crate::notifier::ChangeNotifier;

/// Configuration for compliance propagation.
#[derive(Debug, Clone)]
pub struct ComplianceConfig {
    /// Records fetched per tag query page.
    pub page_size: usize,
    /// Wall-clock budget for one event.
    pub max_running_time: Duration,
    /// Topic record change notifications are published to.
    pub topic: String,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            page_size: defaults::COMPLIANCE_PAGE_SIZE,
            max_running_time: Duration::from_secs(defaults::COMPLIANCE_MAX_RUNNING_SECS),
            topic: defaults::RECORDS_CHANGED_TOPIC.to_string(),
        }
    }
}

impl ComplianceConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `COMPLIANCE_PAGE_SIZE` | `500` | Records per tag query page |
    /// | `COMPLIANCE_MAX_RUNNING_SECS` | `115` | Budget per event |
    /// | `RECORDS_CHANGED_TOPIC` | `recordstopic` | Notification topic |
    pub fn from_env() -> Self {
        let page_size = std::env::var("COMPLIANCE_PAGE_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::COMPLIANCE_PAGE_SIZE)
            .max(1);

        let max_running_secs = std::env::var("COMPLIANCE_MAX_RUNNING_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::COMPLIANCE_MAX_RUNNING_SECS);

        let topic = std::env::var("RECORDS_CHANGED_TOPIC")
            .unwrap_or_else(|_| defaults::RECORDS_CHANGED_TOPIC.to_string());

        Self {
            page_size,
            max_running_time: Duration::from_secs(max_running_secs),
            topic,
        }
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn with_max_running_time(mut self, budget: Duration) -> Self {
        self.max_running_time = budget;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }
}

/// Applies validated tag status changes to the records that carry the tags.
pub struct ComplianceChangeOrchestrator {
    records: Arc<dyn RecordStore>,
    tag_index: Arc<dyn TagAssociationIndex>,
    notifier: ChangeNotifier,
    audit: Arc<dyn AuditSink>,
    config: ComplianceConfig,
}

impl ComplianceChangeOrchestrator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        tag_index: Arc<dyn TagAssociationIndex>,
        notifier: ChangeNotifier,
        audit: Arc<dyn AuditSink>,
        config: ComplianceConfig,
    ) -> Self {
        Self {
            records,
            tag_index,
            notifier,
            audit,
            config,
        }
    }

    /// Propagate every change onto the tenant's records.
    ///
    /// Returns the new compliance of each mutated record. Tags are handled
    /// one after another; a failing tag does not stop the others, but the
    /// first failure is returned once all tags have run so the event gets
    /// redelivered. Running past the time budget stops immediately.
    pub async fn update_compliance_on_records(
        &self,
        changes: &LegalTagChangedCollection,
        ctx: &RequestContext,
    ) -> Result<HashMap<String, LegalCompliance>> {
        let start = Instant::now();
        let deadline = start + self.config.max_running_time;
        let mut updated = HashMap::new();
        let mut first_error: Option<Error> = None;

        for change in &changes.status_changed_tags {
            let tag = change.changed_tag_name.as_str();
            let Some(info) = ComplianceChangeInfo::from_status(&change.changed_tag_status) else {
                warn!(
                    subsystem = "jobs",
                    component = "compliance",
                    partition_id = %ctx.partition_id(),
                    correlation_id = %ctx.correlation_id(),
                    tag = %tag,
                    status = %change.changed_tag_status,
                    "Skipping tag with unknown compliance status"
                );
                continue;
            };

            match self.update_tag(tag, &info, ctx, deadline, &mut updated).await {
                Ok(()) => {}
                Err(e @ Error::ComplianceUpdateStopped(_)) => {
                    error!(
                        subsystem = "jobs",
                        component = "compliance",
                        partition_id = %ctx.partition_id(),
                        correlation_id = %ctx.correlation_id(),
                        tag = %tag,
                        error = %e,
                        "Compliance update stopped"
                    );
                    first_error.get_or_insert(e);
                    break;
                }
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        component = "compliance",
                        partition_id = %ctx.partition_id(),
                        correlation_id = %ctx.correlation_id(),
                        tag = %tag,
                        error = %e,
                        "Compliance update for tag failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            subsystem = "jobs",
            component = "compliance",
            op = "update_compliance",
            partition_id = %ctx.partition_id(),
            correlation_id = %ctx.correlation_id(),
            tag_count = changes.status_changed_tags.len(),
            record_count = updated.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            success = first_error.is_none(),
            "Compliance propagation finished"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(updated),
        }
    }

    async fn update_tag(
        &self,
        tag: &str,
        info: &ComplianceChangeInfo,
        ctx: &RequestContext,
        deadline: Instant,
        updated: &mut HashMap<String, LegalCompliance>,
    ) -> Result<()> {
        let partition_id = ctx.partition_id();
        let mut cursor: Option<Cursor> = None;

        loop {
            if Instant::now() >= deadline {
                return Err(Error::ComplianceUpdateStopped(format!(
                    "Running time exceeded {}s while updating tag {}",
                    self.config.max_running_time.as_secs(),
                    tag
                )));
            }

            let page = self
                .records
                .query_by_legal_tag_name(partition_id, tag, self.config.page_size, cursor.as_ref())
                .await?;

            let (mut holding, stale): (Vec<RecordMetadata>, Vec<RecordMetadata>) =
                page.items.into_iter().partition(|r| r.has_legal_tag(tag));
            for record in &mut holding {
                info.apply(record);
            }

            if !holding.is_empty() {
                self.records.batch_upsert(partition_id, &holding).await?;
            }

            let mut prune: Vec<String> = stale.into_iter().map(|r| r.id).collect();
            if info.prunes_index() {
                prune.extend(holding.iter().map(|r| r.id.clone()));
            }
            if !prune.is_empty() {
                self.tag_index.prune_tag(partition_id, tag, &prune).await?;
            }

            if !holding.is_empty() {
                let infos: Vec<PubSubInfo> = holding
                    .iter()
                    .map(|r| PubSubInfo::new(r.id.clone(), r.kind.clone(), info.operation))
                    .collect();
                self.notifier
                    .publish(ctx, &self.config.topic, &infos)
                    .await?;

                let record_ids: Vec<String> = holding.iter().map(|r| r.id.clone()).collect();
                for id in &record_ids {
                    updated.insert(id.clone(), info.new_compliance);
                }
                self.audit.record(
                    ctx,
                    AuditEvent::ComplianceUpdated {
                        tag: tag.to_string(),
                        record_ids,
                    },
                );
            }

            debug!(
                subsystem = "jobs",
                component = "compliance",
                partition_id = %partition_id,
                tag = %tag,
                record_count = holding.len(),
                pruned = prune.len(),
                "Processed compliance page"
            );

            cursor = page.cursor;
            if cursor.is_none() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metastore_core::{EventTransport, LegalTagChanged, RecordState};
    use metastore_db::{MemoryStore, MemoryTransport};

    use crate::audit::RecordingAuditSink;

    async fn setup(budget: Duration) -> (ComplianceChangeOrchestrator, Arc<MemoryStore>, MemoryTransport) {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryTransport::new();
        bus.create_topic("p1", defaults::RECORDS_CHANGED_TOPIC).await.unwrap();
        let orchestrator = ComplianceChangeOrchestrator::new(
            store.clone(),
            store.clone(),
            ChangeNotifier::new(Arc::new(bus.clone())),
            Arc::new(RecordingAuditSink::new()),
            ComplianceConfig::default()
                .with_page_size(2)
                .with_max_running_time(budget),
        );
        (orchestrator, store, bus)
    }

    fn one(tag: &str, status: &str) -> LegalTagChangedCollection {
        LegalTagChangedCollection {
            status_changed_tags: vec![LegalTagChanged::new(tag, status)],
        }
    }

    #[tokio::test]
    async fn test_stale_index_entries_are_pruned_not_mutated() {
        let (orchestrator, store, _bus) = setup(Duration::from_secs(60)).await;
        store
            .seed("p1", vec![RecordMetadata::new("a", "k", ["T"]), RecordMetadata::new("b", "k", ["U"])])
            .await;
        store.record_tag("p1", "T", "b").await.unwrap();

        let updated = orchestrator
            .update_compliance_on_records(&one("T", "compliant"), &RequestContext::new("p1"))
            .await
            .unwrap();

        assert_eq!(updated.len(), 1);
        assert!(updated.contains_key("a"));
        assert_eq!(store.records_for_tag("p1", "T").await.unwrap(), vec!["a"]);
        let b = store.get("p1", "b").await.unwrap().unwrap();
        assert_eq!(b.status, RecordState::Active);
    }

    #[tokio::test]
    async fn test_index_entries_without_record_are_pruned() {
        let (orchestrator, store, bus) = setup(Duration::from_secs(60)).await;
        store.seed("p1", vec![RecordMetadata::new("a", "k", ["T"])]).await;
        store.record_tag("p1", "T", "ghost").await.unwrap();

        let updated = orchestrator
            .update_compliance_on_records(&one("T", "compliant"), &RequestContext::new("p1"))
            .await
            .unwrap();

        assert_eq!(updated.len(), 1);
        assert!(updated.contains_key("a"));
        assert_eq!(store.records_for_tag("p1", "T").await.unwrap(), vec!["a"]);
        assert!(store.get("p1", "ghost").await.unwrap().is_none());
        let published = bus.published("p1", defaults::RECORDS_CHANGED_TOPIC).await;
        assert_eq!(published.len(), 1);
        assert!(!published[0].data.contains("ghost"));
    }

    #[tokio::test]
    async fn test_unknown_status_leaves_records_unchanged() {
        let (orchestrator, store, bus) = setup(Duration::from_secs(60)).await;
        store.seed("p1", vec![RecordMetadata::new("a", "k", ["T"])]).await;

        let updated = orchestrator
            .update_compliance_on_records(&one("T", "suspended"), &RequestContext::new("p1"))
            .await
            .unwrap();

        assert!(updated.is_empty());
        assert_eq!(
            store.get("p1", "a").await.unwrap().unwrap(),
            RecordMetadata::new("a", "k", ["T"])
        );
        assert!(bus.published("p1", defaults::RECORDS_CHANGED_TOPIC).await.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_budget_stops_before_first_page() {
        let (orchestrator, store, _bus) = setup(Duration::ZERO).await;
        store.seed("p1", vec![RecordMetadata::new("a", "k", ["T"])]).await;

        let err = orchestrator
            .update_compliance_on_records(&one("T", "incompliant"), &RequestContext::new("p1"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ComplianceUpdateStopped(_)));
        let a = store.get("p1", "a").await.unwrap().unwrap();
        assert_eq!(a.legal.status, LegalCompliance::Compliant);
    }

    #[tokio::test]
    async fn test_multi_page_tag_touches_every_record_once() {
        let (orchestrator, store, bus) = setup(Duration::from_secs(60)).await;
        let records = (0..5).map(|i| RecordMetadata::new(format!("r{}", i), "k", ["T"])).collect();
        store.seed("p1", records).await;

        let updated = orchestrator
            .update_compliance_on_records(&one("T", "incompliant"), &RequestContext::new("p1"))
            .await
            .unwrap();

        assert_eq!(updated.len(), 5);
        assert!(updated.values().all(|c| *c == LegalCompliance::Incompliant));
        assert!(store.records_for_tag("p1", "T").await.unwrap().is_empty());
        // page size 2 over 5 records: three pages, one message each
        assert_eq!(bus.published("p1", defaults::RECORDS_CHANGED_TOPIC).await.len(), 3);
    }
}
