//! Core traits for metastore abstractions.
//!
//! These traits define the interfaces that concrete backends must satisfy.
//! Every call is scoped by a tenant partition id; implementations must never
//! let data cross partitions.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::Result;
use crate::messaging::{AckReplier, InboundMessage, OutboundMessage, SubscriptionHandle};
use crate::models::*;

// =============================================================================
// RECORD STORE TRAITS
// =============================================================================

/// Tenant record metadata store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Page through records the tag index associates with `tag`.
    ///
    /// Pages never overlap and the scan ends with `cursor == None`. Returned
    /// records may no longer carry the tag if the index is stale; an entry
    /// whose record is gone comes back as [`RecordMetadata::missing`].
    async fn query_by_legal_tag_name(
        &self,
        partition_id: &str,
        tag: &str,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page<RecordMetadata>>;

    /// Insert or replace all records in one call.
    async fn batch_upsert(&self, partition_id: &str, records: &[RecordMetadata]) -> Result<()>;

    /// Remove a record. Deleting an absent record is a no-op.
    async fn delete(&self, partition_id: &str, id: &str) -> Result<()>;

    /// Fetch a single record.
    async fn get(&self, partition_id: &str, id: &str) -> Result<Option<RecordMetadata>>;

    /// Count active records, optionally restricted to one kind.
    async fn count_active(&self, partition_id: &str, kind: Option<&str>) -> Result<i64>;

    /// Page through active record ids and kinds in id order.
    async fn query_ids_and_kinds(
        &self,
        partition_id: &str,
        kind: Option<&str>,
        limit: usize,
        cursor: Option<&Cursor>,
    ) -> Result<Page<RecordIdAndKind>>;
}

/// Secondary index from legal tag name to the records that reference it.
#[async_trait]
pub trait TagAssociationIndex: Send + Sync {
    /// Associate `record_id` with `tag`. Idempotent.
    async fn record_tag(&self, partition_id: &str, tag: &str, record_id: &str) -> Result<()>;

    /// Remove associations of `tag` with each of `record_ids`.
    ///
    /// Absent entries are ignored. Returns the number actually removed.
    async fn prune_tag(&self, partition_id: &str, tag: &str, record_ids: &[String]) -> Result<u64>;

    /// Record ids currently associated with `tag`, sorted.
    async fn records_for_tag(&self, partition_id: &str, tag: &str) -> Result<Vec<String>>;
}

/// Durable replay progress records.
#[async_trait]
pub trait ReplayRepository: Send + Sync {
    /// Insert or overwrite the stored state of a run.
    async fn save(&self, partition_id: &str, meta: &ReplayMetaData) -> Result<()>;

    async fn get(&self, partition_id: &str, replay_id: Uuid) -> Result<Option<ReplayMetaData>>;

    /// Runs that are still `QUEUED` or `IN_PROGRESS`.
    async fn list_unfinished(&self, partition_id: &str) -> Result<Vec<ReplayMetaData>>;
}

// =============================================================================
// MESSAGING TRAITS
// =============================================================================

/// Callback invoked once per delivered message.
///
/// The receiver must settle the message through `replier`; dropping it nacks.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    async fn receive(&self, message: InboundMessage, replier: AckReplier);
}

/// Topic/subscription provisioning plus publish and pull-subscribe.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn topic_exists(&self, partition_id: &str, topic: &str) -> Result<bool>;

    /// Create a topic. Creating an existing topic is a no-op.
    async fn create_topic(&self, partition_id: &str, topic: &str) -> Result<()>;

    /// First subscription on `topic` whose name starts with `prefix`.
    async fn find_subscription(
        &self,
        partition_id: &str,
        topic: &str,
        prefix: &str,
    ) -> Result<Option<String>>;

    /// Create a subscription and return its name.
    async fn create_subscription(&self, partition_id: &str, topic: &str, name: &str)
        -> Result<String>;

    /// Publish all messages. Returns only after the transport accepted them.
    async fn publish(
        &self,
        partition_id: &str,
        topic: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<()>;

    /// Start delivering messages from `subscription` to `receiver`.
    async fn subscribe(
        &self,
        partition_id: &str,
        subscription: &str,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<SubscriptionHandle>;
}

// =============================================================================
// EXTERNAL SERVICES
// =============================================================================

/// Authoritative legal tag service.
#[async_trait]
pub trait LegalService: Send + Sync {
    /// Which of `names` the service currently considers invalid.
    async fn invalid_tags(&self, ctx: &RequestContext, names: &[String]) -> Result<Vec<InvalidTag>>;
}

/// Audit events emitted by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    /// A page of records had its compliance updated for `tag`.
    ComplianceUpdated { tag: String, record_ids: Vec<String> },
    /// A replay run was accepted.
    ReplayRequested {
        replay_id: Uuid,
        operation: ReplayOperation,
        kind: Option<String>,
    },
    /// A replay request was refused.
    ReplayRequestFailed { operation: String, reason: String },
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, ctx: &RequestContext, event: AuditEvent);
}
