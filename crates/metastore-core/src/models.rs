//! Core data models for metastore.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// RECORD TYPES
// =============================================================================

/// Compliance state of a record's legal block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegalCompliance {
    Compliant,
    Incompliant,
}

impl LegalCompliance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compliant => "compliant",
            Self::Incompliant => "incompliant",
        }
    }
}

impl std::fmt::Display for LegalCompliance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LegalCompliance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compliant" => Ok(Self::Compliant),
            "incompliant" => Ok(Self::Incompliant),
            other => Err(Error::InvalidInput(format!(
                "Unknown legal compliance status: {}",
                other
            ))),
        }
    }
}

/// Lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Active,
    Deleted,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for RecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "deleted" => Ok(Self::Deleted),
            other => Err(Error::InvalidInput(format!(
                "Unknown record state: {}",
                other
            ))),
        }
    }
}

/// Legal block of a record: the tags it carries and the derived compliance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Legal {
    pub legaltags: BTreeSet<String>,
    pub status: LegalCompliance,
}

/// Metadata of a single stored record. `id` is unique within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub id: String,
    pub kind: String,
    pub legal: Legal,
    pub status: RecordState,
    pub version: i64,
}

impl RecordMetadata {
    /// Build an active, compliant record carrying the given tags.
    pub fn new<I, S>(id: impl Into<String>, kind: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            kind: kind.into(),
            legal: Legal {
                legaltags: tags.into_iter().map(Into::into).collect(),
                status: LegalCompliance::Compliant,
            },
            status: RecordState::Active,
            version: 1,
        }
    }

    /// Stand-in for a tag index entry whose record no longer exists.
    ///
    /// It references no legal tags, so compliance treats it as stale.
    pub fn missing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: String::new(),
            legal: Legal {
                legaltags: Default::default(),
                status: LegalCompliance::Compliant,
            },
            status: RecordState::Deleted,
            version: 0,
        }
    }

    /// Whether the record's legal block still references `tag`.
    pub fn has_legal_tag(&self, tag: &str) -> bool {
        self.legal.legaltags.contains(tag)
    }
}

/// Minimal projection used by replay scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIdAndKind {
    pub id: String,
    pub kind: String,
}

// =============================================================================
// PAGINATION
// =============================================================================

/// Opaque continuation token returned by a store.
///
/// Callers pass it back unchanged; its contents are store-specific.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of a cursor scan. `cursor == None` means there are no more pages.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub cursor: Option<Cursor>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            cursor: None,
        }
    }
}

// =============================================================================
// LEGAL TAG CHANGES
// =============================================================================

/// A single tag status change as announced by the legal service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegalTagChanged {
    pub changed_tag_name: String,
    pub changed_tag_status: String,
}

impl LegalTagChanged {
    pub fn new(name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            changed_tag_name: name.into(),
            changed_tag_status: status.into(),
        }
    }
}

/// Payload of a legal-tags-changed event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegalTagChangedCollection {
    #[serde(default)]
    pub status_changed_tags: Vec<LegalTagChanged>,
}

impl LegalTagChangedCollection {
    pub fn is_empty(&self) -> bool {
        self.status_changed_tags.is_empty()
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.status_changed_tags
            .iter()
            .map(|t| t.changed_tag_name.clone())
            .collect()
    }
}

/// A tag the legal service reports as currently invalid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidTag {
    pub name: String,
    #[serde(default)]
    pub reason: String,
}

/// How a tag status change maps onto records that carry the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComplianceChangeInfo {
    pub new_compliance: LegalCompliance,
    pub operation: OperationType,
    pub new_state: RecordState,
}

impl ComplianceChangeInfo {
    /// Resolve the mapping for a status string. Unknown statuses yield `None`.
    pub fn from_status(status: &str) -> Option<Self> {
        match status.parse::<LegalCompliance>().ok()? {
            LegalCompliance::Compliant => Some(Self {
                new_compliance: LegalCompliance::Compliant,
                operation: OperationType::Update,
                new_state: RecordState::Active,
            }),
            LegalCompliance::Incompliant => Some(Self {
                new_compliance: LegalCompliance::Incompliant,
                operation: OperationType::Delete,
                new_state: RecordState::Deleted,
            }),
        }
    }

    pub fn apply(&self, record: &mut RecordMetadata) {
        record.legal.status = self.new_compliance;
        record.status = self.new_state;
    }

    /// Incompliant transitions drop the record from the tag index.
    pub fn prunes_index(&self) -> bool {
        self.new_compliance == LegalCompliance::Incompliant
    }
}

// =============================================================================
// CHANGE NOTIFICATIONS
// =============================================================================

/// Operation carried by a record change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Replay,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Replay => write!(f, "replay"),
        }
    }
}

/// One record change notification entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubSubInfo {
    pub id: String,
    pub kind: String,
    pub op: OperationType,
}

impl PubSubInfo {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, op: OperationType) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            op,
        }
    }
}

// =============================================================================
// REPLAY
// =============================================================================

/// What a replay run re-publishes records for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayOperation {
    /// Re-send change notifications to every downstream consumer
    Replay,
    /// Re-send change notifications to the indexer only
    Reindex,
}

impl ReplayOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replay => "replay",
            Self::Reindex => "reindex",
        }
    }
}

impl std::fmt::Display for ReplayOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReplayOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replay" => Ok(Self::Replay),
            "reindex" => Ok(Self::Reindex),
            other => Err(Error::InvalidInput(format!(
                "Unsupported replay operation: {}",
                other
            ))),
        }
    }
}

/// State of a replay run.
///
/// `Queued -> InProgress -> {Completed, Failed, Stopped}`; a queued run may
/// also fail or be stopped before it starts. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayState {
    Queued,
    InProgress,
    Completed,
    Failed,
    Stopped,
}

impl ReplayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    pub fn can_transition_to(&self, next: ReplayState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::InProgress)
                | (Self::Queued, Self::Failed)
                | (Self::Queued, Self::Stopped)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Stopped)
        )
    }
}

impl std::fmt::Display for ReplayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReplayState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "STOPPED" => Ok(Self::Stopped),
            other => Err(Error::InvalidInput(format!(
                "Unknown replay state: {}",
                other
            ))),
        }
    }
}

/// Persisted progress of one replay run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayMetaData {
    pub replay_id: Uuid,
    pub kind: Option<String>,
    pub operation: ReplayOperation,
    pub total_records: i64,
    pub processed_records: i64,
    pub started_at: DateTime<Utc>,
    pub elapsed_time: String,
    pub state: ReplayState,
}

impl ReplayMetaData {
    pub fn queued(
        replay_id: Uuid,
        kind: Option<String>,
        operation: ReplayOperation,
        total_records: i64,
    ) -> Self {
        Self {
            replay_id,
            kind,
            operation,
            total_records,
            processed_records: 0,
            started_at: Utc::now(),
            elapsed_time: format_elapsed(Duration::ZERO),
            state: ReplayState::Queued,
        }
    }

    /// Move to `next`, refusing transitions out of terminal states.
    pub fn transition(&mut self, next: ReplayState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidInput(format!(
                "Replay {} cannot move from {} to {}",
                self.replay_id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Refresh `elapsed_time` from `started_at`.
    pub fn touch_elapsed(&mut self) {
        let elapsed = (Utc::now() - self.started_at).to_std().unwrap_or_default();
        self.elapsed_time = format_elapsed(elapsed);
    }
}

/// Body of a replay request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub operation: String,
    #[serde(default)]
    pub filter: Option<ReplayFilter>,
}

/// Optional scope of a replay request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayFilter {
    #[serde(default)]
    pub kinds: Vec<String>,
}

impl ReplayRequest {
    /// Single kind scope. Only one kind per run is supported.
    pub fn kind(&self) -> Result<Option<String>> {
        match self.filter.as_ref().map(|f| f.kinds.as_slice()) {
            None | Some([]) => Ok(None),
            Some([kind]) if !kind.trim().is_empty() => Ok(Some(kind.clone())),
            Some([_]) => Err(Error::InvalidInput("Replay kind must not be blank".into())),
            Some(_) => Err(Error::InvalidInput(
                "Replay accepts at most one kind per request".into(),
            )),
        }
    }
}

/// Format a duration as `"{h}h {m}m {s}s"`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}
