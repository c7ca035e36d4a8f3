//! Centralized default constants for metastore.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic numbers.
//!
//! Organized by domain area.

// =============================================================================
// COMPLIANCE PROPAGATION
// =============================================================================

/// Records fetched per `query_by_legal_tag_name` page.
pub const COMPLIANCE_PAGE_SIZE: usize = 500;

/// Wall-clock budget for one legal-tag-changed event before the update is
/// abandoned and left to redelivery (115 seconds).
pub const COMPLIANCE_MAX_RUNNING_SECS: u64 = 115;

/// Tag names sent to the legal service per validation request.
pub const LEGAL_VALIDATE_CHUNK_SIZE: usize = 25;

/// Legal service request timeout in seconds.
pub const LEGAL_TIMEOUT_SECS: u64 = 30;

/// Default legal service base URL.
pub const LEGAL_SERVICE_URL: &str = "http://localhost:8080/api/legal/v1";

// =============================================================================
// NOTIFICATION
// =============================================================================

/// Change notifications packed into one bus message.
pub const NOTIFICATION_BATCH_SIZE: usize = 50;

/// Topic that carries legal tag status changes.
pub const LEGAL_TAGS_CHANGED_TOPIC: &str = "legaltags-changed";

/// Name prefix of the pull subscription this service reads legal tag changes from.
pub const LEGAL_TAGS_CHANGED_SUBSCRIPTION: &str = "storage-legaltags-changed";

/// Topic downstream consumers read record change notifications from.
pub const RECORDS_CHANGED_TOPIC: &str = "recordstopic";

/// Topic the indexer reads reindex notifications from.
pub const REINDEX_TOPIC: &str = "reindex";

// =============================================================================
// REPLAY
// =============================================================================

/// Records fetched and re-published per replay page.
pub const REPLAY_BATCH_SIZE: usize = 50;

/// Replay pages allowed in flight at once.
pub const REPLAY_PARALLELISM: usize = 4;

/// Replay progress channel capacity.
pub const REPLAY_PROGRESS_CAPACITY: usize = 64;

/// Replay event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// MESSAGE BUS
// =============================================================================

/// Idle poll interval of a pull subscriber in milliseconds.
pub const BUS_POLL_INTERVAL_MS: u64 = 500;

/// Seconds a claimed message stays invisible before another consumer may claim it.
///
/// Must outlast a full compliance run so an in-flight message is not claimed twice.
pub const BUS_VISIBILITY_TIMEOUT_SECS: u64 = COMPLIANCE_MAX_RUNNING_SECS + 65;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 8080;

/// Longest `correlation-id` header accepted from HTTP callers.
pub const CORRELATION_ID_MAX_LEN: usize = 64;
