//! Structured logging schema and field name constants for metastore.
//!
//! All crates use these constants for consistent structured logging fields so
//! log aggregation can query by the same field names across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Message rejected, run failed, requires operator attention |
//! | WARN  | Recoverable issue, skipped input, redelivery requested |
//! | INFO  | Lifecycle events (startup, provisioning, replay start/finish) |
//! | DEBUG | Per-page decisions, intermediate counts |
//! | TRACE | Per-record iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Correlation ID propagated from the triggering message or request.
pub const CORRELATION_ID: &str = "correlation_id";

/// Tenant (data partition) the operation is scoped to.
pub const PARTITION_ID: &str = "partition_id";

/// Subsystem originating the log event.
/// Values: "api", "db", "bus", "jobs"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "compliance", "replay", "subscriber", "notifier", "pool"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "update_compliance", "publish", "provision", "claim_next"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Legal tag name being propagated.
pub const TAG: &str = "tag";

/// Replay run identifier.
pub const REPLAY_ID: &str = "replay_id";

/// Bus message identifier.
pub const MESSAGE_ID: &str = "message_id";

/// Topic name.
pub const TOPIC: &str = "topic";

/// Subscription name.
pub const SUBSCRIPTION: &str = "subscription";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of records touched by a page or batch.
pub const RECORD_COUNT: &str = "record_count";

/// Number of bus messages published.
pub const MESSAGE_COUNT: &str = "message_count";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Target used for audit events.
pub const AUDIT_TARGET: &str = "audit";
