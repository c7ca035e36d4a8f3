//! # metastore-jobs
//!
//! Long-running record mutation pipelines for metastore.
//!
//! - [`legal`]: confirms tag status claims against the legal service
//! - [`compliance`]: propagates a tag status change onto every record
//! - [`notifier`]: batches and publishes record change notifications
//! - [`subscriber`]: per-tenant provisioning and the legal-tags-changed receiver
//! - [`replay`]: operator-driven bulk re-publish with durable progress
//! - [`audit`]: audit event sinks

pub mod audit;
pub mod compliance;
pub mod legal;
pub mod notifier;
pub mod replay;
pub mod subscriber;

pub use audit::{RecordingAuditSink, TracingAuditSink};
pub use compliance::{ComplianceChangeOrchestrator, ComplianceConfig};
pub use legal::{HttpLegalService, LegalConfig, LegalTagConsistencyValidator};
pub use notifier::ChangeNotifier;
pub use replay::{ReplayConfig, ReplayEvent, ReplayOrchestrator};
pub use subscriber::{LegalTagChangedReceiver, SubscriberConfig, SubscriberManager};
