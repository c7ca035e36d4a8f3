//! Audit event sinks.

use std::sync::Mutex;

use tracing::info;

use metastore_core::logging::AUDIT_TARGET;
use metastore_core::{AuditEvent, AuditSink, RequestContext};

/// Writes audit events as structured logs on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, ctx: &RequestContext, event: AuditEvent) {
        match event {
            AuditEvent::ComplianceUpdated { tag, record_ids } => info!(
                target: AUDIT_TARGET,
                action = "compliance_update",
                outcome = "success",
                partition_id = %ctx.partition_id(),
                correlation_id = %ctx.correlation_id(),
                user = ctx.user().unwrap_or_default(),
                tag = %tag,
                record_count = record_ids.len(),
                record_ids = ?record_ids,
                "Record compliance updated"
            ),
            AuditEvent::ReplayRequested {
                replay_id,
                operation,
                kind,
            } => info!(
                target: AUDIT_TARGET,
                action = "replay_request",
                outcome = "success",
                partition_id = %ctx.partition_id(),
                correlation_id = %ctx.correlation_id(),
                user = ctx.user().unwrap_or_default(),
                replay_id = %replay_id,
                operation = %operation,
                kind = kind.as_deref().unwrap_or("*"),
                "Replay requested"
            ),
            AuditEvent::ReplayRequestFailed { operation, reason } => info!(
                target: AUDIT_TARGET,
                action = "replay_request",
                outcome = "failure",
                partition_id = %ctx.partition_id(),
                correlation_id = %ctx.correlation_id(),
                user = ctx.user().unwrap_or_default(),
                operation = %operation,
                reason = %reason,
                "Replay request refused"
            ),
        }
    }
}

/// Keeps every event in memory, tagged with its partition.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<(String, AuditEvent)>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, AuditEvent)> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record(&self, ctx: &RequestContext, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push((ctx.partition_id().to_string(), event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_keeps_partition() {
        let sink = RecordingAuditSink::new();
        sink.record(
            &RequestContext::new("p1"),
            AuditEvent::ReplayRequestFailed {
                operation: "purge".into(),
                reason: "unsupported".into(),
            },
        );
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "p1");
    }

    #[test]
    fn test_tracing_sink_accepts_all_events() {
        let ctx = RequestContext::new("p1").with_user("u");
        TracingAuditSink.record(
            &ctx,
            AuditEvent::ComplianceUpdated {
                tag: "T".into(),
                record_ids: vec!["a".into()],
            },
        );
        TracingAuditSink.record(
            &ctx,
            AuditEvent::ReplayRequested {
                replay_id: metastore_core::new_v7(),
                operation: metastore_core::ReplayOperation::Replay,
                kind: None,
            },
        );
    }
}
