//! Record change notification publishing.

use std::sync::Arc;

use tracing::debug;

use metastore_core::{
    defaults, EventTransport, OutboundMessage, PubSubInfo, RequestContext, Result,
};

/// Packs change notifications into bus messages and publishes them.
///
/// Each message carries at most `batch_size` entries and the tenant, user,
/// and correlation attributes of the context. Transport errors propagate.
#[derive(Clone)]
pub struct ChangeNotifier {
    transport: Arc<dyn EventTransport>,
    batch_size: usize,
}

impl ChangeNotifier {
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        Self::with_batch_size(transport, defaults::NOTIFICATION_BATCH_SIZE)
    }

    pub fn with_batch_size(transport: Arc<dyn EventTransport>, batch_size: usize) -> Self {
        Self {
            transport,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Publish `infos` to `topic`. Returns the number of bus messages sent.
    pub async fn publish(
        &self,
        ctx: &RequestContext,
        topic: &str,
        infos: &[PubSubInfo],
    ) -> Result<usize> {
        if infos.is_empty() {
            return Ok(0);
        }

        let attributes = ctx.to_attributes();
        let messages = infos
            .chunks(self.batch_size)
            .map(|chunk| {
                Ok(OutboundMessage {
                    data: serde_json::to_string(chunk)?,
                    attributes: attributes.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let count = messages.len();

        self.transport
            .publish(ctx.partition_id(), topic, messages)
            .await?;

        debug!(
            subsystem = "jobs",
            component = "notifier",
            op = "publish",
            partition_id = %ctx.partition_id(),
            correlation_id = %ctx.correlation_id(),
            topic = %topic,
            record_count = infos.len(),
            message_count = count,
            "Published change notifications"
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metastore_core::context::{CORRELATION_ID, DATA_PARTITION_ID, USER};
    use metastore_core::{Error, OperationType};
    use metastore_db::MemoryTransport;

    fn infos(n: usize) -> Vec<PubSubInfo> {
        (0..n)
            .map(|i| PubSubInfo::new(format!("r{}", i), "k", OperationType::Update))
            .collect()
    }

    #[tokio::test]
    async fn test_publish_batches_by_size() {
        let bus = MemoryTransport::new();
        bus.create_topic("p1", "t").await.unwrap();
        let notifier = ChangeNotifier::with_batch_size(Arc::new(bus.clone()), 50);
        let ctx = RequestContext::new("p1").with_user("u@x").with_correlation_id("c1");

        assert_eq!(notifier.publish(&ctx, "t", &infos(101)).await.unwrap(), 3);

        let sent = bus.published("p1", "t").await;
        assert_eq!(sent.len(), 3);
        let sizes: Vec<usize> = sent
            .iter()
            .map(|m| serde_json::from_str::<Vec<PubSubInfo>>(&m.data).unwrap().len())
            .collect();
        assert_eq!(sizes, vec![50, 50, 1]);
        for m in &sent {
            assert_eq!(m.attributes[DATA_PARTITION_ID], "p1");
            assert_eq!(m.attributes[USER], "u@x");
            assert_eq!(m.attributes[CORRELATION_ID], "c1");
        }
    }

    #[tokio::test]
    async fn test_publish_nothing_sends_nothing() {
        let bus = MemoryTransport::new();
        let notifier = ChangeNotifier::new(Arc::new(bus.clone()));
        let sent = notifier
            .publish(&RequestContext::new("p1"), "missing", &[])
            .await
            .unwrap();
        assert_eq!(sent, 0);
    }

    #[tokio::test]
    async fn test_publish_surfaces_transport_errors() {
        let notifier = ChangeNotifier::new(Arc::new(MemoryTransport::new()));
        let err = notifier
            .publish(&RequestContext::new("p1"), "missing", &infos(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
