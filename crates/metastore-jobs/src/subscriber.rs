//! Legal-tags-changed subscription management and message handling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{error, info, warn};

use metastore_core::{
    decode_legal_tag_changes, defaults, validate_message, AckReplier, EventTransport,
    InboundMessage, LegalCompliance, LegalTagChangedCollection, MessageReceiver, RequestContext,
    Result, SubscriptionHandle,
};

use crate::compliance::ComplianceChangeOrchestrator;
use crate::legal::LegalTagConsistencyValidator;

/// Where tenants receive legal tag changes from.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Topic the legal service publishes tag changes to.
    pub topic: String,
    /// Name prefix of the subscription to reuse; also the name of a new one.
    pub subscription_prefix: String,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            topic: defaults::LEGAL_TAGS_CHANGED_TOPIC.to_string(),
            subscription_prefix: defaults::LEGAL_TAGS_CHANGED_SUBSCRIPTION.to_string(),
        }
    }
}

impl SubscriberConfig {
    /// Read `LEGAL_TAGS_CHANGED_TOPIC` and `LEGAL_TAGS_CHANGED_SUBSCRIPTION`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(topic) = std::env::var("LEGAL_TAGS_CHANGED_TOPIC") {
            config.topic = topic;
        }
        if let Ok(prefix) = std::env::var("LEGAL_TAGS_CHANGED_SUBSCRIPTION") {
            config.subscription_prefix = prefix;
        }
        config
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_subscription_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subscription_prefix = prefix.into();
        self
    }
}

/// Receives legal-tags-changed messages and drives compliance propagation.
///
/// Settlement:
/// - rejected when it fails validation or decoding, or carries no tenant
/// - nacked on any failure after decoding, whatever the error
/// - acked on success
pub struct LegalTagChangedReceiver {
    validator: LegalTagConsistencyValidator,
    orchestrator: Arc<ComplianceChangeOrchestrator>,
}

impl LegalTagChangedReceiver {
    pub fn new(
        validator: LegalTagConsistencyValidator,
        orchestrator: Arc<ComplianceChangeOrchestrator>,
    ) -> Self {
        Self {
            validator,
            orchestrator,
        }
    }

    async fn process(
        &self,
        changes: &LegalTagChangedCollection,
        ctx: &RequestContext,
    ) -> Result<HashMap<String, LegalCompliance>> {
        let validated = self.validator.check(changes, ctx).await?;
        self.orchestrator
            .update_compliance_on_records(&validated, ctx)
            .await
    }
}

#[async_trait]
impl MessageReceiver for LegalTagChangedReceiver {
    async fn receive(&self, message: InboundMessage, replier: AckReplier) {
        let start = Instant::now();

        if let Err(e) = validate_message(&message) {
            error!(
                subsystem = "jobs",
                component = "subscriber",
                message_id = %message.id,
                attributes = ?message.attributes,
                error = %e,
                "Rejecting invalid legal tags changed message"
            );
            replier.reject();
            return;
        }

        let ctx = match RequestContext::from_attributes(&message.attributes) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "subscriber",
                    message_id = %message.id,
                    error = %e,
                    "Rejecting message without tenant context"
                );
                replier.reject();
                return;
            }
        };

        let changes = match decode_legal_tag_changes(&message) {
            Ok(changes) => changes,
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "subscriber",
                    message_id = %message.id,
                    partition_id = %ctx.partition_id(),
                    correlation_id = %ctx.correlation_id(),
                    attributes = ?message.attributes,
                    error = %e,
                    "Rejecting undecodable legal tags changed message"
                );
                replier.reject();
                return;
            }
        };

        match self.process(&changes, &ctx).await {
            Ok(updated) => {
                info!(
                    subsystem = "jobs",
                    component = "subscriber",
                    message_id = %message.id,
                    partition_id = %ctx.partition_id(),
                    correlation_id = %ctx.correlation_id(),
                    record_count = updated.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Legal tags changed message processed"
                );
                replier.ack();
            }
            Err(e) => {
                warn!(
                    subsystem = "jobs",
                    component = "subscriber",
                    message_id = %message.id,
                    partition_id = %ctx.partition_id(),
                    correlation_id = %ctx.correlation_id(),
                    delivery_attempt = message.delivery_attempt,
                    error = %e,
                    "Legal tags changed message failed, requesting redelivery"
                );
                replier.nack();
            }
        }
    }
}

/// Provisions and starts the legal-tags-changed subscription of each tenant.
pub struct SubscriberManager {
    transport: Arc<dyn EventTransport>,
    receiver: Arc<dyn MessageReceiver>,
    config: SubscriberConfig,
}

impl SubscriberManager {
    pub fn new(
        transport: Arc<dyn EventTransport>,
        receiver: Arc<dyn MessageReceiver>,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            transport,
            receiver,
            config,
        }
    }

    /// Subscribe every tenant whose topic exists.
    ///
    /// Tenants without the topic are skipped with a warning; a tenant that
    /// fails to provision is logged and skipped so the others still start.
    pub async fn start(&self, tenants: &[String]) -> Vec<SubscriptionHandle> {
        let mut handles = Vec::new();
        for tenant in tenants {
            match self.start_tenant(tenant).await {
                Ok(Some(handle)) => handles.push(handle),
                Ok(None) => {}
                Err(e) => error!(
                    subsystem = "jobs",
                    component = "subscriber",
                    op = "provision",
                    partition_id = %tenant,
                    error = %e,
                    "Failed to start legal tags subscription"
                ),
            }
        }
        info!(
            subsystem = "jobs",
            component = "subscriber",
            op = "provision",
            tenants = tenants.len(),
            subscriptions = handles.len(),
            "Legal tags subscriptions started"
        );
        handles
    }

    async fn start_tenant(&self, tenant: &str) -> Result<Option<SubscriptionHandle>> {
        let topic = &self.config.topic;
        if !self.transport.topic_exists(tenant, topic).await? {
            warn!(
                subsystem = "jobs",
                component = "subscriber",
                partition_id = %tenant,
                topic = %topic,
                "Topic missing, legal tag compliance updates disabled for tenant"
            );
            return Ok(None);
        }

        let prefix = &self.config.subscription_prefix;
        let subscription = match self
            .transport
            .find_subscription(tenant, topic, prefix)
            .await?
        {
            Some(existing) => existing,
            None => {
                info!(
                    subsystem = "jobs",
                    component = "subscriber",
                    partition_id = %tenant,
                    subscription = %prefix,
                    "Creating subscription"
                );
                self.transport
                    .create_subscription(tenant, topic, prefix)
                    .await?
            }
        };

        let handle = self
            .transport
            .subscribe(tenant, &subscription, self.receiver.clone())
            .await?;
        Ok(Some(handle))
    }
}
