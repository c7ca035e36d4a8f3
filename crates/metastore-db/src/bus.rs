//! PostgreSQL-backed pull message bus.
//!
//! Publishing fans a message out to one row per subscription on the topic.
//! A subscriber pump claims the oldest visible row with `FOR UPDATE SKIP
//! LOCKED`, hides it for the visibility timeout, hands it to the receiver,
//! and settles it from the receiver's decision:
//!
//! - ack deletes the row
//! - nack makes it visible again immediately
//! - reject dead-letters it
//!
//! A pump that dies mid-delivery leaves the row hidden until the visibility
//! timeout lapses, after which another consumer picks it up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use metastore_core::{
    await_decision, defaults, new_v7, AckDecision, AckReplier, Error, EventTransport,
    InboundMessage, MessageReceiver, OutboundMessage, Result, SubscriptionHandle,
};

/// Polling and visibility settings for [`PgEventTransport`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Sleep between claims when the subscription is empty.
    pub poll_interval: Duration,
    /// How long a claimed message stays hidden from other consumers.
    pub visibility_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(defaults::BUS_POLL_INTERVAL_MS),
            visibility_timeout: Duration::from_secs(defaults::BUS_VISIBILITY_TIMEOUT_SECS),
        }
    }
}

impl BusConfig {
    /// Read `BUS_POLL_INTERVAL_MS` and `BUS_VISIBILITY_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = std::env::var("BUS_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = std::env::var("BUS_VISIBILITY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.visibility_timeout = Duration::from_secs(secs);
        }
        config
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

/// PostgreSQL implementation of EventTransport.
#[derive(Clone)]
pub struct PgEventTransport {
    pool: Pool<Postgres>,
    config: BusConfig,
}

impl PgEventTransport {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self::with_config(pool, BusConfig::default())
    }

    pub fn with_config(pool: Pool<Postgres>, config: BusConfig) -> Self {
        Self { pool, config }
    }

    async fn subscription_exists(&self, partition_id: &str, subscription: &str) -> Result<bool> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS(
                 SELECT 1 FROM bus_subscription WHERE data_partition_id = $1 AND name = $2
             )",
        )
        .bind(partition_id)
        .bind(subscription)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(exists.0)
    }

    /// Claim the oldest visible message on a subscription.
    ///
    /// Rows whose attributes do not decode are dead-lettered on the spot and
    /// the next row is claimed instead.
    async fn claim_next(&self, partition_id: &str, subscription: &str) -> Result<Option<InboundMessage>> {
        loop {
            let row = sqlx::query(
                "UPDATE bus_message
                 SET visible_at = NOW() + make_interval(secs => $3),
                     delivery_attempt = delivery_attempt + 1
                 WHERE id = (
                     SELECT id FROM bus_message
                     WHERE data_partition_id = $1
                       AND subscription = $2
                       AND NOT dead_lettered
                       AND visible_at <= NOW()
                     ORDER BY created_at, id
                     LIMIT 1
                     FOR UPDATE SKIP LOCKED
                 )
                 RETURNING id, data, attributes, delivery_attempt",
            )
            .bind(partition_id)
            .bind(subscription)
            .bind(self.config.visibility_timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

            let Some(row) = row else {
                return Ok(None);
            };
            let id: Uuid = row.get("id");
            let attributes = match decode_attributes(row.get("attributes")) {
                Ok(attributes) => attributes,
                Err(e) => {
                    error!(
                        subsystem = "bus",
                        component = "subscriber",
                        partition_id = %partition_id,
                        subscription = %subscription,
                        message_id = %id,
                        error = %e,
                        "Dead-lettering message with undecodable attributes"
                    );
                    self.settle(&id.to_string(), AckDecision::Reject).await?;
                    continue;
                }
            };
            let attempt: i32 = row.get("delivery_attempt");
            return Ok(Some(InboundMessage {
                id: id.to_string(),
                data: row.get("data"),
                attributes,
                delivery_attempt: attempt.max(0) as u32,
            }));
        }
    }

    async fn settle(&self, message_id: &str, decision: AckDecision) -> Result<()> {
        let id = Uuid::parse_str(message_id)
            .map_err(|e| Error::Internal(format!("Bad bus message id {}: {}", message_id, e)))?;
        let sql = match decision {
            AckDecision::Ack => "DELETE FROM bus_message WHERE id = $1",
            AckDecision::Nack => "UPDATE bus_message SET visible_at = NOW() WHERE id = $1",
            AckDecision::Reject => "UPDATE bus_message SET dead_lettered = TRUE WHERE id = $1",
        };
        sqlx::query(sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
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
            component = "subscriber",
            partition_id = %partition_id,
            subscription = %subscription,
            "Subscription pump started"
        );

        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            match self.claim_next(&partition_id, &subscription).await {
                Ok(Some(message)) => {
                    let message_id = message.id.clone();
                    let (replier, rx) = AckReplier::channel();
                    receiver.receive(message, replier).await;
                    let decision = await_decision(rx).await;
                    debug!(
                        subsystem = "bus",
                        component = "subscriber",
                        message_id = %message_id,
                        decision = ?decision,
                        "Settling message"
                    );
                    if let Err(e) = self.settle(&message_id, decision).await {
                        // Row stays hidden until the visibility timeout and is redelivered.
                        error!(
                            subsystem = "bus",
                            component = "subscriber",
                            message_id = %message_id,
                            error = %e,
                            "Failed to settle message"
                        );
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
                Err(e) => {
                    warn!(
                        subsystem = "bus",
                        component = "subscriber",
                        subscription = %subscription,
                        error = %e,
                        "Failed to claim message"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }
        }

        info!(
            subsystem = "bus",
            component = "subscriber",
            subscription = %subscription,
            "Subscription pump stopped"
        );
    }
}

/// Attributes are stored as a flat JSON object of strings.
fn decode_attributes(value: JsonValue) -> Result<HashMap<String, String>> {
    serde_json::from_value(value)
        .map_err(|e| Error::Serialization(format!("Bad message attributes: {}", e)))
}

#[async_trait]
impl EventTransport for PgEventTransport {
    async fn topic_exists(&self, partition_id: &str, topic: &str) -> Result<bool> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM bus_topic WHERE data_partition_id = $1 AND name = $2)",
        )
        .bind(partition_id)
        .bind(topic)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(exists.0)
    }

    async fn create_topic(&self, partition_id: &str, topic: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO bus_topic (data_partition_id, name) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(partition_id)
        .bind(topic)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn find_subscription(
        &self,
        partition_id: &str,
        topic: &str,
        prefix: &str,
    ) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT name FROM bus_subscription
             WHERE data_partition_id = $1
               AND topic = $2
               AND left(name, length($3)) = $3
             ORDER BY name
             LIMIT 1",
        )
        .bind(partition_id)
        .bind(topic)
        .bind(prefix)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.map(|(name,)| name))
    }

    async fn create_subscription(
        &self,
        partition_id: &str,
        topic: &str,
        name: &str,
    ) -> Result<String> {
        if !self.topic_exists(partition_id, topic).await? {
            return Err(Error::NotFound(format!("Topic {} in {}", topic, partition_id)));
        }
        sqlx::query(
            "INSERT INTO bus_subscription (data_partition_id, name, topic) VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
        )
        .bind(partition_id)
        .bind(name)
        .bind(topic)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(name.to_string())
    }

    async fn publish(
        &self,
        partition_id: &str,
        topic: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        if !self.topic_exists(partition_id, topic).await? {
            return Err(Error::Transport(format!(
                "Topic {} does not exist in {}",
                topic, partition_id
            )));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let subscriptions: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM bus_subscription WHERE data_partition_id = $1 AND topic = $2",
        )
        .bind(partition_id)
        .bind(topic)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        for message in &messages {
            let attributes = serde_json::to_value(&message.attributes)?;
            for (subscription,) in &subscriptions {
                sqlx::query(
                    "INSERT INTO bus_message (id, data_partition_id, subscription, data, attributes)
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(new_v7())
                .bind(partition_id)
                .bind(subscription)
                .bind(&message.data)
                .bind(&attributes)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
            }
        }
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "bus",
            component = "publisher",
            partition_id = %partition_id,
            topic = %topic,
            message_count = messages.len(),
            fanout = subscriptions.len(),
            "Published messages"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        partition_id: &str,
        subscription: &str,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Result<SubscriptionHandle> {
        if !self.subscription_exists(partition_id, subscription).await? {
            return Err(Error::NotFound(format!(
                "Subscription {} in {}",
                subscription, partition_id
            )));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_config_builder() {
        let config = BusConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_visibility_timeout(Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.visibility_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_bus_config_defaults() {
        let config = BusConfig::default();
        assert_eq!(
            config.poll_interval,
            Duration::from_millis(defaults::BUS_POLL_INTERVAL_MS)
        );
        assert_eq!(
            config.visibility_timeout,
            Duration::from_secs(defaults::BUS_VISIBILITY_TIMEOUT_SECS)
        );
        assert!(config.visibility_timeout > Duration::from_secs(defaults::COMPLIANCE_MAX_RUNNING_SECS));
    }

    #[test]
    fn test_decode_attributes_accepts_string_map() {
        let attributes =
            decode_attributes(serde_json::json!({"data-partition-id": "opendes"})).unwrap();
        assert_eq!(attributes["data-partition-id"], "opendes");
    }

    #[test]
    fn test_decode_attributes_rejects_non_string_values() {
        for bad in [
            serde_json::json!({"data-partition-id": 7}),
            serde_json::json!(["opendes"]),
            serde_json::json!(null),
        ] {
            let err = decode_attributes(bad).unwrap_err();
            assert!(matches!(err, Error::Serialization(_)));
        }
    }
}
