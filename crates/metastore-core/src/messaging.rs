//! Message bus envelope types, ack/nack plumbing, and inbound validation.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::context::DATA_PARTITION_ID;
use crate::error::{Error, Result};
use crate::models::LegalTagChangedCollection;

/// A message delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    pub data: String,
    pub attributes: HashMap<String, String>,
    /// 1 on first delivery, incremented on each redelivery.
    pub delivery_attempt: u32,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub data: String,
    pub attributes: HashMap<String, String>,
}

/// Outcome a receiver reports back to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed; remove permanently.
    Ack,
    /// Not processed; make available for redelivery.
    Nack,
    /// Structurally invalid; never redeliver.
    Reject,
}

/// One-shot reply handle for a delivered message.
///
/// Exactly one decision is reported per delivery. Dropping the replier
/// without deciding counts as a nack.
#[derive(Debug)]
pub struct AckReplier {
    tx: Option<oneshot::Sender<AckDecision>>,
}

/// Transport side of an [`AckReplier`].
pub type AckReceiver = oneshot::Receiver<AckDecision>;

impl AckReplier {
    pub fn channel() -> (Self, AckReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn ack(mut self) {
        self.reply(AckDecision::Ack);
    }

    pub fn nack(mut self) {
        self.reply(AckDecision::Nack);
    }

    pub fn reject(mut self) {
        self.reply(AckDecision::Reject);
    }

    fn reply(&mut self, decision: AckDecision) {
        if let Some(tx) = self.tx.take() {
            // Transport may have gone away during shutdown; nothing to report to.
            let _ = tx.send(decision);
        }
    }
}

impl Drop for AckReplier {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::debug!(
                subsystem = "bus",
                component = "ack",
                "Replier dropped without a decision, nacking"
            );
            self.reply(AckDecision::Nack);
        }
    }
}

/// Wait for the receiver's decision. A dropped replier reads as a nack.
pub async fn await_decision(rx: AckReceiver) -> AckDecision {
    rx.await.unwrap_or(AckDecision::Nack)
}

/// Handle to a running subscription pump.
pub struct SubscriptionHandle {
    subscription: String,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(subscription: String, shutdown_tx: mpsc::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            subscription,
            shutdown_tx,
            task,
        }
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Stop pulling and wait for the pump to finish its current message.
    pub async fn shutdown(self) -> Result<()> {
        // The pump may already have exited if its source closed.
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Subscription task failed: {}", e)))
    }
}

/// Structural validation of an inbound legal-tags-changed message.
///
/// Pure function of the raw message: the data must be a non-empty JSON array
/// whose elements all carry a non-null `body`, and the attributes must include
/// a non-blank `data-partition-id`.
pub fn validate_message(message: &InboundMessage) -> Result<()> {
    envelopes(message).map(|_| ())
}

/// Decode every envelope body into one merged change collection.
///
/// Each `body` is either a JSON object or a string containing JSON.
pub fn decode_legal_tag_changes(message: &InboundMessage) -> Result<LegalTagChangedCollection> {
    let mut merged = LegalTagChangedCollection::default();
    for envelope in envelopes(message)? {
        let body = &envelope["body"];
        let collection: LegalTagChangedCollection = match body {
            JsonValue::String(raw) => serde_json::from_str(raw),
            other => serde_json::from_value(other.clone()),
        }
        .map_err(|e| Error::InvalidMessage(format!("Undecodable body: {}", e)))?;
        merged
            .status_changed_tags
            .extend(collection.status_changed_tags);
    }
    Ok(merged)
}

fn envelopes(message: &InboundMessage) -> Result<Vec<JsonValue>> {
    let data = message.data.trim();
    if data.is_empty() || data == "{}" {
        return Err(Error::InvalidMessage("Message data is empty".into()));
    }

    if message.attributes.is_empty() {
        return Err(Error::InvalidMessage("Message attributes are empty".into()));
    }
    let has_partition = message
        .attributes
        .get(DATA_PARTITION_ID)
        .is_some_and(|p| !p.trim().is_empty());
    if !has_partition {
        return Err(Error::InvalidMessage(format!(
            "Missing required attribute {}",
            DATA_PARTITION_ID
        )));
    }

    let parsed: JsonValue = serde_json::from_str(data)
        .map_err(|e| Error::InvalidMessage(format!("Message data is not JSON: {}", e)))?;
    let JsonValue::Array(items) = parsed else {
        return Err(Error::InvalidMessage("Message data is not an array".into()));
    };
    if items.is_empty() {
        return Err(Error::InvalidMessage("Message data array is empty".into()));
    }
    for (i, item) in items.iter().enumerate() {
        match item.get("body") {
            Some(body) if !body.is_null() => {}
            _ => {
                return Err(Error::InvalidMessage(format!(
                    "Envelope {} has no body",
                    i
                )))
            }
        }
    }
    Ok(items)
}
