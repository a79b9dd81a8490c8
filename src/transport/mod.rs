//! Transport layer for workflow messaging.
//!
//! A transport hands envelopes between workers with at-least-once
//! delivery. Subscribers on the same topic form a competing-consumer
//! group: every published message reaches exactly one of them. The
//! in-memory variant backs tests and single-process deployments; the MQTT
//! variant provides the durable broker path.

use crate::contracts::PaigeantMessage;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod inmemory;
pub mod mqtt;

pub use inmemory::InMemoryTransport;
pub use mqtt::MqttTransport;

/// Transport failure surface.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("transport closed")]
    Closed,
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("acknowledge failed: {0}")]
    Ack(String),
    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Opaque handle identifying one delivery for ack/nack bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub topic: String,
    pub id: u64,
}

/// One delivered message: raw bytes plus the tag to settle it with.
///
/// Bytes are handed to the consumer unparsed so that a poisonous payload
/// can still be acked and dropped instead of wedging the topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
}

/// A live subscription on one topic.
///
/// Holds at most one undelivered message; backpressure past that single
/// in-flight slot stays in the transport.
pub struct Subscription {
    topic: String,
    receiver: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub(crate) fn new(topic: String, receiver: mpsc::Receiver<Delivery>) -> Self {
        Self { topic, receiver }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next delivery. Returns [`TransportError::Closed`] once
    /// the transport disconnects.
    pub async fn next(&mut self) -> Result<Delivery, TransportError> {
        self.receiver.recv().await.ok_or(TransportError::Closed)
    }
}

/// Pluggable publish/subscribe/ack/nack over named topics.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Acquire broker resources. Idempotent.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Release broker resources. Idempotent; in-flight subscriptions
    /// observe [`TransportError::Closed`].
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Durable at-least-once handoff of raw envelope bytes.
    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Serialize and publish an envelope.
    async fn publish(
        &self,
        topic: &str,
        message: &PaigeantMessage,
    ) -> Result<(), TransportError> {
        let payload = message.to_bytes().map_err(|e| TransportError::Publish {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;
        self.publish_raw(topic, payload).await
    }

    /// Join the competing-consumer group for `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;

    /// Confirm processing. Idempotent.
    async fn ack(&self, tag: &DeliveryTag) -> Result<(), TransportError>;

    /// Reject a delivery. With `requeue`, the message becomes eligible for
    /// redelivery; transports without native requeue republish the raw
    /// bytes to the tail of the same topic and ack the original.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError>;
}
