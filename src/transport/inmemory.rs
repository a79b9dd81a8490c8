//! In-process transport: one FIFO queue per topic.
//!
//! No durability and no broker; ack is pure bookkeeping. Subscribing on an
//! empty topic blocks cooperatively until a message arrives. Useful for
//! tests and single-process deployments.

use super::{Delivery, DeliveryTag, Subscription, Transport, TransportError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

#[derive(Default)]
struct TopicQueue {
    ready: VecDeque<Delivery>,
    pending: HashMap<u64, Delivery>,
}

#[derive(Default)]
struct Shared {
    topics: Mutex<HashMap<String, TopicQueue>>,
    notify: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
}

/// Process-local FIFO transport.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ready (undelivered) messages on a topic.
    pub fn depth(&self, topic: &str) -> usize {
        let topics = self.shared.topics.lock().expect("topic lock poisoned");
        topics.get(topic).map_or(0, |q| q.ready.len())
    }

    /// Number of delivered-but-unsettled messages on a topic.
    pub fn pending(&self, topic: &str) -> usize {
        let topics = self.shared.topics.lock().expect("topic lock poisoned");
        topics.get(topic).map_or(0, |q| q.pending.len())
    }

    fn take_ready(shared: &Shared, topic: &str) -> Option<Delivery> {
        let mut topics = shared.topics.lock().expect("topic lock poisoned");
        let queue = topics.get_mut(topic)?;
        let delivery = queue.ready.pop_front()?;
        queue.pending.insert(delivery.tag.id, delivery.clone());
        Some(delivery)
    }

    fn requeue_front(shared: &Shared, delivery: Delivery) {
        let mut topics = shared.topics.lock().expect("topic lock poisoned");
        let queue = topics.entry(delivery.tag.topic.clone()).or_default();
        queue.pending.remove(&delivery.tag.id);
        queue.ready.push_front(delivery);
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.shared.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut topics = self.shared.topics.lock().expect("topic lock poisoned");
            topics.entry(topic.to_string()).or_default().ready.push_back(Delivery {
                tag: DeliveryTag {
                    topic: topic.to_string(),
                    id,
                },
                payload,
            });
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        // Single-slot channel: the feeder competes with other subscribers
        // for the shared queue and parks one delivery at a time.
        let (sender, receiver) = mpsc::channel(1);
        let shared = self.shared.clone();
        let topic_name = topic.to_string();
        tokio::spawn(async move {
            loop {
                // Register for wakeups before checking the queue, so a
                // publish racing the empty check is never missed.
                let mut wakeup = std::pin::pin!(shared.notify.notified());
                wakeup.as_mut().enable();
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(delivery) = InMemoryTransport::take_ready(&shared, &topic_name) {
                    if sender.send(delivery.clone()).await.is_err() {
                        // Subscriber went away between pop and handoff.
                        InMemoryTransport::requeue_front(&shared, delivery);
                        break;
                    }
                    continue;
                }
                wakeup.await;
            }
            debug!(topic = %topic_name, "in-memory subscription feeder stopped");
        });
        Ok(Subscription::new(topic.to_string(), receiver))
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), TransportError> {
        let mut topics = self.shared.topics.lock().expect("topic lock poisoned");
        if let Some(queue) = topics.get_mut(&tag.topic) {
            queue.pending.remove(&tag.id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        let mut topics = self.shared.topics.lock().expect("topic lock poisoned");
        let queue = topics.entry(delivery.tag.topic.clone()).or_default();
        queue.pending.remove(&delivery.tag.id);
        if requeue {
            queue.ready.push_front(delivery.clone());
            drop(topics);
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn publish(transport: &InMemoryTransport, topic: &str, body: &str) {
        transport
            .publish_raw(topic, body.as_bytes().to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_then_subscribe_delivers_in_order() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        publish(&transport, "echo", "one").await;
        publish(&transport, "echo", "two").await;

        let mut sub = transport.subscribe("echo").await.unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.payload, b"one");
        transport.ack(&first.tag).await.unwrap();

        let second = sub.next().await.unwrap();
        assert_eq!(second.payload, b"two");
        transport.ack(&second.tag).await.unwrap();
        assert_eq!(transport.pending("echo"), 0);
    }

    #[tokio::test]
    async fn subscribe_blocks_until_message_arrives() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        let mut sub = transport.subscribe("echo").await.unwrap();

        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        publish(&transport, "echo", "late").await;
        let delivery = waiter.await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn competing_consumers_each_message_delivered_once() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        let mut sub_a = transport.subscribe("work").await.unwrap();
        let mut sub_b = transport.subscribe("work").await.unwrap();

        for i in 0..4 {
            publish(&transport, "work", &format!("m{i}")).await;
        }

        // Distribution between the two consumers is unspecified; what is
        // guaranteed is that all four arrive exactly once in total.
        let mut seen = Vec::new();
        for _ in 0..4 {
            let delivery = tokio::select! {
                d = sub_a.next() => d.unwrap(),
                d = sub_b.next() => d.unwrap(),
            };
            transport.ack(&delivery.tag).await.unwrap();
            seen.push(delivery.payload);
        }

        seen.sort();
        assert_eq!(seen, vec![b"m0".to_vec(), b"m1".to_vec(), b"m2".to_vec(), b"m3".to_vec()]);
        assert_eq!(transport.depth("work"), 0);
        assert_eq!(transport.pending("work"), 0);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        publish(&transport, "echo", "retry-me").await;

        let mut sub = transport.subscribe("echo").await.unwrap();
        let first = sub.next().await.unwrap();
        transport.nack(&first, true).await.unwrap();

        let again = sub.next().await.unwrap();
        assert_eq!(again.payload, b"retry-me");
        transport.ack(&again.tag).await.unwrap();
    }

    #[tokio::test]
    async fn nack_without_requeue_drops() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        publish(&transport, "echo", "poison").await;

        let mut sub = transport.subscribe("echo").await.unwrap();
        let delivery = sub.next().await.unwrap();
        transport.nack(&delivery, false).await.unwrap();

        assert_eq!(transport.depth("echo"), 0);
        assert_eq!(transport.pending("echo"), 0);
    }

    #[tokio::test]
    async fn disconnect_closes_subscriptions() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        let mut sub = transport.subscribe("echo").await.unwrap();

        transport.disconnect().await.unwrap();
        let result = tokio::time::timeout(Duration::from_millis(500), sub.next()).await;
        assert!(matches!(result, Ok(Err(TransportError::Closed))));
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let transport = InMemoryTransport::new();
        transport.connect().await.unwrap();
        publish(&transport, "echo", "once").await;

        let mut sub = transport.subscribe("echo").await.unwrap();
        let delivery = sub.next().await.unwrap();
        transport.ack(&delivery.tag).await.unwrap();
        transport.ack(&delivery.tag).await.unwrap();
    }
}
