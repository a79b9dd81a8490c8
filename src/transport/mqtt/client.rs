//! rumqttc-backed durable transport.
//!
//! A background supervisor task owns the event loop: it routes inbound
//! publishes to the matching subscription, tracks them in a pending map
//! until the executor settles them, and drives reconnection with bounded
//! backoff. Publish paths are gated on the watch-channel connection state
//! so callers fail fast instead of queueing into a dead connection.

use super::connection::{configure_mqtt_options, shared_topic, ConnectionState, ReconnectConfig};
use crate::config::MqttConfig;
use crate::transport::{Delivery, DeliveryTag, Subscription, Transport, TransportError};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SUBSCRIPTION_BUFFER: usize = 16;

/// Routing and settlement state shared with the event-loop task.
#[derive(Default)]
struct Router {
    subscriptions: StdMutex<HashMap<String, mpsc::Sender<Delivery>>>,
    pending: StdMutex<HashMap<u64, Publish>>,
    next_id: AtomicU64,
}

impl Router {
    fn sender_for(&self, topic: &str) -> Option<mpsc::Sender<Delivery>> {
        self.subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .get(topic)
            .cloned()
    }

    fn track(&self, topic: &str, publish: Publish) -> Delivery {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = publish.payload.to_vec();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, publish);
        Delivery {
            tag: DeliveryTag {
                topic: topic.to_string(),
                id,
            },
            payload,
        }
    }

    fn settle(&self, id: u64) -> Option<Publish> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id)
    }
}

struct Handle {
    client: AsyncClient,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    /// Shared-subscription filters, re-applied after reconnect.
    subscribed: Arc<StdMutex<Vec<String>>>,
}

/// Durable broker transport over MQTT 5.
pub struct MqttTransport {
    config: MqttConfig,
    reconnect: ReconnectConfig,
    router: Arc<Router>,
    handle: Mutex<Option<Handle>>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            reconnect: ReconnectConfig::default(),
            router: Arc::new(Router::default()),
            handle: Mutex::new(None),
        }
    }

    /// Current connection state, if a connection was ever attempted.
    pub async fn connection_state(&self) -> Option<ConnectionState> {
        let handle = self.handle.lock().await;
        handle.as_ref().map(|h| h.state_rx.borrow().clone())
    }

    async fn wait_for_connack(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let wait = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.borrow().is_operational() {
                    return Ok(());
                }
                if state_rx.changed().await.is_err() {
                    return Err(TransportError::Connect("connection task ended".into()));
                }
            }
        })
        .await;
        match wait {
            Ok(result) => result,
            Err(_) => Err(TransportError::Connect(
                "timed out waiting for broker ConnAck".into(),
            )),
        }
    }

    /// Sleep that aborts early on shutdown. Returns false when shutdown
    /// was requested.
    async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn route_publish(router: &Router, client: &AsyncClient, publish: Publish) {
        let topic = String::from_utf8_lossy(&publish.topic).to_string();
        match router.sender_for(&topic) {
            Some(sender) => {
                let delivery = router.track(&topic, publish);
                let id = delivery.tag.id;
                if sender.send(delivery).await.is_err() {
                    // Subscriber dropped between routing and handoff; settle
                    // so the broker's pending window is not held open.
                    if let Some(original) = router.settle(id) {
                        let _ = client.ack(&original).await;
                    }
                    warn!(topic = %topic, "delivery for closed subscription dropped");
                }
            }
            None => {
                warn!(topic = %topic, "no subscription for delivered topic, dropping");
                let _ = client.ack(&publish).await;
            }
        }
    }

    async fn supervise(
        mut event_loop: EventLoop,
        client: AsyncClient,
        router: Arc<Router>,
        subscribed: Arc<StdMutex<Vec<String>>>,
        state_tx: watch::Sender<ConnectionState>,
        mut shutdown_rx: watch::Receiver<bool>,
        reconnect: ReconnectConfig,
    ) {
        let mut reconnect_attempts: u32 = 0;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("shutdown signal received, stopping MQTT supervisor");
                        break;
                    }
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        debug!("broker ConnAck received");
                        reconnect_attempts = 0;
                        let _ = state_tx.send(ConnectionState::Connected);
                        let filters: Vec<String> =
                            subscribed.lock().expect("subscribed lock poisoned").clone();
                        for filter in filters {
                            if let Err(e) = client.subscribe(filter.as_str(), QoS::AtLeastOnce).await {
                                error!(filter = %filter, error = %e, "re-subscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        Self::route_publish(&router, &client, publish).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let reason = e.to_string();
                        reconnect_attempts += 1;
                        let delay = reconnect.delay_for_attempt(reconnect_attempts);
                        warn!(
                            error = %reason,
                            attempt = reconnect_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "MQTT event loop error, backing off before reconnect"
                        );
                        let _ = state_tx.send(ConnectionState::Reconnecting(reconnect_attempts));
                        if !Self::interruptible_sleep(&mut shutdown_rx, delay).await {
                            break;
                        }
                    }
                }
            }
        }
        let _ = state_tx.send(ConnectionState::Disconnected("supervisor stopped".into()));
    }

    async fn operational_client(&self) -> Result<AsyncClient, TransportError> {
        let handle = self.handle.lock().await;
        let handle = handle
            .as_ref()
            .ok_or_else(|| TransportError::Connect("transport not connected".into()))?;
        let state = handle.state_rx.borrow().clone();
        if !state.is_operational() {
            return Err(TransportError::Connect(format!(
                "transport not operational: {state:?}"
            )));
        }
        Ok(handle.client.clone())
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut handle_slot = self.handle.lock().await;
        if let Some(handle) = handle_slot.as_ref() {
            if handle.state_rx.borrow().is_operational() {
                return Ok(());
            }
        }
        // A stale, non-operational connection is torn down before the new
        // one starts.
        if let Some(stale) = handle_slot.take() {
            let _ = stale.shutdown_tx.send(true);
            stale.supervisor.abort();
        }

        let options = configure_mqtt_options(&self.config)?;
        let (client, event_loop) = AsyncClient::new(options, 10);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let subscribed = Arc::new(StdMutex::new(Vec::new()));

        let supervisor = tokio::spawn(Self::supervise(
            event_loop,
            client.clone(),
            self.router.clone(),
            subscribed.clone(),
            state_tx,
            shutdown_rx,
            self.reconnect.clone(),
        ));

        if let Err(e) = Self::wait_for_connack(state_rx.clone(), CONNECT_TIMEOUT).await {
            let _ = shutdown_tx.send(true);
            supervisor.abort();
            return Err(e);
        }
        info!(broker = %self.config.broker_url, "MQTT transport connected");

        *handle_slot = Some(Handle {
            client,
            state_rx,
            shutdown_tx,
            supervisor,
            subscribed,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut handle_slot = self.handle.lock().await;
        let Some(handle) = handle_slot.take() else {
            return Ok(());
        };

        let _ = handle.shutdown_tx.send(true);
        let _ = handle.client.disconnect().await;

        match tokio::time::timeout(Duration::from_secs(2), handle.supervisor).await {
            Ok(Ok(())) => debug!("MQTT supervisor shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "MQTT supervisor ended with error"),
            Err(_) => warn!("MQTT supervisor did not stop in time"),
            _ => {}
        }

        // Dropping the senders closes every live subscription.
        self.router
            .subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .clear();
        info!("MQTT transport disconnected");
        Ok(())
    }

    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let client = self.operational_client().await?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let client = self.operational_client().await?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.router
            .subscriptions
            .lock()
            .expect("subscription lock poisoned")
            .insert(topic.to_string(), sender);

        let filter = shared_topic(&self.config.consumer_group, topic);
        client
            .subscribe(filter.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let handle = self.handle.lock().await;
        if let Some(handle) = handle.as_ref() {
            let mut subscribed = handle.subscribed.lock().expect("subscribed lock poisoned");
            if !subscribed.contains(&filter) {
                subscribed.push(filter.clone());
            }
        }
        debug!(topic = %topic, filter = %filter, "subscribed");
        Ok(Subscription::new(topic.to_string(), receiver))
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), TransportError> {
        // Settling twice is a no-op: the pending entry is gone.
        let Some(publish) = self.router.settle(tag.id) else {
            return Ok(());
        };
        let client = self.operational_client().await?;
        client
            .ack(&publish)
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        // MQTT has no native requeue: push the raw bytes to the tail of
        // the same topic, then settle the original.
        if requeue {
            self.publish_raw(&delivery.tag.topic, delivery.payload.clone())
                .await?;
        }
        self.ack(&delivery.tag).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_transport() -> MqttTransport {
        MqttTransport::new(MqttConfig {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            consumer_group: "paigeant".to_string(),
        })
    }

    #[tokio::test]
    async fn connection_state_is_none_before_connect() {
        let transport = test_transport();
        assert!(transport.connection_state().await.is_none());
    }

    #[tokio::test]
    async fn publish_fails_without_connection() {
        let transport = test_transport();
        let result = transport.publish_raw("echo", b"x".to_vec()).await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn subscribe_fails_without_connection() {
        let transport = test_transport();
        assert!(transport.subscribe("echo").await.is_err());
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_noop() {
        let transport = test_transport();
        assert!(transport.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn ack_of_unknown_tag_is_idempotent() {
        let transport = test_transport();
        let tag = DeliveryTag {
            topic: "echo".into(),
            id: 42,
        };
        assert!(transport.ack(&tag).await.is_ok());
    }

    #[test]
    fn router_track_and_settle_round_trip() {
        let router = Router::default();
        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: bytes::Bytes::from("echo"),
            pkid: 1,
            payload: bytes::Bytes::from("payload"),
            properties: None,
        };
        let delivery = router.track("echo", publish);

        assert_eq!(delivery.payload, b"payload");
        assert!(router.settle(delivery.tag.id).is_some());
        assert!(router.settle(delivery.tag.id).is_none());
    }
}
