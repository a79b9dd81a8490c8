//! Pure connection state management for the MQTT transport.
//!
//! Connection state transitions, reconnect backoff policy and MQTT option
//! construction live here, away from the event-loop I/O.

use crate::config::MqttConfig;
use crate::transport::TransportError;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Connection state for the MQTT transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state, waiting for ConnAck.
    Connecting,
    /// Connected and ready for operations.
    Connected,
    /// Disconnected with reason.
    Disconnected(String),
    /// Attempting to reconnect (attempt count).
    Reconnecting(u32),
}

impl ConnectionState {
    /// Whether publish/subscribe operations may proceed.
    pub fn is_operational(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Reconnection backoff policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Backoff pattern in milliseconds, walked once per attempt.
    pub backoff_pattern: Vec<u64>,
    /// Delay used after the pattern is exhausted.
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![250, 500, 1000, 2000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given (1-based) reconnection attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let millis = self
            .backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay);
        Duration::from_millis(millis)
    }
}

/// Build the shared-subscription filter for a topic.
///
/// An empty group name opts out of shared subscriptions (every subscriber
/// gets every message), which is only useful for monitoring tools.
pub fn shared_topic(group: &str, topic: &str) -> String {
    if group.is_empty() {
        topic.to_string()
    } else {
        format!("$share/{group}/{topic}")
    }
}

/// Construct MQTT options from transport configuration.
///
/// Client ids are unique per transport instance so broker-side session
/// state never collides between worker processes.
pub fn configure_mqtt_options(config: &MqttConfig) -> Result<MqttOptions, TransportError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| TransportError::Connect(format!("invalid broker URL: {}", config.broker_url)))?;

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::Connect(format!("broker URL has no host: {}", config.broker_url)))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let client_id = format!("paigeant-{}", Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = config.username() {
        options.set_credentials(username, config.password().unwrap_or_default());
    }

    options.set_keep_alive(Duration::from_secs(60));
    // Envelopes carry full payload history; the broker default of 10KB is
    // far too small.
    options.set_max_packet_size(Some(256 * 1024));
    // Deliveries are settled by the executor, not on receipt.
    options.set_manual_acks(true);

    Ok(options)
}
