//! Durable MQTT transport.
//!
//! Split into two sub-modules:
//!
//! - [`connection`] - pure connection state, reconnect policy and option
//!   construction
//! - [`client`] - the rumqttc event loop, delivery routing and the
//!   [`Transport`](crate::transport::Transport) implementation
//!
//! Workers subscribing to the same agent topic join an MQTT 5 shared
//! subscription, so deliveries are spread across a competing-consumer
//! group. Acknowledgements are manual: a message stays in flight until
//! the executor settles it.

pub mod client;
pub mod connection;

pub use client::MqttTransport;
pub use connection::{ConnectionState, ReconnectConfig};
