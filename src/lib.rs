//! paigeant - durable routing-slip workflows for distributed agents
//!
//! A workflow is an ordered itinerary of activities. Each activity is
//! delivered as a self-describing message to a worker listening on a named
//! queue; the worker runs the activity, captures its output, optionally
//! extends the itinerary, and forwards the message to the next worker.
//! Workflow state lives entirely inside the message, with a side
//! repository for observability and crash recovery.
//!
//! # Overview
//!
//! This crate provides the complete engine:
//! - Routing-slip message contracts with stable JSON wire format
//! - Pluggable transports (in-memory queue, durable MQTT broker)
//! - Workflow repositories (in-memory, SQLite, PostgreSQL)
//! - The dispatcher that emits the initial message
//! - The per-agent executor loop with retry and failure semantics
//! - Bounded, capability-gated dynamic itinerary editing
//!
//! # Quick Start
//!
//! ```rust
//! use paigeant::contracts::{ActivitySpec, PaigeantMessage, RoutingSlip};
//!
//! // Build the slip for a two-step workflow and wrap it in an envelope.
//! let slip = RoutingSlip::new(vec![
//!     ActivitySpec::new("summarizer", "Summarize the incident report"),
//!     ActivitySpec::new("notifier", "Post the summary to the ops channel"),
//! ]);
//! let message = PaigeantMessage::new("corr-42", "run-1", slip);
//!
//! // The canonical wire form round-trips losslessly.
//! let bytes = message.to_bytes().unwrap();
//! let parsed = PaigeantMessage::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed, message);
//! assert_eq!(parsed.routing_slip.next_step().unwrap().agent_name, "summarizer");
//! ```

pub mod config;
pub mod contracts;
pub mod dispatch;
pub mod error;
pub mod execute;
pub mod observability;
pub mod registry;
pub mod repository;
pub mod testing;
pub mod transport;

pub use config::PaigeantConfig;
pub use contracts::{ActivitySpec, PaigeantMessage, RoutingSlip, SerializedDeps};
pub use dispatch::{DispatchOptions, WorkflowDispatcher};
pub use error::{PaigeantError, PaigeantResult};
pub use execute::{ActivityContext, ActivityExecutor, RetryPolicy};
pub use registry::{ActivityFailure, ActivityRunner, AgentRegistration, AgentRegistry};
pub use repository::{
    InMemoryRepository, PostgresRepository, SqliteRepository, WorkflowRepository,
};
pub use transport::{InMemoryTransport, MqttTransport, Transport};
