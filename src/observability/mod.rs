//! Observability: structured logging setup.
//!
//! The engine itself only emits `tracing` events and spans; this module
//! wires up the subscriber so every process (workers, the dispatcher CLI,
//! the monitor) logs the same way, quieting only the backends the
//! configuration actually selects.

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat, LogOptions};

// Span macros for structured logging
pub use logging::{step_span, workflow_span};
