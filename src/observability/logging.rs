//! Structured logging for workers and operator tools.
//!
//! Every process of a deployment (workers, the dispatcher CLI, the
//! monitor) initializes tracing the same way: level and output format
//! from the environment, plus noise suppression for whichever transport
//! and repository backends the configuration actually selects. Workflow
//! identity travels on spans built with [`workflow_span!`] and
//! [`step_span!`].
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: json, pretty or compact (default json)
//! - `LOG_SPANS`: true/1 to emit span open/close events (default off)
//! - `RUST_LOG`: replaces the whole filter (env_logger syntax)

use crate::config::{PaigeantConfig, RepositoryBackend, TransportBackend};
use std::env;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured JSON for log aggregation.
    #[default]
    Json,
    /// Multi-line human-readable output for development.
    Pretty,
    /// Single-line terminal output.
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Logging options, usually assembled from the environment.
#[derive(Debug, Clone)]
pub struct LogOptions {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            include_spans: false,
        }
    }
}

impl LogOptions {
    /// Read `LOG_LEVEL` / `LOG_FORMAT` / `LOG_SPANS`, falling back to the
    /// defaults for anything absent or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: env::var("LOG_LEVEL")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.level),
            format: env::var("LOG_FORMAT")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.format),
            include_spans: env::var("LOG_SPANS")
                .map(|raw| matches!(raw.to_ascii_lowercase().as_str(), "true" | "1"))
                .unwrap_or(defaults.include_spans),
        }
    }
}

/// Noise directives for the backends this deployment actually runs.
///
/// Only the crates the selected backends pull in are quieted, so an
/// in-memory deployment never blanket-silences a component an operator
/// might be debugging.
fn noise_directives(config: &PaigeantConfig) -> Vec<&'static str> {
    let mut directives = vec!["tokio=warn"];
    if config.transport.backend == TransportBackend::Mqtt {
        directives.push("rumqttc=warn");
    }
    if matches!(
        config.repository.backend,
        RepositoryBackend::Sqlite | RepositoryBackend::Postgres
    ) {
        directives.push("sqlx=warn");
    }
    directives
}

fn build_filter(config: &PaigeantConfig, options: &LogOptions) -> EnvFilter {
    if let Ok(custom) = env::var("RUST_LOG") {
        return EnvFilter::new(custom);
    }
    let mut filter = EnvFilter::new(options.level.to_string());
    for directive in noise_directives(config) {
        if let Ok(parsed) = directive.parse() {
            filter = filter.add_directive(parsed);
        }
    }
    filter
}

/// Install the global subscriber for this process.
pub fn init_logging(config: &PaigeantConfig, options: &LogOptions) {
    let filter = build_filter(config, options);
    let span_events = if options.include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    };
    let registry = tracing_subscriber::registry().with(filter);
    match options.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_span_events(span_events))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_span_events(span_events))
            .init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .init(),
    }
}

/// Environment-driven initialization.
pub fn init_default_logging(config: &PaigeantConfig) {
    init_logging(config, &LogOptions::from_env());
}

/// Span carrying the identity fields of one workflow.
#[macro_export]
macro_rules! workflow_span {
    ($correlation_id:expr, $run_id:expr) => {
        tracing::info_span!(
            "workflow",
            correlation_id = %$correlation_id,
            run_id = %$run_id
        )
    };
}

/// Span carrying the identity fields of one step execution.
#[macro_export]
macro_rules! step_span {
    ($correlation_id:expr, $run_id:expr, $agent_name:expr, $attempt:expr) => {
        tracing::info_span!(
            "step",
            correlation_id = %$correlation_id,
            run_id = %$run_id,
            agent_name = %$agent_name,
            attempt = $attempt
        )
    };
}

// Re-export macros for convenience
pub use {step_span, workflow_span};
