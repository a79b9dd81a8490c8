//! Crate-level error umbrella and error-message hygiene.
//!
//! Each layer carries its own error enum; this module folds them into one
//! top-level type for callers that drive the whole engine, and provides
//! the sanitizer applied to every error message before it is persisted in
//! a step record.

use thiserror::Error;

use crate::config::ConfigError;
use crate::contracts::EnvelopeError;
use crate::dispatch::DispatchError;
use crate::execute::ExecutorError;
use crate::registry::{DepsError, DiscoveryError};
use crate::repository::RepositoryError;
use crate::transport::TransportError;

/// Top-level error for paigeant operations.
#[derive(Debug, Error)]
pub enum PaigeantError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Deps(#[from] DepsError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for paigeant operations.
pub type PaigeantResult<T> = Result<T, PaigeantError>;

/// Sanitize an error message before it reaches persisted records.
///
/// Step errors end up in the repository and in retry payloads, where they
/// may be read far from the failing process. Redacts credential-looking
/// key/value pairs and sensitive file paths, and bounds the length.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    sanitized = regex::Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+")
        .expect("static regex")
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    sanitized =
        regex::Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
            .expect("static regex")
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();

    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let max_content_len = 500 - truncate_suffix.len();
        sanitized = format!("{}{}", &sanitized[..max_content_len], truncate_suffix);
    }

    sanitized
}
