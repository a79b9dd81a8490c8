//! Configuration for transports, repositories and retry policy.
//!
//! Configuration is environment-driven: a TOML file (path from
//! `PAIGEANT_CONFIG`, default `paigeant.toml`) provides the base and
//! `PAIGEANT_*` environment variables override individual fields, so a
//! bare environment with no file at all still yields a working in-memory
//! setup.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaigeantConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Cumulative dynamic-insertion bound per workflow.
    #[serde(default = "default_max_insertions")]
    pub max_insertions: u32,
}

impl Default for PaigeantConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            repository: RepositoryConfig::default(),
            retry: RetryConfig::default(),
            max_insertions: default_max_insertions(),
        }
    }
}

/// Transport selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportBackend {
    InMemory,
    Mqtt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "default_transport_backend")]
    pub backend: TransportBackend,
    #[serde(default)]
    pub mqtt: MqttConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: default_transport_backend(),
            mqtt: MqttConfig::default(),
        }
    }
}

/// MQTT broker settings. Credentials come from environment variables
/// named here, never from the file itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttConfig {
    pub broker_url: String,
    pub username_env: Option<String>,
    pub password_env: Option<String>,
    /// Shared-subscription group name; workers in the same group compete
    /// for deliveries.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            username_env: None,
            password_env: None,
            consumer_group: default_consumer_group(),
        }
    }
}

impl MqttConfig {
    /// Resolve the broker username from the configured environment variable.
    pub fn username(&self) -> Option<String> {
        self.username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Resolve the broker password from the configured environment variable.
    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }
}

/// Repository selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryBackend {
    InMemory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryConfig {
    #[serde(default = "default_repository_backend")]
    pub backend: RepositoryBackend,
    /// DSN for durable backends: a file path for SQLite, a connection URL
    /// for PostgreSQL. Ignored by the in-memory backend.
    #[serde(default = "default_repository_dsn")]
    pub dsn: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            backend: default_repository_backend(),
            dsn: default_repository_dsn(),
        }
    }
}

/// Retry policy for recoverable step failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_transport_backend() -> TransportBackend {
    TransportBackend::InMemory
}

fn default_consumer_group() -> String {
    "paigeant".to_string()
}

fn default_repository_backend() -> RepositoryBackend {
    RepositoryBackend::InMemory
}

fn default_repository_dsn() -> String {
    "paigeant.db".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    250
}

fn default_max_insertions() -> u32 {
    3
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid value for {variable}: {value}")]
    InvalidEnvValue { variable: String, value: String },
}

impl PaigeantConfig {
    /// Load configuration: TOML file if present, then environment
    /// overrides on top.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("PAIGEANT_CONFIG").unwrap_or_else(|_| "paigeant.toml".into());
        let mut config = if Path::new(&path).exists() {
            Self::load_from_file(Path::new(&path))?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(backend) = std::env::var("PAIGEANT_TRANSPORT") {
            self.transport.backend = match backend.to_lowercase().as_str() {
                "inmemory" => TransportBackend::InMemory,
                "mqtt" => TransportBackend::Mqtt,
                other => {
                    return Err(ConfigError::InvalidEnvValue {
                        variable: "PAIGEANT_TRANSPORT".into(),
                        value: other.into(),
                    })
                }
            };
        }
        if let Ok(url) = std::env::var("PAIGEANT_TRANSPORT_DSN") {
            self.transport.mqtt.broker_url = url;
        }
        if let Ok(group) = std::env::var("PAIGEANT_CONSUMER_GROUP") {
            self.transport.mqtt.consumer_group = group;
        }
        if let Ok(backend) = std::env::var("PAIGEANT_REPOSITORY") {
            self.repository.backend = match backend.to_lowercase().as_str() {
                "inmemory" => RepositoryBackend::InMemory,
                "sqlite" => RepositoryBackend::Sqlite,
                "postgres" => RepositoryBackend::Postgres,
                other => {
                    return Err(ConfigError::InvalidEnvValue {
                        variable: "PAIGEANT_REPOSITORY".into(),
                        value: other.into(),
                    })
                }
            };
        }
        if let Ok(dsn) = std::env::var("PAIGEANT_REPOSITORY_DSN") {
            self.repository.dsn = dsn;
        }
        self.retry.max_attempts =
            parse_env_u32("PAIGEANT_MAX_ATTEMPTS", self.retry.max_attempts)?;
        self.retry.backoff_base_ms =
            parse_env_u64("PAIGEANT_BACKOFF_BASE_MS", self.retry.backoff_base_ms)?;
        self.retry.backoff_cap_ms =
            parse_env_u64("PAIGEANT_BACKOFF_CAP_MS", self.retry.backoff_cap_ms)?;
        self.retry.jitter_ms = parse_env_u64("PAIGEANT_BACKOFF_JITTER_MS", self.retry.jitter_ms)?;
        self.max_insertions = parse_env_u32("PAIGEANT_MAX_INSERTIONS", self.max_insertions)?;
        Ok(())
    }
}

fn parse_env_u32(variable: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(variable) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidEnvValue {
            variable: variable.into(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(variable: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(variable) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidEnvValue {
            variable: variable.into(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_inmemory_everything() {
        let config = PaigeantConfig::default();
        assert_eq!(config.transport.backend, TransportBackend::InMemory);
        assert_eq!(config.repository.backend, RepositoryBackend::InMemory);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.max_insertions, 3);
    }

    #[test]
    fn parses_full_toml() {
        let toml_content = r#"
max_insertions = 5

[transport]
backend = "mqtt"

[transport.mqtt]
broker_url = "mqtts://broker.example:8883"
username_env = "MQTT_USER"
password_env = "MQTT_PASS"
consumer_group = "workers"

[repository]
backend = "sqlite"
dsn = "/var/lib/paigeant/workflows.db"

[retry]
max_attempts = 5
backoff_base_ms = 100
backoff_cap_ms = 2000
jitter_ms = 50
"#;
        let config: PaigeantConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.transport.backend, TransportBackend::Mqtt);
        assert_eq!(config.transport.mqtt.broker_url, "mqtts://broker.example:8883");
        assert_eq!(config.transport.mqtt.consumer_group, "workers");
        assert_eq!(config.repository.backend, RepositoryBackend::Sqlite);
        assert_eq!(config.repository.dsn, "/var/lib/paigeant/workflows.db");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.max_insertions, 5);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: PaigeantConfig = toml::from_str("[repository]\nbackend = \"sqlite\"\n").unwrap();
        assert_eq!(config.repository.backend, RepositoryBackend::Sqlite);
        assert_eq!(config.repository.dsn, "paigeant.db");
        assert_eq!(config.transport.backend, TransportBackend::InMemory);
    }

    #[test]
    fn empty_toml_is_valid() {
        let config: PaigeantConfig = toml::from_str("").unwrap();
        assert_eq!(config, PaigeantConfig::default());
    }
}
