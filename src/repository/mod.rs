//! Idempotent persistence of workflow metadata and step lifecycle.
//!
//! The repository is observational: executors write lifecycle records
//! out-of-band for recovery and inspection, and repository failures are
//! never allowed to fail a message. The contract that matters is
//! insert-or-ignore on `(correlation_id, agent_name, run_id)`: a retry of
//! a step must not produce a second row.

use crate::contracts::RoutingSlip;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod inmemory;
pub mod postgres;
pub mod sqlite;

pub use inmemory::InMemoryRepository;
pub use postgres::PostgresRepository;
pub use sqlite::SqliteRepository;

/// Repository failure surface. Treated as non-fatal by the executor.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository backend error: {0}")]
    Backend(String),
    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        RepositoryError::Backend(e.to_string())
    }
}

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(WorkflowStatus::Pending),
            "running" => Some(WorkflowStatus::Running),
            "completed" => Some(WorkflowStatus::Completed),
            "failed" => Some(WorkflowStatus::Failed),
            _ => None,
        }
    }
}

/// Step lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Started => "started",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "started" => Some(StepStatus::Started),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

/// Last-seen routing slip and payload of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSnapshot {
    pub routing_slip: RoutingSlip,
    pub payload: Map<String, Value>,
}

/// Persisted workflow metadata, keyed by correlation id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRecord {
    pub correlation_id: String,
    pub status: WorkflowStatus,
    pub snapshot: WorkflowSnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Fresh record as written by the dispatcher.
    pub fn pending(correlation_id: &str, snapshot: WorkflowSnapshot) -> Self {
        let now = crate::contracts::now_millis();
        Self {
            correlation_id: correlation_id.to_string(),
            status: WorkflowStatus::Pending,
            snapshot,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Unique key of one step execution within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey {
    pub correlation_id: String,
    pub agent_name: String,
    pub run_id: String,
}

impl StepKey {
    pub fn new(correlation_id: &str, agent_name: &str, run_id: &str) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            agent_name: agent_name.to_string(),
            run_id: run_id.to_string(),
        }
    }
}

/// Persisted record of one step execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub correlation_id: String,
    pub agent_name: String,
    pub run_id: String,
    pub attempt: u32,
    pub status: StepStatus,
    pub error: Option<String>,
    pub output_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Read-side filter for workflow listings.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
}

/// Build the repository selected by configuration.
pub async fn connect_repository(
    config: &crate::config::RepositoryConfig,
) -> Result<std::sync::Arc<dyn WorkflowRepository>, RepositoryError> {
    use crate::config::RepositoryBackend;
    Ok(match config.backend {
        RepositoryBackend::InMemory => std::sync::Arc::new(InMemoryRepository::new()),
        RepositoryBackend::Sqlite => std::sync::Arc::new(SqliteRepository::connect(&config.dsn).await?),
        RepositoryBackend::Postgres => {
            std::sync::Arc::new(PostgresRepository::connect(&config.dsn).await?)
        }
    })
}

/// Idempotent workflow/step persistence.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Create or refresh a workflow record. Idempotent on the correlation
    /// id: the first write wins on creation, later calls update status and
    /// snapshot only.
    async fn record_workflow(&self, record: &WorkflowRecord) -> Result<(), RepositoryError>;

    /// Record the start of a step: insert-or-ignore on the step key, and
    /// refresh the owning workflow's snapshot to *running*.
    async fn record_step_started(
        &self,
        key: &StepKey,
        attempt: u32,
        snapshot: &WorkflowSnapshot,
    ) -> Result<(), RepositoryError>;

    /// Unconditionally mark the owned step row completed.
    async fn record_step_completed(
        &self,
        key: &StepKey,
        attempt: u32,
        output_ref: &str,
    ) -> Result<(), RepositoryError>;

    /// Unconditionally mark the owned step row failed.
    async fn record_step_failed(
        &self,
        key: &StepKey,
        attempt: u32,
        error: &str,
    ) -> Result<(), RepositoryError>;

    /// Terminal workflow transition to *completed*.
    async fn mark_workflow_completed(
        &self,
        correlation_id: &str,
        snapshot: &WorkflowSnapshot,
    ) -> Result<(), RepositoryError>;

    /// Terminal workflow transition to *failed*.
    async fn mark_workflow_failed(
        &self,
        correlation_id: &str,
        snapshot: &WorkflowSnapshot,
    ) -> Result<(), RepositoryError>;

    async fn get_workflow(
        &self,
        correlation_id: &str,
    ) -> Result<Option<WorkflowRecord>, RepositoryError>;

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowRecord>, RepositoryError>;

    async fn get_steps(&self, correlation_id: &str) -> Result<Vec<StepRecord>, RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
        ] {
            assert_eq!(WorkflowStatus::parse(status.as_str()), Some(status));
        }
        for status in [StepStatus::Started, StepStatus::Completed, StepStatus::Failed] {
            assert_eq!(StepStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(WorkflowStatus::parse("bogus"), None);
    }

    #[test]
    fn pending_record_starts_with_equal_timestamps() {
        let record = WorkflowRecord::pending("corr", WorkflowSnapshot::default());
        assert_eq!(record.status, WorkflowStatus::Pending);
        assert_eq!(record.created_at, record.updated_at);
    }
}
