//! PostgreSQL workflow repository.
//!
//! Remote relational backend for multi-host deployments. Identical
//! semantics to the SQLite store; insert-or-ignore is expressed as
//! `ON CONFLICT ... DO NOTHING` against the unique step key.

use super::{
    RepositoryError, StepKey, StepRecord, StepStatus, WorkflowFilter, WorkflowRecord,
    WorkflowRepository, WorkflowSnapshot, WorkflowStatus,
};
use crate::contracts::now_millis;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;

/// PostgreSQL-backed repository.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

fn decode_workflow_status(raw: &str) -> Result<WorkflowStatus, RepositoryError> {
    WorkflowStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Backend(format!("unknown workflow status '{raw}'")))
}

fn decode_step_status(raw: &str) -> Result<StepStatus, RepositoryError> {
    StepStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Backend(format!("unknown step status '{raw}'")))
}

impl PostgresRepository {
    /// Connect to the database and initialize the schema.
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        let repository = Self { pool };
        repository.init_schema().await?;
        Ok(repository)
    }

    /// Build the adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> Result<Self, RepositoryError> {
        let repository = Self { pool };
        repository.init_schema().await?;
        Ok(repository)
    }

    async fn init_schema(&self) -> Result<(), RepositoryError> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                correlation_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                snapshot_json TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS steps (
                correlation_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                run_id TEXT NOT NULL,
                attempt BIGINT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                output_ref TEXT,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ,
                UNIQUE(correlation_id, agent_name, run_id)
            )
            "#,
        ];
        for statement in ddl {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn update_workflow(
        &self,
        correlation_id: &str,
        status: WorkflowStatus,
        snapshot: &WorkflowSnapshot,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE workflows SET status = $1, snapshot_json = $2, updated_at = $3 WHERE correlation_id = $4",
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(snapshot)?)
        .bind(now_millis())
        .bind(correlation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn workflow_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowRecord, RepositoryError> {
        Ok(WorkflowRecord {
            correlation_id: row.get("correlation_id"),
            status: decode_workflow_status(row.get("status"))?,
            snapshot: serde_json::from_str(row.get("snapshot_json"))?,
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        })
    }

    fn step_from_row(row: &sqlx::postgres::PgRow) -> Result<StepRecord, RepositoryError> {
        Ok(StepRecord {
            correlation_id: row.get("correlation_id"),
            agent_name: row.get("agent_name"),
            run_id: row.get("run_id"),
            attempt: row.get::<i64, _>("attempt") as u32,
            status: decode_step_status(row.get("status"))?,
            error: row.get("error"),
            output_ref: row.get("output_ref"),
            started_at: row.get::<DateTime<Utc>, _>("started_at"),
            finished_at: row.get::<Option<DateTime<Utc>>, _>("finished_at"),
        })
    }
}

#[async_trait]
impl WorkflowRepository for PostgresRepository {
    async fn record_workflow(&self, record: &WorkflowRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO workflows (correlation_id, status, snapshot_json, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (correlation_id) DO UPDATE SET
                status = excluded.status,
                snapshot_json = excluded.snapshot_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.correlation_id)
        .bind(record.status.as_str())
        .bind(serde_json::to_string(&record.snapshot)?)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_step_started(
        &self,
        key: &StepKey,
        attempt: u32,
        snapshot: &WorkflowSnapshot,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO steps (correlation_id, agent_name, run_id, attempt, status, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (correlation_id, agent_name, run_id) DO NOTHING
            "#,
        )
        .bind(&key.correlation_id)
        .bind(&key.agent_name)
        .bind(&key.run_id)
        .bind(attempt as i64)
        .bind(StepStatus::Started.as_str())
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        self.update_workflow(&key.correlation_id, WorkflowStatus::Running, snapshot)
            .await
    }

    async fn record_step_completed(
        &self,
        key: &StepKey,
        attempt: u32,
        output_ref: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE steps
            SET status = $1, attempt = $2, output_ref = $3, error = NULL, finished_at = $4
            WHERE correlation_id = $5 AND agent_name = $6 AND run_id = $7
            "#,
        )
        .bind(StepStatus::Completed.as_str())
        .bind(attempt as i64)
        .bind(output_ref)
        .bind(now_millis())
        .bind(&key.correlation_id)
        .bind(&key.agent_name)
        .bind(&key.run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_step_failed(
        &self,
        key: &StepKey,
        attempt: u32,
        error: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE steps
            SET status = $1, attempt = $2, error = $3, finished_at = $4
            WHERE correlation_id = $5 AND agent_name = $6 AND run_id = $7
            "#,
        )
        .bind(StepStatus::Failed.as_str())
        .bind(attempt as i64)
        .bind(error)
        .bind(now_millis())
        .bind(&key.correlation_id)
        .bind(&key.agent_name)
        .bind(&key.run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_workflow_completed(
        &self,
        correlation_id: &str,
        snapshot: &WorkflowSnapshot,
    ) -> Result<(), RepositoryError> {
        self.update_workflow(correlation_id, WorkflowStatus::Completed, snapshot)
            .await
    }

    async fn mark_workflow_failed(
        &self,
        correlation_id: &str,
        snapshot: &WorkflowSnapshot,
    ) -> Result<(), RepositoryError> {
        self.update_workflow(correlation_id, WorkflowStatus::Failed, snapshot)
            .await
    }

    async fn get_workflow(
        &self,
        correlation_id: &str,
    ) -> Result<Option<WorkflowRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflows WHERE correlation_id = $1")
            .bind(correlation_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::workflow_from_row).transpose()
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowRecord>, RepositoryError> {
        let rows = match filter.status {
            Some(status) => {
                sqlx::query("SELECT * FROM workflows WHERE status = $1 ORDER BY created_at")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM workflows ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::workflow_from_row).collect()
    }

    async fn get_steps(&self, correlation_id: &str) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM steps WHERE correlation_id = $1 ORDER BY started_at, agent_name",
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::step_from_row).collect()
    }
}
