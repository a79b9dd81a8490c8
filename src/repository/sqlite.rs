//! SQLite workflow repository.
//!
//! Embedded file store for single-host deployments. Uses the sqlx
//! runtime-query API; the schema is created on connect. Insert-or-ignore
//! step starts rely on SQLite's native `INSERT OR IGNORE` against the
//! unique step key.

use super::{
    RepositoryError, StepKey, StepRecord, StepStatus, WorkflowFilter, WorkflowRecord,
    WorkflowRepository, WorkflowSnapshot, WorkflowStatus,
};
use crate::contracts::now_millis;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

/// File-backed repository.
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Backend(format!("bad timestamp '{raw}': {e}")))
}

fn decode_workflow_status(raw: &str) -> Result<WorkflowStatus, RepositoryError> {
    WorkflowStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Backend(format!("unknown workflow status '{raw}'")))
}

fn decode_step_status(raw: &str) -> Result<StepStatus, RepositoryError> {
    StepStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Backend(format!("unknown step status '{raw}'")))
}

impl SqliteRepository {
    /// Open (creating if missing) the database file and initialize the
    /// schema.
    pub async fn connect(path: &str) -> Result<Self, RepositoryError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let repository = Self { pool };
        repository.init_schema().await?;
        Ok(repository)
    }

    async fn init_schema(&self) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                correlation_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                snapshot_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS steps (
                correlation_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                run_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                output_ref TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                UNIQUE(correlation_id, agent_name, run_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_workflow(
        &self,
        correlation_id: &str,
        status: WorkflowStatus,
        snapshot: &WorkflowSnapshot,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE workflows SET status = ?, snapshot_json = ?, updated_at = ? WHERE correlation_id = ?")
            .bind(status.as_str())
            .bind(serde_json::to_string(snapshot)?)
            .bind(encode_ts(&now_millis()))
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn workflow_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowRecord, RepositoryError> {
        Ok(WorkflowRecord {
            correlation_id: row.get("correlation_id"),
            status: decode_workflow_status(row.get("status"))?,
            snapshot: serde_json::from_str(row.get("snapshot_json"))?,
            created_at: decode_ts(row.get("created_at"))?,
            updated_at: decode_ts(row.get("updated_at"))?,
        })
    }

    fn step_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StepRecord, RepositoryError> {
        let finished_at: Option<String> = row.get("finished_at");
        Ok(StepRecord {
            correlation_id: row.get("correlation_id"),
            agent_name: row.get("agent_name"),
            run_id: row.get("run_id"),
            attempt: row.get::<i64, _>("attempt") as u32,
            status: decode_step_status(row.get("status"))?,
            error: row.get("error"),
            output_ref: row.get("output_ref"),
            started_at: decode_ts(row.get("started_at"))?,
            finished_at: finished_at.as_deref().map(decode_ts).transpose()?,
        })
    }
}

#[async_trait]
impl WorkflowRepository for SqliteRepository {
    async fn record_workflow(&self, record: &WorkflowRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO workflows (correlation_id, status, snapshot_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(correlation_id) DO UPDATE SET
                status = excluded.status,
                snapshot_json = excluded.snapshot_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.correlation_id)
        .bind(record.status.as_str())
        .bind(serde_json::to_string(&record.snapshot)?)
        .bind(encode_ts(&record.created_at))
        .bind(encode_ts(&record.updated_at))
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
            INSERT OR IGNORE INTO steps
                (correlation_id, agent_name, run_id, attempt, status, started_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&key.correlation_id)
        .bind(&key.agent_name)
        .bind(&key.run_id)
        .bind(attempt as i64)
        .bind(StepStatus::Started.as_str())
        .bind(encode_ts(&now_millis()))
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
            SET status = ?, attempt = ?, output_ref = ?, error = NULL, finished_at = ?
            WHERE correlation_id = ? AND agent_name = ? AND run_id = ?
            "#,
        )
        .bind(StepStatus::Completed.as_str())
        .bind(attempt as i64)
        .bind(output_ref)
        .bind(encode_ts(&now_millis()))
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
            SET status = ?, attempt = ?, error = ?, finished_at = ?
            WHERE correlation_id = ? AND agent_name = ? AND run_id = ?
            "#,
        )
        .bind(StepStatus::Failed.as_str())
        .bind(attempt as i64)
        .bind(error)
        .bind(encode_ts(&now_millis()))
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
        let row = sqlx::query("SELECT * FROM workflows WHERE correlation_id = ?")
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
                sqlx::query("SELECT * FROM workflows WHERE status = ? ORDER BY created_at")
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
        let rows = sqlx::query("SELECT * FROM steps WHERE correlation_id = ? ORDER BY rowid")
            .bind(correlation_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::step_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_repository() -> (tempfile::TempDir, SqliteRepository) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows.db");
        let repo = SqliteRepository::connect(path.to_str().unwrap()).await.unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn record_workflow_upsert_preserves_created_at() {
        let (_dir, repo) = temp_repository().await;
        let record = WorkflowRecord::pending("corr-1", WorkflowSnapshot::default());
        repo.record_workflow(&record).await.unwrap();

        let mut updated = record.clone();
        updated.status = WorkflowStatus::Completed;
        repo.record_workflow(&updated).await.unwrap();

        let stored = repo.get_workflow("corr-1").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
        assert_eq!(stored.created_at, record.created_at);
    }

    #[tokio::test]
    async fn duplicate_step_start_is_ignored() {
        let (_dir, repo) = temp_repository().await;
        repo.record_workflow(&WorkflowRecord::pending("corr-1", WorkflowSnapshot::default()))
            .await
            .unwrap();
        let key = StepKey::new("corr-1", "echo", "run-1");

        repo.record_step_started(&key, 0, &WorkflowSnapshot::default()).await.unwrap();
        repo.record_step_started(&key, 2, &WorkflowSnapshot::default()).await.unwrap();

        let steps = repo.get_steps("corr-1").await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].attempt, 0);
    }

    #[tokio::test]
    async fn step_failure_then_completion_updates_owned_row() {
        let (_dir, repo) = temp_repository().await;
        repo.record_workflow(&WorkflowRecord::pending("corr-1", WorkflowSnapshot::default()))
            .await
            .unwrap();
        let key = StepKey::new("corr-1", "flaky", "run-1");
        repo.record_step_started(&key, 0, &WorkflowSnapshot::default()).await.unwrap();
        repo.record_step_failed(&key, 1, "transient").await.unwrap();

        let steps = repo.get_steps("corr-1").await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Failed);
        assert_eq!(steps[0].error.as_deref(), Some("transient"));

        repo.record_step_completed(&key, 1, "\"ok\"").await.unwrap();
        let steps = repo.get_steps("corr-1").await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].attempt, 1);
        assert!(steps[0].error.is_none());
    }

    #[tokio::test]
    async fn data_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows.db");
        {
            let repo = SqliteRepository::connect(path.to_str().unwrap()).await.unwrap();
            repo.record_workflow(&WorkflowRecord::pending("corr-1", WorkflowSnapshot::default()))
                .await
                .unwrap();
        }
        let repo = SqliteRepository::connect(path.to_str().unwrap()).await.unwrap();
        assert!(repo.get_workflow("corr-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_workflows_filters_by_status() {
        let (_dir, repo) = temp_repository().await;
        repo.record_workflow(&WorkflowRecord::pending("a", WorkflowSnapshot::default()))
            .await
            .unwrap();
        repo.record_workflow(&WorkflowRecord::pending("b", WorkflowSnapshot::default()))
            .await
            .unwrap();
        repo.mark_workflow_failed("b", &WorkflowSnapshot::default()).await.unwrap();

        let failed = repo
            .list_workflows(&WorkflowFilter {
                status: Some(WorkflowStatus::Failed),
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].correlation_id, "b");
        assert_eq!(repo.list_workflows(&WorkflowFilter::default()).await.unwrap().len(), 2);
    }
}
