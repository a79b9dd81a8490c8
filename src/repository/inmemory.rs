//! In-memory workflow repository.
//!
//! Backs tests and unconfigured deployments; nothing survives a process
//! restart. Semantics are identical to the durable backends, including
//! insert-or-ignore step starts.

use super::{
    RepositoryError, StepKey, StepRecord, StepStatus, WorkflowFilter, WorkflowRecord,
    WorkflowRepository, WorkflowSnapshot, WorkflowStatus,
};
use crate::contracts::now_millis;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Store {
    workflows: HashMap<String, WorkflowRecord>,
    steps: Vec<StepRecord>,
}

/// Map-backed repository.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    store: Arc<Mutex<Store>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn update_workflow(
        store: &mut Store,
        correlation_id: &str,
        status: WorkflowStatus,
        snapshot: &WorkflowSnapshot,
    ) {
        if let Some(workflow) = store.workflows.get_mut(correlation_id) {
            workflow.status = status;
            workflow.snapshot = snapshot.clone();
            workflow.updated_at = now_millis();
        }
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryRepository {
    async fn record_workflow(&self, record: &WorkflowRecord) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().expect("repository lock poisoned");
        match store.workflows.get_mut(&record.correlation_id) {
            Some(existing) => {
                existing.status = record.status;
                existing.snapshot = record.snapshot.clone();
                existing.updated_at = now_millis();
            }
            None => {
                store
                    .workflows
                    .insert(record.correlation_id.clone(), record.clone());
            }
        }
        Ok(())
    }

    async fn record_step_started(
        &self,
        key: &StepKey,
        attempt: u32,
        snapshot: &WorkflowSnapshot,
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().expect("repository lock poisoned");
        let exists = store.steps.iter().any(|step| {
            step.correlation_id == key.correlation_id
                && step.agent_name == key.agent_name
                && step.run_id == key.run_id
        });
        if !exists {
            store.steps.push(StepRecord {
                correlation_id: key.correlation_id.clone(),
                agent_name: key.agent_name.clone(),
                run_id: key.run_id.clone(),
                attempt,
                status: StepStatus::Started,
                error: None,
                output_ref: None,
                started_at: now_millis(),
                finished_at: None,
            });
        }
        Self::update_workflow(&mut store, &key.correlation_id, WorkflowStatus::Running, snapshot);
        Ok(())
    }

    async fn record_step_completed(
        &self,
        key: &StepKey,
        attempt: u32,
        output_ref: &str,
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().expect("repository lock poisoned");
        if let Some(step) = store.steps.iter_mut().find(|step| {
            step.correlation_id == key.correlation_id
                && step.agent_name == key.agent_name
                && step.run_id == key.run_id
        }) {
            step.status = StepStatus::Completed;
            step.attempt = attempt;
            step.output_ref = Some(output_ref.to_string());
            step.error = None;
            step.finished_at = Some(now_millis());
        }
        Ok(())
    }

    async fn record_step_failed(
        &self,
        key: &StepKey,
        attempt: u32,
        error: &str,
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().expect("repository lock poisoned");
        if let Some(step) = store.steps.iter_mut().find(|step| {
            step.correlation_id == key.correlation_id
                && step.agent_name == key.agent_name
                && step.run_id == key.run_id
        }) {
            step.status = StepStatus::Failed;
            step.attempt = attempt;
            step.error = Some(error.to_string());
            step.finished_at = Some(now_millis());
        }
        Ok(())
    }

    async fn mark_workflow_completed(
        &self,
        correlation_id: &str,
        snapshot: &WorkflowSnapshot,
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().expect("repository lock poisoned");
        Self::update_workflow(&mut store, correlation_id, WorkflowStatus::Completed, snapshot);
        Ok(())
    }

    async fn mark_workflow_failed(
        &self,
        correlation_id: &str,
        snapshot: &WorkflowSnapshot,
    ) -> Result<(), RepositoryError> {
        let mut store = self.store.lock().expect("repository lock poisoned");
        Self::update_workflow(&mut store, correlation_id, WorkflowStatus::Failed, snapshot);
        Ok(())
    }

    async fn get_workflow(
        &self,
        correlation_id: &str,
    ) -> Result<Option<WorkflowRecord>, RepositoryError> {
        let store = self.store.lock().expect("repository lock poisoned");
        Ok(store.workflows.get(correlation_id).cloned())
    }

    async fn list_workflows(
        &self,
        filter: &WorkflowFilter,
    ) -> Result<Vec<WorkflowRecord>, RepositoryError> {
        let store = self.store.lock().expect("repository lock poisoned");
        let mut workflows: Vec<_> = store
            .workflows
            .values()
            .filter(|record| filter.status.map_or(true, |status| record.status == status))
            .cloned()
            .collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(workflows)
    }

    async fn get_steps(&self, correlation_id: &str) -> Result<Vec<StepRecord>, RepositoryError> {
        let store = self.store.lock().expect("repository lock poisoned");
        Ok(store
            .steps
            .iter()
            .filter(|step| step.correlation_id == correlation_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> WorkflowSnapshot {
        WorkflowSnapshot::default()
    }

    #[tokio::test]
    async fn record_workflow_is_idempotent_on_creation() {
        let repo = InMemoryRepository::new();
        let record = WorkflowRecord::pending("corr-1", snapshot());
        repo.record_workflow(&record).await.unwrap();

        let mut updated = record.clone();
        updated.status = WorkflowStatus::Running;
        repo.record_workflow(&updated).await.unwrap();

        let stored = repo.get_workflow("corr-1").await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Running);
        assert_eq!(stored.created_at, record.created_at);
        assert_eq!(repo.list_workflows(&WorkflowFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn step_started_twice_yields_one_row() {
        let repo = InMemoryRepository::new();
        repo.record_workflow(&WorkflowRecord::pending("corr-1", snapshot()))
            .await
            .unwrap();
        let key = StepKey::new("corr-1", "echo", "run-1");

        repo.record_step_started(&key, 0, &snapshot()).await.unwrap();
        repo.record_step_started(&key, 1, &snapshot()).await.unwrap();

        let steps = repo.get_steps("corr-1").await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].attempt, 0);
        assert_eq!(steps[0].status, StepStatus::Started);
    }

    #[tokio::test]
    async fn step_started_marks_workflow_running() {
        let repo = InMemoryRepository::new();
        repo.record_workflow(&WorkflowRecord::pending("corr-1", snapshot()))
            .await
            .unwrap();
        repo.record_step_started(&StepKey::new("corr-1", "echo", "run-1"), 0, &snapshot())
            .await
            .unwrap();

        let workflow = repo.get_workflow("corr-1").await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn completion_updates_owned_row() {
        let repo = InMemoryRepository::new();
        repo.record_workflow(&WorkflowRecord::pending("corr-1", snapshot()))
            .await
            .unwrap();
        let key = StepKey::new("corr-1", "echo", "run-1");
        repo.record_step_started(&key, 0, &snapshot()).await.unwrap();
        repo.record_step_completed(&key, 1, "\"out\"").await.unwrap();

        let steps = repo.get_steps("corr-1").await.unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[0].attempt, 1);
        assert_eq!(steps[0].output_ref.as_deref(), Some("\"out\""));
        assert!(steps[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn list_workflows_filters_by_status() {
        let repo = InMemoryRepository::new();
        repo.record_workflow(&WorkflowRecord::pending("a", snapshot())).await.unwrap();
        repo.record_workflow(&WorkflowRecord::pending("b", snapshot())).await.unwrap();
        repo.mark_workflow_failed("b", &snapshot()).await.unwrap();

        let failed = repo
            .list_workflows(&WorkflowFilter {
                status: Some(WorkflowStatus::Failed),
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].correlation_id, "b");
    }

    #[tokio::test]
    async fn concurrent_duplicate_step_starts_yield_one_row() {
        let repo = InMemoryRepository::new();
        repo.record_workflow(&WorkflowRecord::pending("corr-1", snapshot()))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for attempt in 0..8u32 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let key = StepKey::new("corr-1", "echo", "run-1");
                repo.record_step_started(&key, attempt, &WorkflowSnapshot::default())
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(repo.get_steps("corr-1").await.unwrap().len(), 1);
    }
}
