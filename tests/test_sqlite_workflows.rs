//! End-to-end workflow over the SQLite repository: the same lifecycle the
//! in-memory scenarios exercise, persisted to a real file.


use paigeant::contracts::ActivitySpec;
use paigeant::dispatch::DispatchOptions;
use paigeant::execute::RetryPolicy;
use paigeant::registry::AgentRegistration;
use paigeant::repository::{SqliteRepository, StepStatus, WorkflowRepository, WorkflowStatus};
use paigeant::testing::mocks::{wait_for_workflow, ChainRunner, FlakyRunner};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::WorkflowHarness;

#[tokio::test]
async fn pipeline_with_retry_is_recorded_in_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("workflows.db");
    let repository = Arc::new(
        SqliteRepository::connect(db_path.to_str().unwrap())
            .await
            .unwrap(),
    );

    let mut harness = WorkflowHarness::new().with_repository(repository.clone());
    harness
        .registry
        .register(AgentRegistration::new("a", Arc::new(ChainRunner::new("a"))));
    harness
        .registry
        .register(AgentRegistration::new("b", Arc::new(FlakyRunner::failing_times(1))));
    harness.start_worker("a", RetryPolicy::immediate(3));
    harness.start_worker("b", RetryPolicy::immediate(3));

    let mut dispatcher = harness.dispatcher();
    dispatcher.add_to_runway(ActivitySpec::new("a", "x"));
    dispatcher.add_to_runway(ActivitySpec::new("b", "go"));
    let correlation_id = dispatcher
        .dispatch_workflow(DispatchOptions::default())
        .await
        .unwrap();

    wait_for_workflow(
        &harness.repository,
        &correlation_id,
        WorkflowStatus::Completed,
        Duration::from_secs(10),
    )
    .await
    .expect("workflow should complete");
    harness.shutdown().await;

    // Reopen the file: every record must have survived.
    let reopened = SqliteRepository::connect(db_path.to_str().unwrap())
        .await
        .unwrap();
    let workflow = reopened.get_workflow(&correlation_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert!(workflow.snapshot.routing_slip.itinerary.is_empty());

    let steps = reopened.get_steps(&correlation_id).await.unwrap();
    assert_eq!(steps.len(), 2);
    let b_step = steps.iter().find(|s| s.agent_name == "b").unwrap();
    assert_eq!(b_step.status, StepStatus::Completed);
    assert_eq!(b_step.attempt, 1);
}
