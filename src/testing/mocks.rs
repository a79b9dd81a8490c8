//! Mock activity runners and workflow test helpers.
//!
//! The runners cover the behaviors workflows exercise: echoing, chaining
//! previous output, failing transiently or permanently, and editing the
//! itinerary. `wait_for_workflow` polls the repository until a workflow
//! reaches a terminal status.

use crate::execute::ActivityContext;
use crate::registry::{ActivityFailure, ActivityRunner, DepsValue};
use crate::repository::{WorkflowRecord, WorkflowRepository, WorkflowStatus};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Returns its prompt verbatim.
pub struct EchoRunner;

#[async_trait]
impl ActivityRunner for EchoRunner {
    async fn run(
        &self,
        prompt: &str,
        _deps: Option<DepsValue>,
        _ctx: &mut ActivityContext,
    ) -> Result<Value, ActivityFailure> {
        Ok(Value::String(prompt.to_string()))
    }
}

/// Appends its name to the previous step's output (or to the prompt when
/// running first), producing chains like `x+a+b+c`.
pub struct ChainRunner {
    pub name: String,
}

impl ChainRunner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ActivityRunner for ChainRunner {
    async fn run(
        &self,
        prompt: &str,
        _deps: Option<DepsValue>,
        ctx: &mut ActivityContext,
    ) -> Result<Value, ActivityFailure> {
        let base = ctx
            .previous_output()
            .and_then(|previous| previous.output.as_str().map(str::to_string))
            .unwrap_or_else(|| prompt.to_string());
        Ok(Value::String(format!("{}+{}", base, self.name)))
    }
}

/// Fails retryably a fixed number of times, then succeeds.
pub struct FlakyRunner {
    failures_remaining: AtomicU32,
}

impl FlakyRunner {
    pub fn failing_times(failures: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl ActivityRunner for FlakyRunner {
    async fn run(
        &self,
        _prompt: &str,
        _deps: Option<DepsValue>,
        _ctx: &mut ActivityContext,
    ) -> Result<Value, ActivityFailure> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ActivityFailure::retryable("simulated transient failure"));
        }
        Ok(json!("recovered"))
    }
}

/// Always fails with the configured kind.
pub struct AlwaysFailRunner {
    retryable: bool,
}

impl AlwaysFailRunner {
    pub fn retryable() -> Self {
        Self { retryable: true }
    }

    pub fn permanent() -> Self {
        Self { retryable: false }
    }
}

#[async_trait]
impl ActivityRunner for AlwaysFailRunner {
    async fn run(
        &self,
        _prompt: &str,
        _deps: Option<DepsValue>,
        _ctx: &mut ActivityContext,
    ) -> Result<Value, ActivityFailure> {
        if self.retryable {
            Err(ActivityFailure::retryable("simulated transient failure"))
        } else {
            Err(ActivityFailure::permanent("simulated permanent failure"))
        }
    }
}

/// Requests itinerary insertions and reports the hook's verdict in its
/// output.
pub struct PlannerRunner {
    pub insertions: Vec<(String, String)>,
}

impl PlannerRunner {
    pub fn inserting(insertions: Vec<(String, String)>) -> Self {
        Self { insertions }
    }
}

#[async_trait]
impl ActivityRunner for PlannerRunner {
    async fn run(
        &self,
        _prompt: &str,
        _deps: Option<DepsValue>,
        ctx: &mut ActivityContext,
    ) -> Result<Value, ActivityFailure> {
        let edit_result = match ctx.edit_itinerary(&self.insertions) {
            Ok(count) => json!({ "inserted": count }),
            Err(e) => json!({ "error": e.to_string() }),
        };
        Ok(json!({ "plan": "done", "edit_result": edit_result }))
    }
}

/// Poll the repository until the workflow reaches the expected status.
pub async fn wait_for_workflow(
    repository: &Arc<dyn WorkflowRepository>,
    correlation_id: &str,
    status: WorkflowStatus,
    timeout: Duration,
) -> Option<WorkflowRecord> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(record)) = repository.get_workflow(correlation_id).await {
            if record.status == status {
                return Some(record);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
