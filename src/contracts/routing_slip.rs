//! Routing slip: the itinerary, executed log and compensations carried by
//! every message.
//!
//! The slip is owned by whichever message currently carries it. All
//! mutation happens through the narrow operations here: `mark_complete`
//! pops the head into the executed log, `insert_after_head` splices new
//! steps immediately behind the executing step. The executed log is
//! append-only and is never reordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use thiserror::Error;

use super::iso_millis;

/// Self-describing serialized dependency blob.
///
/// `type` is a stable tag resolved against the worker's dependency codec
/// registry; `module` is an opaque hint for locating the registration;
/// `data` round-trips losslessly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerializedDeps {
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(rename = "module", default, skip_serializing_if = "Option::is_none")]
    pub module_hint: Option<String>,
    pub data: Value,
}

impl SerializedDeps {
    /// Serialize a typed dependency value under a stable tag.
    pub fn of<T: Serialize>(type_tag: &str, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            type_tag: type_tag.to_string(),
            module_hint: None,
            data: serde_json::to_value(value)?,
        })
    }

    pub fn with_module_hint(mut self, module_hint: &str) -> Self {
        self.module_hint = Some(module_hint.to_string());
        self
    }
}

/// One step of a workflow itinerary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivitySpec {
    pub agent_name: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps: Option<SerializedDeps>,
    #[serde(default = "default_expects_previous_output")]
    pub expects_previous_output: bool,
}

fn default_expects_previous_output() -> bool {
    true
}

impl ActivitySpec {
    pub fn new(agent_name: &str, prompt: &str) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            prompt: prompt.to_string(),
            deps: None,
            expects_previous_output: true,
        }
    }

    pub fn with_deps(mut self, deps: SerializedDeps) -> Self {
        self.deps = Some(deps);
        self
    }

    pub fn with_expects_previous_output(mut self, expects: bool) -> Self {
        self.expects_previous_output = expects;
        self
    }
}

/// Terminal status of an executed step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutedStatus {
    Completed,
    Failed,
}

/// Append-only record of one executed step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutedActivity {
    pub agent_name: String,
    #[serde(with = "iso_millis")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<String>,
    pub status: ExecutedStatus,
}

/// Itinerary-mutation failures surfaced to callers of the slip.
#[derive(Debug, Error, PartialEq)]
pub enum SlipError {
    #[error("itinerary insertion bound exceeded: {inserted} already inserted, {requested} requested, limit {max}")]
    InsertionBound {
        inserted: u32,
        requested: usize,
        max: u32,
    },
    #[error("agent '{0}' already executed in this run")]
    AlreadyExecuted(String),
    #[error("routing slip invalid: {0}")]
    Invalid(String),
}

/// Remaining, executed and compensating activities of one workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoutingSlip {
    #[serde(default)]
    pub itinerary: Vec<ActivitySpec>,
    #[serde(default)]
    pub executed: Vec<ExecutedActivity>,
    #[serde(default)]
    pub compensations: Vec<ActivitySpec>,
    #[serde(default)]
    pub inserted_count: u32,
}

impl RoutingSlip {
    pub fn new(itinerary: Vec<ActivitySpec>) -> Self {
        Self {
            itinerary,
            executed: Vec::new(),
            compensations: Vec::new(),
            inserted_count: 0,
        }
    }

    /// The head of the itinerary: the only step eligible for execution.
    pub fn next_step(&self) -> Option<&ActivitySpec> {
        self.itinerary.first()
    }

    /// True once every activity has been executed.
    pub fn is_finished(&self) -> bool {
        self.itinerary.is_empty()
    }

    /// Agent names present in the executed log.
    pub fn executed_agents(&self) -> HashSet<&str> {
        self.executed
            .iter()
            .map(|record| record.agent_name.as_str())
            .collect()
    }

    /// Pop the head of the itinerary and append its outcome to the
    /// executed log. Returns the completed spec.
    pub fn mark_complete(
        &mut self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        output_ref: Option<String>,
        status: ExecutedStatus,
    ) -> Option<ActivitySpec> {
        let head = if self.itinerary.is_empty() {
            return None;
        } else {
            self.itinerary.remove(0)
        };
        self.executed.push(ExecutedActivity {
            agent_name: head.agent_name.clone(),
            started_at,
            finished_at,
            output_ref,
            status,
        });
        Some(head)
    }

    /// Insert new steps immediately after the currently executing head.
    ///
    /// The insertion is atomic: if the cumulative bound would be exceeded
    /// or any step duplicates an already-executed agent, nothing changes.
    pub fn insert_after_head(
        &mut self,
        steps: Vec<ActivitySpec>,
        max_insertions: u32,
    ) -> Result<usize, SlipError> {
        if steps.is_empty() {
            return Ok(0);
        }
        let requested = steps.len();
        if self.inserted_count as usize + requested > max_insertions as usize {
            return Err(SlipError::InsertionBound {
                inserted: self.inserted_count,
                requested,
                max: max_insertions,
            });
        }
        let executed = self.executed_agents();
        if let Some(step) = steps.iter().find(|s| executed.contains(s.agent_name.as_str())) {
            return Err(SlipError::AlreadyExecuted(step.agent_name.clone()));
        }
        let insert_pos = 1.min(self.itinerary.len());
        self.itinerary.splice(insert_pos..insert_pos, steps);
        self.inserted_count += requested as u32;
        Ok(requested)
    }

    /// Structural validation applied on deserialization.
    pub fn validate(&self) -> Result<(), SlipError> {
        if self
            .itinerary
            .iter()
            .chain(self.compensations.iter())
            .any(|spec| spec.agent_name.is_empty())
        {
            return Err(SlipError::Invalid("empty agent_name in itinerary".into()));
        }
        let executed = self.executed_agents();
        if let Some(spec) = self
            .itinerary
            .iter()
            .find(|spec| executed.contains(spec.agent_name.as_str()))
        {
            return Err(SlipError::Invalid(format!(
                "itinerary re-targets executed agent '{}'",
                spec.agent_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::now_millis;
    use serde_json::json;

    fn slip(names: &[&str]) -> RoutingSlip {
        RoutingSlip::new(names.iter().map(|n| ActivitySpec::new(n, "go")).collect())
    }

    #[test]
    fn next_step_is_head() {
        let slip = slip(&["a", "b"]);
        assert_eq!(slip.next_step().unwrap().agent_name, "a");
        assert!(!slip.is_finished());
    }

    #[test]
    fn mark_complete_moves_head_to_executed() {
        let mut slip = slip(&["a", "b"]);
        let started = now_millis();
        let spec = slip
            .mark_complete(started, now_millis(), None, ExecutedStatus::Completed)
            .unwrap();

        assert_eq!(spec.agent_name, "a");
        assert_eq!(slip.itinerary.len(), 1);
        assert_eq!(slip.executed.len(), 1);
        assert_eq!(slip.executed[0].agent_name, "a");
        assert_eq!(slip.executed[0].status, ExecutedStatus::Completed);
    }

    #[test]
    fn mark_complete_on_empty_itinerary_is_noop() {
        let mut slip = RoutingSlip::default();
        assert!(slip
            .mark_complete(now_millis(), now_millis(), None, ExecutedStatus::Completed)
            .is_none());
        assert!(slip.executed.is_empty());
    }

    #[test]
    fn insert_lands_immediately_after_head() {
        let mut slip = slip(&["planner", "c"]);
        let inserted = slip
            .insert_after_head(vec![ActivitySpec::new("notifier", "post")], 3)
            .unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(slip.inserted_count, 1);
        let names: Vec<_> = slip.itinerary.iter().map(|s| s.agent_name.as_str()).collect();
        assert_eq!(names, vec!["planner", "notifier", "c"]);
    }

    #[test]
    fn insert_rejected_when_bound_exceeded() {
        let mut slip = slip(&["planner"]);
        let err = slip
            .insert_after_head(vec![ActivitySpec::new("notifier", "post")], 0)
            .unwrap_err();

        assert!(matches!(err, SlipError::InsertionBound { max: 0, .. }));
        assert_eq!(slip.inserted_count, 0);
        assert_eq!(slip.itinerary.len(), 1);
    }

    #[test]
    fn insert_bound_is_cumulative() {
        let mut slip = slip(&["planner", "c"]);
        slip.insert_after_head(vec![ActivitySpec::new("x", "p"), ActivitySpec::new("y", "p")], 3)
            .unwrap();
        let err = slip
            .insert_after_head(
                vec![ActivitySpec::new("z", "p"), ActivitySpec::new("w", "p")],
                3,
            )
            .unwrap_err();

        assert!(matches!(err, SlipError::InsertionBound { inserted: 2, requested: 2, max: 3 }));
        assert_eq!(slip.inserted_count, 2);
    }

    #[test]
    fn insert_rejected_for_already_executed_agent() {
        let mut slip = slip(&["planner"]);
        slip.executed.push(ExecutedActivity {
            agent_name: "done".into(),
            started_at: now_millis(),
            finished_at: now_millis(),
            output_ref: None,
            status: ExecutedStatus::Completed,
        });

        let err = slip
            .insert_after_head(vec![ActivitySpec::new("done", "again")], 3)
            .unwrap_err();
        assert_eq!(err, SlipError::AlreadyExecuted("done".into()));
    }

    #[test]
    fn activity_spec_wire_shape() {
        let spec = ActivitySpec::new("echo", "hi").with_deps(
            SerializedDeps::of("HttpKey", &json!({"api_key": "k"}))
                .unwrap()
                .with_module_hint("demo.agents"),
        );
        let value = serde_json::to_value(&spec).unwrap();

        assert_eq!(value["agent_name"], "echo");
        assert_eq!(value["deps"]["type"], "HttpKey");
        assert_eq!(value["deps"]["module"], "demo.agents");
        assert_eq!(value["deps"]["data"]["api_key"], "k");
        assert_eq!(value["expects_previous_output"], true);
    }

    #[test]
    fn expects_previous_output_defaults_true_when_absent() {
        let spec: ActivitySpec =
            serde_json::from_value(json!({"agent_name": "echo", "prompt": "hi"})).unwrap();
        assert!(spec.expects_previous_output);
    }

    #[test]
    fn validate_rejects_itinerary_retargeting_executed_agent() {
        let mut slip = slip(&["a"]);
        slip.executed.push(ExecutedActivity {
            agent_name: "a".into(),
            started_at: now_millis(),
            finished_at: now_millis(),
            output_ref: None,
            status: ExecutedStatus::Completed,
        });
        assert!(slip.validate().is_err());
    }
}
