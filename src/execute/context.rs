//! Per-invocation context handed to activity runners.
//!
//! The context exposes workflow identity, the prior step's output and,
//! when the agent's registration allows it, the itinerary-edit hook. Edits
//! are validated synchronously against the registry snapshot carried by
//! the envelope and buffered; the executor applies accepted insertions to
//! the envelope before advancing.

use crate::contracts::{ActivitySpec, PaigeantMessage, PreviousOutput};
use crate::registry::AgentRegistration;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Itinerary-edit rejections, surfaced to the runner as an error string.
#[derive(Debug, Error, PartialEq)]
pub enum EditError {
    #[error("itinerary editing is not permitted for this agent")]
    NotPermitted,
    #[error("agent '{0}' is not a registered activity in this workflow")]
    UnknownAgent(String),
    #[error("agent '{0}' already executed in this run")]
    AlreadyExecuted(String),
    #[error("insertion bound reached: {inserted} of {max} insertions used, {requested} more requested")]
    BoundExceeded {
        inserted: u32,
        requested: usize,
        max: u32,
    },
}

struct ItineraryEditor {
    registry_snapshot: BTreeMap<String, ActivitySpec>,
    executed: HashSet<String>,
    inserted_count: u32,
    max_insertions: u32,
    accepted: Vec<ActivitySpec>,
}

/// Context for one runner invocation.
pub struct ActivityContext {
    correlation_id: String,
    run_id: String,
    trace_id: Option<String>,
    obo_token: Option<String>,
    previous_output: Option<PreviousOutput>,
    editor: Option<ItineraryEditor>,
}

impl ActivityContext {
    /// Build the context for the head step of a message.
    pub fn for_message(
        message: &PaigeantMessage,
        registration: &AgentRegistration,
        previous_output: Option<PreviousOutput>,
    ) -> Self {
        let editor = registration.can_edit_itinerary.then(|| ItineraryEditor {
            registry_snapshot: message.activity_registry.clone().unwrap_or_default(),
            executed: message
                .routing_slip
                .executed_agents()
                .into_iter()
                .map(str::to_string)
                .collect(),
            inserted_count: message.routing_slip.inserted_count,
            max_insertions: registration.max_insertions,
            accepted: Vec::new(),
        });
        Self {
            correlation_id: message.correlation_id.clone(),
            run_id: message.run_id.clone(),
            trace_id: message.trace_id.clone(),
            obo_token: message.obo_token.clone(),
            previous_output,
            editor,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn obo_token(&self) -> Option<&str> {
        self.obo_token.as_deref()
    }

    pub fn previous_output(&self) -> Option<&PreviousOutput> {
        self.previous_output.as_ref()
    }

    /// Whether this invocation may edit the itinerary.
    pub fn can_edit_itinerary(&self) -> bool {
        self.editor.is_some()
    }

    /// Request insertion of `(agent_name, prompt)` pairs immediately after
    /// the executing step.
    ///
    /// Validation is atomic: on any rejection nothing is buffered and the
    /// returned error describes why. Dependencies come from the registry
    /// snapshot carried by the envelope.
    pub fn edit_itinerary(&mut self, insertions: &[(String, String)]) -> Result<usize, EditError> {
        let editor = self.editor.as_mut().ok_or(EditError::NotPermitted)?;
        if insertions.is_empty() {
            return Ok(0);
        }

        let already = editor.inserted_count as usize + editor.accepted.len();
        if already + insertions.len() > editor.max_insertions as usize {
            return Err(EditError::BoundExceeded {
                inserted: already as u32,
                requested: insertions.len(),
                max: editor.max_insertions,
            });
        }

        let mut specs = Vec::with_capacity(insertions.len());
        for (agent_name, prompt) in insertions {
            let template = editor
                .registry_snapshot
                .get(agent_name)
                .ok_or_else(|| EditError::UnknownAgent(agent_name.clone()))?;
            if editor.executed.contains(agent_name) {
                return Err(EditError::AlreadyExecuted(agent_name.clone()));
            }
            let mut spec = template.clone();
            spec.prompt = prompt.clone();
            specs.push(spec);
        }

        let accepted = specs.len();
        editor.accepted.extend(specs);
        Ok(accepted)
    }

    /// Drain the insertions accepted during this invocation.
    pub(crate) fn take_insertions(&mut self) -> Vec<ActivitySpec> {
        self.editor
            .as_mut()
            .map(|editor| std::mem::take(&mut editor.accepted))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{RoutingSlip, SerializedDeps};
    use crate::testing::mocks::EchoRunner;
    use serde_json::json;
    use std::sync::Arc;

    fn planner_message() -> PaigeantMessage {
        let slip = RoutingSlip::new(vec![
            ActivitySpec::new("planner", "plan"),
            ActivitySpec::new("c", "finish"),
        ]);
        let mut registry = BTreeMap::new();
        registry.insert(
            "notifier".to_string(),
            ActivitySpec::new("notifier", "default prompt").with_deps(
                SerializedDeps::of("NotifierDeps", &json!({"channel": "#ops"})).unwrap(),
            ),
        );
        PaigeantMessage::new("corr-1", "run-1", slip).with_activity_registry(registry)
    }

    fn editing_registration(max_insertions: u32) -> AgentRegistration {
        AgentRegistration::new("planner", Arc::new(EchoRunner))
            .with_itinerary_editing(max_insertions)
    }

    #[test]
    fn edit_rejected_without_capability() {
        let message = planner_message();
        let registration = AgentRegistration::new("planner", Arc::new(EchoRunner));
        let mut ctx = ActivityContext::for_message(&message, &registration, None);

        assert_eq!(
            ctx.edit_itinerary(&[("notifier".into(), "post".into())]),
            Err(EditError::NotPermitted)
        );
    }

    #[test]
    fn edit_buffers_accepted_insertions() {
        let message = planner_message();
        let mut ctx = ActivityContext::for_message(&message, &editing_registration(3), None);

        let accepted = ctx
            .edit_itinerary(&[("notifier".into(), "post the summary".into())])
            .unwrap();
        assert_eq!(accepted, 1);

        let insertions = ctx.take_insertions();
        assert_eq!(insertions.len(), 1);
        assert_eq!(insertions[0].agent_name, "notifier");
        assert_eq!(insertions[0].prompt, "post the summary");
        // Dependencies come from the dispatch-time snapshot.
        assert_eq!(insertions[0].deps.as_ref().unwrap().type_tag, "NotifierDeps");
    }

    #[test]
    fn edit_rejects_unknown_agent() {
        let message = planner_message();
        let mut ctx = ActivityContext::for_message(&message, &editing_registration(3), None);

        assert_eq!(
            ctx.edit_itinerary(&[("stranger".into(), "hi".into())]),
            Err(EditError::UnknownAgent("stranger".into()))
        );
        assert!(ctx.take_insertions().is_empty());
    }

    #[test]
    fn edit_rejects_already_executed_agent() {
        let mut message = planner_message();
        message.routing_slip.executed.push(crate::contracts::ExecutedActivity {
            agent_name: "notifier".into(),
            started_at: crate::contracts::now_millis(),
            finished_at: crate::contracts::now_millis(),
            output_ref: None,
            status: crate::contracts::ExecutedStatus::Completed,
        });
        let mut ctx = ActivityContext::for_message(&message, &editing_registration(3), None);

        assert_eq!(
            ctx.edit_itinerary(&[("notifier".into(), "again".into())]),
            Err(EditError::AlreadyExecuted("notifier".into()))
        );
    }

    #[test]
    fn edit_bound_counts_buffered_and_prior_insertions() {
        let mut message = planner_message();
        message.routing_slip.inserted_count = 2;
        let mut ctx = ActivityContext::for_message(&message, &editing_registration(3), None);

        ctx.edit_itinerary(&[("notifier".into(), "once".into())]).unwrap();
        let err = ctx
            .edit_itinerary(&[("notifier".into(), "twice".into())])
            .unwrap_err();
        assert_eq!(
            err,
            EditError::BoundExceeded {
                inserted: 3,
                requested: 1,
                max: 3
            }
        );
        assert_eq!(ctx.take_insertions().len(), 1);
    }

    #[test]
    fn edit_with_zero_bound_returns_error_string() {
        let message = planner_message();
        let mut ctx = ActivityContext::for_message(&message, &editing_registration(0), None);

        let err = ctx
            .edit_itinerary(&[("notifier".into(), "post".into())])
            .unwrap_err();
        assert!(err.to_string().contains("insertion bound reached"));
        assert!(ctx.take_insertions().is_empty());
    }

    #[test]
    fn context_exposes_workflow_identity() {
        let message = planner_message()
            .with_trace_id(Some("trace-1".into()))
            .with_obo_token(Some("obo".into()));
        let ctx = ActivityContext::for_message(
            &message,
            &editing_registration(3),
            Some(PreviousOutput {
                agent_name: "a".into(),
                output: json!("prior"),
            }),
        );

        assert_eq!(ctx.correlation_id(), "corr-1");
        assert_eq!(ctx.run_id(), "run-1");
        assert_eq!(ctx.trace_id(), Some("trace-1"));
        assert_eq!(ctx.obo_token(), Some("obo"));
        assert_eq!(ctx.previous_output().unwrap().agent_name, "a");
        assert!(ctx.can_edit_itinerary());
    }
}
