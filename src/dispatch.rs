//! Workflow dispatcher: builds and emits the first message.
//!
//! The dispatcher is intentionally thin. It performs no validation of
//! runner availability; the worker for the first agent may not be running
//! yet, in which case the message waits in the durable topic.

use crate::contracts::{ActivitySpec, PaigeantMessage, RoutingSlip};
use crate::repository::{WorkflowRecord, WorkflowRepository, WorkflowSnapshot};
use crate::transport::{Transport, TransportError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Dispatch failures.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot dispatch an empty workflow")]
    EmptyWorkflow,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Per-dispatch options: initial payload variables, delegation token and
/// trace context.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub variables: Map<String, Value>,
    pub obo_token: Option<String>,
    pub trace_id: Option<String>,
}

/// Service assembling workflows from registered activities.
pub struct WorkflowDispatcher<T: Transport> {
    transport: Arc<T>,
    repository: Arc<dyn WorkflowRepository>,
    runway: Vec<ActivitySpec>,
    available_activities: BTreeMap<String, ActivitySpec>,
}

impl<T: Transport> WorkflowDispatcher<T> {
    pub fn new(transport: Arc<T>, repository: Arc<dyn WorkflowRepository>) -> Self {
        Self {
            transport,
            repository,
            runway: Vec::new(),
            available_activities: BTreeMap::new(),
        }
    }

    /// Append an activity to the itinerary under construction. The spec
    /// also becomes available as an insertion target.
    pub fn add_to_runway(&mut self, spec: ActivitySpec) {
        self.register_available_activity(spec.clone());
        self.runway.push(spec);
    }

    /// Make an activity available for dynamic insertion without putting it
    /// on the initial itinerary.
    pub fn register_available_activity(&mut self, spec: ActivitySpec) {
        self.available_activities.insert(spec.agent_name.clone(), spec);
    }

    pub fn runway(&self) -> &[ActivitySpec] {
        &self.runway
    }

    /// Build the initial message, record the workflow as pending and
    /// publish onto the first activity's topic. Returns the correlation id.
    pub async fn dispatch_workflow(
        &self,
        options: DispatchOptions,
    ) -> Result<String, DispatchError> {
        let first_topic = self
            .runway
            .first()
            .map(|spec| spec.agent_name.clone())
            .ok_or(DispatchError::EmptyWorkflow)?;

        let correlation_id = Uuid::new_v4().to_string();
        let run_id = Uuid::new_v4().to_string();
        let routing_slip = RoutingSlip::new(self.runway.clone());

        let message = PaigeantMessage::new(&correlation_id, &run_id, routing_slip)
            .with_payload(options.variables)
            .with_obo_token(options.obo_token)
            .with_trace_id(options.trace_id)
            .with_activity_registry(self.available_activities.clone());

        let snapshot = WorkflowSnapshot {
            routing_slip: message.routing_slip.clone(),
            payload: message.payload.clone(),
        };
        let span = crate::workflow_span!(correlation_id, run_id);
        async {
            if let Err(e) = self
                .repository
                .record_workflow(&WorkflowRecord::pending(&correlation_id, snapshot))
                .await
            {
                warn!(error = %e, "failed to record dispatched workflow");
            }

            self.transport.publish(&first_topic, &message).await?;
            info!(
                correlation_id = %correlation_id,
                run_id = %run_id,
                first_agent = %first_topic,
                steps = self.runway.len(),
                "workflow dispatched"
            );
            Ok::<(), DispatchError>(())
        }
        .instrument(span)
        .await?;
        Ok(correlation_id)
    }
}
