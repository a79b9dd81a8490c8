//! Activity executor: the long-running worker loop for one agent.
//!
//! Each worker hosts exactly one subscription stream and processes one
//! message at a time: deserialize, record the step start, reconstruct
//! typed dependencies, invoke the runner, then advance-and-forward or
//! retry. The transport's delivery exclusivity is the serialization
//! mechanism; the executor never holds more than the single in-flight
//! message.

use crate::contracts::{now_millis, PaigeantMessage};
use crate::error::sanitize_error_message;
use crate::registry::{ActivityRunner as _, AgentRegistration, AgentRegistry, UnknownAgent};
use crate::repository::{StepKey, WorkflowRepository, WorkflowSnapshot};
use crate::transport::{Delivery, Transport, TransportError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn, Instrument};

pub mod context;
pub mod retry;

pub use context::{ActivityContext, EditError};
pub use retry::RetryPolicy;

/// Worker-fatal failures. Everything else is handled per message.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    UnknownAgent(#[from] UnknownAgent),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn snapshot_of(message: &PaigeantMessage) -> WorkflowSnapshot {
    WorkflowSnapshot {
        routing_slip: message.routing_slip.clone(),
        payload: message.payload.clone(),
    }
}

/// Long-running worker for one agent topic.
pub struct ActivityExecutor<T: Transport> {
    transport: Arc<T>,
    repository: Arc<dyn WorkflowRepository>,
    registry: AgentRegistry,
    agent_name: String,
    retry: RetryPolicy,
}

impl<T: Transport + 'static> ActivityExecutor<T> {
    pub fn new(
        transport: Arc<T>,
        repository: Arc<dyn WorkflowRepository>,
        registry: AgentRegistry,
        agent_name: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            repository,
            registry,
            agent_name: agent_name.to_string(),
            retry,
        }
    }

    /// Run the worker loop until shutdown is signalled or the transport
    /// closes.
    ///
    /// Shutdown is cooperative: the in-flight step finishes, its result is
    /// published and acknowledged, then the transport is released.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ExecutorError> {
        let registration = self
            .registry
            .get(&self.agent_name)
            .ok_or_else(|| UnknownAgent(self.agent_name.clone()))?;

        self.transport.connect().await?;
        let mut subscription = self.transport.subscribe(&self.agent_name).await?;
        info!(agent_name = %self.agent_name, "activity worker started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(agent_name = %self.agent_name, "shutdown requested, stopping worker");
                        break;
                    }
                }
                delivery = subscription.next() => match delivery {
                    Ok(delivery) => {
                        if let Err(e) = self.process_delivery(&registration, &delivery).await {
                            error!(
                                agent_name = %self.agent_name,
                                error = %e,
                                "infrastructure failure, worker exiting"
                            );
                            let _ = self.transport.ack(&delivery.tag).await;
                            let _ = self.transport.disconnect().await;
                            return Err(e);
                        }
                    }
                    Err(TransportError::Closed) => {
                        info!(agent_name = %self.agent_name, "transport closed, stopping worker");
                        break;
                    }
                    Err(e) => {
                        let _ = self.transport.disconnect().await;
                        return Err(e.into());
                    }
                }
            }
        }

        self.transport.disconnect().await?;
        Ok(())
    }

    async fn process_delivery(
        &self,
        registration: &AgentRegistration,
        delivery: &Delivery,
    ) -> Result<(), ExecutorError> {
        let message = match PaigeantMessage::from_bytes(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                // Poisonous payload: settle it or it wedges the topic.
                warn!(
                    agent_name = %self.agent_name,
                    topic = %delivery.tag.topic,
                    error = %e,
                    "malformed delivery, dropping"
                );
                self.transport.ack(&delivery.tag).await?;
                return Ok(());
            }
        };

        let Some(head) = message.routing_slip.next_step().cloned() else {
            warn!(
                agent_name = %self.agent_name,
                correlation_id = %message.correlation_id,
                "delivery with empty itinerary, dropping"
            );
            self.transport.ack(&delivery.tag).await?;
            return Ok(());
        };

        if head.agent_name != self.agent_name {
            warn!(
                agent_name = %self.agent_name,
                correlation_id = %message.correlation_id,
                head_agent = %head.agent_name,
                "misrouted delivery, dropping"
            );
            self.transport.ack(&delivery.tag).await?;
            return Ok(());
        }

        let key = StepKey::new(&message.correlation_id, &head.agent_name, &message.run_id);
        if let Err(e) = self
            .repository
            .record_step_started(&key, message.attempt, &snapshot_of(&message))
            .await
        {
            warn!(correlation_id = %message.correlation_id, error = %e, "failed to record step start");
        }
        info!(
            correlation_id = %message.correlation_id,
            run_id = %message.run_id,
            agent_name = %self.agent_name,
            attempt = message.attempt,
            "step started"
        );

        let started_at = now_millis();

        let deps = match &head.deps {
            Some(blob) => match self.registry.deps().decode(blob) {
                Ok(value) => Some(value),
                Err(e) => {
                    return self
                        .fail_workflow(&key, &message, &e.to_string(), delivery)
                        .await;
                }
            },
            None => None,
        };

        let previous = head
            .expects_previous_output
            .then(|| message.previous_output())
            .flatten();
        let mut ctx = ActivityContext::for_message(&message, registration, previous);

        let step = crate::step_span!(
            message.correlation_id,
            message.run_id,
            self.agent_name,
            message.attempt
        );
        match registration
            .runner
            .run(&head.prompt, deps, &mut ctx)
            .instrument(step)
            .await
        {
            Ok(output) => {
                self.complete_step(registration, &key, message, ctx, output, started_at, delivery)
                    .await
            }
            Err(failure) if failure.is_retryable() => {
                self.retry_step(&key, message, &failure.message, delivery).await
            }
            Err(failure) => {
                self.fail_workflow(&key, &message, &failure.message, delivery)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_step(
        &self,
        registration: &AgentRegistration,
        key: &StepKey,
        message: PaigeantMessage,
        mut ctx: ActivityContext,
        output: Value,
        started_at: DateTime<Utc>,
        delivery: &Delivery,
    ) -> Result<(), ExecutorError> {
        let output_ref = serde_json::to_string(&output).unwrap_or_default();
        if let Err(e) = self
            .repository
            .record_step_completed(key, message.attempt, &output_ref)
            .await
        {
            warn!(correlation_id = %message.correlation_id, error = %e, "failed to record step completion");
        }
        info!(
            correlation_id = %message.correlation_id,
            run_id = %message.run_id,
            agent_name = %self.agent_name,
            attempt = message.attempt,
            "step completed"
        );

        let mut message = message;
        let insertions = ctx.take_insertions();
        if !insertions.is_empty() {
            let names: Vec<String> = insertions.iter().map(|s| s.agent_name.clone()).collect();
            match message.insert_steps(insertions, registration.max_insertions) {
                Ok(count) => info!(
                    correlation_id = %message.correlation_id,
                    inserted = count,
                    agents = ?names,
                    "itinerary extended"
                ),
                Err(e) => warn!(
                    correlation_id = %message.correlation_id,
                    error = %e,
                    "buffered insertions rejected by envelope"
                ),
            }
        }

        let next = message.advance(output, started_at);

        match next.routing_slip.next_step() {
            None => {
                if let Err(e) = self
                    .repository
                    .mark_workflow_completed(&next.correlation_id, &snapshot_of(&next))
                    .await
                {
                    warn!(correlation_id = %next.correlation_id, error = %e, "failed to record workflow completion");
                }
                info!(
                    correlation_id = %next.correlation_id,
                    run_id = %next.run_id,
                    agent_name = %self.agent_name,
                    "workflow completed"
                );
            }
            Some(next_step) => {
                let next_topic = next_step.agent_name.clone();
                self.transport.publish(&next_topic, &next).await?;
                info!(
                    correlation_id = %next.correlation_id,
                    run_id = %next.run_id,
                    agent_name = %self.agent_name,
                    next_agent = %next_topic,
                    "forwarded to next activity"
                );
            }
        }

        self.transport.ack(&delivery.tag).await?;
        Ok(())
    }

    async fn retry_step(
        &self,
        key: &StepKey,
        message: PaigeantMessage,
        error_message: &str,
        delivery: &Delivery,
    ) -> Result<(), ExecutorError> {
        let sanitized = sanitize_error_message(error_message);
        let failed_attempt = message.attempt + 1;
        if let Err(e) = self
            .repository
            .record_step_failed(key, failed_attempt, &sanitized)
            .await
        {
            warn!(correlation_id = %message.correlation_id, error = %e, "failed to record step failure");
        }

        if failed_attempt < self.retry.max_attempts {
            let delay = self.retry.backoff(message.attempt);
            warn!(
                correlation_id = %message.correlation_id,
                run_id = %message.run_id,
                agent_name = %self.agent_name,
                attempt = failed_attempt,
                delay_ms = delay.as_millis() as u64,
                error = %sanitized,
                "step failed, scheduling retry"
            );
            let retry_message = message.retry_clone(&sanitized);
            tokio::time::sleep(delay).await;
            self.transport.publish(&self.agent_name, &retry_message).await?;
            self.transport.ack(&delivery.tag).await?;
            Ok(())
        } else {
            error!(
                correlation_id = %message.correlation_id,
                run_id = %message.run_id,
                agent_name = %self.agent_name,
                attempt = failed_attempt,
                error = %sanitized,
                "retries exhausted, failing workflow"
            );
            if let Err(e) = self
                .repository
                .mark_workflow_failed(&message.correlation_id, &snapshot_of(&message))
                .await
            {
                warn!(correlation_id = %message.correlation_id, error = %e, "failed to record workflow failure");
            }
            self.transport.ack(&delivery.tag).await?;
            Ok(())
        }
    }

    async fn fail_workflow(
        &self,
        key: &StepKey,
        message: &PaigeantMessage,
        error_message: &str,
        delivery: &Delivery,
    ) -> Result<(), ExecutorError> {
        let sanitized = sanitize_error_message(error_message);
        if let Err(e) = self
            .repository
            .record_step_failed(key, message.attempt + 1, &sanitized)
            .await
        {
            warn!(correlation_id = %message.correlation_id, error = %e, "failed to record step failure");
        }
        error!(
            correlation_id = %message.correlation_id,
            run_id = %message.run_id,
            agent_name = %self.agent_name,
            attempt = message.attempt,
            error = %sanitized,
            "permanent failure, failing workflow"
        );
        if let Err(e) = self
            .repository
            .mark_workflow_failed(&message.correlation_id, &snapshot_of(message))
            .await
        {
            warn!(correlation_id = %message.correlation_id, error = %e, "failed to record workflow failure");
        }
        self.transport.ack(&delivery.tag).await?;
        Ok(())
    }
}
