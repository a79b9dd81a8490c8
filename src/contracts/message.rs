//! The wire envelope exchanged over the bus.
//!
//! A [`PaigeantMessage`] is immutable on the wire: workers derive the next
//! message with [`advance`](PaigeantMessage::advance) or
//! [`retry_clone`](PaigeantMessage::retry_clone) instead of editing the one
//! they received. Unknown envelope keys survive a deserialize/serialize
//! round-trip so newer producers can talk to older workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use super::routing_slip::{ActivitySpec, ExecutedStatus, RoutingSlip, SlipError};
use super::{iso_millis, now_millis, PREVIOUS_OUTPUT_KEY};

/// Wire format version emitted by this crate.
pub const SPEC_VERSION: &str = "1.0";

/// Payload key recording the error that triggered the most recent retry.
const LAST_ERROR_KEY: &str = "last_error";

/// Output produced by a prior agent, stored under the reserved
/// `previous_output` payload key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreviousOutput {
    pub agent_name: String,
    pub output: Value,
}

/// Envelope parse and mutation failures.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported spec_version '{0}'")]
    UnsupportedVersion(String),
    #[error("invalid envelope: {0}")]
    Invalid(String),
    #[error(transparent)]
    Slip(#[from] SlipError),
}

/// Envelope exchanged over the bus: metadata, routing slip and payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaigeantMessage {
    pub message_id: String,
    pub correlation_id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obo_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub spec_version: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub routing_slip: RoutingSlip,
    /// Snapshot of dispatch-time registered activities, authorizing
    /// dynamic insertions (absent when editing is not in play).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_registry: Option<BTreeMap<String, ActivitySpec>>,
    /// Keys this version does not understand, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PaigeantMessage {
    pub fn new(correlation_id: &str, run_id: &str, routing_slip: RoutingSlip) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: correlation_id.to_string(),
            run_id: run_id.to_string(),
            trace_id: None,
            timestamp: now_millis(),
            obo_token: None,
            signature: None,
            spec_version: SPEC_VERSION.to_string(),
            attempt: 0,
            payload: Map::new(),
            routing_slip,
            activity_registry: None,
            extra: Map::new(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_obo_token(mut self, obo_token: Option<String>) -> Self {
        self.obo_token = obo_token;
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_activity_registry(
        mut self,
        registry: BTreeMap<String, ActivitySpec>,
    ) -> Self {
        self.activity_registry = Some(registry);
        self
    }

    /// Canonical on-wire form. Stable under re-serialization of an
    /// unmodified envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate delivered bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let message: PaigeantMessage = serde_json::from_slice(bytes)?;
        message.validate()?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if !self.spec_version.starts_with("1.") {
            return Err(EnvelopeError::UnsupportedVersion(self.spec_version.clone()));
        }
        if self.message_id.is_empty() || self.correlation_id.is_empty() || self.run_id.is_empty()
        {
            return Err(EnvelopeError::Invalid(
                "message_id, correlation_id and run_id are required".into(),
            ));
        }
        self.routing_slip.validate()?;
        Ok(())
    }

    /// The prior step's output, when a predecessor recorded one.
    pub fn previous_output(&self) -> Option<PreviousOutput> {
        self.payload
            .get(PREVIOUS_OUTPUT_KEY)
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Complete the head step and derive the message for the next one.
    ///
    /// Pops the head of the itinerary into the executed log, stores the
    /// step output under `previous_output`, resets `attempt`, mints a
    /// fresh `message_id` and preserves workflow identity and security
    /// context.
    pub fn advance(mut self, output: Value, started_at: DateTime<Utc>) -> Self {
        let output_ref = serde_json::to_string(&output).ok();
        if let Some(completed) = self.routing_slip.mark_complete(
            started_at,
            now_millis(),
            output_ref,
            ExecutedStatus::Completed,
        ) {
            let previous = PreviousOutput {
                agent_name: completed.agent_name,
                output,
            };
            self.payload.insert(
                PREVIOUS_OUTPUT_KEY.to_string(),
                serde_json::to_value(previous).unwrap_or(Value::Null),
            );
        }
        self.payload.remove(LAST_ERROR_KEY);
        self.message_id = Uuid::new_v4().to_string();
        self.timestamp = now_millis();
        self.attempt = 0;
        self
    }

    /// Derive the redelivery message for a retryable failure.
    ///
    /// Increments `attempt` and mints a fresh `message_id`; itinerary and
    /// executed log are untouched and `run_id` is preserved.
    pub fn retry_clone(&self, error: &str) -> Self {
        let mut retry = self.clone();
        retry.message_id = Uuid::new_v4().to_string();
        retry.timestamp = now_millis();
        retry.attempt = self.attempt + 1;
        retry
            .payload
            .insert(LAST_ERROR_KEY.to_string(), Value::String(error.to_string()));
        retry
    }

    /// Insert steps immediately after the currently executing head,
    /// subject to the cumulative insertion bound.
    pub fn insert_steps(
        &mut self,
        steps: Vec<ActivitySpec>,
        max_insertions: u32,
    ) -> Result<usize, EnvelopeError> {
        Ok(self.routing_slip.insert_after_head(steps, max_insertions)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(names: &[&str]) -> PaigeantMessage {
        let slip = RoutingSlip::new(names.iter().map(|n| ActivitySpec::new(n, "go")).collect());
        PaigeantMessage::new("corr-1", "run-1", slip)
    }

    #[test]
    fn round_trip_preserves_equality() {
        let original = message(&["a", "b"])
            .with_trace_id(Some("trace-9".into()))
            .with_obo_token(Some("token".into()));
        let bytes = original.to_bytes().unwrap();
        let parsed = PaigeantMessage::from_bytes(&bytes).unwrap();

        assert_eq!(parsed, original);
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let mut raw: Value = serde_json::from_slice(&message(&["a"]).to_bytes().unwrap()).unwrap();
        raw["x_vendor_hint"] = json!({"shard": 7});

        let parsed = PaigeantMessage::from_bytes(raw.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.extra["x_vendor_hint"]["shard"], 7);

        let reserialized: Value =
            serde_json::from_slice(&parsed.to_bytes().unwrap()).unwrap();
        assert_eq!(reserialized["x_vendor_hint"]["shard"], 7);
    }

    #[test]
    fn from_bytes_rejects_garbage() {
        assert!(matches!(
            PaigeantMessage::from_bytes(b"not json"),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn from_bytes_rejects_unsupported_version() {
        let mut raw: Value = serde_json::from_slice(&message(&["a"]).to_bytes().unwrap()).unwrap();
        raw["spec_version"] = json!("2.0");

        assert!(matches!(
            PaigeantMessage::from_bytes(raw.to_string().as_bytes()),
            Err(EnvelopeError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn advance_moves_head_and_records_previous_output() {
        let original = message(&["a", "b"]);
        let started = now_millis();
        let advanced = original.clone().advance(json!("done-by-a"), started);

        assert_eq!(advanced.routing_slip.itinerary.len(), 1);
        assert_eq!(advanced.routing_slip.itinerary[0].agent_name, "b");
        assert_eq!(advanced.routing_slip.executed.len(), 1);
        assert_eq!(advanced.routing_slip.executed[0].agent_name, "a");
        assert_eq!(advanced.attempt, 0);
        assert_ne!(advanced.message_id, original.message_id);
        assert_eq!(advanced.correlation_id, original.correlation_id);
        assert_eq!(advanced.run_id, original.run_id);

        let previous = advanced.previous_output().unwrap();
        assert_eq!(previous.agent_name, "a");
        assert_eq!(previous.output, json!("done-by-a"));
    }

    #[test]
    fn advance_appears_in_executed_exactly_once() {
        let advanced = message(&["a"]).advance(json!(1), now_millis());
        let in_executed = advanced
            .routing_slip
            .executed
            .iter()
            .filter(|r| r.agent_name == "a")
            .count();
        assert_eq!(in_executed, 1);
        assert!(advanced
            .routing_slip
            .itinerary
            .iter()
            .all(|s| s.agent_name != "a"));
    }

    #[test]
    fn retry_clone_increments_attempt_without_touching_slip() {
        let original = message(&["a", "b"]);
        let retry = original.retry_clone("transient boom");

        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.run_id, original.run_id);
        assert_eq!(retry.routing_slip, original.routing_slip);
        assert_ne!(retry.message_id, original.message_id);
        assert_eq!(retry.payload["last_error"], json!("transient boom"));
    }

    #[test]
    fn advance_clears_last_error() {
        let retried = message(&["a"]).retry_clone("boom");
        let advanced = retried.advance(json!("ok"), now_millis());
        assert!(!advanced.payload.contains_key("last_error"));
    }

    #[test]
    fn insert_steps_respects_bound() {
        let mut msg = message(&["planner", "c"]);
        msg.insert_steps(vec![ActivitySpec::new("notifier", "post")], 3)
            .unwrap();
        assert_eq!(msg.routing_slip.inserted_count, 1);

        let err = msg
            .insert_steps(
                vec![
                    ActivitySpec::new("x", "p"),
                    ActivitySpec::new("y", "p"),
                    ActivitySpec::new("z", "p"),
                ],
                3,
            )
            .unwrap_err();
        assert!(matches!(err, EnvelopeError::Slip(SlipError::InsertionBound { .. })));
    }

    #[test]
    fn timestamp_serializes_with_millisecond_precision() {
        let raw: Value = serde_json::from_slice(&message(&["a"]).to_bytes().unwrap()).unwrap();
        let ts = raw["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z'));
        // e.g. 2026-08-02T12:34:56.789Z
        assert_eq!(ts.split('.').nth(1).map(|frac| frac.len()), Some(4));
    }
}
