//! Agent registry: the process-local mapping from agent name to runner.
//!
//! The registry is the executor's only trusted source of runner identity;
//! messages carry references but never code. It is an explicit service
//! object threaded through worker construction, not a process-wide
//! singleton.

use crate::execute::ActivityContext;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

pub mod deps;
pub mod discovery;

pub use deps::{DepsCodecs, DepsError, DepsValue};
pub use discovery::{discover_agents, AgentManifest, DiscoveredAgent, DiscoveryError};

/// Whether a runner failure should be retried or is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    Permanent,
}

/// Failure sentinel returned by activity runners.
///
/// The executor is the sole arbiter of retry vs. terminate; runners only
/// declare which kind of failure they hit.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ActivityFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ActivityFailure {
    pub fn retryable<S: Into<String>>(message: S) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }
}

/// A named, stateless executor of activities.
///
/// The output value is opaque to the engine; it is forwarded to the next
/// step as `previous_output`.
#[async_trait]
pub trait ActivityRunner: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        deps: Option<DepsValue>,
        ctx: &mut ActivityContext,
    ) -> Result<Value, ActivityFailure>;
}

/// One registered agent: its runner plus declared capabilities.
#[derive(Clone)]
pub struct AgentRegistration {
    pub agent_name: String,
    pub runner: Arc<dyn ActivityRunner>,
    /// Type tag of the dependency value this agent expects, resolved
    /// through the dependency codecs.
    pub deps_tag: Option<String>,
    pub can_edit_itinerary: bool,
    pub max_insertions: u32,
}

impl AgentRegistration {
    pub fn new(agent_name: &str, runner: Arc<dyn ActivityRunner>) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            runner,
            deps_tag: None,
            can_edit_itinerary: false,
            max_insertions: 3,
        }
    }

    pub fn with_deps_tag(mut self, tag: &str) -> Self {
        self.deps_tag = Some(tag.to_string());
        self
    }

    pub fn with_itinerary_editing(mut self, max_insertions: u32) -> Self {
        self.can_edit_itinerary = true;
        self.max_insertions = max_insertions;
        self
    }
}

/// Thread-safe registry of agents available in this process.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<String, AgentRegistration>>>,
    deps: DepsCodecs,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace an agent.
    pub fn register(&self, registration: AgentRegistration) {
        let name = registration.agent_name.clone();
        let replaced = self
            .agents
            .write()
            .expect("agent registry lock poisoned")
            .insert(name.clone(), registration)
            .is_some();
        if replaced {
            debug!(agent_name = %name, "replaced agent registration");
        } else {
            info!(agent_name = %name, "registered agent");
        }
    }

    pub fn get(&self, agent_name: &str) -> Option<AgentRegistration> {
        self.agents
            .read()
            .expect("agent registry lock poisoned")
            .get(agent_name)
            .cloned()
    }

    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .agents
            .read()
            .expect("agent registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Dependency codecs shared by every agent in this process.
    pub fn deps(&self) -> &DepsCodecs {
        &self.deps
    }
}

/// Worker startup failure: the agent this worker should serve is not
/// registered.
#[derive(Debug, Error)]
#[error("agent '{0}' is not registered in this process")]
pub struct UnknownAgent(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::EchoRunner;

    #[test]
    fn register_and_resolve() {
        let registry = AgentRegistry::new();
        registry.register(AgentRegistration::new("echo", Arc::new(EchoRunner)));

        let registration = registry.get("echo").unwrap();
        assert_eq!(registration.agent_name, "echo");
        assert!(!registration.can_edit_itinerary);
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn registration_builder_flags() {
        let registration = AgentRegistration::new("planner", Arc::new(EchoRunner))
            .with_deps_tag("PlannerDeps")
            .with_itinerary_editing(2);

        assert_eq!(registration.deps_tag.as_deref(), Some("PlannerDeps"));
        assert!(registration.can_edit_itinerary);
        assert_eq!(registration.max_insertions, 2);
    }

    #[test]
    fn agent_names_are_sorted() {
        let registry = AgentRegistry::new();
        registry.register(AgentRegistration::new("zeta", Arc::new(EchoRunner)));
        registry.register(AgentRegistration::new("alpha", Arc::new(EchoRunner)));

        assert_eq!(registry.agent_names(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn failure_kinds() {
        assert!(ActivityFailure::retryable("x").is_retryable());
        assert!(!ActivityFailure::permanent("x").is_retryable());
        assert_eq!(ActivityFailure::permanent("boom").to_string(), "boom");
    }
}
