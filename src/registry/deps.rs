//! Typed reconstruction of serialized dependency blobs.
//!
//! Dependency payloads travel as self-describing JSON tagged with a stable
//! type tag. Workers register a factory per tag at startup; reconstruction
//! is an explicit table lookup, never reflection. The resulting value is
//! type-erased and downcast by the runner that declared the tag.

use crate::contracts::SerializedDeps;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Type-erased reconstructed dependency value.
pub type DepsValue = Box<dyn Any + Send>;

type Factory = Arc<dyn Fn(&Value) -> Result<DepsValue, DepsError> + Send + Sync>;

/// Dependency reconstruction failures. Always permanent: a payload that
/// cannot be rebuilt will not get better on retry.
#[derive(Debug, Error)]
pub enum DepsError {
    #[error("no dependency codec registered for type tag '{0}'")]
    UnknownTypeTag(String),
    #[error("failed to reconstruct dependency '{tag}': {reason}")]
    Reconstruct { tag: String, reason: String },
}

/// Registry of `type_tag -> factory` codecs.
#[derive(Clone, Default)]
pub struct DepsCodecs {
    factories: Arc<RwLock<HashMap<String, Factory>>>,
}

impl DepsCodecs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec reconstructing `T` for the given tag.
    pub fn register<T>(&self, type_tag: &str)
    where
        T: DeserializeOwned + Send + 'static,
    {
        let tag = type_tag.to_string();
        let factory_tag = tag.clone();
        let factory: Factory = Arc::new(move |data: &Value| {
            serde_json::from_value::<T>(data.clone())
                .map(|value| Box::new(value) as DepsValue)
                .map_err(|e| DepsError::Reconstruct {
                    tag: factory_tag.clone(),
                    reason: e.to_string(),
                })
        });
        self.factories
            .write()
            .expect("deps codec lock poisoned")
            .insert(tag, factory);
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.factories
            .read()
            .expect("deps codec lock poisoned")
            .contains_key(type_tag)
    }

    /// Reconstruct the typed value described by a serialized blob.
    pub fn decode(&self, deps: &SerializedDeps) -> Result<DepsValue, DepsError> {
        let factory = self
            .factories
            .read()
            .expect("deps codec lock poisoned")
            .get(&deps.type_tag)
            .cloned()
            .ok_or_else(|| DepsError::UnknownTypeTag(deps.type_tag.clone()))?;
        factory(&deps.data)
    }
}
