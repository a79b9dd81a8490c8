//! Static discovery of agent declarations on a filesystem path.
//!
//! Operators describe the agents a deployment offers in `*.agents.toml`
//! manifest files next to the code that implements them. Discovery walks a
//! directory tree, skipping ignored directories, and parses each manifest
//! without executing anything.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Manifest file suffix recognized by discovery.
pub const MANIFEST_SUFFIX: &str = ".agents.toml";

const IGNORED_DIRS: &[&str] = &["target", "node_modules", ".git", "__pycache__"];

/// One agent declaration from a manifest file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentManifest {
    pub name: String,
    /// Opaque module hint used to locate the registration code.
    #[serde(default)]
    pub module: Option<String>,
    /// Type tag of the dependency value the agent expects.
    #[serde(default)]
    pub deps_type: Option<String>,
    #[serde(default)]
    pub can_edit_itinerary: bool,
    #[serde(default = "default_max_insertions")]
    pub max_insertions: u32,
}

fn default_max_insertions() -> u32 {
    3
}

#[derive(Debug, Default, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    agents: Vec<AgentManifest>,
}

/// An agent declaration plus the manifest file it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredAgent {
    pub manifest: AgentManifest,
    pub source: PathBuf,
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Walk `root` and collect every agent declared in a manifest file.
pub fn discover_agents(root: &Path) -> Result<Vec<DiscoveredAgent>, DiscoveryError> {
    let mut discovered = Vec::new();
    walk(root, &mut discovered)?;
    discovered.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));
    Ok(discovered)
}

fn walk(dir: &Path, discovered: &mut Vec<DiscoveredAgent>) -> Result<(), DiscoveryError> {
    let entries = std::fs::read_dir(dir).map_err(|source| DiscoveryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| DiscoveryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if path.is_dir() {
            if name.starts_with('.') || IGNORED_DIRS.contains(&name.as_str()) {
                continue;
            }
            walk(&path, discovered)?;
        } else if name.ends_with(MANIFEST_SUFFIX) {
            let content = std::fs::read_to_string(&path).map_err(|source| DiscoveryError::Io {
                path: path.clone(),
                source,
            })?;
            let manifest: ManifestFile =
                toml::from_str(&content).map_err(|source| DiscoveryError::Parse {
                    path: path.clone(),
                    source,
                })?;
            debug!(path = %path.display(), agents = manifest.agents.len(), "parsed agent manifest");
            discovered.extend(manifest.agents.into_iter().map(|manifest| DiscoveredAgent {
                manifest,
                source: path.clone(),
            }));
        }
    }
    Ok(())
}
