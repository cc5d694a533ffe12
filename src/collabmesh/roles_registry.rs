//! Hot-reloadable catalog of collaborating agents (C2).
//!
//! The registry holds its state as an `Arc<RolesSnapshot>` behind a
//! `tokio::sync::RwLock`. `reload` atomically swaps the `Arc`; any reader
//! that already cloned the old snapshot keeps working against a fully
//! consistent view until it drops it, matching the "hot reload" design note
//! in [`crate::collabmesh`]'s top-level docs: readers never observe a
//! partially-updated registry.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::collabmesh::config::{ConfigError, RolesConfig};
use crate::collabmesh::model::AgentDescriptor;

/// Failure modes for [`RolesRegistry`] operations.
#[derive(Debug)]
pub enum RegistryError {
    Config(ConfigError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Config(e) => write!(f, "registry configuration error: {}", e),
        }
    }
}

impl Error for RegistryError {}

impl From<ConfigError> for RegistryError {
    fn from(e: ConfigError) -> Self {
        RegistryError::Config(e)
    }
}

struct RolesSnapshot {
    agents: Vec<AgentDescriptor>,
    by_id: HashMap<String, usize>,
    task_domains: HashMap<String, Vec<String>>,
}

impl RolesSnapshot {
    fn from_config(config: RolesConfig) -> Self {
        let by_id = config
            .agents
            .iter()
            .enumerate()
            .map(|(i, a)| (a.agent_id.clone(), i))
            .collect();
        RolesSnapshot {
            agents: config.agents,
            by_id,
            task_domains: config.task_domains,
        }
    }
}

/// The live agent catalog, reloadable from its backing TOML file.
pub struct RolesRegistry {
    path: PathBuf,
    snapshot: RwLock<Arc<RolesSnapshot>>,
}

impl RolesRegistry {
    /// Load the registry from `path`, failing if the document is malformed.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let config = RolesConfig::from_toml_file(&path)?;
        Ok(RolesRegistry {
            path,
            snapshot: RwLock::new(Arc::new(RolesSnapshot::from_config(config))),
        })
    }

    /// Build a registry directly from an already-parsed [`RolesConfig`],
    /// with no backing file (reload will re-read from `path` regardless, so
    /// callers that want reload support should use [`RolesRegistry::load`]).
    pub fn from_config(path: PathBuf, config: RolesConfig) -> Self {
        RolesRegistry {
            path,
            snapshot: RwLock::new(Arc::new(RolesSnapshot::from_config(config))),
        }
    }

    /// All registered agents, in stable (config file) order.
    pub async fn list_agents(&self) -> Vec<AgentDescriptor> {
        self.snapshot.read().await.agents.clone()
    }

    /// Look up one agent by id.
    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentDescriptor> {
        let snapshot = self.snapshot.read().await;
        snapshot
            .by_id
            .get(agent_id)
            .map(|&idx| snapshot.agents[idx].clone())
    }

    /// Preferred role ordering configured for `domain`; empty if unconfigured.
    pub async fn domain_preferences(&self, domain: &str) -> Vec<String> {
        self.snapshot
            .read()
            .await
            .task_domains
            .get(domain)
            .cloned()
            .unwrap_or_default()
    }

    /// Re-parse the backing file and atomically replace the snapshot.
    /// On parse failure, the live snapshot is left untouched.
    pub async fn reload(&self) -> Result<(), RegistryError> {
        let config = RolesConfig::from_toml_file(&self.path)?;
        let mut guard = self.snapshot.write().await;
        *guard = Arc::new(RolesSnapshot::from_config(config));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_doc(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("roles.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    const VALID_DOC: &str = r#"
        [[agents]]
        agent_id = "agent_a"
        agent_name = "Agent A"
        roles = ["Synthesizer"]
        domains = ["technical"]
        priority_weight = 0.8
    "#;

    #[tokio::test]
    async fn list_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(&dir, VALID_DOC);
        let registry = RolesRegistry::load(&path).await.unwrap();
        assert_eq!(registry.list_agents().await.len(), 1);
        assert!(registry.get_agent("agent_a").await.is_some());
        assert!(registry.get_agent("nope").await.is_none());
    }

    #[tokio::test]
    async fn reload_failure_preserves_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_doc(&dir, VALID_DOC);
        let registry = RolesRegistry::load(&path).await.unwrap();

        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"not valid toml [[[").unwrap();

        let result = registry.reload().await;
        assert!(result.is_err());
        assert_eq!(registry.list_agents().await.len(), 1);
    }
}
