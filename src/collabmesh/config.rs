//! Structured configuration for the Roles Registry and Arbitration Engine.
//!
//! Unlike the rest of this crate's ecosystem siblings, the roles and
//! arbitration documents are nested tables rather than a single path, so
//! they are parsed with `toml` rather than constructed by hand.

use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::collabmesh::model::{AgentDescriptor, Role};

/// Failure loading or parsing a configuration document.
#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "config io error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl Error for ConfigError {}

#[derive(Debug, Deserialize)]
struct RawAgent {
    agent_id: String,
    agent_name: String,
    #[serde(default)]
    roles: Vec<String>,
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default)]
    priority_weight: f64,
    cost_per_1k_tokens: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawDomainPreference {
    #[serde(default)]
    preferred_roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawRolesConfig {
    #[serde(default)]
    agents: Vec<RawAgent>,
    #[serde(default)]
    task_domains: HashMap<String, RawDomainPreference>,
}

/// Parsed, validated Roles configuration: the agent catalog plus per-domain
/// preferred-role orderings.
#[derive(Debug, Clone, Default)]
pub struct RolesConfig {
    pub agents: Vec<AgentDescriptor>,
    pub task_domains: HashMap<String, Vec<String>>,
}

impl RolesConfig {
    /// Parse and validate a TOML roles document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let raw: RawRolesConfig =
            toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut agents = Vec::with_capacity(raw.agents.len());
        let mut seen = std::collections::HashSet::new();
        for a in raw.agents {
            if !seen.insert(a.agent_id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate agent_id: {}",
                    a.agent_id
                )));
            }
            if !(0.0..=1.0).contains(&a.priority_weight) {
                return Err(ConfigError::Invalid(format!(
                    "agent {} has out-of-range priority_weight",
                    a.agent_id
                )));
            }
            let roles = a
                .roles
                .iter()
                .map(|r| {
                    Role::parse(r)
                        .ok_or_else(|| ConfigError::Invalid(format!("unknown role: {}", r)))
                })
                .collect::<Result<Vec<_>, _>>()?;
            agents.push(AgentDescriptor {
                agent_id: a.agent_id,
                agent_name: a.agent_name,
                roles,
                domains: a.domains,
                priority_weight: a.priority_weight,
                cost_per_1k_tokens: a.cost_per_1k_tokens,
            });
        }

        let task_domains = raw
            .task_domains
            .into_iter()
            .map(|(k, v)| (k, v.preferred_roles))
            .collect();

        Ok(RolesConfig {
            agents,
            task_domains,
        })
    }

    /// Load and parse a roles document from disk.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&data)
    }
}

#[derive(Debug, Deserialize)]
struct RawTaskTypeStrategy {
    primary: String,
}

#[derive(Debug, Deserialize)]
struct RawArbitrationConfig {
    default_strategy: String,
    fallback_strategy: String,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default)]
    task_type_strategies: HashMap<String, RawTaskTypeStrategy>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

/// Parsed Arbitration Engine configuration (strategy names, timeouts, retries).
#[derive(Debug, Clone)]
pub struct ArbitrationConfig {
    pub default_strategy: String,
    pub fallback_strategy: String,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub task_type_strategies: HashMap<String, String>,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        ArbitrationConfig {
            default_strategy: "confidence_weight".to_string(),
            fallback_strategy: "confidence_weight".to_string(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            task_type_strategies: HashMap::new(),
        }
    }
}

impl ArbitrationConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let raw: RawArbitrationConfig =
            toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(ArbitrationConfig {
            default_strategy: raw.default_strategy,
            fallback_strategy: raw.fallback_strategy,
            timeout_ms: raw.timeout_ms,
            max_retries: raw.max_retries,
            task_type_strategies: raw
                .task_type_strategies
                .into_iter()
                .map(|(k, v)| (k, v.primary))
                .collect(),
        })
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&data)
    }

    /// Resolve which strategy to use for a task type, falling back to
    /// `default_strategy` when no override is configured.
    pub fn strategy_for_task_type(&self, task_type: &str) -> &str {
        self.task_type_strategies
            .get(task_type)
            .unwrap_or(&self.default_strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_roles_doc() {
        let toml_doc = r#"
            [[agents]]
            agent_id = "agent_a"
            agent_name = "Agent A"
            roles = ["Synthesizer", "Analyst"]
            domains = ["technical"]
            priority_weight = 0.8

            [task_domains.technical]
            preferred_roles = ["Synthesizer", "Analyst"]
        "#;
        let cfg = RolesConfig::from_toml_str(toml_doc).unwrap();
        assert_eq!(cfg.agents.len(), 1);
        assert_eq!(cfg.task_domains["technical"], vec!["Synthesizer", "Analyst"]);
    }

    #[test]
    fn rejects_duplicate_agent_ids() {
        let toml_doc = r#"
            [[agents]]
            agent_id = "a"
            agent_name = "A"
            priority_weight = 0.5
            [[agents]]
            agent_id = "a"
            agent_name = "A2"
            priority_weight = 0.5
        "#;
        assert!(RolesConfig::from_toml_str(toml_doc).is_err());
    }

    #[test]
    fn arbitration_config_defaults() {
        let toml_doc = r#"
            default_strategy = "majority_vote"
            fallback_strategy = "confidence_weight"
        "#;
        let cfg = ArbitrationConfig::from_toml_str(toml_doc).unwrap();
        assert_eq!(cfg.timeout_ms, 30_000);
        assert_eq!(cfg.max_retries, 3);
    }
}
