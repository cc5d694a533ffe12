//! Shared data model for the collaboration pipeline.
//!
//! These types flow between every component in [`crate::collabmesh`]: the
//! fragmenter produces [`Subtask`]s inside a [`TaskFragment`], the dispatcher
//! turns them into [`SubtaskResult`]s, the arbitration engine and composer
//! consume and resolve [`Conflict`]s into an [`ArbitrationResult`], and the
//! orchestrator writes the final [`CompositionResult`] into the memory graph
//! as a [`MemoryNode`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The fixed role vocabulary an [`AgentDescriptor`] may draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Synthesizer,
    Analyst,
    Explainer,
    Editor,
    Challenger,
    Optimizer,
    CodeSpecialist,
    Coordinator,
    Generalist,
}

impl Role {
    /// Parse a role from its configuration-file spelling (`Code_Specialist`
    /// rather than the Rust-idiomatic `CodeSpecialist`).
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "Synthesizer" => Some(Role::Synthesizer),
            "Analyst" => Some(Role::Analyst),
            "Explainer" => Some(Role::Explainer),
            "Editor" => Some(Role::Editor),
            "Challenger" => Some(Role::Challenger),
            "Optimizer" => Some(Role::Optimizer),
            "Code_Specialist" => Some(Role::CodeSpecialist),
            "Coordinator" => Some(Role::Coordinator),
            "Generalist" => Some(Role::Generalist),
            _ => None,
        }
    }
}

/// Identity and capability record for one collaborating agent.
///
/// Immutable once registered; the [`crate::collabmesh::roles_registry::RolesRegistry`]
/// replaces the whole snapshot on `reload`, it never mutates a descriptor in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub agent_name: String,
    pub roles: Vec<Role>,
    pub domains: Vec<String>,
    pub priority_weight: f64,
    pub cost_per_1k_tokens: Option<f64>,
}

impl AgentDescriptor {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn has_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d == domain)
    }
}

/// Coarse, deterministic estimate of how much work a subtask requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// The shape-template used to fragment a master prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinationStrategy {
    Simple,
    Structured,
    Comprehensive,
}

/// Lifecycle state of one [`Subtask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One node of a [`TaskFragment`]'s dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub task_id: String,
    pub parent_task_id: String,
    pub description: String,
    pub task_type: String,
    pub domain: String,
    pub priority: f64,
    pub estimated_complexity: Complexity,
    pub required_roles: Vec<Role>,
    pub dependencies: Vec<String>,
    pub assigned_agent: Option<String>,
    pub state: SubtaskState,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl Subtask {
    pub fn is_ready(&self, completed: &std::collections::HashSet<String>) -> bool {
        self.state == SubtaskState::Pending
            && self.dependencies.iter().all(|d| completed.contains(d))
    }
}

/// A master task: one user prompt plus its entire fragmentation tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFragment {
    pub master_task_id: String,
    pub original_prompt: String,
    pub task_type: String,
    pub domain: String,
    pub subtasks: Vec<Subtask>,
    pub coordination_strategy: CoordinationStrategy,
    pub created_at: DateTime<Utc>,
    pub state: FragmentState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentState {
    Fragmented,
    InProgress,
    Completed,
    Failed,
}

/// Token accounting for one agent invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

/// The output of one agent working on one subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub subtask_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub content: String,
    pub confidence_score: f64,
    pub completion_time: f64,
    pub token_usage: TokenUsage,
    pub error_count: u32,
    pub metadata: HashMap<String, String>,
}

impl SubtaskResult {
    pub fn conflict_resolved(&self) -> bool {
        self.metadata
            .get("conflict_resolved")
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn mark_resolved(&mut self, reason: &str) {
        self.metadata
            .insert("conflict_resolved".to_string(), "true".to_string());
        self.metadata
            .insert("resolution_reason".to_string(), reason.to_string());
    }

    pub fn quality_score(&self, priority_weight: f64) -> f64 {
        0.7 * self.confidence_score + 0.3 * priority_weight
    }
}

/// Classification of a detected disagreement between contributing outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictType {
    Factual,
    Logical,
    Contradictory,
    Quality,
    Timeout,
    Error,
    MinorDispute,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::Factual => "factual",
            ConflictType::Logical => "logical",
            ConflictType::Contradictory => "contradictory",
            ConflictType::Quality => "quality",
            ConflictType::Timeout => "timeout",
            ConflictType::Error => "error",
            ConflictType::MinorDispute => "minor_dispute",
        }
    }
}

/// A detected disagreement between two or more contributing outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: String,
    pub subtask_ids: Vec<String>,
    pub agent_ids: Vec<String>,
    pub conflict_type: ConflictType,
    pub severity: f64,
    pub description: String,
    pub resolution_strategy: String,
    pub created_at: DateTime<Utc>,
}

/// One contributing agent's output, as consumed by the arbitration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent_id: String,
    pub output: String,
    pub confidence: f64,
    pub error_count: u32,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// The decision produced by an arbitration strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationResult {
    pub winner_agent_id: String,
    pub winning_output: String,
    pub confidence: f64,
    pub strategy_used: String,
    pub fallback_triggered: bool,
    pub fallback_reason: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Strategy used to assemble surviving subtask results into one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositionStrategy {
    Hierarchical,
    Sequential,
    Synthetic,
}

/// The final, attributed output for one master task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionResult {
    pub master_task_id: String,
    pub composed_content: String,
    pub confidence_score: f64,
    pub attribution_map: HashMap<String, Vec<String>>,
    pub conflict_resolution_log: Vec<Conflict>,
    pub composition_strategy: CompositionStrategy,
    pub created_at: DateTime<Utc>,
}

/// A validation or advisory warning surfaced by the fragmenter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub task_id: Option<String>,
    pub kind: String,
    pub severity: WarningSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningSeverity {
    Medium,
    High,
}
