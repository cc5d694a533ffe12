//! Arbitration-engine and composer conflict-resolution scenarios.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use collabmesh::collabmesh::arbitration::loader::ArbitrationLoader;
use collabmesh::collabmesh::arbitration::strategies::ArbitrationStrategy;
use collabmesh::collabmesh::arbitration::ArbitrationEngine;
use collabmesh::collabmesh::config::RolesConfig;
use collabmesh::collabmesh::model::{AgentOutput, CompositionStrategy, SubtaskResult, TokenUsage};
use collabmesh::collabmesh::roles_registry::RolesRegistry;
use collabmesh::CollaborativeComposer;

fn output(agent: &str, out: &str, confidence: f64) -> AgentOutput {
    AgentOutput {
        agent_id: agent.to_string(),
        output: out.to_string(),
        confidence,
        error_count: 0,
        execution_time_ms: 100,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn conflicting_opinions_majority_vote_wins() {
    let loader = Arc::new(ArbitrationLoader::with_builtins());
    let engine = ArbitrationEngine::new(loader, "majority_vote", "confidence_weight", 30_000);
    let outputs = vec![
        output("agent_a", "The code is secure", 0.8),
        output("agent_b", "The code is secure", 0.75),
        output("agent_c", "The code has vulnerabilities", 0.95),
    ];
    let (_conflict, result) = engine.arbitrate_conflict(&outputs, "s1", Some("majority_vote"), None).await.unwrap();
    assert_eq!(result.winning_output, "The code is secure");
}

#[tokio::test]
async fn conflicting_opinions_confidence_weight_wins() {
    let loader = Arc::new(ArbitrationLoader::with_builtins());
    let engine = ArbitrationEngine::new(loader, "confidence_weight", "confidence_weight", 30_000);
    let outputs = vec![
        output("agent_a", "The code is secure", 0.8),
        output("agent_b", "The code is secure", 0.75),
        output("agent_c", "The code has vulnerabilities", 0.95),
    ];
    let (_conflict, result) = engine.arbitrate_conflict(&outputs, "s1", Some("confidence_weight"), None).await.unwrap();
    assert_eq!(result.winning_output, "The code has vulnerabilities");
}

struct AlwaysFails;

impl ArbitrationStrategy for AlwaysFails {
    fn strategy_name(&self) -> &'static str {
        "always_fails"
    }

    fn arbitrate(&self, _outputs: &[AgentOutput], _config: Option<&serde_json::Value>) -> Result<collabmesh::collabmesh::model::ArbitrationResult, String> {
        Err("deliberately broken strategy".to_string())
    }
}

#[tokio::test]
async fn strategy_failure_triggers_fallback() {
    let loader = Arc::new(ArbitrationLoader::with_builtins());
    loader.register("always_fails", Arc::new(AlwaysFails)).await;
    let engine = ArbitrationEngine::new(loader, "always_fails", "confidence_weight", 30_000);
    let outputs = vec![
        output("agent_a", "a", 0.6),
        output("agent_b", "b", 0.9),
        output("agent_c", "c", 0.7),
    ];
    let (_conflict, result) = engine.arbitrate_conflict(&outputs, "s1", None, None).await.unwrap();
    assert!(result.fallback_triggered);
    assert_eq!(result.strategy_used, "fallback_confidence");
    assert_eq!(result.winner_agent_id, "agent_b");
}

fn subtask_result(id: &str, agent: &str, content: &str, confidence: f64) -> SubtaskResult {
    SubtaskResult {
        subtask_id: id.to_string(),
        agent_id: agent.to_string(),
        agent_name: agent.to_string(),
        content: content.to_string(),
        confidence_score: confidence,
        completion_time: 1.0,
        token_usage: TokenUsage::default(),
        error_count: 0,
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn factual_conflict_resolved_by_higher_confidence() {
    let config = RolesConfig::from_toml_str("").unwrap();
    let registry = Arc::new(RolesRegistry::from_config("roles.toml".into(), config));
    let composer = CollaborativeComposer::new(registry);
    // Disjoint, mostly non-overlapping characters keep similarity well below
    // the 0.3 gate while still carrying a contradicting numeric fact.
    let results = vec![
        subtask_result("a", "agent_a", "42", 0.95),
        subtask_result("b", "agent_b", "17", 0.8),
    ];
    let composition = composer.compose_results("m4", results, CompositionStrategy::Hierarchical).await;
    assert_eq!(composition.conflict_resolution_log.len(), 1);
    assert_eq!(
        composition.conflict_resolution_log[0].conflict_type,
        collabmesh::collabmesh::model::ConflictType::Factual
    );
    let winner = composition
        .conflict_resolution_log
        .iter()
        .find(|c| c.conflict_type == collabmesh::collabmesh::model::ConflictType::Factual)
        .unwrap();
    assert_eq!(winner.subtask_ids, vec!["a".to_string(), "b".to_string()]);
}
