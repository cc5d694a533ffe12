//! End-to-end scenarios for the full collaboration pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use collabmesh::collabmesh::assigner::AgentAssigner;
use collabmesh::collabmesh::config::RolesConfig;
use collabmesh::collabmesh::dispatcher::{DispatchConfig, SubtaskDispatcher};
use collabmesh::collabmesh::event::NoopAuditHandler;
use collabmesh::collabmesh::fragmenter::TaskFragmenter;
use collabmesh::collabmesh::invoker::{AgentInvoker, InvocationError, InvocationResponse};
use collabmesh::collabmesh::model::TokenUsage;
use collabmesh::collabmesh::roles_registry::RolesRegistry;
use collabmesh::{CollaborativeComposer, MemoryGraph, PipelineOrchestrator};

const ROLES_DOC: &str = r#"
    [[agents]]
    agent_id = "agent_generalist"
    agent_name = "Generalist"
    roles = ["Generalist", "Synthesizer", "Analyst", "Explainer", "Editor", "Challenger", "Optimizer", "Code_Specialist", "Coordinator"]
    domains = ["education", "technical", "code_review", "analysis", "general"]
    priority_weight = 0.7

    [task_domains.technical]
    preferred_roles = ["Synthesizer", "Analyst"]
"#;

struct EchoInvoker;

#[async_trait]
impl AgentInvoker for EchoInvoker {
    async fn invoke(
        &self,
        agent_id: &str,
        prompt: &str,
        _max_tokens: Option<u32>,
        _system_message: Option<&str>,
    ) -> Result<InvocationResponse, InvocationError> {
        Ok(InvocationResponse {
            content: format!("{} handled: {}", agent_id, prompt),
            usage: TokenUsage {
                prompt: 10,
                completion: 10,
                total: 20,
            },
            latency_seconds: 0.05,
            model: "test-model".to_string(),
        })
    }
}

async fn build_orchestrator(dir: &tempfile::TempDir) -> PipelineOrchestrator {
    let config = RolesConfig::from_toml_str(ROLES_DOC).unwrap();
    let registry = Arc::new(RolesRegistry::from_config(dir.path().join("roles.toml"), config));
    let fragmenter = Arc::new(TaskFragmenter::new(Arc::clone(&registry)));
    let assigner = Arc::new(AgentAssigner::new(Arc::clone(&registry)));
    let memory = Arc::new(MemoryGraph::open(dir.path()).unwrap());
    let dispatcher = Arc::new(SubtaskDispatcher::new(
        Arc::new(EchoInvoker),
        Arc::clone(&memory),
        Arc::new(NoopAuditHandler),
        DispatchConfig::default(),
    ));
    let composer = Arc::new(CollaborativeComposer::new(registry));
    PipelineOrchestrator::new(fragmenter, assigner, dispatcher, composer, memory, Arc::new(NoopAuditHandler))
}

#[tokio::test]
async fn simple_explanation() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = build_orchestrator(&dir).await;
    let envelope = orchestrator
        .run("m1", "Explain how to use Python decorators", "explanation", "education", None)
        .await
        .unwrap();
    assert!(envelope.composition.confidence_score > 0.5);
    assert_eq!(envelope.composition.attribution_map.len(), 1);
}

#[tokio::test]
async fn comprehensive_code_review() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = build_orchestrator(&dir).await;
    let prompt = format!(
        "Perform a comprehensive code review of this pull request {}",
        "with thorough multiple various detailed considerations ".repeat(10)
    );
    let envelope = orchestrator
        .run("m2", &prompt, "code_review", "technical", None)
        .await
        .unwrap();
    assert_eq!(envelope.composition.attribution_map.len(), 5);
    assert!(envelope.failed_subtask_ids.is_empty());
    assert_eq!(
        envelope.composition.composition_strategy,
        collabmesh::collabmesh::model::CompositionStrategy::Hierarchical
    );
}

#[tokio::test]
async fn memory_temporal_recall_across_pipeline_runs() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = build_orchestrator(&dir).await;
    orchestrator
        .run("m3", "Explain how lists work in Python", "explanation", "education", None)
        .await
        .unwrap();
    let memory = MemoryGraph::open(dir.path()).unwrap();
    let nodes = memory.get_nodes_by_context("final_composition");
    assert_eq!(nodes.len(), 1);
}
