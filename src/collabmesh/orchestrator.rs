//! End-to-end pipeline coordinator (C9): fragment -> assign -> dispatch ->
//! compose -> persist, emitting an audit record at every stage boundary.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::collabmesh::assigner::AgentAssigner;
use crate::collabmesh::composer::CollaborativeComposer;
use crate::collabmesh::dispatcher::{CancellationToken, SubtaskDispatcher};
use crate::collabmesh::event::{AuditEvent, AuditHandler};
use crate::collabmesh::fragmenter::{FragmenterError, TaskFragmenter};
use crate::collabmesh::memory_graph::MemoryGraph;
use crate::collabmesh::model::{CompositionResult, CompositionStrategy, CoordinationStrategy};

/// Failure modes surfaced by [`PipelineOrchestrator::run`].
#[derive(Debug)]
pub enum OrchestratorError {
    Fragmentation(FragmenterError),
    Storage(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::Fragmentation(e) => write!(f, "fragmentation failed: {}", e),
            OrchestratorError::Storage(msg) => write!(f, "storage failure: {}", msg),
        }
    }
}

impl Error for OrchestratorError {}

impl From<FragmenterError> for OrchestratorError {
    fn from(e: FragmenterError) -> Self {
        OrchestratorError::Fragmentation(e)
    }
}

/// The result of one end-to-end `run` call.
#[derive(Debug, Clone)]
pub struct PipelineEnvelope {
    pub master_task_id: String,
    pub composition: CompositionResult,
    pub failed_subtask_ids: Vec<String>,
    pub warnings: Vec<String>,
}

/// Hierarchical composition is the default for every coordination strategy;
/// callers that want sequential or synthetic composition pass it explicitly
/// to `PipelineOrchestrator::run`.
fn default_composition_strategy(_coordination: CoordinationStrategy) -> CompositionStrategy {
    CompositionStrategy::Hierarchical
}

/// Wires the fragmenter, assigner, dispatcher, and composer into one call.
pub struct PipelineOrchestrator {
    fragmenter: Arc<TaskFragmenter>,
    assigner: Arc<AgentAssigner>,
    dispatcher: Arc<SubtaskDispatcher>,
    composer: Arc<CollaborativeComposer>,
    memory: Arc<MemoryGraph>,
    audit: Arc<dyn AuditHandler>,
}

impl PipelineOrchestrator {
    pub fn new(
        fragmenter: Arc<TaskFragmenter>,
        assigner: Arc<AgentAssigner>,
        dispatcher: Arc<SubtaskDispatcher>,
        composer: Arc<CollaborativeComposer>,
        memory: Arc<MemoryGraph>,
        audit: Arc<dyn AuditHandler>,
    ) -> Self {
        PipelineOrchestrator {
            fragmenter,
            assigner,
            dispatcher,
            composer,
            memory,
            audit,
        }
    }

    /// Run one master prompt through the full pipeline, returning the
    /// composed, attributed result. `strategy` selects the composition shape;
    /// pass `None` to derive it from the fragment's coordination strategy.
    pub async fn run(
        &self,
        master_task_id: &str,
        prompt: &str,
        task_type: &str,
        domain: &str,
        strategy: Option<CompositionStrategy>,
    ) -> Result<PipelineEnvelope, OrchestratorError> {
        let mut fragment = self
            .fragmenter
            .fragment(master_task_id, prompt, task_type, domain)
            .await?;
        self.audit
            .on_event(&AuditEvent::Fragmented {
                master_task_id: master_task_id.to_string(),
                subtask_count: fragment.subtasks.len(),
            })
            .await;

        let unassigned = self.assigner.assign_all(&mut fragment.subtasks).await;
        for subtask in &fragment.subtasks {
            self.audit
                .on_event(&AuditEvent::Assigned {
                    task_id: subtask.task_id.clone(),
                    agent_id: subtask.assigned_agent.clone(),
                })
                .await;
        }
        let mut warnings: Vec<String> = unassigned
            .iter()
            .map(|id| format!("{}: no agent scored positively, will fail as unassigned", id))
            .collect();

        let cancel = CancellationToken::new();
        let results = self.dispatcher.dispatch(&mut fragment.subtasks, &cancel).await;

        let failed_subtask_ids: Vec<String> = fragment
            .subtasks
            .iter()
            .filter(|s| s.state == crate::collabmesh::model::SubtaskState::Failed)
            .map(|s| s.task_id.clone())
            .collect();

        let composition_strategy =
            strategy.unwrap_or_else(|| default_composition_strategy(fragment.coordination_strategy));
        let composition = self
            .composer
            .compose_results(master_task_id, results, composition_strategy)
            .await;

        if composition.conflict_resolution_log.is_empty() && composition.attribution_map.is_empty() {
            warnings.push("no surviving subtask results to compose".to_string());
        }

        let node_id = self
            .memory
            .add_node(
                "orchestrator",
                "final_composition",
                serde_json::to_value(&composition).unwrap_or(serde_json::Value::Null),
                None,
                None,
            )
            .map_err(|e| OrchestratorError::Storage(e.to_string()))?;
        self.audit
            .on_event(&AuditEvent::CompositionRecorded {
                master_task_id: master_task_id.to_string(),
                node_id,
            })
            .await;

        Ok(PipelineEnvelope {
            master_task_id: master_task_id.to_string(),
            composition,
            failed_subtask_ids,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collabmesh::config::RolesConfig;
    use crate::collabmesh::dispatcher::DispatchConfig;
    use crate::collabmesh::event::NoopAuditHandler;
    use crate::collabmesh::invoker::{AgentInvoker, InvocationError, InvocationResponse};
    use crate::collabmesh::model::TokenUsage;
    use crate::collabmesh::roles_registry::RolesRegistry;
    use async_trait::async_trait;

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
                content: format!("{} says: handled '{}'", agent_id, prompt),
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
        let roles_doc = r#"
            [[agents]]
            agent_id = "agent_generalist"
            agent_name = "Generalist"
            roles = ["Generalist", "Synthesizer", "Analyst", "Explainer", "Editor", "Challenger", "Optimizer", "Code_Specialist", "Coordinator"]
            domains = ["education", "technical", "code_review", "analysis", "general"]
            priority_weight = 0.7
        "#;
        let config = RolesConfig::from_toml_str(roles_doc).unwrap();
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
        PipelineOrchestrator::new(
            fragmenter,
            assigner,
            dispatcher,
            composer,
            memory,
            Arc::new(NoopAuditHandler),
        )
    }

    #[tokio::test]
    async fn simple_explanation_produces_one_subtask_composition() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = build_orchestrator(&dir).await;
        let envelope = orchestrator
            .run(
                "m1",
                "Explain how to use Python decorators",
                "explanation",
                "education",
                None,
            )
            .await
            .unwrap();
        assert!(envelope.failed_subtask_ids.is_empty());
        assert_eq!(envelope.composition.attribution_map.len(), 1);
        assert!(envelope.composition.confidence_score > 0.0);
    }

    #[tokio::test]
    async fn comprehensive_prompt_dispatches_five_subtasks() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = build_orchestrator(&dir).await;
        let prompt = format!(
            "Perform a comprehensive code review {}",
            "with thorough multiple various detailed ".repeat(10)
        );
        let envelope = orchestrator
            .run("m2", &prompt, "code_review", "technical", None)
            .await
            .unwrap();
        assert!(envelope.failed_subtask_ids.is_empty());
        assert_eq!(envelope.composition.attribution_map.len(), 5);
    }
}
