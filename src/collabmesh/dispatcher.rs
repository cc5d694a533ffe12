//! Drives subtasks through their state machine, invoking `AgentInvoker`s
//! concurrently up to a configured ceiling (C5).

use chrono::Utc;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use crate::collabmesh::event::{AuditEvent, AuditHandler};
use crate::collabmesh::invoker::{AgentInvoker, InvocationResponse};
use crate::collabmesh::memory_graph::MemoryGraph;
use crate::collabmesh::model::{Subtask, SubtaskResult, SubtaskState, TokenUsage};

/// A cooperative cancellation signal shared across all in-flight subtasks of
/// one dispatch call. Cloning shares the same underlying flag.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tunables for one dispatcher instance.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            concurrency: 8,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Drives one [`crate::collabmesh::model::TaskFragment`]'s subtasks through
/// `pending -> in_progress -> {completed, failed}`, issuing invocations
/// concurrently across independent subtasks (a ready-queue wave per DAG
/// layer) bounded by a `tokio::sync::Semaphore`.
pub struct SubtaskDispatcher {
    invoker: Arc<dyn AgentInvoker>,
    memory: Arc<MemoryGraph>,
    audit: Arc<dyn AuditHandler>,
    config: DispatchConfig,
}

impl SubtaskDispatcher {
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        memory: Arc<MemoryGraph>,
        audit: Arc<dyn AuditHandler>,
        config: DispatchConfig,
    ) -> Self {
        SubtaskDispatcher {
            invoker,
            memory,
            audit,
            config,
        }
    }

    /// Dispatch all subtasks to terminal state, returning the results for
    /// every subtask that reached `completed`. Subtasks that fail (including
    /// unassigned, upstream-failed, or cancelled ones) are absent from the
    /// returned results but are still recorded in the memory graph.
    pub async fn dispatch(
        &self,
        subtasks: &mut [Subtask],
        cancel: &CancellationToken,
    ) -> Vec<SubtaskResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut results: Vec<SubtaskResult> = Vec::new();

        loop {
            // Cascade failures from failed dependencies before computing readiness.
            let failed_ids: HashSet<String> = subtasks
                .iter()
                .filter(|s| s.state == SubtaskState::Failed)
                .map(|s| s.task_id.clone())
                .collect();
            for subtask in subtasks.iter_mut() {
                if subtask.state == SubtaskState::Pending
                    && subtask.dependencies.iter().any(|d| failed_ids.contains(d))
                {
                    self.transition_failed(subtask, "upstream_failed").await;
                }
            }

            if cancel.is_cancelled() {
                for subtask in subtasks.iter_mut() {
                    if subtask.state == SubtaskState::Pending {
                        self.transition_failed(subtask, "cancelled").await;
                    }
                }
            }

            let completed_ids: HashSet<String> = subtasks
                .iter()
                .filter(|s| s.state == SubtaskState::Completed)
                .map(|s| s.task_id.clone())
                .collect();

            let ready_indices: Vec<usize> = subtasks
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_ready(&completed_ids) && s.assigned_agent.is_some())
                .map(|(i, _)| i)
                .collect();

            let unassigned_indices: Vec<usize> = subtasks
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    s.state == SubtaskState::Pending
                        && s.assigned_agent.is_none()
                        && s.dependencies.iter().all(|d| completed_ids.contains(d))
                })
                .map(|(i, _)| i)
                .collect();
            for idx in unassigned_indices {
                self.transition_failed(&mut subtasks[idx], "unassigned").await;
            }

            if ready_indices.is_empty() {
                let still_pending = subtasks.iter().any(|s| s.state == SubtaskState::Pending);
                if !still_pending {
                    break;
                }
                // Nothing ready and nothing will ever become ready (no cycle
                // reaches here thanks to C3's validation) — fail remainder.
                for subtask in subtasks.iter_mut() {
                    if subtask.state == SubtaskState::Pending {
                        self.transition_failed(subtask, "unassigned").await;
                    }
                }
                continue;
            }

            let mut handles = Vec::new();
            for idx in ready_indices {
                subtasks[idx].state = SubtaskState::InProgress;
                self.audit
                    .on_event(&AuditEvent::SubtaskTransitioned {
                        task_id: subtasks[idx].task_id.clone(),
                        from: SubtaskState::Pending,
                        to: SubtaskState::InProgress,
                        reason: None,
                    })
                    .await;

                let subtask = subtasks[idx].clone();
                let invoker = Arc::clone(&self.invoker);
                let semaphore = Arc::clone(&semaphore);
                let config = self.config.clone();
                let cancel = cancel.clone();

                handles.push((idx, tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    invoke_with_retry(invoker.as_ref(), &subtask, &config, &cancel).await
                })));
            }

            for (idx, handle) in handles {
                let outcome = handle.await.expect("dispatch task panicked");
                match outcome {
                    Ok(result) => {
                        subtasks[idx].state = SubtaskState::Completed;
                        self.audit
                            .on_event(&AuditEvent::SubtaskTransitioned {
                                task_id: subtasks[idx].task_id.clone(),
                                from: SubtaskState::InProgress,
                                to: SubtaskState::Completed,
                                reason: None,
                            })
                            .await;
                        if let Err(e) = self.memory.add_node(
                            &result.agent_id,
                            &subtasks[idx].task_type,
                            serde_json::json!({
                                "task_id": result.subtask_id,
                                "content": result.content,
                                "confidence_score": result.confidence_score,
                            }),
                            None,
                            None,
                        ) {
                            log::error!("dispatcher: failed to persist memory node: {}", e);
                        }
                        results.push(result);
                    }
                    Err(reason) => {
                        self.transition_failed(&mut subtasks[idx], &reason).await;
                    }
                }
            }
        }

        results
    }

    async fn transition_failed(&self, subtask: &mut Subtask, reason: &str) {
        if subtask.state == SubtaskState::Failed {
            return;
        }
        let from = subtask.state;
        subtask.state = SubtaskState::Failed;
        subtask.metadata.insert("reason".to_string(), reason.to_string());

        self.audit
            .on_event(&AuditEvent::SubtaskTransitioned {
                task_id: subtask.task_id.clone(),
                from,
                to: SubtaskState::Failed,
                reason: Some(reason.to_string()),
            })
            .await;

        let mut metadata = HashMap::new();
        metadata.insert("reason".to_string(), reason.to_string());
        if let Err(e) = self.memory.add_node(
            subtask.assigned_agent.as_deref().unwrap_or("unassigned"),
            &subtask.task_type,
            serde_json::json!({"task_id": subtask.task_id, "state": "failed", "reason": reason}),
            Some(metadata),
            None,
        ) {
            log::error!("dispatcher: failed to persist failure node: {}", e);
        }
    }
}

type InvokeOutcome = Result<SubtaskResult, String>;

async fn invoke_with_retry(
    invoker: &dyn AgentInvoker,
    subtask: &Subtask,
    config: &DispatchConfig,
    cancel: &CancellationToken,
) -> InvokeOutcome {
    let agent_id = subtask.assigned_agent.as_ref().expect("ready subtask has an agent");
    let mut attempt = 0u32;
    let mut last_error = String::new();

    loop {
        if cancel.is_cancelled() {
            invoker.cancel(agent_id).await;
            return Err("cancelled".to_string());
        }

        let invocation = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                invoker.cancel(agent_id).await;
                return Err("cancelled".to_string());
            }
            result = tokio::time::timeout(config.timeout, invoker.invoke(agent_id, &subtask.description, None, None)) => result,
        };

        match invocation {
            Ok(Ok(response)) => {
                return Ok(build_success(subtask, agent_id, response));
            }
            Ok(Err(e)) if e.transient && attempt < config.max_retries => {
                last_error = e.message;
                attempt += 1;
                sleep_backoff(config, attempt).await;
            }
            Ok(Err(e)) => {
                return Err(e.message);
            }
            Err(_timeout) if attempt < config.max_retries => {
                last_error = "timed out".to_string();
                attempt += 1;
                sleep_backoff(config, attempt).await;
            }
            Err(_timeout) => {
                return Err(format!("timed out after {} attempts", attempt + 1));
            }
        }
    }
    #[allow(unreachable_code)]
    Err(last_error)
}

async fn sleep_backoff(config: &DispatchConfig, attempt: u32) {
    let base_ms = config.backoff_base.as_millis() as f64;
    let mut delay_ms = base_ms * config.backoff_multiplier.powi(attempt as i32 - 1);
    if config.jitter {
        let jitter_factor: f64 = rand::thread_rng().gen_range(0.8..1.2);
        delay_ms *= jitter_factor;
    }
    tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
}

fn build_success(subtask: &Subtask, agent_id: &str, response: InvocationResponse) -> SubtaskResult {
    SubtaskResult {
        subtask_id: subtask.task_id.clone(),
        agent_id: agent_id.to_string(),
        agent_name: agent_id.to_string(),
        content: response.content,
        confidence_score: 1.0,
        completion_time: response.latency_seconds,
        token_usage: TokenUsage {
            prompt: response.usage.prompt,
            completion: response.usage.completion,
            total: response.usage.total,
        },
        error_count: 0,
        metadata: HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collabmesh::event::NoopAuditHandler;
    use crate::collabmesh::invoker::InvocationError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct FlakyInvoker {
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl AgentInvoker for FlakyInvoker {
        async fn invoke(
            &self,
            _agent_id: &str,
            _prompt: &str,
            _max_tokens: Option<u32>,
            _system_message: Option<&str>,
        ) -> Result<InvocationResponse, InvocationError> {
            let remaining = self.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(InvocationError::transient("temporary glitch"));
            }
            Ok(InvocationResponse {
                content: "done".to_string(),
                usage: TokenUsage {
                    prompt: 1,
                    completion: 1,
                    total: 2,
                },
                latency_seconds: 0.01,
                model: "test-model".to_string(),
            })
        }
    }

    fn basic_subtask(id: &str, deps: Vec<&str>) -> Subtask {
        Subtask {
            task_id: id.to_string(),
            parent_task_id: "m".to_string(),
            description: "do the thing".to_string(),
            task_type: "generic".to_string(),
            domain: "technical".to_string(),
            priority: 0.5,
            estimated_complexity: crate::collabmesh::model::Complexity::Medium,
            required_roles: vec![],
            dependencies: deps.into_iter().map(|s| s.to_string()).collect(),
            assigned_agent: Some("agent_a".to_string()),
            state: SubtaskState::Pending,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn completes_independent_subtasks() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryGraph::open(dir.path()).unwrap());
        let invoker: Arc<dyn AgentInvoker> = Arc::new(FlakyInvoker {
            fail_times: AtomicU32::new(0),
        });
        let dispatcher = SubtaskDispatcher::new(
            invoker,
            memory,
            Arc::new(NoopAuditHandler),
            DispatchConfig {
                max_retries: 1,
                backoff_base: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let mut subtasks = vec![basic_subtask("a", vec![]), basic_subtask("b", vec!["a"])];
        let results = dispatcher
            .dispatch(&mut subtasks, &CancellationToken::new())
            .await;
        assert_eq!(results.len(), 2);
        assert!(subtasks.iter().all(|s| s.state == SubtaskState::Completed));
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryGraph::open(dir.path()).unwrap());
        let invoker: Arc<dyn AgentInvoker> = Arc::new(FlakyInvoker {
            fail_times: AtomicU32::new(2),
        });
        let dispatcher = SubtaskDispatcher::new(
            invoker,
            memory,
            Arc::new(NoopAuditHandler),
            DispatchConfig {
                max_retries: 3,
                backoff_base: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let mut subtasks = vec![basic_subtask("a", vec![])];
        let results = dispatcher
            .dispatch(&mut subtasks, &CancellationToken::new())
            .await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn unassigned_subtask_fails_without_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryGraph::open(dir.path()).unwrap());
        let invoker: Arc<dyn AgentInvoker> = Arc::new(FlakyInvoker {
            fail_times: AtomicU32::new(0),
        });
        let dispatcher = SubtaskDispatcher::new(
            invoker,
            memory,
            Arc::new(NoopAuditHandler),
            DispatchConfig::default(),
        );
        let mut subtask = basic_subtask("a", vec![]);
        subtask.assigned_agent = None;
        let mut subtasks = vec![subtask];
        let results = dispatcher
            .dispatch(&mut subtasks, &CancellationToken::new())
            .await;
        assert!(results.is_empty());
        assert_eq!(subtasks[0].state, SubtaskState::Failed);
        assert_eq!(subtasks[0].metadata.get("reason").unwrap(), "unassigned");
    }

    #[tokio::test]
    async fn dependent_of_failed_subtask_cascades() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryGraph::open(dir.path()).unwrap());
        let invoker: Arc<dyn AgentInvoker> = Arc::new(FlakyInvoker {
            fail_times: AtomicU32::new(0),
        });
        let dispatcher = SubtaskDispatcher::new(
            invoker,
            memory,
            Arc::new(NoopAuditHandler),
            DispatchConfig::default(),
        );
        let mut upstream = basic_subtask("a", vec![]);
        upstream.assigned_agent = None;
        let downstream = basic_subtask("b", vec!["a"]);
        let mut subtasks = vec![upstream, downstream];
        dispatcher
            .dispatch(&mut subtasks, &CancellationToken::new())
            .await;
        assert_eq!(subtasks[1].state, SubtaskState::Failed);
        assert_eq!(subtasks[1].metadata.get("reason").unwrap(), "upstream_failed");
    }

    #[tokio::test]
    async fn cancellation_leaves_nothing_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryGraph::open(dir.path()).unwrap());
        let invoker: Arc<dyn AgentInvoker> = Arc::new(FlakyInvoker {
            fail_times: AtomicU32::new(0),
        });
        let dispatcher = SubtaskDispatcher::new(
            invoker,
            memory,
            Arc::new(NoopAuditHandler),
            DispatchConfig::default(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut subtasks = vec![basic_subtask("a", vec![])];
        dispatcher.dispatch(&mut subtasks, &cancel).await;
        assert!(subtasks.iter().all(|s| s.state != SubtaskState::InProgress));
    }
}
