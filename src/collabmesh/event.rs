//! Audit events emitted by the pipeline.
//!
//! Events are opaque structured records to the core: collectors (dashboards,
//! telemetry exporters) are external. A single [`AuditHandler`] trait with
//! default no-op methods lets callers subscribe to only the events they
//! care about, mirroring the `EventHandler` callback shape used elsewhere in
//! this codebase for agent/orchestration observability.

use async_trait::async_trait;

use crate::collabmesh::model::{ArbitrationResult, Conflict, SubtaskState};

/// One structured audit record. Every state transition and conflict
/// resolution in the pipeline emits one of these.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    /// C3 fragmented a master prompt.
    Fragmented {
        master_task_id: String,
        subtask_count: usize,
    },
    /// C4 bound (or failed to bind) an agent to a subtask.
    Assigned {
        task_id: String,
        agent_id: Option<String>,
    },
    /// C5 transitioned a subtask's state.
    SubtaskTransitioned {
        task_id: String,
        from: SubtaskState,
        to: SubtaskState,
        reason: Option<String>,
    },
    /// C6 resolved a conflict.
    ConflictResolved {
        conflict: Conflict,
        result: ArbitrationResult,
    },
    /// C9 recorded the final composition.
    CompositionRecorded {
        master_task_id: String,
        node_id: String,
    },
    /// A recoverable failure was handled locally (retry, fallback, etc.).
    RecoveredFailure {
        component: String,
        detail: String,
    },
}

/// Subscriber for [`AuditEvent`]s. All methods default to no-ops; implement
/// only what you need.
#[async_trait]
pub trait AuditHandler: Send + Sync {
    async fn on_event(&self, _event: &AuditEvent) {}
}

/// An [`AuditHandler`] that drops every event; the default when no caller
/// supplies one.
pub struct NoopAuditHandler;

#[async_trait]
impl AuditHandler for NoopAuditHandler {
    async fn on_event(&self, _event: &AuditEvent) {}
}
