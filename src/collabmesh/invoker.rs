//! The `AgentInvoker` capability: the only seam between this crate and
//! concrete AI provider clients.
//!
//! Provider selection, retries against a specific vendor API, and streaming
//! are all out of scope (§1) — the dispatcher only ever calls through this
//! trait, mirroring how [`crate::collabmesh`]'s `ClientWrapper` analogue
//! abstracts over vendor clients elsewhere in this codebase.

use async_trait::async_trait;
use std::error::Error;
use std::fmt;

use crate::collabmesh::model::TokenUsage;

/// The response an [`AgentInvoker`] yields for one prompt.
#[derive(Debug, Clone)]
pub struct InvocationResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub latency_seconds: f64,
    pub model: String,
}

/// Failure returned by an [`AgentInvoker::invoke`] call.
#[derive(Debug, Clone)]
pub struct InvocationError {
    pub message: String,
    pub transient: bool,
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent invocation failed: {}", self.message)
    }
}

impl Error for InvocationError {}

impl InvocationError {
    pub fn transient(message: impl Into<String>) -> Self {
        InvocationError {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        InvocationError {
            message: message.into(),
            transient: false,
        }
    }
}

/// Opaque external capability: given an agent id and a prompt, eventually
/// returns content plus usage and latency, or fails. The dispatcher does not
/// care which provider this resolves to.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        agent_id: &str,
        prompt: &str,
        max_tokens: Option<u32>,
        system_message: Option<&str>,
    ) -> Result<InvocationResponse, InvocationError>;

    /// Best-effort cooperative cancellation of any in-flight call for
    /// `agent_id`. Invokers that cannot honor cancellation may no-op; the
    /// dispatcher treats the subtask as abandoned regardless.
    async fn cancel(&self, _agent_id: &str) {}
}
