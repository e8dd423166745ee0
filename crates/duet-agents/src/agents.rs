//! Narrow contracts for the two agents the engine drives.
//!
//! Implementations live elsewhere: [`crate::planner::LlmPlanningAgent`] and
//! [`crate::claude_cli::ClaudeCliAgent`] in production, scripted doubles in
//! tests.

use std::fmt;

use async_trait::async_trait;
use duet_core::types::TokenUsage;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// AgentError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// The resume handle is unknown or expired.
    HandleNotFound,
    RateLimited,
    Network,
    /// A tool or credential was refused.
    PermissionDenied,
    /// The agent itself gave up on time.
    Timeout,
    /// The agent answered with something unparseable.
    InvalidResponse,
    Other,
}

impl fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentErrorKind::HandleNotFound => "handle not found",
            AgentErrorKind::RateLimited => "rate limited",
            AgentErrorKind::Network => "network error",
            AgentErrorKind::PermissionDenied => "permission denied",
            AgentErrorKind::Timeout => "agent timeout",
            AgentErrorKind::InvalidResponse => "invalid response",
            AgentErrorKind::Other => "agent error",
        };
        f.write_str(label)
    }
}

/// A failed agent call. `usage` is set when the agent reported what the
/// failed call consumed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub message: String,
    pub usage: Option<TokenUsage>,
}

impl AgentError {
    pub fn new(kind: AgentErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            usage: None,
        }
    }

    pub fn handle_not_found(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::HandleNotFound, message)
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

// ---------------------------------------------------------------------------
// Planning agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PlanningResponse {
    /// Raw text expected to hold one JSON object matching the task schema.
    pub content: String,
    pub usage: TokenUsage,
}

/// Turns a request plus session context into a structured response.
#[async_trait]
pub trait PlanningAgent: Send + Sync {
    /// Model name used for pricing.
    fn model(&self) -> &str;

    async fn generate(
        &self,
        context_summary: &str,
        request: &str,
        task_schema: &serde_json::Value,
    ) -> Result<PlanningResponse, AgentError>;
}

// ---------------------------------------------------------------------------
// Execution agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub instruction: String,
    pub allowed_tools: Vec<String>,
    /// Conversation to continue; `None` starts a fresh one.
    pub resume: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReply {
    pub output: String,
    /// Conversation id reported by the agent, if any.
    pub handle: Option<String>,
    pub usage: TokenUsage,
}

/// Performs a Task against real tools through a resumable conversation.
#[async_trait]
pub trait ExecutionAgent: Send + Sync {
    fn model(&self) -> &str;

    async fn invoke(&self, request: ExecutionRequest) -> Result<ExecutionReply, AgentError>;
}
