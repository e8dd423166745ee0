//! Task Executor: one Task, one execution-agent exchange.
//!
//! The executor owns the resume handle for the duration of a call and
//! drives it through a two-state machine:
//!
//! ```text
//!   NoHandle --success--> Bound
//!   Bound    --success--> Bound
//!   Bound    --HandleNotFound--> NoHandle, same Task retried once fresh
//!   NoHandle --HandleNotFound--> hard failure
//! ```
//!
//! It classifies failures but never decides whether to retry them; that is
//! the validation loop's call.

use std::sync::Arc;
use std::time::Duration;

use duet_core::config::ExecutorConfig;
use duet_core::types::{ExecutionHandle, FailureKind, SessionId, Task, TokenUsage};
use duet_intelligence::{BudgetDenied, UsageCharge, UsageEstimate, UsageGovernor};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agents::{AgentError, AgentErrorKind, ExecutionAgent, ExecutionRequest};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Budget(#[from] BudgetDenied),
    #[error("execution handle lost twice in a row: {0}")]
    HandleNotFound(String),
    #[error("execution timed out after {0}s")]
    Timeout(u64),
    #[error("tool permission denied: {0}")]
    PermissionDenied(String),
    #[error("execution agent rate limited: {0}")]
    RateLimited(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("execution agent error: {0}")]
    Agent(String),
}

impl ExecutorError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ExecutorError::Budget(_) => FailureKind::BudgetExceeded,
            ExecutorError::HandleNotFound(_) => FailureKind::HandleNotFound,
            ExecutorError::Timeout(_) => FailureKind::ExecutionTimeout,
            ExecutorError::PermissionDenied(_)
            | ExecutorError::RateLimited(_)
            | ExecutorError::Network(_)
            | ExecutorError::Agent(_) => FailureKind::ExecutionError,
        }
    }

    /// Failures that another attempt cannot fix.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutorError::Budget(_)
                | ExecutorError::HandleNotFound(_)
                | ExecutorError::PermissionDenied(_)
        )
    }
}

fn classify(err: AgentError) -> ExecutorError {
    match err.kind {
        AgentErrorKind::HandleNotFound => ExecutorError::HandleNotFound(err.message),
        AgentErrorKind::PermissionDenied => ExecutorError::PermissionDenied(err.message),
        AgentErrorKind::RateLimited => ExecutorError::RateLimited(err.message),
        AgentErrorKind::Network => ExecutorError::Network(err.message),
        AgentErrorKind::Timeout
        | AgentErrorKind::InvalidResponse
        | AgentErrorKind::Other => ExecutorError::Agent(err.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Handle state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleState {
    NoHandle,
    Bound(ExecutionHandle),
}

impl HandleState {
    /// Adopt `handle` only if it belongs to `session`.
    pub fn for_session(session: &SessionId, handle: Option<ExecutionHandle>) -> Self {
        match handle {
            Some(h) if &h.session_id == session => HandleState::Bound(h),
            Some(h) => {
                warn!(session_id = %session, owner = %h.session_id, "ignoring handle from another session");
                HandleState::NoHandle
            }
            None => HandleState::NoHandle,
        }
    }

    pub fn handle(&self) -> Option<&ExecutionHandle> {
        match self {
            HandleState::Bound(h) => Some(h),
            HandleState::NoHandle => None,
        }
    }

    pub fn into_handle(self) -> Option<ExecutionHandle> {
        match self {
            HandleState::Bound(h) => Some(h),
            HandleState::NoHandle => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What one `execute` call produced.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Agent output, or the classified failure.
    pub result: Result<String, ExecutorError>,
    /// Handle to resume from next time. `None` after the handle was lost.
    pub handle: Option<ExecutionHandle>,
    /// Usage committed across every agent call this execution made.
    pub charge: UsageCharge,
    /// Agent calls actually dispatched (0 when the budget refused the first).
    pub agent_calls: u32,
}

// ---------------------------------------------------------------------------
// TaskExecutor
// ---------------------------------------------------------------------------

pub struct TaskExecutor {
    agent: Arc<dyn ExecutionAgent>,
    governor: Arc<UsageGovernor>,
    estimate: TokenUsage,
    timeout: Duration,
}

impl TaskExecutor {
    pub fn new(
        agent: Arc<dyn ExecutionAgent>,
        governor: Arc<UsageGovernor>,
        timeout: Duration,
    ) -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            agent,
            governor,
            estimate: TokenUsage::new(
                defaults.estimated_input_tokens,
                defaults.estimated_output_tokens,
            ),
            timeout,
        }
    }

    pub fn with_estimate(mut self, estimate: TokenUsage) -> Self {
        self.estimate = estimate;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `task`, resuming `handle` when it belongs to `session`.
    pub async fn execute(
        &self,
        session: &SessionId,
        task: &Task,
        handle: Option<ExecutionHandle>,
    ) -> ExecutionOutcome {
        let mut state = HandleState::for_session(session, handle);
        let mut charge = UsageCharge::default();
        let mut agent_calls = 0u32;
        let estimate = UsageEstimate {
            model: self.agent.model().to_string(),
            usage: self.estimate,
        };

        loop {
            let reservation = match self.governor.reserve(session, &estimate) {
                Ok(r) => r,
                Err(denied) => {
                    return ExecutionOutcome {
                        result: Err(denied.into()),
                        handle: state.into_handle(),
                        charge,
                        agent_calls,
                    }
                }
            };

            let request = ExecutionRequest {
                instruction: task.render_prompt(),
                allowed_tools: task.tools(),
                resume: state.handle().map(|h| h.id.clone()),
            };
            agent_calls += 1;
            debug!(
                session_id = %session,
                task_id = %task.id,
                resume = request.resume.as_deref().unwrap_or("-"),
                "invoking execution agent"
            );

            let reply = match tokio::time::timeout(self.timeout, self.agent.invoke(request)).await {
                Err(_) => {
                    // Nothing came back; charge what was expected.
                    charge.add(self.governor.commit(reservation, self.estimate));
                    warn!(
                        session_id = %session,
                        task_id = %task.id,
                        timeout_secs = self.timeout.as_secs(),
                        "execution agent timed out"
                    );
                    return ExecutionOutcome {
                        result: Err(ExecutorError::Timeout(self.timeout.as_secs())),
                        handle: state.into_handle(),
                        charge,
                        agent_calls,
                    };
                }
                Ok(reply) => reply,
            };

            match reply {
                Ok(reply) => {
                    charge.add(self.governor.commit(reservation, reply.usage));
                    let handle = match (state, reply.handle) {
                        (HandleState::Bound(h), Some(id)) if h.id == id => Some(h),
                        (_, Some(id)) => Some(ExecutionHandle::new(id, session.clone())),
                        (state, None) => state.into_handle(),
                    };
                    return ExecutionOutcome {
                        result: Ok(reply.output),
                        handle,
                        charge,
                        agent_calls,
                    };
                }
                Err(err) => {
                    charge.add(
                        self.governor
                            .commit(reservation, err.usage.unwrap_or_default()),
                    );
                    if err.kind == AgentErrorKind::HandleNotFound {
                        if let HandleState::Bound(stale) = &state {
                            info!(
                                session_id = %session,
                                task_id = %task.id,
                                handle = %stale.id,
                                "execution handle not found; retrying without resume"
                            );
                            state = HandleState::NoHandle;
                            continue;
                        }
                        warn!(session_id = %session, task_id = %task.id, "execution handle lost again; giving up");
                        return ExecutionOutcome {
                            result: Err(classify(err)),
                            handle: None,
                            charge,
                            agent_calls,
                        };
                    }
                    warn!(session_id = %session, task_id = %task.id, error = %err, "execution agent failed");
                    return ExecutionOutcome {
                        result: Err(classify(err)),
                        handle: state.into_handle(),
                        charge,
                        agent_calls,
                    };
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
