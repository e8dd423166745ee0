//! Task Planner: request + session context -> validated [`Task`].
//!
//! The planning agent must answer with a single JSON object matching
//! [`task_schema`]. Anything else is a [`PlanningError`]; there is no
//! fallback to executing the raw request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use duet_core::config::PlannerConfig;
use duet_core::types::{SessionId, Task, TaskAction, TaskError, TokenUsage};
use duet_intelligence::llm::{CompletionRequest, LlmError, LlmProvider};
use duet_intelligence::{BudgetDenied, UsageCharge, UsageEstimate, UsageGovernor};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::agents::{AgentError, AgentErrorKind, PlanningAgent, PlanningResponse};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error(transparent)]
    Budget(#[from] BudgetDenied),
    #[error("planning agent failed: {0}")]
    Agent(#[from] AgentError),
    #[error("planning agent timed out after {0}s")]
    Timeout(u64),
    #[error("planner response is not a JSON object: {0}")]
    Malformed(String),
    #[error("planner response violates the task schema: {0}")]
    Schema(String),
}

pub type Result<T> = std::result::Result<T, PlanningError>;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// JSON schema the planning agent is asked to satisfy.
pub fn task_schema() -> serde_json::Value {
    let actions: Vec<&str> = TaskAction::ALL.iter().map(|a| a.as_str()).collect();
    serde_json::json!({
        "type": "object",
        "required": ["action", "instruction"],
        "additionalProperties": false,
        "properties": {
            "action": { "type": "string", "enum": actions },
            "target": { "type": "string", "description": "file path the action applies to" },
            "instruction": { "type": "string", "minLength": 1 },
            "context": { "type": "string", "description": "error text or other background" },
            "allowed_tools": { "type": "array", "items": { "type": "string" }, "minItems": 1 }
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskDocument {
    action: String,
    #[serde(default)]
    target: Option<String>,
    instruction: String,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    allowed_tools: Option<Vec<String>>,
}

/// Pull the JSON object out of a model reply, tolerating a code fence or
/// surrounding prose.
fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.rsplit_once("```").map(|(inner, _)| inner.trim()))
        .unwrap_or(trimmed);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    (start < end).then(|| &body[start..=end])
}

/// Parse and validate a planner reply.
pub fn parse_task(raw: &str) -> Result<Task> {
    let json = extract_json(raw).ok_or_else(|| PlanningError::Malformed(preview(raw)))?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| PlanningError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(PlanningError::Malformed(preview(raw)));
    }
    let doc: TaskDocument =
        serde_json::from_value(value).map_err(|e| PlanningError::Schema(e.to_string()))?;

    let action: TaskAction = doc.action.parse().map_err(|e: TaskError| {
        PlanningError::Schema(e.to_string())
    })?;
    let mut task = Task::new(action, doc.instruction)
        .map_err(|e| PlanningError::Schema(e.to_string()))?;

    match doc.target.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
        Some(target) => task = task.with_target(target),
        None if action.produces_file() => {
            return Err(PlanningError::Schema(format!("{action} requires a target")));
        }
        None => {}
    }
    if let Some(context) = doc.context.filter(|c| !c.trim().is_empty()) {
        task = task.with_context(context);
    }
    if let Some(tools) = doc.allowed_tools {
        if tools.is_empty() || tools.iter().any(|t| t.trim().is_empty()) {
            return Err(PlanningError::Schema(
                "allowed_tools must list at least one non-empty tool".into(),
            ));
        }
        task = task.with_allowed_tools(tools);
    }
    Ok(task)
}

fn preview(raw: &str) -> String {
    duet_core::session::truncate_chars(raw.trim(), 200)
}

// ---------------------------------------------------------------------------
// TaskPlanner
// ---------------------------------------------------------------------------

/// A Task plus what planning it cost.
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub task: Task,
    pub charge: UsageCharge,
}

pub struct TaskPlanner {
    agent: Arc<dyn PlanningAgent>,
    governor: Arc<UsageGovernor>,
    estimate: TokenUsage,
    timeout: Duration,
}

impl TaskPlanner {
    pub fn new(
        agent: Arc<dyn PlanningAgent>,
        governor: Arc<UsageGovernor>,
        timeout: Duration,
    ) -> Self {
        let defaults = PlannerConfig::default();
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

    /// Plan one request. Whatever the agent consumed is committed before
    /// this returns, success or not.
    pub async fn plan(
        &self,
        session: &SessionId,
        context_summary: &str,
        request: &str,
    ) -> Result<PlannedTask> {
        let estimate = UsageEstimate {
            model: self.agent.model().to_string(),
            usage: self.estimate,
        };
        let reservation = self.governor.reserve(session, &estimate)?;
        let schema = task_schema();

        let call = self.agent.generate(context_summary, request, &schema);
        let response: PlanningResponse = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => {
                // The agent may have consumed anything up to the estimate.
                self.governor.commit(reservation, self.estimate);
                warn!(session_id = %session, timeout_secs = self.timeout.as_secs(), "planning agent timed out");
                return Err(PlanningError::Timeout(self.timeout.as_secs()));
            }
            Ok(Err(err)) => {
                self.governor
                    .commit(reservation, err.usage.unwrap_or_default());
                warn!(session_id = %session, error = %err, "planning agent failed");
                return Err(err.into());
            }
            Ok(Ok(response)) => response,
        };

        let charge = self.governor.commit(reservation, response.usage);
        match parse_task(&response.content) {
            Ok(task) => {
                info!(
                    session_id = %session,
                    task_id = %task.id,
                    action = %task.action,
                    target = task.target.as_deref().unwrap_or("-"),
                    "task planned"
                );
                Ok(PlannedTask { task, charge })
            }
            Err(err) => {
                warn!(session_id = %session, error = %err, "planner response rejected");
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// LlmPlanningAgent
// ---------------------------------------------------------------------------

const SYSTEM_PROMPT: &str = "You are the planning half of a coding assistant. \
Convert the user's request into exactly one task for an execution agent that \
has file-system and shell tools. Reply with a single JSON object that matches \
the schema below and nothing else.";

/// Planning agent backed by any [`LlmProvider`].
pub struct LlmPlanningAgent {
    provider: Arc<dyn LlmProvider>,
    model: String,
    max_tokens: u32,
}

impl LlmPlanningAgent {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens,
        }
    }

    pub fn from_config(provider: Arc<dyn LlmProvider>, cfg: &PlannerConfig) -> Self {
        Self::new(provider, cfg.model.clone(), cfg.max_tokens)
    }

    fn system_prompt(context_summary: &str, schema: &serde_json::Value) -> String {
        let mut prompt = format!(
            "{SYSTEM_PROMPT}\n\nSchema:\n{}",
            serde_json::to_string_pretty(schema).unwrap_or_default()
        );
        if !context_summary.is_empty() {
            prompt.push_str("\n\nEarlier in this session:\n");
            prompt.push_str(context_summary);
        }
        prompt
    }
}

fn classify_llm_error(err: LlmError) -> AgentError {
    let kind = match &err {
        LlmError::RateLimited { .. } => AgentErrorKind::RateLimited,
        LlmError::Timeout => AgentErrorKind::Timeout,
        LlmError::Transport(_) => AgentErrorKind::Network,
        e if e.is_auth() => AgentErrorKind::PermissionDenied,
        LlmError::Malformed(_) => AgentErrorKind::InvalidResponse,
        LlmError::Client(_) | LlmError::Rejected { .. } => AgentErrorKind::Other,
    };
    AgentError::new(kind, err.to_string())
}

#[async_trait]
impl PlanningAgent for LlmPlanningAgent {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        context_summary: &str,
        request: &str,
        task_schema: &serde_json::Value,
    ) -> std::result::Result<PlanningResponse, AgentError> {
        let request = CompletionRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            system: Self::system_prompt(context_summary, task_schema),
            prompt: request.to_string(),
        };
        let completion = self
            .provider
            .complete(&request)
            .await
            .map_err(classify_llm_error)?;
        if completion.truncated {
            warn!(model = %completion.model, max_tokens = self.max_tokens, "planning response hit max_tokens");
        }
        Ok(PlanningResponse {
            usage: completion.usage,
            content: completion.text,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use duet_intelligence::{BudgetLimits, LlmMockProvider, RateTable, Scope};

    #[test]
    fn parses_plain_object() {
        let task = parse_task(
            r#"{"action":"create_file","target":"hello.txt","instruction":"write hello"}"#,
        )
        .unwrap();
        assert_eq!(task.action, TaskAction::CreateFile);
        assert_eq!(task.target.as_deref(), Some("hello.txt"));
    }

    #[test]
    fn parses_fenced_object_with_prose() {
        let raw = "```json\n{\"action\":\"explain\",\"instruction\":\"explain main.rs\"}\n```";
        let task = parse_task(raw).unwrap();
        assert_eq!(task.action, TaskAction::Explain);
        assert!(task.target.is_none());
    }

    #[test]
    fn rejects_non_json() {
        assert!(matches!(
            parse_task("sure, I'll create that file"),
            Err(PlanningError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_unknown_action() {
        let err = parse_task(r#"{"action":"deploy","instruction":"ship it"}"#).unwrap_err();
        assert!(matches!(err, PlanningError::Schema(_)));
    }

    #[test]
    fn rejects_empty_instruction() {
        let err = parse_task(r#"{"action":"explain","instruction":"  "}"#).unwrap_err();
        assert!(matches!(err, PlanningError::Schema(_)));
    }

    #[test]
    fn rejects_file_action_without_target() {
        let err = parse_task(r#"{"action":"create_file","instruction":"write it"}"#).unwrap_err();
        assert!(err.to_string().contains("requires a target"));
    }

    #[test]
    fn rejects_unknown_fields_and_empty_tools() {
        assert!(parse_task(r#"{"action":"explain","instruction":"x","shell":"rm -rf /"}"#).is_err());
        assert!(parse_task(r#"{"action":"explain","instruction":"x","allowed_tools":[]}"#).is_err());
    }

    #[test]
    fn schema_lists_every_action() {
        let schema = task_schema();
        let actions = schema["properties"]["action"]["enum"].as_array().unwrap();
        assert_eq!(actions.len(), TaskAction::ALL.len());
    }

    #[tokio::test]
    async fn llm_agent_usage_is_committed_even_for_bad_output() {
        let provider = Arc::new(LlmMockProvider::new().with_content("not json", 120, 30));
        let agent = Arc::new(LlmPlanningAgent::from_config(
            provider.clone(),
            &PlannerConfig::default(),
        ));
        let governor = Arc::new(UsageGovernor::new(BudgetLimits::default(), RateTable::default()));
        let planner = TaskPlanner::new(agent, governor.clone(), Duration::from_secs(5));
        let session = SessionId::parse("s1").unwrap();

        let err = planner.plan(&session, "", "do something").await.unwrap_err();
        assert!(matches!(err, PlanningError::Malformed(_)));

        let status = governor.status(&Scope::Session(session));
        assert_eq!(status.used_tokens, 150);
        assert_eq!(status.requests, 1);

        let sent = provider.requests();
        assert!(sent[0].system.contains("\"action\""));
        assert_eq!(sent[0].prompt, "do something");
    }

    #[test]
    fn llm_errors_are_classified() {
        assert_eq!(
            classify_llm_error(LlmError::RateLimited { retry_after_secs: None }).kind,
            AgentErrorKind::RateLimited
        );
        assert_eq!(
            classify_llm_error(LlmError::Rejected {
                status: 401,
                kind: "authentication_error".into(),
                message: "bad key".into()
            })
            .kind,
            AgentErrorKind::PermissionDenied
        );
    }
}
