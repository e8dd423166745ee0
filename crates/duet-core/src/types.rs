use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Maximum length of a session identifier.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Opaque, stable identifier of a session.
///
/// Identifiers are restricted to `[A-Za-z0-9_.-]` (and may not start with a
/// dot) so that they can key a file on disk without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Validate and wrap a caller-supplied identifier.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidSessionId> {
        let raw = raw.into();
        if raw.is_empty() || raw.len() > MAX_SESSION_ID_LEN {
            return Err(InvalidSessionId(raw));
        }
        if raw.starts_with('.') {
            return Err(InvalidSessionId(raw));
        }
        let ok = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !ok {
            return Err(InvalidSessionId(raw));
        }
        Ok(Self(raw))
    }

    /// A fresh system-assigned identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = InvalidSessionId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session id {0:?}: expected 1-128 chars of [A-Za-z0-9_.-], not starting with '.'")]
pub struct InvalidSessionId(pub String);

// ---------------------------------------------------------------------------
// TaskAction
// ---------------------------------------------------------------------------

/// The closed set of things a Task can ask the execution agent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    #[serde(alias = "create")]
    CreateFile,
    #[serde(alias = "modify", alias = "edit", alias = "edit_file")]
    ModifyFile,
    Explain,
    #[serde(alias = "test", alias = "run_test")]
    RunTests,
    Debug,
    Refactor,
}

impl TaskAction {
    pub const ALL: [TaskAction; 6] = [
        TaskAction::CreateFile,
        TaskAction::ModifyFile,
        TaskAction::Explain,
        TaskAction::RunTests,
        TaskAction::Debug,
        TaskAction::Refactor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::CreateFile => "create_file",
            TaskAction::ModifyFile => "modify_file",
            TaskAction::Explain => "explain",
            TaskAction::RunTests => "run_tests",
            TaskAction::Debug => "debug",
            TaskAction::Refactor => "refactor",
        }
    }

    /// Actions whose success is judged by the file they leave behind.
    pub fn produces_file(&self) -> bool {
        matches!(
            self,
            TaskAction::CreateFile | TaskAction::ModifyFile | TaskAction::Refactor
        )
    }

    /// Tools the execution agent may use when the Task carries no override.
    pub fn default_tools(&self) -> &'static [&'static str] {
        match self {
            TaskAction::CreateFile => &["Write", "Read", "Glob"],
            TaskAction::ModifyFile | TaskAction::Refactor => {
                &["Read", "Edit", "Write", "Grep", "Glob"]
            }
            TaskAction::Explain => &["Read", "Grep", "Glob"],
            TaskAction::RunTests => &["Bash", "Read", "Grep"],
            TaskAction::Debug => &["Read", "Edit", "Bash", "Grep", "Glob"],
        }
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskAction {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        serde_json::from_value(serde_json::Value::String(normalized))
            .map_err(|_| TaskError::UnknownAction(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("instruction must not be empty")]
    EmptyInstruction,
}

/// A structured unit of work handed to the execution agent.
///
/// Tasks are immutable once built; a retry derives a new Task through
/// [`Task::with_feedback`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub action: TaskAction,
    pub target: Option<String>,
    pub instruction: String,
    pub context: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    /// The Task this one was derived from on retry.
    pub derived_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(action: TaskAction, instruction: impl Into<String>) -> Result<Self, TaskError> {
        let instruction = instruction.into();
        if instruction.trim().is_empty() {
            return Err(TaskError::EmptyInstruction);
        }
        Ok(Self {
            id: Uuid::new_v4(),
            action,
            target: None,
            instruction,
            context: None,
            allowed_tools: None,
            derived_from: None,
            created_at: Utc::now(),
        })
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.allowed_tools = Some(tools);
        self
    }

    /// Build the follow-up Task for a rejected attempt: same action and
    /// target, instruction rewritten to carry the failure detail.
    pub fn with_feedback(&self, diagnostic: &str) -> Task {
        let instruction = format!(
            "{}\n\nThe previous attempt was rejected: {}\nAddress this and complete the task.",
            self.instruction,
            diagnostic.trim()
        );
        let context = match &self.context {
            Some(ctx) => format!("{ctx}\n\nPrevious failure: {}", diagnostic.trim()),
            None => format!("Previous failure: {}", diagnostic.trim()),
        };
        Task {
            id: Uuid::new_v4(),
            action: self.action,
            target: self.target.clone(),
            instruction,
            context: Some(context),
            allowed_tools: self.allowed_tools.clone(),
            derived_from: Some(self.derived_from.unwrap_or(self.id)),
            created_at: Utc::now(),
        }
    }

    /// Effective tool allowlist: the override if present, else the action default.
    pub fn tools(&self) -> Vec<String> {
        match &self.allowed_tools {
            Some(tools) => tools.clone(),
            None => self
                .action
                .default_tools()
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }

    /// The prompt sent to the execution agent.
    pub fn render_prompt(&self) -> String {
        let mut prompt = format!("Action: {}\n", self.action);
        if let Some(target) = &self.target {
            prompt.push_str(&format!("Target: {target}\n"));
        }
        prompt.push_str(&format!("\n{}\n", self.instruction));
        if let Some(context) = &self.context {
            prompt.push_str(&format!("\nContext:\n{context}\n"));
        }
        prompt
    }
}

// ---------------------------------------------------------------------------
// ExecutionHandle
// ---------------------------------------------------------------------------

/// Resume reference for a conversation with the execution agent.
///
/// A handle belongs to exactly one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub id: String,
    pub session_id: SessionId,
    pub issued_at: DateTime<Utc>,
}

impl ExecutionHandle {
    pub fn new(id: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            id: id.into(),
            session_id,
            issued_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

// ---------------------------------------------------------------------------
// Failure taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PlanningError,
    HandleNotFound,
    ExecutionTimeout,
    ExecutionError,
    ValidationExhausted,
    BudgetExceeded,
    SessionCorrupt,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::PlanningError => "planning failed",
            FailureKind::HandleNotFound => "execution conversation could not be resumed",
            FailureKind::ExecutionTimeout => "execution timed out",
            FailureKind::ExecutionError => "execution failed",
            FailureKind::ValidationExhausted => "output rejected after all attempts",
            FailureKind::BudgetExceeded => "usage budget exceeded",
            FailureKind::SessionCorrupt => "session record is corrupt",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Why a terminal Result failed: a taxonomy kind plus the last diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

// ---------------------------------------------------------------------------
// TaskResult
// ---------------------------------------------------------------------------

/// Outcome of running a Task to a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    /// Agent output on success, last diagnostic on failure.
    pub output: String,
    pub failure: Option<Failure>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub attempt_count: u32,
    /// Handle the session should resume from next time.
    pub handle: Option<ExecutionHandle>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn succeeded(output: impl Into<String>, attempt_count: u32) -> Self {
        Self {
            success: true,
            output: output.into(),
            failure: None,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            attempt_count,
            handle: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(kind: FailureKind, reason: impl Into<String>, attempt_count: u32) -> Self {
        let reason = reason.into();
        Self {
            success: false,
            output: reason.clone(),
            failure: Some(Failure { kind, reason }),
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            attempt_count,
            handle: None,
            finished_at: Utc::now(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage, cost_usd: f64) -> Self {
        self.usage = usage;
        self.cost_usd = cost_usd;
        self
    }

    pub fn with_handle(mut self, handle: Option<ExecutionHandle>) -> Self {
        self.handle = handle;
        self
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

// ---------------------------------------------------------------------------
// TaskRecord
// ---------------------------------------------------------------------------

/// Whether the Workflow Dispatcher has seen a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    #[default]
    Pending,
    Delivered,
    Failed,
}

/// One entry of a session's causal history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Position in the session history, starting at 0.
    pub seq: u64,
    pub request: String,
    pub task: Task,
    pub result: TaskResult,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery: DeliveryState,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
