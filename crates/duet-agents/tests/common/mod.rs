//! Scripted collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use duet_agents::dispatcher::{DispatchError, WorkflowDispatcher};
use duet_agents::{
    AgentError, ExecutionAgent, ExecutionReply, ExecutionRequest, Orchestrator, PlanningAgent,
    PlanningResponse,
};
use duet_core::config::Config;
use duet_core::session_store::SessionStore;
use duet_core::types::{SessionId, Task, TaskResult, TokenUsage};
use duet_intelligence::{BudgetLimits, RateTable, UsageGovernor};

// ---------------------------------------------------------------------------
// Planning agent
// ---------------------------------------------------------------------------

pub struct ScriptedPlanner {
    replies: Mutex<VecDeque<Result<PlanningResponse, AgentError>>>,
    calls: AtomicUsize,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue a JSON task document.
    pub fn plan(self, json: &str) -> Self {
        self.replies.lock().unwrap().push_back(Ok(PlanningResponse {
            content: json.to_string(),
            usage: TokenUsage::new(10, 0),
        }));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlanningAgent for ScriptedPlanner {
    fn model(&self) -> &str {
        "planner-model"
    }

    async fn generate(
        &self,
        _context_summary: &str,
        request: &str,
        _task_schema: &serde_json::Value,
    ) -> Result<PlanningResponse, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let queued = self.replies.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| {
            Ok(PlanningResponse {
                content: serde_json::json!({ "action": "explain", "instruction": request })
                    .to_string(),
                usage: TokenUsage::new(10, 0),
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Execution agent
// ---------------------------------------------------------------------------

pub enum Step {
    Reply {
        output: String,
        handle: Option<String>,
        usage: TokenUsage,
    },
    /// Write `contents` to `path`, then reply.
    WriteFile {
        path: PathBuf,
        contents: String,
        handle: String,
    },
    Fail(AgentError),
    /// Sleep before replying.
    Delay(Duration, String),
    /// Never answer.
    Hang,
}

impl Step {
    pub fn reply(output: &str, handle: &str) -> Self {
        Step::Reply {
            output: output.into(),
            handle: Some(handle.into()),
            usage: TokenUsage::new(100, 0),
        }
    }

    pub fn reply_with_usage(output: &str, handle: &str, tokens: u64) -> Self {
        Step::Reply {
            output: output.into(),
            handle: Some(handle.into()),
            usage: TokenUsage::new(tokens, 0),
        }
    }
}

pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ExecutionRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().unwrap().push_back(step);
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExecutionAgent for ScriptedExecutor {
    fn model(&self) -> &str {
        "executor-model"
    }

    async fn invoke(&self, request: ExecutionRequest) -> Result<ExecutionReply, AgentError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        self.requests.lock().unwrap().push(request);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            None => Ok(ExecutionReply {
                output: "ok".into(),
                handle: Some("h-default".into()),
                usage: TokenUsage::new(100, 0),
            }),
            Some(Step::Reply {
                output,
                handle,
                usage,
            }) => Ok(ExecutionReply {
                output,
                handle,
                usage,
            }),
            Some(Step::WriteFile {
                path,
                contents,
                handle,
            }) => {
                std::fs::write(&path, contents).unwrap();
                Ok(ExecutionReply {
                    output: format!("wrote {}", path.display()),
                    handle: Some(handle),
                    usage: TokenUsage::new(100, 0),
                })
            }
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Delay(delay, output)) => {
                tokio::time::sleep(delay).await;
                Ok(ExecutionReply {
                    output,
                    handle: Some("h-delay".into()),
                    usage: TokenUsage::new(100, 0),
                })
            }
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                unreachable!("hung call was never cancelled")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingDispatcher {
    pub notified: Mutex<Vec<(SessionId, Task, TaskResult)>>,
    pub fail: bool,
}

impl RecordingDispatcher {
    pub fn failing() -> Self {
        Self {
            notified: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn count(&self) -> usize {
        self.notified.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkflowDispatcher for RecordingDispatcher {
    async fn notify(
        &self,
        session: &SessionId,
        task: &Task,
        result: &TaskResult,
    ) -> Result<(), DispatchError> {
        self.notified
            .lock()
            .unwrap()
            .push((session.clone(), task.clone(), result.clone()));
        if self.fail {
            return Err(DispatchError::Rejected(503));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<SessionStore>,
    pub governor: Arc<UsageGovernor>,
    pub planner: Arc<ScriptedPlanner>,
    pub executor: Arc<ScriptedExecutor>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn workspace(&self) -> &Path {
        self.dir.path()
    }
}

/// Small estimates so limits in tests are easy to reason about:
/// planning reserves 10 tokens, each execution attempt 100.
pub fn test_config(workspace: &Path) -> Config {
    let mut config = Config::default();
    config.orchestrator.max_attempts = 3;
    config.orchestrator.call_timeout_secs = 5;
    config.orchestrator.workspace_root = workspace.display().to_string();
    config.planner.estimated_input_tokens = 10;
    config.planner.estimated_output_tokens = 0;
    config.executor.estimated_input_tokens = 100;
    config.executor.estimated_output_tokens = 0;
    config
}

pub fn harness(
    planner: ScriptedPlanner,
    executor: ScriptedExecutor,
    dispatcher: RecordingDispatcher,
    configure: impl FnOnce(&mut Config),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    configure(&mut config);

    let store = Arc::new(SessionStore::new(
        dir.path().join("sessions"),
        &config.session,
    ));
    let governor = Arc::new(UsageGovernor::new(
        BudgetLimits::from_config(&config.budget),
        RateTable::default(),
    ));
    let planner = Arc::new(planner);
    let executor = Arc::new(executor);
    let dispatcher = Arc::new(dispatcher);

    let orchestrator = Orchestrator::from_config(
        &config,
        Arc::clone(&store),
        Arc::clone(&governor),
        planner.clone(),
        executor.clone(),
        dispatcher.clone(),
    );

    Harness {
        orchestrator,
        store,
        governor,
        planner,
        executor,
        dispatcher,
        dir,
    }
}

pub fn sid(raw: &str) -> SessionId {
    SessionId::parse(raw).unwrap()
}
