//! The task orchestration engine.
//!
//! - **agents**: contracts for the planning and execution agents
//! - **planner**: request -> validated Task, plus the LLM-backed planning agent
//! - **executor**: one Task against the execution agent, with resume-handle
//!   recovery and a hard timeout
//! - **validator**: structural acceptance and the bounded retry loop
//! - **orchestrator**: sequencing, per-session serialization, dispatch and
//!   notification recovery
//! - **claude_cli**: the `claude` CLI as an execution agent
//! - **dispatcher**: logging and webhook Workflow Dispatchers
//! - **shutdown**: cooperative cancellation

pub mod agents;
pub mod claude_cli;
pub mod dispatcher;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod shutdown;
pub mod validator;

pub use agents::{
    AgentError, AgentErrorKind, ExecutionAgent, ExecutionReply, ExecutionRequest, PlanningAgent,
    PlanningResponse,
};
pub use dispatcher::{DispatchError, WorkflowDispatcher};
pub use executor::{ExecutionOutcome, ExecutorError, HandleState, TaskExecutor};
pub use orchestrator::{Orchestrator, OrchestratorError, RecoveryReport, SessionStatus};
pub use planner::{PlannedTask, PlanningError, TaskPlanner};
pub use shutdown::ShutdownSignal;
pub use validator::{ActionValidator, OutputValidator, ValidationLoop, Verdict};
