//! Orchestrator: the only writer of session history.
//!
//! One call to [`Orchestrator::handle`] runs
//!
//! ```text
//! resolve session -> budget pre-check -> plan -> execute/validate loop
//!   -> append record -> notify dispatcher -> mark delivery
//! ```
//!
//! Calls for the same session are serialized behind a per-session gate;
//! calls for different sessions run concurrently and meet only inside the
//! Usage Governor.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use duet_core::config::Config;
use duet_core::session_store::{SessionStore, SessionStoreError};
use duet_core::types::{DeliveryState, FailureKind, SessionId, TaskRecord, TaskResult, TokenUsage};
use duet_intelligence::{BudgetDenied, UsageGovernor, UsageSummary};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::agents::{ExecutionAgent, PlanningAgent};
use crate::dispatcher::WorkflowDispatcher;
use crate::executor::TaskExecutor;
use crate::planner::{PlanningError, TaskPlanner};
use crate::shutdown::ShutdownSignal;
use crate::validator::{ActionValidator, OutputValidator, ValidationLoop};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures that end a request before any Task ran. Nothing is appended
/// and nothing is dispatched for these.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Budget(#[from] BudgetDenied),
    #[error("planning failed: {0}")]
    Planning(PlanningError),
    #[error("session record is corrupt: {0}")]
    SessionCorrupt(SessionStoreError),
    #[error("session store error: {0}")]
    Store(SessionStoreError),
    #[error("request cancelled")]
    Cancelled,
}

impl OrchestratorError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            OrchestratorError::Budget(_) => FailureKind::BudgetExceeded,
            OrchestratorError::Planning(PlanningError::Budget(_)) => FailureKind::BudgetExceeded,
            OrchestratorError::Planning(_) => FailureKind::PlanningError,
            OrchestratorError::SessionCorrupt(_) => FailureKind::SessionCorrupt,
            OrchestratorError::Store(_) => FailureKind::SessionCorrupt,
            OrchestratorError::Cancelled => FailureKind::Cancelled,
        }
    }
}

impl From<PlanningError> for OrchestratorError {
    fn from(err: PlanningError) -> Self {
        match err {
            PlanningError::Budget(denied) => OrchestratorError::Budget(denied),
            other => OrchestratorError::Planning(other),
        }
    }
}

impl From<SessionStoreError> for OrchestratorError {
    fn from(err: SessionStoreError) -> Self {
        match err {
            SessionStoreError::Corrupt { .. } => OrchestratorError::SessionCorrupt(err),
            other => OrchestratorError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub task_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub usage: UsageSummary,
}

/// What a recovery pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub delivered: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    store: Arc<SessionStore>,
    governor: Arc<UsageGovernor>,
    planner: TaskPlanner,
    executor: TaskExecutor,
    validation: ValidationLoop,
    dispatcher: Arc<dyn WorkflowDispatcher>,
    gates: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        governor: Arc<UsageGovernor>,
        planner: TaskPlanner,
        executor: TaskExecutor,
        validation: ValidationLoop,
        dispatcher: Arc<dyn WorkflowDispatcher>,
    ) -> Self {
        Self {
            store,
            governor,
            planner,
            executor,
            validation,
            dispatcher,
            gates: DashMap::new(),
        }
    }

    /// Wire the standard pipeline from configuration around the given
    /// collaborators.
    pub fn from_config(
        config: &Config,
        store: Arc<SessionStore>,
        governor: Arc<UsageGovernor>,
        planning_agent: Arc<dyn PlanningAgent>,
        execution_agent: Arc<dyn ExecutionAgent>,
        dispatcher: Arc<dyn WorkflowDispatcher>,
    ) -> Self {
        let timeout = Duration::from_secs(config.orchestrator.call_timeout_secs);
        let planner = TaskPlanner::new(planning_agent, Arc::clone(&governor), timeout)
            .with_estimate(TokenUsage::new(
                config.planner.estimated_input_tokens,
                config.planner.estimated_output_tokens,
            ));
        let executor = TaskExecutor::new(execution_agent, Arc::clone(&governor), timeout)
            .with_estimate(TokenUsage::new(
                config.executor.estimated_input_tokens,
                config.executor.estimated_output_tokens,
            ));
        let validator: Box<dyn OutputValidator> =
            Box::new(ActionValidator::new(&config.orchestrator.workspace_root));
        let validation = ValidationLoop::new(validator, config.orchestrator.max_attempts);
        Self::new(store, governor, planner, executor, validation, dispatcher)
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn governor(&self) -> &UsageGovernor {
        &self.governor
    }

    /// Explicit "new session": a fresh id, created and persisted.
    pub fn new_session(&self) -> Result<SessionId> {
        let id = SessionId::generate();
        self.store.resolve(&id)?;
        Ok(id)
    }

    /// Turn `request` into exactly one terminal Result for `session`.
    ///
    /// Task-level failures (exhausted retries, timeouts, budget hit
    /// mid-loop) come back as `Ok` with `success == false`; they are
    /// recorded and dispatched like successes.
    pub async fn handle(&self, session: &SessionId, request: &str) -> Result<TaskResult> {
        let _turn = self.turn(session).await;

        let current = self.store.resolve(session).map_err(|err| {
            error!(session_id = %session, error = %err, "cannot resolve session");
            OrchestratorError::from(err)
        })?;
        self.governor.check(session)?;

        let planned = self
            .planner
            .plan(session, current.context_summary(), request)
            .await?;

        let mut result = self
            .validation
            .run(
                &self.executor,
                session,
                &planned.task,
                current.last_handle().cloned(),
            )
            .await;
        result.usage.add(planned.charge.usage);
        result.cost_usd += planned.charge.cost_usd;

        let record = self
            .store
            .append(session, request, planned.task, result.clone())?;
        self.deliver(session, &record).await;

        info!(
            session_id = %session,
            seq = record.seq,
            success = result.success,
            attempts = result.attempt_count,
            total_tokens = result.usage.total(),
            cost_usd = result.cost_usd,
            "request handled"
        );
        Ok(result)
    }

    /// [`Self::handle`], abandoned as soon as `shutdown` fires. An abandoned
    /// call releases its outstanding reservation and appends nothing unless
    /// it had already reached the append step.
    pub async fn handle_with_shutdown(
        &self,
        session: &SessionId,
        request: &str,
        shutdown: &ShutdownSignal,
    ) -> Result<TaskResult> {
        if shutdown.is_shutting_down() {
            return Err(OrchestratorError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                warn!(session_id = %session, "request cancelled");
                Err(OrchestratorError::Cancelled)
            }
            result = self.handle(session, request) => result,
        }
    }

    /// `None` for a session that was never created; looking does not
    /// create it.
    pub fn status(&self, session: &SessionId) -> Result<Option<SessionStatus>> {
        let Some(current) = self.store.get(session)? else {
            return Ok(None);
        };
        Ok(Some(SessionStatus {
            session_id: session.clone(),
            task_count: current.task_count(),
            created_at: current.created_at,
            last_used_at: current.last_used_at,
            usage: self.governor.summary(session),
        }))
    }

    /// Sessions with a call in flight or queued.
    pub fn active_sessions(&self) -> usize {
        self.gates.len()
    }

    /// Re-notify every recorded Result whose delivery never completed.
    /// Usage is not touched: it was committed when the calls ran.
    pub async fn recover_notifications(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for (session, stale) in self.store.pending_deliveries()? {
            let _turn = self.turn(&session).await;

            // Re-read under the gate; a live call may have delivered it.
            let current = self.store.resolve(&session)?;
            let Some(record) = current
                .records()
                .iter()
                .find(|r| r.seq == stale.seq && r.delivery == DeliveryState::Pending)
            else {
                continue;
            };
            info!(session_id = %session, seq = record.seq, "re-notifying undelivered result");
            match self.deliver(&session, record).await {
                DeliveryState::Delivered => report.delivered += 1,
                _ => report.failed += 1,
            }
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Wait for exclusive use of `session`.
    async fn turn(&self, session: &SessionId) -> Turn<'_> {
        let gate = self
            .gates
            .entry(session.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Turn {
            orchestrator: self,
            session: session.clone(),
            guard: Some(gate.lock_owned().await),
        }
    }

    /// Notify once and record the outcome. Failures are logged, not retried.
    async fn deliver(&self, session: &SessionId, record: &TaskRecord) -> DeliveryState {
        let state = match self
            .dispatcher
            .notify(session, &record.task, &record.result)
            .await
        {
            Ok(()) => DeliveryState::Delivered,
            Err(err) => {
                error!(session_id = %session, seq = record.seq, error = %err, "dispatch failed");
                DeliveryState::Failed
            }
        };
        if let Err(err) = self.store.mark_delivery(session, record.seq, state) {
            warn!(session_id = %session, seq = record.seq, error = %err, "could not record delivery state");
        }
        state
    }
}

/// Exclusive use of one session. When the last holder or waiter lets go,
/// the gate is removed and the session's cached record is released.
struct Turn<'a> {
    orchestrator: &'a Orchestrator,
    session: SessionId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let idle = self
            .orchestrator
            .gates
            .remove_if(&self.session, |_, gate| Arc::strong_count(gate) == 1)
            .is_some();
        if idle {
            self.orchestrator.store.evict(&self.session);
        }
    }
}
