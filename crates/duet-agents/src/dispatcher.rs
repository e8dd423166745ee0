//! Workflow Dispatcher: turns a terminal Result into an outside side effect.
//!
//! The engine calls `notify` at most once per recorded Result and never
//! retries a failed delivery itself.

use std::time::Duration;

use async_trait::async_trait;
use duet_core::config::DispatcherConfig;
use duet_core::types::{SessionId, Task, TaskResult};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("dispatcher rejected the result (status {0})")]
    Rejected(u16),
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        DispatchError::Http(err.to_string())
    }
}

#[async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    async fn notify(
        &self,
        session: &SessionId,
        task: &Task,
        result: &TaskResult,
    ) -> Result<(), DispatchError>;
}

/// Build the dispatcher the configuration asks for.
pub fn from_config(cfg: &DispatcherConfig) -> Box<dyn WorkflowDispatcher> {
    match &cfg.webhook_url {
        Some(url) => Box::new(WebhookDispatcher::new(
            url.clone(),
            Duration::from_secs(cfg.timeout_secs),
        )),
        None => Box::new(LoggingDispatcher),
    }
}

// ---------------------------------------------------------------------------
// LoggingDispatcher
// ---------------------------------------------------------------------------

/// Writes each outcome to the log and acknowledges it.
#[derive(Debug, Default)]
pub struct LoggingDispatcher;

#[async_trait]
impl WorkflowDispatcher for LoggingDispatcher {
    async fn notify(
        &self,
        session: &SessionId,
        task: &Task,
        result: &TaskResult,
    ) -> Result<(), DispatchError> {
        match &result.failure {
            None => info!(
                session_id = %session,
                task_id = %task.id,
                action = %task.action,
                attempts = result.attempt_count,
                cost_usd = result.cost_usd,
                "task completed"
            ),
            Some(failure) => warn!(
                session_id = %session,
                task_id = %task.id,
                action = %task.action,
                attempts = result.attempt_count,
                kind = ?failure.kind,
                reason = %failure.reason,
                "task failed"
            ),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WebhookDispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct DispatchPayload<'a> {
    pub session_id: &'a SessionId,
    pub task: &'a Task,
    pub result: &'a TaskResult,
}

/// POSTs `{session_id, task, result}` as JSON.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl WorkflowDispatcher for WebhookDispatcher {
    async fn notify(
        &self,
        session: &SessionId,
        task: &Task,
        result: &TaskResult,
    ) -> Result<(), DispatchError> {
        let payload = DispatchPayload {
            session_id: session,
            task,
            result,
        };
        let resp = self.client.post(&self.url).json(&payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DispatchError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}
