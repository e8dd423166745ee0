//! Execution agent backed by the `claude` CLI in print mode.
//!
//! Each call runs `claude -p <prompt> --output-format json` (plus
//! `--resume <id>` when bound) in the workspace root and reads the single
//! JSON result document from stdout.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use duet_core::config::ExecutorConfig;
use duet_core::types::TokenUsage;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::agents::{AgentError, AgentErrorKind, ExecutionAgent, ExecutionReply, ExecutionRequest};

pub struct ClaudeCliAgent {
    binary: String,
    model: String,
    workdir: PathBuf,
    extra_args: Vec<String>,
}

impl ClaudeCliAgent {
    pub fn new(binary: impl Into<String>, model: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
            workdir: workdir.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn from_config(cfg: &ExecutorConfig, workdir: impl Into<PathBuf>) -> Self {
        Self::new(cfg.binary.clone(), cfg.model.clone(), workdir)
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Argument vector for one invocation.
    pub fn build_args(&self, request: &ExecutionRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.instruction.clone(),
            "--output-format".into(),
            "json".into(),
            "--model".into(),
            self.model.clone(),
        ];
        if !request.allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(request.allowed_tools.join(","));
        }
        if let Some(resume) = &request.resume {
            args.push("--resume".into());
            args.push(resume.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl ExecutionAgent for ClaudeCliAgent {
    fn model(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, request: ExecutionRequest) -> Result<ExecutionReply, AgentError> {
        let args = self.build_args(&request);
        debug!(binary = %self.binary, resume = request.resume.is_some(), "spawning execution agent");

        let output = Command::new(&self.binary)
            .args(&args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Cancellation drops this future; take the child with it.
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                AgentError::new(
                    AgentErrorKind::Other,
                    format!("failed to run {}: {e}", self.binary),
                )
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        parse_cli_output(output.status.success(), &stdout, &stderr)
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CliResult {
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    usage: Option<CliUsage>,
    #[serde(default)]
    permission_denials: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl CliUsage {
    fn to_usage(&self) -> TokenUsage {
        TokenUsage::new(
            self.input_tokens + self.cache_creation_input_tokens + self.cache_read_input_tokens,
            self.output_tokens,
        )
    }
}

fn classify_message(message: &str) -> AgentErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("no conversation found") || lower.contains("session not found") {
        AgentErrorKind::HandleNotFound
    } else if lower.contains("rate limit") || lower.contains("429") || lower.contains("overloaded") {
        AgentErrorKind::RateLimited
    } else if lower.contains("permission") || lower.contains("not allowed") {
        AgentErrorKind::PermissionDenied
    } else if lower.contains("network")
        || lower.contains("connection")
        || lower.contains("econnreset")
        || lower.contains("timed out")
    {
        AgentErrorKind::Network
    } else {
        AgentErrorKind::Other
    }
}

/// Turn one CLI run into a reply or a classified error.
pub fn parse_cli_output(
    exit_ok: bool,
    stdout: &str,
    stderr: &str,
) -> Result<ExecutionReply, AgentError> {
    let parsed = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str::<CliResult>(l).ok())
        .or_else(|| serde_json::from_str::<CliResult>(stdout.trim()).ok());

    let Some(doc) = parsed else {
        let message = if stderr.trim().is_empty() {
            stdout.trim()
        } else {
            stderr.trim()
        };
        let kind = if exit_ok {
            AgentErrorKind::InvalidResponse
        } else {
            classify_message(message)
        };
        return Err(AgentError::new(kind, message.to_string()));
    };

    let usage = doc.usage.as_ref().map(CliUsage::to_usage).unwrap_or_default();
    let text = doc.result.clone().unwrap_or_default();

    if doc.is_error || !exit_ok {
        let message = if text.is_empty() {
            doc.subtype.clone().unwrap_or_else(|| stderr.trim().to_string())
        } else {
            text
        };
        let kind = if !doc.permission_denials.is_empty() {
            AgentErrorKind::PermissionDenied
        } else {
            classify_message(&format!("{message} {stderr}"))
        };
        return Err(AgentError::new(kind, message).with_usage(usage));
    }

    Ok(ExecutionReply {
        output: text,
        handle: doc.session_id,
        usage,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
