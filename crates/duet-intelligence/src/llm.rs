//! Single-turn completion client for the planning agent.
//!
//! Planning is one system prompt plus one user request, answered by one
//! JSON document, so the provider contract is a single [`CompletionRequest`]
//! in and a single [`Completion`] out. [`AnthropicProvider`] speaks the
//! Messages API; [`MockProvider`] replays scripted completions in tests.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use duet_core::types::TokenUsage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("could not build HTTP client: {0}")]
    Client(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    /// HTTP 429, or 529 when the API is overloaded.
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("rejected with status {status} ({kind}): {message}")]
    Rejected {
        status: u16,
        kind: String,
        message: String,
    },
    #[error("unreadable completion: {0}")]
    Malformed(String),
}

impl LlmError {
    pub fn is_auth(&self) -> bool {
        matches!(self, LlmError::Rejected { status: 401 | 403, .. })
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
    /// `true` when generation stopped at `max_tokens`; the text is then
    /// probably a truncated document.
    pub truncated: bool,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;
}

// ---------------------------------------------------------------------------
// Anthropic Messages API
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: [UserTurn<'a>; 1],
}

#[derive(Serialize)]
struct UserTurn<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> MessagesBody<'a> {
    /// Planning wants the most likely document, so sampling is greedy.
    fn new(request: &'a CompletionRequest) -> Self {
        Self {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: 0.0,
            system: &request.system,
            messages: [UserTurn {
                role: "user",
                content: &request.prompt,
            }],
        }
    }
}

#[derive(Deserialize)]
struct MessagesReply {
    model: String,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: ReplyUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ReplyUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

#[derive(Deserialize)]
struct ErrorReply {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

impl MessagesReply {
    fn into_completion(self) -> Completion {
        let text = self
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<String>();
        let u = self.usage;
        Completion {
            text,
            model: self.model,
            usage: TokenUsage::new(
                u.input_tokens + u.cache_read_input_tokens + u.cache_creation_input_tokens,
                u.output_tokens,
            ),
            truncated: self.stop_reason.as_deref() == Some("max_tokens"),
        }
    }
}

/// Map a non-success status and its body to an error.
fn rejection(status: u16, retry_after: Option<u64>, body: &str) -> LlmError {
    if status == 429 || status == 529 {
        return LlmError::RateLimited {
            retry_after_secs: retry_after,
        };
    }
    match serde_json::from_str::<ErrorReply>(body) {
        Ok(reply) => LlmError::Rejected {
            status,
            kind: reply.error.kind,
            message: reply.error.message,
        },
        Err(_) => LlmError::Rejected {
            status,
            kind: "unknown".into(),
            message: body.trim().to_string(),
        },
    }
}

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicProvider {
    /// `timeout` bounds each HTTP exchange end to end.
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Client(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let resp = self
            .client
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&MessagesBody::new(request))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let body = resp.text().await.unwrap_or_default();
            return Err(rejection(status.as_u16(), retry_after, &body));
        }

        let body = resp.text().await?;
        let reply: MessagesReply =
            serde_json::from_str(&body).map_err(|e| LlmError::Malformed(e.to_string()))?;
        let completion = reply.into_completion();
        debug!(
            model = %completion.model,
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            truncated = completion.truncated,
            "completion received"
        );
        Ok(completion)
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// Replays queued completions in order, recording every request.
#[derive(Default)]
pub struct MockProvider {
    replies: Mutex<VecDeque<Result<Completion, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(self, text: impl Into<String>, input: u64, output: u64) -> Self {
        guard(&self.replies).push_back(Ok(Completion {
            text: text.into(),
            model: "mock".into(),
            usage: TokenUsage::new(input, output),
            truncated: false,
        }));
        self
    }

    pub fn with_error(self, error: LlmError) -> Self {
        guard(&self.replies).push_back(Err(error));
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        guard(&self.requests).clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        guard(&self.requests).push(request.clone());
        guard(&self.replies).pop_front().unwrap_or_else(|| {
            Err(LlmError::Malformed("no scripted completion left".into()))
        })
    }
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
