//! Backend abstraction: one contract over several vendor protocols.
//!
//! A [`Backend`] turns the conversation history into one vendor call and the
//! vendor's reply into a [`BackendResponse`]: either final text or a
//! non-empty batch of [`ToolCall`]s, never both. It also owns how messages
//! are stored in history, since each vendor wants tool turns shaped
//! differently.
//!
//! | Adapter | Protocol |
//! |---------|----------|
//! | [`AnthropicBackend`] | Messages API, native `tool_use` / `tool_result` blocks |
//! | [`OpenAiBackend`] | Chat completions function calling (OpenAI, OpenRouter) |
//! | [`LocalBackend`] | OpenAI-compatible local server (Ollama, llama.cpp, vLLM) |
//! | [`CliBackend`] | Subprocess CLI, tool calls prompt-engineered as JSON |
//! | [`TextOnlyBackend`] | Decorator that hides tools from any inner backend |

pub mod anthropic;
pub mod cli;
mod http;
pub mod local;
pub mod openai;
pub mod text;
pub mod wire;

pub use anthropic::{AnthropicBackend, AnthropicConfig};
pub use cli::{CliBackend, CliConfig};
pub use local::{LocalBackend, LocalConfig};
pub use openai::{OpenAiBackend, OpenAiConfig};
pub use text::TextOnlyBackend;

use crate::error::BackendError;
use crate::{ContentBlock, Message, ToolCall, ToolDef, ToolOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Prefix for text responses that carry a vendor-reported error instead of
/// model output.
pub const ERROR_MARKER: &str = "[backend error]";

// ── Response types ─────────────────────────────────────────────────

/// Token usage for one backend call.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// What the model produced: final text, or tools to run.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseBody {
    Text(String),
    /// Always non-empty.
    ToolCalls(Vec<ToolCall>),
}

/// Normalized reply from one backend call.
///
/// `blocks` keeps the assistant turn as the vendor produced it (narration
/// text interleaved with tool-use entries) so adapters can store it back
/// into history without loss.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendResponse {
    body: ResponseBody,
    blocks: Vec<ContentBlock>,
    pub usage: Usage,
}

impl BackendResponse {
    /// A final text answer.
    pub fn text(text: impl Into<String>, usage: Usage) -> Self {
        let text = text.into();
        Self {
            blocks: vec![ContentBlock::text(text.clone())],
            body: ResponseBody::Text(text),
            usage,
        }
    }

    /// A text response carrying a vendor error, prefixed with [`ERROR_MARKER`].
    pub fn error_text(message: impl fmt::Display, usage: Usage) -> Self {
        Self::text(format!("{ERROR_MARKER} {message}"), usage)
    }

    /// Build from an assistant turn's blocks.
    ///
    /// Any tool-use block makes this a tool-call response (its text blocks
    /// are kept only as narration). Otherwise the text blocks are joined into
    /// the final answer. Tool-result blocks are ignored.
    pub fn from_blocks(blocks: Vec<ContentBlock>, usage: Usage) -> Self {
        let blocks: Vec<ContentBlock> = blocks
            .into_iter()
            .filter(|b| !matches!(b, ContentBlock::ToolResult { .. }))
            .collect();
        let calls: Vec<ToolCall> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some(ToolCall::new(id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect();

        let body = if calls.is_empty() {
            ResponseBody::Text(join_text(&blocks))
        } else {
            ResponseBody::ToolCalls(calls)
        };
        Self {
            body,
            blocks,
            usage,
        }
    }

    /// A tool-call response with optional narration. Falls back to an empty
    /// text response when `calls` is empty.
    pub fn tool_calls(narration: Option<String>, calls: Vec<ToolCall>, usage: Usage) -> Self {
        let mut blocks: Vec<ContentBlock> = narration
            .filter(|n| !n.trim().is_empty())
            .map(ContentBlock::text)
            .into_iter()
            .collect();
        blocks.extend(calls.iter().map(ContentBlock::tool_use));
        Self::from_blocks(blocks, usage)
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        &self.blocks
    }

    /// Final text, or `None` for a tool-call response.
    pub fn final_text(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Text(t) => Some(t),
            ResponseBody::ToolCalls(_) => None,
        }
    }

    /// Requested tool calls; empty for a text response.
    pub fn calls(&self) -> &[ToolCall] {
        match &self.body {
            ResponseBody::Text(_) => &[],
            ResponseBody::ToolCalls(calls) => calls,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        matches!(self.body, ResponseBody::ToolCalls(_))
    }

    /// Text that accompanied the tool calls (or the final text).
    pub fn narration(&self) -> String {
        join_text(&self.blocks)
    }

    /// Whether this is a vendor error rendered as text.
    pub fn is_error_marked(&self) -> bool {
        self.final_text()
            .is_some_and(|t| t.starts_with(ERROR_MARKER))
    }
}

fn join_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } if !text.is_empty() => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tool results shaped for history: one bundled message or one per result.
#[derive(Clone, Debug, PartialEq)]
pub enum ToolResultMessages {
    Single(Message),
    Many(Vec<Message>),
}

impl ToolResultMessages {
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            ToolResultMessages::Single(m) => vec![m],
            ToolResultMessages::Many(ms) => ms,
        }
    }
}

// ── Backend trait ──────────────────────────────────────────────────

/// A swappable adapter to one vendor's model-serving protocol.
///
/// `send` is the only I/O. Transport failures come back as typed
/// [`BackendError`]s and are never retried here; the conversation wraps
/// every call in a [`RetryPolicy`](crate::api::retry::RetryPolicy).
/// Payloads that arrive but cannot be parsed degrade to a text response.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short identifier for logs.
    fn name(&self) -> &str;

    /// Make one model call over the full history.
    async fn send(
        &self,
        messages: &[Message],
        system_prompt: &str,
        tools: &[ToolDef],
        max_tokens: u32,
    ) -> Result<BackendResponse, BackendError>;

    fn format_user_message(&self, text: &str) -> Message {
        Message::user(text)
    }

    /// History entry for a response. Tool-call turns keep their native
    /// blocks (narration included); text turns are plain text.
    fn format_assistant_message(&self, response: &BackendResponse) -> Message {
        match response.body() {
            ResponseBody::Text(text) => Message::assistant_text(text.clone()),
            ResponseBody::ToolCalls(_) => Message::assistant_blocks(response.blocks().to_vec()),
        }
    }

    /// History entries carrying tool results back to the model.
    fn format_tool_results(&self, results: &[ToolOutcome]) -> ToolResultMessages;

    /// Cheap liveness probe. The default makes a one-token call and
    /// propagates any failure.
    async fn ping(&self) -> Result<bool, BackendError> {
        let response = self.send(&[Message::user("ping")], "", &[], 1).await?;
        Ok(!response.is_error_marked())
    }
}

/// Bundle every result into one tool-role message of `tool_result` blocks.
pub(crate) fn bundled_tool_results(results: &[ToolOutcome]) -> ToolResultMessages {
    let blocks = results
        .iter()
        .map(|r| ContentBlock::ToolResult {
            tool_use_id: r.call_id.clone(),
            content: r.result.clone(),
            is_error: r.is_error,
        })
        .collect();
    ToolResultMessages::Single(Message::tool_results(blocks))
}

// ── Factory ────────────────────────────────────────────────────────

/// Which adapter [`build_backend`] constructs.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Anthropic,
    OpenAi,
    Local,
    Cli,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Anthropic => write!(f, "anthropic"),
            BackendKind::OpenAi => write!(f, "openai"),
            BackendKind::Local => write!(f, "local"),
            BackendKind::Cli => write!(f, "cli"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(BackendKind::Anthropic),
            "openai" | "openrouter" => Ok(BackendKind::OpenAi),
            "local" | "ollama" => Ok(BackendKind::Local),
            "cli" | "subprocess" => Ok(BackendKind::Cli),
            other => Err(BackendError::Config(format!("unknown backend kind '{other}'"))),
        }
    }
}

/// Settings common to every adapter. Unset fields fall back to each
/// adapter's defaults and environment variables.
#[derive(Clone, Debug, Default)]
pub struct BackendSettings {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Program for the CLI backend.
    pub program: Option<String>,
    /// Hide tools from the model.
    pub text_only: bool,
}

/// Construct the adapter for `kind`.
pub fn build_backend(
    kind: BackendKind,
    settings: &BackendSettings,
) -> Result<Arc<dyn Backend>, BackendError> {
    let backend: Arc<dyn Backend> = match kind {
        BackendKind::Anthropic => {
            let mut config = match &settings.api_key {
                Some(key) => AnthropicConfig::new(key.clone()),
                None => AnthropicConfig::from_env()?,
            };
            if let Some(model) = &settings.model {
                config = config.with_model(model.clone());
            }
            if let Some(url) = &settings.base_url {
                config = config.with_base_url(url.clone());
            }
            Arc::new(AnthropicBackend::new(config)?)
        }
        BackendKind::OpenAi => {
            let mut config = match &settings.api_key {
                Some(key) => OpenAiConfig::new(key.clone()),
                None => OpenAiConfig::from_env()?,
            };
            if let Some(model) = &settings.model {
                config = config.with_model(model.clone());
            }
            if let Some(url) = &settings.base_url {
                config = config.with_base_url(url.clone());
            }
            Arc::new(OpenAiBackend::new(config)?)
        }
        BackendKind::Local => {
            let mut config = LocalConfig::default();
            if let Some(model) = &settings.model {
                config = config.with_model(model.clone());
            }
            if let Some(url) = &settings.base_url {
                config = config.with_base_url(url.clone());
            }
            if let Some(key) = &settings.api_key {
                config = config.with_api_key(key.clone());
            }
            Arc::new(LocalBackend::new(config)?)
        }
        BackendKind::Cli => {
            let mut config = CliConfig::default();
            if let Some(program) = &settings.program {
                config = config.with_program(program.clone());
            }
            if let Some(model) = &settings.model {
                config = config.with_args(["--model".to_string(), model.clone()]);
            }
            Arc::new(CliBackend::new(config))
        }
    };

    if settings.text_only {
        Ok(Arc::new(TextOnlyBackend::new(backend)))
    } else {
        Ok(backend)
    }
}
