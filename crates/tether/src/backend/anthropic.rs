//! Anthropic Messages API adapter.
//!
//! Tool use is native: the model answers with `tool_use` content blocks and
//! results go back as `tool_result` blocks in a single user-role message.

use super::http;
use super::{Backend, BackendResponse, ToolResultMessages, Usage, bundled_tool_results};
use crate::error::BackendError;
use crate::{ContentBlock, Message, MessageContent, MessageRole, ToolDef, ToolOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-5";

/// Used when the caller passes `max_tokens = 0`; the API requires a value.
const FALLBACK_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub version: String,
    pub timeout: Duration,
    pub temperature: Option<f32>,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_ANTHROPIC_MODEL.into(),
            base_url: ANTHROPIC_BASE_URL.into(),
            version: ANTHROPIC_VERSION.into(),
            timeout: Duration::from_secs(120),
            temperature: None,
        }
    }

    /// Read `ANTHROPIC_API_KEY`, plus optional `ANTHROPIC_MODEL` and
    /// `ANTHROPIC_BASE_URL`.
    pub fn from_env() -> Result<Self, BackendError> {
        let key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| BackendError::Config("ANTHROPIC_API_KEY not set".into()))?;
        let mut config = Self::new(key);
        if let Ok(model) = std::env::var("ANTHROPIC_MODEL") {
            config.model = model;
        }
        if let Ok(url) = std::env::var("ANTHROPIC_BASE_URL") {
            config.base_url = url;
        }
        Ok(config)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize, Debug, PartialEq)]
struct WireMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Serialize, Debug)]
struct WireTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Deserialize, Debug)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<Value>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<ResponseUsage>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct ResponseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

/// Convert history to Messages API form.
///
/// Tool results travel in the user role. Consecutive messages with the same
/// wire role are merged (the API requires alternation), and empty text
/// blocks are dropped (the API rejects them).
fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    let mut out: Vec<WireMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        let role = match message.role {
            MessageRole::Assistant => "assistant",
            MessageRole::User | MessageRole::Tool => "user",
        };
        let blocks: Vec<ContentBlock> = match &message.content {
            MessageContent::Text(text) => vec![ContentBlock::text(text.clone())],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
        .into_iter()
        .filter(|b| !matches!(b, ContentBlock::Text { text } if text.trim().is_empty()))
        .collect();

        if blocks.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => out.push(WireMessage {
                role,
                content: blocks,
            }),
        }
    }
    out
}

/// Parse a Messages API response body. Unknown block types (thinking,
/// server tools) are skipped; an unparseable body degrades to text.
fn parse_response(body: &str) -> BackendResponse {
    let parsed: MessagesResponse = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(e) => {
            warn!("Unparseable Anthropic response ({e}); returning body as text");
            return BackendResponse::text(body.trim(), Usage::default());
        }
    };

    let usage = parsed
        .usage
        .map(|u| Usage::new(u.input_tokens, u.output_tokens))
        .unwrap_or_default();

    if let Some(err) = parsed.error {
        return BackendResponse::error_text(err.message, usage);
    }

    let blocks: Vec<ContentBlock> = parsed
        .content
        .into_iter()
        .filter_map(|raw| match serde_json::from_value::<ContentBlock>(raw) {
            Ok(block @ (ContentBlock::Text { .. } | ContentBlock::ToolUse { .. })) => Some(block),
            Ok(_) => None,
            Err(e) => {
                trace!("Skipping unsupported content block: {e}");
                None
            }
        })
        .collect();

    debug!(
        "Anthropic output: stop_reason={:?}, {} block(s)",
        parsed.stop_reason,
        blocks.len()
    );
    BackendResponse::from_blocks(blocks, usage)
}

// ── Backend ────────────────────────────────────────────────────────

pub struct AnthropicBackend {
    config: AnthropicConfig,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(config: AnthropicConfig) -> Result<Self, BackendError> {
        if config.api_key.trim().is_empty() {
            return Err(BackendError::Config("Anthropic API key is empty".into()));
        }
        let client = http::build_client(config.timeout)?;
        info!("Anthropic backend: model={}", config.model);
        Ok(Self { config, client })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    fn build_request<'a>(
        &'a self,
        messages: &[Message],
        system_prompt: &'a str,
        tools: &'a [ToolDef],
        max_tokens: u32,
    ) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.config.model,
            max_tokens: if max_tokens == 0 {
                FALLBACK_MAX_TOKENS
            } else {
                max_tokens
            },
            system: (!system_prompt.is_empty()).then_some(system_prompt),
            messages: to_wire_messages(messages),
            tools: tools
                .iter()
                .map(|t| WireTool {
                    name: &t.name,
                    description: &t.description,
                    input_schema: &t.parameters,
                })
                .collect(),
            temperature: self.config.temperature,
        }
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn send(
        &self,
        messages: &[Message],
        system_prompt: &str,
        tools: &[ToolDef],
        max_tokens: u32,
    ) -> Result<BackendResponse, BackendError> {
        let body = self.build_request(messages, system_prompt, tools, max_tokens);
        debug!(
            "Anthropic request: model={}, messages={}, tools={}, max_tokens={}",
            body.model,
            body.messages.len(),
            body.tools.len(),
            body.max_tokens
        );

        let request = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", &self.config.version)
            .json(&body);
        let text = http::execute("anthropic", request, self.config.timeout).await?;
        Ok(parse_response(&text))
    }

    fn format_tool_results(&self, results: &[ToolOutcome]) -> ToolResultMessages {
        bundled_tool_results(results)
    }
}
