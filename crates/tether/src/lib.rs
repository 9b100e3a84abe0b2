//! Agent execution core: one conversation loop over many model vendors.
//!
//! `tether` drives a model backend through a bounded tool-calling loop. The
//! [`Conversation`](agent::conversation::Conversation) appends the user's
//! message, asks the active [`Backend`](backend::Backend) for a reply, runs any
//! requested tools through the [`ToolRegistry`](tools::core::ToolRegistry)
//! (concurrently when the model asks for several at once), feeds the results
//! back, and repeats until the model answers in plain text or the tool-turn
//! ceiling is hit.
//!
//! Vendor differences stay inside the adapters in [`backend`]. From the
//! loop's point of view every reply is either final text or a non-empty batch
//! of [`ToolCall`]s, plus token usage.
//!
//! # Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use tether::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BackendError> {
//!     let backend = Arc::new(AnthropicBackend::new(AnthropicConfig::from_env()?)?);
//!
//!     let registry = Arc::new(ToolRegistry::new().with(clock_tool()));
//!
//!     let config = ConversationConfig::new("You are a helpful assistant.")
//!         .with_max_tool_turns(10)
//!         .with_max_tokens(2048);
//!
//!     let mut conversation = Conversation::new(backend, registry, config);
//!     let answer = conversation.send("What time is it in UTC?").await?;
//!     println!("{answer}");
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`agent`] | [`Conversation`](agent::conversation::Conversation) loop, parallel dispatcher, config, events |
//! | [`backend`] | [`Backend`](backend::Backend) trait and the Anthropic, OpenAI, local, CLI and text-only adapters |
//! | [`tools`] | [`Tool`](tools::core::Tool) trait, [`ToolRegistry`](tools::core::ToolRegistry), per-tool stats, keyword router |
//! | [`api`] | Retry policy with rate-limit aware backoff |
//! | [`error`] | [`BackendError`](error::BackendError) and [`ToolError`](error::ToolError) |

pub mod agent;
pub mod api;
pub mod backend;
pub mod error;
pub mod prelude;
pub mod tools;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use error::{BackendError, ToolError};

// Re-export schemars for downstream crates deriving tool argument schemas.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`.
///
/// # Example
///
/// ```
/// use tether::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct WeatherArgs {
///     city: String,
///     #[serde(default)]
///     units: Option<String>,
/// }
///
/// let schema = json_schema_for::<WeatherArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"city".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
///
/// `Tool` marks messages carrying tool results back to the model. Adapters
/// decide how that maps onto their wire format (Anthropic sends them as
/// `user`, OpenAI as `tool`).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::Tool => write!(f, "tool"),
        }
    }
}

/// One typed entry of a structured message body.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_use(call: &ToolCall) -> Self {
        ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.arguments.clone(),
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }
}

/// Message body: plain text or a list of typed blocks.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text of the body, ignoring tool blocks.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Tool-use blocks in order of appearance.
    pub fn tool_uses(&self) -> Vec<ToolCall> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: input.clone(),
                    }),
                    _ => None,
                })
                .collect(),
        }
    }

    /// `(tool_use_id, content, is_error)` triples of tool-result blocks.
    pub fn tool_results(&self) -> Vec<(&str, &str, bool)> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => Some((tool_use_id.as_str(), content.as_str(), *is_error)),
                    _ => None,
                })
                .collect(),
        }
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    pub content: MessageContent,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// A single tool result, keyed by the originating call id.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: MessageContent::Blocks(vec![ContentBlock::tool_result(call_id, content)]),
        }
    }

    /// Several tool results bundled as blocks of one message.
    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Tool results rendered as plain text (for backends with no structured
    /// tool protocol).
    pub fn tool_text(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Whether this message opens a user turn: a plain-text user message,
    /// as opposed to tool results travelling in the user role.
    pub fn is_turn_start(&self) -> bool {
        self.role == MessageRole::User && matches!(self.content, MessageContent::Text(_))
    }

    /// Whether this assistant message requests tools.
    pub fn has_tool_calls(&self) -> bool {
        self.role == MessageRole::Assistant && !self.content.tool_uses().is_empty()
    }

    pub fn text(&self) -> String {
        self.content.as_text()
    }
}

// ── Tool types ─────────────────────────────────────────────────────

/// Vendor-neutral tool definition advertised to a backend.
///
/// Each adapter maps it to its wire format (`input_schema` for Anthropic,
/// `function.parameters` for OpenAI, prose for the CLI backend).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Build a definition whose parameter schema is derived from `T`.
    pub fn from_schema<T: JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::new(name, description, json_schema_for::<T>())
    }
}

/// A tool call requested by the model.
///
/// `id` is opaque and must be echoed back in the matching tool result.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Arguments as a JSON object.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Result of executing one [`ToolCall`], keyed by the call's id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolOutcome {
    pub call_id: String,
    pub name: String,
    pub result: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn new(call: &ToolCall, result: impl Into<String>, is_error: bool) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result: result.into(),
            is_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let user = Message::user("hello");
        assert_eq!(user.role, MessageRole::User);
        assert!(user.is_turn_start());
        assert_eq!(user.text(), "hello");

        let result = Message::tool_result("call-1", "42");
        assert_eq!(result.role, MessageRole::Tool);
        assert!(!result.is_turn_start());
        assert_eq!(result.content.tool_results(), vec![("call-1", "42", false)]);
    }

    #[test]
    fn tool_uses_preserve_order() {
        let msg = Message::assistant_blocks(vec![
            ContentBlock::text("checking both"),
            ContentBlock::tool_use(&ToolCall::new("a", "first", serde_json::json!({}))),
            ContentBlock::tool_use(&ToolCall::new("b", "second", serde_json::json!({"x": 1}))),
        ]);
        assert!(msg.has_tool_calls());
        let ids: Vec<_> = msg.content.tool_uses().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(msg.text(), "checking both");
    }

    #[test]
    fn content_block_serializes_with_type_tag() {
        let block = ContentBlock::tool_result("t1", "ok");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["tool_use_id"], "t1");
        assert!(json.get("is_error").is_none());
    }

    #[test]
    fn tool_def_from_schema() {
        #[derive(Deserialize, JsonSchema)]
        #[allow(dead_code)]
        struct Args {
            query: String,
        }
        let def = ToolDef::from_schema::<Args>("search", "Search things");
        assert_eq!(def.name, "search");
        assert_eq!(def.parameters["type"], "object");
    }
}
