//! OpenAI chat-completions wire format, shared by [`OpenAiBackend`] and
//! [`LocalBackend`].
//!
//! Request and response types mirror the subset of the chat completions API
//! the adapters use. Parsing is lenient where local servers diverge from
//! OpenAI: tool-call `arguments` may be an object instead of a JSON string,
//! and call ids may be missing.
//!
//! [`OpenAiBackend`]: super::OpenAiBackend
//! [`LocalBackend`]: super::LocalBackend

use super::http;
use super::{BackendResponse, Usage};
use crate::error::BackendError;
use crate::{ContentBlock, Message, MessageContent, MessageRole, ToolCall, ToolDef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace, warn};

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body. Unused optional fields are omitted.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireToolDef>>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One chat message on the wire.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WireMessage {
    pub role: WireRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl WireMessage {
    fn text(role: WireRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn tool_result(call_id: &str, content: &str) -> Self {
        Self {
            role: WireRole::Tool,
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

/// Tool definition in function-calling format.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WireToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&ToolDef> for WireToolDef {
    fn from(def: &ToolDef) -> Self {
        Self {
            tool_type: "function".into(),
            function: FunctionDef {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.parameters.clone(),
            },
        }
    }
}

/// A tool call as sent or received. Outbound `arguments` are always a JSON
/// string; inbound they may be a string or an object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WireToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    pub function: FunctionCallData,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionCallData {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl From<&ToolCall> for WireToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: Some(call.id.clone()),
            call_type: Some("function".into()),
            function: FunctionCallData {
                name: call.name.clone(),
                arguments: Value::String(call.arguments.to_string()),
            },
        }
    }
}

/// Convert history into chat messages, system prompt first.
///
/// Structured tool results fan out into one `tool` message per result. Tool
/// results stored as plain text (text-only histories) are sent as user
/// messages, since a `tool` message needs a call id.
pub fn to_wire_messages(messages: &[Message], system_prompt: &str) -> Vec<WireMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        out.push(WireMessage::text(WireRole::System, system_prompt));
    }

    for message in messages {
        match (&message.role, &message.content) {
            (MessageRole::User, MessageContent::Text(text))
            | (MessageRole::Tool, MessageContent::Text(text)) => {
                out.push(WireMessage::text(WireRole::User, text.clone()));
            }
            (MessageRole::Assistant, MessageContent::Text(text)) => {
                out.push(WireMessage::text(WireRole::Assistant, text.clone()));
            }
            (MessageRole::Assistant, MessageContent::Blocks(_)) => {
                let narration = message.content.as_text();
                let calls: Vec<WireToolCall> = message
                    .content
                    .tool_uses()
                    .iter()
                    .map(WireToolCall::from)
                    .collect();
                out.push(WireMessage {
                    role: WireRole::Assistant,
                    content: (!narration.is_empty() || calls.is_empty()).then_some(narration),
                    tool_calls: (!calls.is_empty()).then_some(calls),
                    tool_call_id: None,
                });
            }
            (MessageRole::User | MessageRole::Tool, MessageContent::Blocks(blocks)) => {
                for block in blocks {
                    match block {
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => out.push(WireMessage::tool_result(tool_use_id, content)),
                        ContentBlock::Text { text } => {
                            out.push(WireMessage::text(WireRole::User, text.clone()));
                        }
                        ContentBlock::ToolUse { .. } => {
                            warn!("Dropping tool_use block found outside an assistant message");
                        }
                    }
                }
            }
        }
    }
    out
}

pub fn to_wire_tools(tools: &[ToolDef]) -> Option<Vec<WireToolDef>> {
    if tools.is_empty() {
        None
    } else {
        Some(tools.iter().map(WireToolDef::from).collect())
    }
}

// ── Response types ─────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

#[derive(Deserialize, Debug, Clone)]
struct UsageInfo {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

/// Normalize tool-call arguments to a JSON object.
///
/// Accepts a JSON-encoded string (OpenAI) or an object (several local
/// servers). Anything else becomes an empty object so the tool's own
/// argument checks report the problem to the model.
pub fn normalize_arguments(name: &str, arguments: Value) -> Value {
    match arguments {
        Value::Object(_) => arguments,
        Value::Null => Value::Object(Default::default()),
        Value::String(raw) if raw.trim().is_empty() => Value::Object(Default::default()),
        Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => {
                warn!("Tool call '{name}' has unparseable arguments: {raw}");
                Value::Object(Default::default())
            }
        },
        other => {
            warn!("Tool call '{name}' has non-object arguments: {other}");
            Value::Object(Default::default())
        }
    }
}

/// Call id for servers that omit one. Unique within a response.
pub(crate) fn synthesize_call_id(index: usize) -> String {
    let stamp = chrono::Utc::now().timestamp_micros();
    format!("call_{stamp:x}_{index}")
}

/// Parse a chat completions response body.
///
/// Never fails: a body that is not a chat completion becomes a text
/// response holding the raw body, and an `error` object becomes an
/// error-marked text response.
pub fn parse_chat_response(body: &str) -> BackendResponse {
    let parsed: RawChatResponse = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(e) => {
            warn!("Unparseable chat completion ({e}); returning body as text");
            return BackendResponse::text(body.trim(), Usage::default());
        }
    };

    let usage = parsed
        .usage
        .map(|u| {
            Usage::new(
                u.prompt_tokens.unwrap_or(0),
                u.completion_tokens.unwrap_or(0),
            )
        })
        .unwrap_or_default();

    if let Some(err) = parsed.error {
        return BackendResponse::error_text(err.message, usage);
    }

    let Some(choice) = parsed.choices.and_then(|c| c.into_iter().next()) else {
        debug!("Chat completion had no choices");
        return BackendResponse::text(String::new(), usage);
    };
    debug!(
        "Chat completion: finish_reason={:?}, {} chars text, {} tool call(s)",
        choice.finish_reason,
        choice.message.content.as_ref().map_or(0, |s| s.len()),
        choice.message.tool_calls.as_ref().map_or(0, |t| t.len()),
    );

    let calls: Vec<ToolCall> = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(i, call)| {
            let id = call
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| synthesize_call_id(i));
            let arguments = normalize_arguments(&call.function.name, call.function.arguments);
            ToolCall::new(id, call.function.name, arguments)
        })
        .collect();

    if calls.is_empty() {
        BackendResponse::text(choice.message.content.unwrap_or_default(), usage)
    } else {
        BackendResponse::tool_calls(choice.message.content, calls, usage)
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// HTTP client for one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct ChatClient {
    vendor: &'static str,
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    headers: Vec<(String, String)>,
    timeout: Duration,
}

impl ChatClient {
    pub fn new(
        vendor: &'static str,
        base_url: impl Into<String>,
        api_key: Option<String>,
        headers: Vec<(String, String)>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            vendor,
            client: http::build_client(timeout)?,
            base_url: base_url.into(),
            api_key,
            headers,
            timeout,
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    /// POST `chat/completions` and parse the reply.
    pub async fn chat(&self, body: &ChatRequest) -> Result<BackendResponse, BackendError> {
        debug!(
            "{} request: model={}, messages={}, tools={}, max_tokens={}",
            self.vendor,
            body.model,
            body.messages.len(),
            body.tools.as_ref().map_or(0, |t| t.len()),
            body.max_tokens,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let request = self
            .authorize(self.client.post(self.endpoint("chat/completions")))
            .json(body);
        let text = http::execute(self.vendor, request, self.timeout).await?;
        let response = parse_chat_response(&text);
        debug!(
            "Token usage: input={}, output={}",
            response.usage.input_tokens, response.usage.output_tokens
        );
        Ok(response)
    }

    /// GET a path relative to the base URL, returning the body.
    pub async fn get(&self, path: &str) -> Result<String, BackendError> {
        let request = self.authorize(self.client.get(self.endpoint(path)));
        http::execute(self.vendor, request, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolOutcome;
    use crate::backend::bundled_tool_results;
    use serde_json::json;

    #[test]
    fn history_maps_to_chat_messages() {
        let call = ToolCall::new("call_1", "clock", json!({"tz": "UTC"}));
        let history = vec![
            Message::user("what time is it?"),
            Message::assistant_blocks(vec![
                ContentBlock::text("Checking."),
                ContentBlock::tool_use(&call),
            ]),
            Message::tool_result("call_1", "12:00"),
            Message::assistant_text("It is noon."),
        ];
        let wire = to_wire_messages(&history, "be brief");

        assert_eq!(wire.len(), 5);
        assert_eq!(wire[0].role, WireRole::System);
        assert_eq!(wire[1].content.as_deref(), Some("what time is it?"));

        let calls = wire[2].tool_calls.as_ref().unwrap();
        assert_eq!(wire[2].content.as_deref(), Some("Checking."));
        assert_eq!(calls[0].id.as_deref(), Some("call_1"));
        // Arguments go out as a JSON string.
        let args = calls[0].function.arguments.as_str().unwrap();
        assert_eq!(serde_json::from_str::<Value>(args).unwrap(), json!({"tz": "UTC"}));

        assert_eq!(wire[3].role, WireRole::Tool);
        assert_eq!(wire[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(wire[4].role, WireRole::Assistant);
    }

    #[test]
    fn bundled_results_fan_out_per_call() {
        let results = bundled_tool_results(&[
            ToolOutcome {
                call_id: "a".into(),
                name: "x".into(),
                result: "1".into(),
                is_error: false,
            },
            ToolOutcome {
                call_id: "b".into(),
                name: "y".into(),
                result: "2".into(),
                is_error: false,
            },
        ]);
        let wire = to_wire_messages(&results.into_messages(), "");
        let ids: Vec<_> = wire.iter().map(|m| m.tool_call_id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn system_prompt_omitted_when_empty() {
        let wire = to_wire_messages(&[Message::user("hi")], "");
        assert_eq!(wire.len(), 1);
        let body = serde_json::to_value(&wire[0]).unwrap();
        assert!(body.get("tool_calls").is_none());
    }

    #[test]
    fn parses_text_response_with_usage() {
        let body = r#"{
            "choices": [{"message": {"content": "Hello!"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let response = parse_chat_response(body);
        assert_eq!(response.final_text(), Some("Hello!"));
        assert_eq!(response.usage, Usage::new(12, 3));
    }

    #[test]
    fn parses_string_and_object_arguments() {
        let body = r#"{
            "choices": [{"message": {"content": null, "tool_calls": [
                {"id": "c1", "type": "function", "function": {"name": "add", "arguments": "{\"a\":1,\"b\":2}"}},
                {"function": {"name": "clock", "arguments": {"tz": "UTC"}}}
            ]}}]
        }"#;
        let response = parse_chat_response(body);
        let calls = response.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].arguments, json!({"a": 1, "b": 2}));
        assert!(calls[1].id.starts_with("call_"));
        assert_eq!(calls[1].arguments, json!({"tz": "UTC"}));
    }

    #[test]
    fn bad_arguments_become_empty_object() {
        assert_eq!(normalize_arguments("t", json!("not json")), json!({}));
        assert_eq!(normalize_arguments("t", json!("")), json!({}));
        assert_eq!(normalize_arguments("t", json!([1, 2])), json!({}));
    }

    #[test]
    fn error_field_becomes_marked_text() {
        let response = parse_chat_response(r#"{"error": {"message": "model not found"}}"#);
        assert!(response.is_error_marked());
        assert!(response.final_text().unwrap().contains("model not found"));
    }

    #[test]
    fn garbage_body_degrades_to_text() {
        let response = parse_chat_response("<html>502</html>");
        assert_eq!(response.final_text(), Some("<html>502</html>"));
    }

    #[test]
    fn endpoint_joins_paths() {
        let client = ChatClient::new(
            "test",
            "http://localhost:11434/v1/",
            None,
            vec![],
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            client.endpoint("chat/completions"),
            "http://localhost:11434/v1/chat/completions"
        );
    }
}
