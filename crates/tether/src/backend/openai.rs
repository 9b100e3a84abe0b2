//! OpenAI chat completions adapter (also works for OpenRouter and other
//! hosted OpenAI-compatible APIs).

use super::wire::{self, ChatClient, ChatRequest};
use super::{Backend, BackendResponse, ToolResultMessages};
use crate::error::BackendError;
use crate::{Message, ToolDef, ToolOutcome};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
    pub temperature: Option<f32>,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_OPENAI_MODEL.into(),
            base_url: OPENAI_BASE_URL.into(),
            timeout: Duration::from_secs(120),
            temperature: None,
            headers: Vec::new(),
        }
    }

    /// Read `OPENAI_API_KEY`, plus optional `OPENAI_MODEL` and
    /// `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self, BackendError> {
        let key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| BackendError::Config("OPENAI_API_KEY not set".into()))?;
        let mut config = Self::new(key);
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            config.model = model;
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.base_url = url;
        }
        Ok(config)
    }

    /// OpenRouter endpoint with its attribution headers.
    pub fn openrouter(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::new(api_key)
            .with_model(model)
            .with_base_url(OPENROUTER_BASE_URL)
            .with_header("HTTP-Referer", "https://github.com/tether-rs/tether")
            .with_header("X-Title", "tether")
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

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Chat completions with native function calling.
///
/// Tool results go back as one `role: "tool"` message per result.
pub struct OpenAiBackend {
    config: OpenAiConfig,
    client: ChatClient,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Result<Self, BackendError> {
        if config.api_key.trim().is_empty() {
            return Err(BackendError::Config("OpenAI API key is empty".into()));
        }
        let client = ChatClient::new(
            "openai",
            config.base_url.clone(),
            Some(config.api_key.clone()),
            config.headers.clone(),
            config.timeout,
        )?;
        info!("OpenAI backend: model={}, base={}", config.model, config.base_url);
        Ok(Self { config, client })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    pub(crate) fn build_request(
        &self,
        messages: &[Message],
        system_prompt: &str,
        tools: &[ToolDef],
        max_tokens: u32,
    ) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages: wire::to_wire_messages(messages, system_prompt),
            max_tokens,
            temperature: self.config.temperature,
            tools: wire::to_wire_tools(tools),
        }
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn send(
        &self,
        messages: &[Message],
        system_prompt: &str,
        tools: &[ToolDef],
        max_tokens: u32,
    ) -> Result<BackendResponse, BackendError> {
        let body = self.build_request(messages, system_prompt, tools, max_tokens);
        self.client.chat(&body).await
    }

    fn format_tool_results(&self, results: &[ToolOutcome]) -> ToolResultMessages {
        ToolResultMessages::Many(
            results
                .iter()
                .map(|r| Message::tool_result(r.call_id.clone(), r.result.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::wire::WireRole;
    use crate::{ContentBlock, ToolCall};
    use serde_json::json;

    fn backend() -> OpenAiBackend {
        OpenAiBackend::new(OpenAiConfig::new("sk-test").with_model("gpt-test")).unwrap()
    }

    #[test]
    fn rejects_empty_key() {
        assert!(matches!(
            OpenAiBackend::new(OpenAiConfig::new("  ")),
            Err(BackendError::Config(_))
        ));
    }

    #[test]
    fn request_body_shape() {
        let tools = vec![ToolDef::new(
            "clock",
            "Current time",
            json!({"type": "object", "properties": {}}),
        )];
        let body = backend().build_request(&[Message::user("hi")], "sys", &tools, 256);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-test");
        assert_eq!(json["max_tokens"], 256);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["name"], "clock");
        assert!(json.get("temperature").is_none());

        let no_tools = backend().build_request(&[Message::user("hi")], "", &[], 16);
        assert!(serde_json::to_value(&no_tools).unwrap().get("tools").is_none());
    }

    #[test]
    fn tool_results_are_one_message_each() {
        let call_a = ToolCall::new("a", "x", json!({}));
        let call_b = ToolCall::new("b", "y", json!({}));
        let messages = backend()
            .format_tool_results(&[
                ToolOutcome::new(&call_a, "1", false),
                ToolOutcome::new(&call_b, "2", false),
            ])
            .into_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content.tool_results(), vec![("b", "2", false)]);
    }

    #[test]
    fn assistant_turn_round_trips_call_ids() {
        let backend = backend();
        let response = wire::parse_chat_response(
            r#"{"choices":[{"message":{"content":"one sec","tool_calls":[
                {"id":"call_9","type":"function","function":{"name":"clock","arguments":"{}"}}
            ]}}]}"#,
        );
        let stored = backend.format_assistant_message(&response);
        assert_eq!(
            stored.content,
            crate::MessageContent::Blocks(vec![
                ContentBlock::text("one sec"),
                ContentBlock::tool_use(&ToolCall::new("call_9", "clock", json!({}))),
            ])
        );

        let request = backend.build_request(&[stored], "", &[], 0);
        let assistant = &request.messages[0];
        assert_eq!(assistant.role, WireRole::Assistant);
        assert_eq!(
            assistant.tool_calls.as_ref().unwrap()[0].id.as_deref(),
            Some("call_9")
        );
    }

    #[test]
    fn openrouter_preset() {
        let config = OpenAiConfig::openrouter("key", "anthropic/claude-sonnet-4");
        assert_eq!(config.base_url, OPENROUTER_BASE_URL);
        assert!(config.headers.iter().any(|(k, _)| k == "X-Title"));
    }
}
