//! Local inference over an OpenAI-compatible server (Ollama, llama.cpp,
//! vLLM, LM Studio).
//!
//! Same wire format as [`OpenAiBackend`](super::OpenAiBackend), with no API
//! key by default and a long timeout for slow local hardware. Liveness is a
//! `GET /models` rather than a generation.

use super::wire::{self, ChatClient, ChatRequest};
use super::{Backend, BackendResponse, ToolResultMessages};
use crate::error::BackendError;
use crate::{Message, ToolDef, ToolOutcome};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

pub const LOCAL_BASE_URL: &str = "http://localhost:11434/v1";
pub const DEFAULT_LOCAL_MODEL: &str = "llama3.1";

#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub temperature: Option<f32>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_url: LOCAL_BASE_URL.into(),
            model: DEFAULT_LOCAL_MODEL.into(),
            api_key: None,
            timeout: Duration::from_secs(600),
            temperature: None,
        }
    }
}

impl LocalConfig {
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
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

pub struct LocalBackend {
    config: LocalConfig,
    client: ChatClient,
}

impl LocalBackend {
    pub fn new(config: LocalConfig) -> Result<Self, BackendError> {
        let client = ChatClient::new(
            "local",
            config.base_url.clone(),
            config.api_key.clone(),
            Vec::new(),
            config.timeout,
        )?;
        info!("Local backend: model={}, base={}", config.model, config.base_url);
        Ok(Self { config, client })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn build_request(
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
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        "local"
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

    async fn ping(&self) -> Result<bool, BackendError> {
        let body = self.client.get("models").await?;
        debug!("Local server lists models: {} bytes", body.len());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_ollama() {
        let config = LocalConfig::default();
        assert_eq!(config.base_url, "http://localhost:11434/v1");
        assert!(config.api_key.is_none());
        assert!(config.timeout >= Duration::from_secs(300));
    }

    #[test]
    fn builds_without_key() {
        let backend = LocalBackend::new(LocalConfig::default().with_model("qwen2.5")).unwrap();
        assert_eq!(backend.model(), "qwen2.5");
        let body = backend.build_request(&[Message::user("hi")], "", &[], 32);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "qwen2.5");
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ping_fails_when_server_is_down() {
        // Port 9 (discard) is essentially never serving HTTP locally.
        let backend = LocalBackend::new(
            LocalConfig::default()
                .with_base_url("http://127.0.0.1:9/v1")
                .with_timeout(Duration::from_secs(2)),
        )
        .unwrap();
        assert!(backend.ping().await.is_err());
    }
}
