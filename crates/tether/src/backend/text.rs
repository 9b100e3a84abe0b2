//! Text-only decorator for models without tool support.

use super::{Backend, BackendResponse, ToolResultMessages};
use crate::error::BackendError;
use crate::{Message, ToolDef, ToolOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Wraps any backend and never advertises tools to it.
///
/// If the inner model emits tool calls anyway, they are rendered as text so
/// the loop always sees a final answer.
pub struct TextOnlyBackend {
    inner: Arc<dyn Backend>,
    name: String,
}

impl TextOnlyBackend {
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        let name = format!("{}+text", inner.name());
        Self { inner, name }
    }

    pub fn inner(&self) -> &Arc<dyn Backend> {
        &self.inner
    }
}

fn render_calls_as_text(response: &BackendResponse) -> String {
    let mut lines = Vec::new();
    let narration = response.narration();
    if !narration.is_empty() {
        lines.push(narration);
    }
    for call in response.calls() {
        lines.push(format!("[tool call not available: {}({})]", call.name, call.arguments));
    }
    lines.join("\n")
}

#[async_trait]
impl Backend for TextOnlyBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        messages: &[Message],
        system_prompt: &str,
        tools: &[ToolDef],
        max_tokens: u32,
    ) -> Result<BackendResponse, BackendError> {
        if !tools.is_empty() {
            debug!("Text-only mode: withholding {} tool(s)", tools.len());
        }
        let response = self.inner.send(messages, system_prompt, &[], max_tokens).await?;
        if response.has_tool_calls() {
            warn!(
                "{} emitted {} tool call(s) in text-only mode; rendering as text",
                self.inner.name(),
                response.calls().len()
            );
            return Ok(BackendResponse::text(
                render_calls_as_text(&response),
                response.usage,
            ));
        }
        Ok(response)
    }

    fn format_user_message(&self, text: &str) -> Message {
        self.inner.format_user_message(text)
    }

    fn format_assistant_message(&self, response: &BackendResponse) -> Message {
        Message::assistant_text(response.narration())
    }

    fn format_tool_results(&self, results: &[ToolOutcome]) -> ToolResultMessages {
        let text = results
            .iter()
            .map(|r| format!("Result of {}: {}", r.name, r.result))
            .collect::<Vec<_>>()
            .join("\n\n");
        ToolResultMessages::Single(Message::tool_text(text))
    }

    async fn ping(&self) -> Result<bool, BackendError> {
        self.inner.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Usage;
    use crate::ToolCall;
    use serde_json::json;
    use std::sync::Mutex;

    /// Always answers with a tool call and records the tools it was offered.
    struct Eager {
        offered: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Backend for Eager {
        fn name(&self) -> &str {
            "eager"
        }

        async fn send(
            &self,
            _messages: &[Message],
            _system_prompt: &str,
            tools: &[ToolDef],
            _max_tokens: u32,
        ) -> Result<BackendResponse, BackendError> {
            self.offered.lock().unwrap().push(tools.len());
            Ok(BackendResponse::tool_calls(
                Some("Let me look.".into()),
                vec![ToolCall::new("c1", "search", json!({"q": "rust"}))],
                Usage::new(1, 1),
            ))
        }

        fn format_tool_results(&self, _results: &[ToolOutcome]) -> ToolResultMessages {
            ToolResultMessages::Many(vec![])
        }
    }

    #[tokio::test]
    async fn strips_tools_and_renders_calls_as_text() {
        let inner = Arc::new(Eager {
            offered: Mutex::new(vec![]),
        });
        let backend = TextOnlyBackend::new(inner.clone());
        assert_eq!(backend.name(), "eager+text");

        let tools = vec![ToolDef::new("search", "Search", json!({}))];
        let response = backend
            .send(&[Message::user("hi")], "", &tools, 64)
            .await
            .unwrap();

        assert_eq!(*inner.offered.lock().unwrap(), vec![0]);
        let text = response.final_text().unwrap();
        assert!(text.starts_with("Let me look."));
        assert!(text.contains("search"));
        assert_eq!(response.usage, Usage::new(1, 1));
    }

    #[test]
    fn tool_results_render_as_text() {
        let inner = Arc::new(Eager {
            offered: Mutex::new(vec![]),
        });
        let backend = TextOnlyBackend::new(inner);
        let call = ToolCall::new("c1", "search", json!({}));
        let messages = backend
            .format_tool_results(&[ToolOutcome::new(&call, "found it", false)])
            .into_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "Result of search: found it");
    }
}
