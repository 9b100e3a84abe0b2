//! The bounded tool-calling loop.
//!
//! A [`Conversation`] owns the message history for one chat. Each
//! [`send`](Conversation::send) appends the user's message, then alternates
//! between the backend and the tool dispatcher until the model answers in
//! plain text or the tool-turn ceiling is hit:
//!
//! ```text
//! AwaitingUser ─▶ CallingBackend ─┬─▶ DispatchingTools ─▶ CallingBackend ...
//!                                 └─▶ Finalizing ─▶ AwaitingUser
//! ```
//!
//! The loop never branches on which vendor is behind the [`Backend`]; every
//! reply is either final text or a non-empty batch of tool calls.

use super::config::ConversationConfig;
use super::dispatch::dispatch_tool_calls;
use super::events::{ConversationEvent, EventHandler, NoopHandler};
use crate::backend::{Backend, BackendResponse, ResponseBody};
use crate::error::BackendError;
use crate::tools::core::ToolRegistry;
use crate::tools::router::ToolRouter;
use crate::{Message, ToolCall, ToolDef, ToolOutcome};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the loop is. Reported to observers through
/// [`ConversationEvent::StateChanged`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConversationState {
    AwaitingUser,
    CallingBackend,
    DispatchingTools,
    Finalizing,
}

/// Running totals across every `send` since construction or the last
/// [`reset`](Conversation::reset).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationStats {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Tool calls the model requested, including any left unexecuted at the
    /// turn limit.
    pub total_tool_calls: u64,
    /// Backend calls made.
    pub total_turns: u64,
}

impl ConversationStats {
    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }
}

/// One chat with one backend.
///
/// `send` takes `&mut self`, so a conversation has at most one turn in
/// flight. Share the backend and registry across conversations through
/// their `Arc`s instead.
///
/// ```ignore
/// let mut conversation = Conversation::new(backend, registry, config)
///     .with_router(ToolRouter::default().with_builtin_groups())
///     .with_event_handler(Arc::new(LoggingHandler));
///
/// let answer = conversation.send("What's 6 times 7?").await?;
/// ```
pub struct Conversation {
    backend: Arc<dyn Backend>,
    registry: Arc<ToolRegistry>,
    config: ConversationConfig,
    router: Option<ToolRouter>,
    handler: Arc<dyn EventHandler>,
    messages: Vec<Message>,
    stats: ConversationStats,
    state: ConversationState,
}

impl Conversation {
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<ToolRegistry>,
        config: ConversationConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            config,
            router: None,
            handler: Arc::new(NoopHandler),
            messages: Vec::new(),
            stats: ConversationStats::default(),
            state: ConversationState::AwaitingUser,
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Narrow the advertised tools per message. Without a router the whole
    /// registry is offered on every call.
    pub fn with_router(mut self, router: ToolRouter) -> Self {
        self.router = Some(router);
        self
    }

    /// Start from an existing history, e.g. one restored by the caller.
    pub fn with_history(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn stats(&self) -> &ConversationStats {
        &self.stats
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Forget the history and zero the stats.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.stats = ConversationStats::default();
        self.set_state(ConversationState::AwaitingUser);
    }

    /// Handle one user message and return the model's final text.
    ///
    /// Exactly one user message is appended. On success the history ends
    /// with an assistant text message holding the returned string. If the
    /// model keeps calling tools past `max_tool_turns`, the pending batch is
    /// answered with "not executed" results and an explanatory string that
    /// names the limit is returned instead.
    ///
    /// Backend errors that survive the retry policy are returned; the user
    /// message and any completed tool turns stay in the history.
    pub async fn send(&mut self, user_input: &str) -> Result<String, BackendError> {
        let user = self.backend.format_user_message(user_input);
        self.messages.push(user);
        info!(
            "Conversation turn on {}: {} message(s) in history",
            self.backend.name(),
            self.messages.len()
        );

        let tools = self.route_tools(user_input);
        let mut turn: u32 = 0;
        let mut tool_turns: u32 = 0;

        loop {
            turn += 1;
            self.set_state(ConversationState::CallingBackend);
            self.handler.on_event(&ConversationEvent::TurnStart {
                turn,
                tool_turns,
                max_tool_turns: self.config.max_tool_turns,
                tools_offered: tools.len(),
            });

            let response = match self.call_backend(&tools).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Backend {} failed on turn {turn}: {e}", self.backend.name());
                    self.set_state(ConversationState::AwaitingUser);
                    return Err(e);
                }
            };
            self.record_usage(&response);

            let calls = match response.body() {
                ResponseBody::Text(text) => {
                    let text = text.clone();
                    return Ok(self.finish(&response, text, turn));
                }
                ResponseBody::ToolCalls(calls) => calls.clone(),
            };

            let narration = response.narration();
            if !narration.is_empty() {
                self.handler.on_event(&ConversationEvent::Text(&narration));
            }
            self.messages.push(self.backend.format_assistant_message(&response));
            tool_turns += 1;
            self.stats.total_tool_calls += calls.len() as u64;
            self.handler.on_event(&ConversationEvent::ToolCallsReceived {
                turn,
                count: calls.len(),
            });

            if tool_turns > self.config.max_tool_turns {
                return Ok(self.stop_at_turn_limit(&calls, turn));
            }

            self.set_state(ConversationState::DispatchingTools);
            let outcomes =
                dispatch_tool_calls(&self.registry, &calls, &self.config.dispatch).await;
            for outcome in &outcomes {
                self.handler.on_event(&ConversationEvent::ToolResult {
                    name: &outcome.name,
                    call_id: &outcome.call_id,
                    result: &outcome.result,
                    is_error: outcome.is_error,
                });
            }
            let results = self.backend.format_tool_results(&outcomes).into_messages();
            self.messages.extend(results);
        }
    }

    fn route_tools(&self, user_input: &str) -> Vec<ToolDef> {
        match &self.router {
            Some(router) => {
                let defs = router.select(user_input, &self.registry);
                debug!(
                    "Router offered {} of {} tool(s)",
                    defs.len(),
                    self.registry.len()
                );
                defs
            }
            None => self.registry.definitions(),
        }
    }

    async fn call_backend(&self, tools: &[ToolDef]) -> Result<BackendResponse, BackendError> {
        let backend = &self.backend;
        let messages = &self.messages;
        let system_prompt = self.config.system_prompt.as_str();
        let max_tokens = self.config.max_tokens;
        let handler = &self.handler;

        self.config
            .retry
            .run(
                move || backend.send(messages, system_prompt, tools, max_tokens),
                |notice| {
                    let error = notice.error.to_string();
                    handler.on_event(&ConversationEvent::RetryScheduled {
                        attempt: notice.attempt,
                        max_attempts: notice.max_attempts,
                        class: notice.class,
                        delay: notice.delay,
                        error: &error,
                    });
                },
            )
            .await
    }

    fn record_usage(&mut self, response: &BackendResponse) {
        self.stats.total_turns += 1;
        self.stats.total_input_tokens += response.usage.input_tokens;
        self.stats.total_output_tokens += response.usage.output_tokens;
        self.handler.on_event(&ConversationEvent::TokenUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        });
    }

    fn finish(&mut self, response: &BackendResponse, text: String, turn: u32) -> String {
        self.set_state(ConversationState::Finalizing);
        self.messages.push(self.backend.format_assistant_message(response));
        self.trim_history();
        self.handler
            .on_event(&ConversationEvent::Finished { text: &text, turns: turn });
        self.set_state(ConversationState::AwaitingUser);
        text
    }

    /// Answer the unexecuted batch so every call keeps a result, then close
    /// the turn with an explanation.
    fn stop_at_turn_limit(&mut self, calls: &[ToolCall], turn: u32) -> String {
        let max = self.config.max_tool_turns;
        warn!("Tool-turn limit of {max} reached; skipping {} call(s)", calls.len());
        self.handler
            .on_event(&ConversationEvent::TurnLimitReached { max_tool_turns: max });

        self.set_state(ConversationState::Finalizing);
        let skipped: Vec<ToolOutcome> = calls
            .iter()
            .map(|call| {
                ToolOutcome::new(
                    call,
                    format!("Error: not executed, tool-turn limit ({max}) reached"),
                    true,
                )
            })
            .collect();
        let results = self.backend.format_tool_results(&skipped).into_messages();
        self.messages.extend(results);

        let text = format!(
            "[turn limit reached] Stopped after {max} tool turn(s) without a final answer. \
             Ask again to continue from here."
        );
        self.messages.push(Message::assistant_text(text.clone()));
        self.trim_history();
        self.handler
            .on_event(&ConversationEvent::Finished { text: &text, turns: turn });
        self.set_state(ConversationState::AwaitingUser);
        text
    }

    /// Drop whole turns from the front until the history fits in
    /// `max_history`. The newest turn is always kept intact, so a tool call
    /// is never separated from its result.
    fn trim_history(&mut self) {
        let cut = trim_point(&self.messages, self.config.max_history);
        if cut == 0 {
            return;
        }
        self.messages.drain(..cut);
        debug!("History trimmed by {cut} message(s)");
        self.handler.on_event(&ConversationEvent::HistoryTrimmed {
            dropped: cut,
            remaining: self.messages.len(),
        });
    }

    fn set_state(&mut self, state: ConversationState) {
        if self.state != state {
            self.state = state;
            self.handler.on_event(&ConversationEvent::StateChanged(state));
        }
    }
}

/// Number of leading messages to drop so that at most `max` remain, cutting
/// only at turn starts. Returns 0 when nothing needs to go or no turn
/// boundary exists past the first message.
fn trim_point(messages: &[Message], max: usize) -> usize {
    if messages.len() <= max {
        return 0;
    }
    let boundaries: Vec<usize> = messages
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, m)| m.is_turn_start())
        .map(|(i, _)| i)
        .collect();
    boundaries
        .iter()
        .copied()
        .find(|&i| messages.len() - i <= max)
        .or_else(|| boundaries.last().copied())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContentBlock;
    use serde_json::json;

    fn tool_turn(prompt: &str, id: &str) -> Vec<Message> {
        vec![
            Message::user(prompt),
            Message::assistant_blocks(vec![ContentBlock::tool_use(&ToolCall::new(
                id,
                "calculate",
                json!({}),
            ))]),
            Message::tool_result(id, "42"),
            Message::assistant_text("done"),
        ]
    }

    #[test]
    fn trim_point_keeps_short_history() {
        let messages = tool_turn("q", "c1");
        assert_eq!(trim_point(&messages, 100), 0);
        assert_eq!(trim_point(&messages, 4), 0);
    }

    #[test]
    fn trim_point_cuts_at_turn_starts_only() {
        let mut messages = tool_turn("one", "c1");
        messages.extend(tool_turn("two", "c2"));
        messages.extend(tool_turn("three", "c3"));

        // 12 messages, room for 6: drop the first two turns (8 messages)
        // because cutting after the first turn would still leave 8.
        assert_eq!(trim_point(&messages, 6), 8);
        assert_eq!(trim_point(&messages, 8), 4);
    }

    #[test]
    fn trim_point_never_splits_the_newest_turn() {
        let mut messages = tool_turn("old", "c1");
        messages.extend(tool_turn("new", "c2"));
        // Limit smaller than one turn: drop everything before the newest
        // turn start and keep that turn whole.
        assert_eq!(trim_point(&messages, 2), 4);
        assert!(messages[4].is_turn_start());
    }

    #[test]
    fn trim_point_ignores_tool_results_in_user_role() {
        // A single long turn has no boundary past index 0.
        let mut messages = vec![Message::user("go")];
        for i in 0..10 {
            let id = format!("c{i}");
            messages.push(Message::assistant_blocks(vec![ContentBlock::tool_use(
                &ToolCall::new(&id, "calculate", json!({})),
            )]));
            messages.push(Message::tool_result(&id, "ok"));
        }
        assert_eq!(trim_point(&messages, 5), 0);
    }

    #[test]
    fn stats_total_tokens() {
        let stats = ConversationStats {
            total_input_tokens: 10,
            total_output_tokens: 5,
            ..Default::default()
        };
        assert_eq!(stats.total_tokens(), 15);
    }
}
