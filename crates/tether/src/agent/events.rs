//! Events and handlers for the [`Conversation`](super::conversation::Conversation) loop.
//!
//! The loop reports its lifecycle through [`ConversationEvent`] variants, from
//! turn start through tool execution to the final answer. Callers implement
//! [`EventHandler`] to observe them for logging, progress output or metrics.
//! Handlers observe only; they cannot steer the loop.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget conversations |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use super::conversation::ConversationState;
use crate::api::retry::ErrorClass;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by a conversation while it handles one `send`.
#[derive(Debug)]
pub enum ConversationEvent<'a> {
    /// The loop moved to a new state.
    StateChanged(ConversationState),
    /// A backend call is about to be made.
    TurnStart {
        /// Backend calls so far in this `send`, including this one.
        turn: u32,
        /// Tool turns completed so far in this `send`.
        tool_turns: u32,
        max_tool_turns: u32,
        /// Number of tool definitions advertised for this call.
        tools_offered: usize,
    },
    /// Token usage reported by the backend for one call.
    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Narration the model produced alongside tool calls.
    Text(&'a str),
    /// The model requested a batch of tool calls.
    ToolCallsReceived { turn: u32, count: usize },
    /// One tool call of the batch finished.
    ToolResult {
        name: &'a str,
        call_id: &'a str,
        result: &'a str,
        is_error: bool,
    },
    /// A backend call failed and will be retried after `delay`.
    RetryScheduled {
        attempt: u32,
        max_attempts: u32,
        class: ErrorClass,
        delay: Duration,
        error: &'a str,
    },
    /// The tool-turn ceiling was hit; the pending batch was not executed.
    TurnLimitReached { max_tool_turns: u32 },
    /// Old messages were dropped from the front of the history.
    HistoryTrimmed { dropped: usize, remaining: usize },
    /// The model answered in plain text.
    Finished { text: &'a str, turns: u32 },
}

impl ConversationEvent<'_> {
    /// Total tokens of a `TokenUsage` event, `None` for every other variant.
    pub fn total_tokens(&self) -> Option<u64> {
        match self {
            Self::TokenUsage {
                input_tokens,
                output_tokens,
            } => Some(input_tokens + output_tokens),
            _ => None,
        }
    }
}

// ── Handlers ───────────────────────────────────────────────────────

/// Observer of conversation events.
///
/// Called synchronously from the loop, so implementations should return
/// quickly.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ConversationEvent<'_>);
}

/// Ignores every event.
pub struct NoopHandler;

impl EventHandler for NoopHandler {
    fn on_event(&self, _event: &ConversationEvent<'_>) {}
}

/// Adapts a closure into an [`EventHandler`].
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let ConversationEvent::ToolResult { name, .. } = event {
///         eprintln!("ran {name}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&ConversationEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&ConversationEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&ConversationEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &ConversationEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each inner handler in registration order.
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add `handler` only when `condition` holds, keeping the builder chain
    /// intact.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &ConversationEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs every event through `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &ConversationEvent<'_>) {
        match event {
            ConversationEvent::StateChanged(state) => {
                trace!("Conversation state: {state:?}");
            }
            ConversationEvent::TurnStart {
                turn,
                tool_turns,
                max_tool_turns,
                tools_offered,
            } => {
                info!(
                    "[turn {turn}] tool turns {tool_turns}/{max_tool_turns}, {tools_offered} tool(s) offered"
                );
            }
            ConversationEvent::TokenUsage {
                input_tokens,
                output_tokens,
            } => {
                debug!("Tokens: input={input_tokens}, output={output_tokens}");
            }
            ConversationEvent::Text(text) => {
                let preview: String = text.chars().take(200).collect();
                debug!(
                    "Model narration: {preview}{}",
                    if text.len() > 200 { "..." } else { "" }
                );
            }
            ConversationEvent::ToolCallsReceived { turn, count } => {
                debug!("{count} tool call(s) in turn {turn}");
            }
            ConversationEvent::ToolResult {
                name,
                result,
                is_error,
                ..
            } => {
                if *is_error {
                    warn!("Tool {name} failed: {}", crate::tools::core::preview(result, 200));
                } else {
                    debug!("Tool {name} result: {} bytes", result.len());
                }
            }
            ConversationEvent::RetryScheduled {
                attempt,
                max_attempts,
                class,
                delay,
                error,
            } => {
                warn!(
                    "{class:?} backend error (attempt {attempt}/{max_attempts}), retrying in {:.1}s: {error}",
                    delay.as_secs_f64()
                );
            }
            ConversationEvent::TurnLimitReached { max_tool_turns } => {
                warn!("Conversation hit the tool-turn limit ({max_tool_turns})");
            }
            ConversationEvent::HistoryTrimmed { dropped, remaining } => {
                info!("Trimmed {dropped} message(s) from history, {remaining} remain");
            }
            ConversationEvent::Finished { text, turns } => {
                info!("Answered after {turns} turn(s), {} chars", text.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn total_tokens_only_for_usage() {
        let usage = ConversationEvent::TokenUsage {
            input_tokens: 120,
            output_tokens: 30,
        };
        assert_eq!(usage.total_tokens(), Some(150));
        assert_eq!(
            ConversationEvent::TurnLimitReached { max_tool_turns: 3 }.total_tokens(),
            None
        );
    }

    #[test]
    fn composite_calls_every_handler() {
        let count = Arc::new(AtomicUsize::new(0));
        let a = count.clone();
        let b = count.clone();
        let handler = CompositeEventHandler::new()
            .with(FnEventHandler::new(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            }))
            .with_if(false, NoopHandler)
            .with_opt(Some(FnEventHandler::new(move |_| {
                b.fetch_add(10, Ordering::SeqCst);
            })))
            .with(LoggingHandler);
        assert_eq!(handler.len(), 3);

        handler.on_event(&ConversationEvent::Finished {
            text: "done",
            turns: 1,
        });
        assert_eq!(count.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn fn_handler_sees_borrowed_fields() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = FnEventHandler::new(move |event| {
            if let ConversationEvent::ToolResult { name, is_error, .. } = event {
                sink.lock().unwrap().push((name.to_string(), *is_error));
            }
        });
        handler.on_event(&ConversationEvent::ToolResult {
            name: "calculate",
            call_id: "c1",
            result: "42",
            is_error: false,
        });
        assert_eq!(*seen.lock().unwrap(), vec![("calculate".to_string(), false)]);
    }
}
