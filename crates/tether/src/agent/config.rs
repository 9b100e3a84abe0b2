//! Configuration for a [`Conversation`](super::conversation::Conversation).
//!
//! ```ignore
//! let config = ConversationConfig::new("You are helpful.")
//!     .with_max_tool_turns(10)
//!     .with_max_tokens(2048)
//!     .with_retry(RetryPolicy::default().with_max_attempts(3))
//!     .with_dispatch(DispatchConfig::default().with_max_workers(8));
//! ```

use crate::api::retry::RetryPolicy;

pub const DEFAULT_MAX_TOOL_TURNS: u32 = 25;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_MAX_HISTORY: usize = 100;
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// How a batch of tool calls from one model turn is executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Upper bound on calls running at once. Default: 4.
    pub max_workers: usize,
    /// Run calls one after another in the order the model issued them.
    pub sequential: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            sequential: false,
        }
    }
}

impl DispatchConfig {
    /// Clamped to at least one worker.
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn with_sequential(mut self, sequential: bool) -> Self {
        self.sequential = sequential;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ConversationConfig {
    pub system_prompt: String,
    /// Tool turns allowed per `send` before the loop gives up. Default: 25.
    pub max_tool_turns: u32,
    /// Output token ceiling passed to every backend call. Default: 4096.
    pub max_tokens: u32,
    /// History length that triggers trimming at the end of a `send`.
    /// Default: 100.
    pub max_history: usize,
    pub retry: RetryPolicy,
    pub dispatch: DispatchConfig,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self::new("")
    }
}

impl ConversationConfig {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            max_tool_turns: DEFAULT_MAX_TOOL_TURNS,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_history: DEFAULT_MAX_HISTORY,
            retry: RetryPolicy::default(),
            dispatch: DispatchConfig::default(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_tool_turns(mut self, turns: u32) -> Self {
        self.max_tool_turns = turns;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_max_history(mut self, messages: usize) -> Self {
        self.max_history = messages;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }
}
