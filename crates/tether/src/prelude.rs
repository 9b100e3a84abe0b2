//! Convenience re-exports for common `tether` types.
//!
//! Meant to be glob-imported when wiring up a conversation:
//!
//! ```ignore
//! use tether::prelude::*;
//! ```
//!
//! Wire-format types and adapter internals are left out; import those from
//! their modules directly when needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{
    ContentBlock, Message, MessageContent, MessageRole, ToolCall, ToolDef, ToolOutcome,
    json_schema_for,
};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{BackendError, ToolError};

// ── Backends ────────────────────────────────────────────────────────
pub use crate::backend::{
    AnthropicBackend, AnthropicConfig, Backend, BackendKind, BackendResponse, BackendSettings,
    CliBackend, CliConfig, LocalBackend, LocalConfig, OpenAiBackend, OpenAiConfig, ResponseBody,
    TextOnlyBackend, ToolResultMessages, Usage, build_backend,
};

// ── Agent runtime ───────────────────────────────────────────────────
pub use crate::agent::{
    CompositeEventHandler, Conversation, ConversationConfig, ConversationEvent,
    ConversationState, ConversationStats, DispatchConfig, EventHandler, FnEventHandler,
    LoggingHandler, NoopHandler, dispatch_tool_calls,
};
pub use crate::api::{ErrorClass, RetryPolicy};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::builtin::{calculator_tool, clock_tool};
pub use crate::tools::{
    FnTool, KeywordGroup, Tool, ToolFuture, ToolRegistry, ToolRouter, ToolStats, parse_tool_args,
};
