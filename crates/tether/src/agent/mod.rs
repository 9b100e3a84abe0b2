//! Agent runtime: the [`Conversation`] loop and its supporting modules.
//!
//! - [`conversation::Conversation`] drives one chat through the bounded
//!   tool-calling loop. Start here.
//! - [`config::ConversationConfig`] sets the system prompt, turn and token
//!   ceilings, history length, retry policy and dispatch settings.
//! - [`dispatch`] runs a batch of tool calls concurrently and returns the
//!   outcomes in call order.
//! - [`events`] holds the [`EventHandler`] trait and the
//!   [`ConversationEvent`] enum for observing the loop, with
//!   [`LoggingHandler`], [`CompositeEventHandler`] and [`FnEventHandler`].

pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod events;

pub use config::{ConversationConfig, DispatchConfig};
pub use conversation::{Conversation, ConversationState, ConversationStats};
pub use dispatch::dispatch_tool_calls;
pub use events::{
    CompositeEventHandler, ConversationEvent, EventHandler, FnEventHandler, LoggingHandler,
    NoopHandler,
};
