//! Tool abstractions: the [`Tool`] trait, the [`ToolRegistry`] that
//! dispatches calls by name, per-tool statistics, and the keyword
//! [`ToolRouter`] that narrows the advertised tool set per turn.
//!
//! # Defining tools
//!
//! - **[`FnTool`]**: closure-based, arguments parsed into a typed struct.
//! - **`impl Tool`**: a struct with [`Tool::definition()`] and
//!   [`Tool::execute()`], for tools that hold state.
//!
//! # Submodules
//!
//! - [`core`]: [`Tool`], [`ToolRegistry`], [`FnTool`], dispatch helpers.
//! - [`stats`]: lock-free [`ToolStats`] counters.
//! - [`router`]: [`ToolRouter`] and [`KeywordGroup`].
//! - [`builtin`]: small bundled tools (`current_time`, `calculate`).

pub mod builtin;
pub mod core;
pub mod names;
pub mod router;
pub mod stats;

pub use core::{
    DEFAULT_CATEGORY, DEFAULT_MAX_RESULT_BYTES, DispatchOutcome, FnTool, Tool, ToolFuture,
    ToolRegistry, parse_tool_args, truncate_result, validate_tool_arguments,
};
pub use router::{KeywordGroup, ToolRouter};
pub use stats::ToolStats;
