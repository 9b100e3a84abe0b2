//! Tool abstraction and the name-keyed registry that dispatches to it.
//!
//! The [`Tool`] trait defines what every tool provides: a static definition
//! (name, description, JSON Schema) and an async `execute` method. Tools are
//! collected into a [`ToolRegistry`] once at startup; afterwards the registry
//! is shared read-only (typically behind an `Arc`) and only its per-tool
//! statistics change.

use super::stats::{ToolStats, ToolStatsCell};
use crate::{ToolDef, ToolError};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Category assigned to tools that do not declare one.
pub const DEFAULT_CATEGORY: &str = "general";

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>>;

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool that the model can invoke.
///
/// Returning `Err` (or panicking) is fine: the registry turns either into an
/// error result the model can read and react to.
///
/// # Example
///
/// ```ignore
/// struct Weather { client: reqwest::Client }
///
/// impl Tool for Weather {
///     fn definition(&self) -> ToolDef {
///         ToolDef::from_schema::<WeatherArgs>("weather", "Current weather for a city")
///     }
///
///     fn category(&self) -> &str { "web" }
///
///     fn execute(&self, arguments: &serde_json::Value) -> ToolFuture<'_> {
///         let args = parse_tool_args::<WeatherArgs>(arguments);
///         Box::pin(async move {
///             let args = args?;
///             // ... fetch
///             Ok(format!("Sunny in {}", args.city))
///         })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The definition advertised to the backend.
    fn definition(&self) -> ToolDef;

    /// Execute the tool with the given JSON object of arguments.
    fn execute(&self, arguments: &serde_json::Value) -> ToolFuture<'_>;

    /// The tool's name (delegates to the definition).
    fn name(&self) -> String {
        self.definition().name
    }

    /// Router group this tool belongs to.
    fn category(&self) -> &str {
        DEFAULT_CATEGORY
    }
}

// ── Dispatch outcome ───────────────────────────────────────────────

/// Result of one registry dispatch. Always carries text for the model.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub result: String,
    pub is_error: bool,
    pub duration: Duration,
}

impl DispatchOutcome {
    fn error(result: String, duration: Duration) -> Self {
        Self {
            result,
            is_error: true,
            duration,
        }
    }
}

// ── ToolRegistry ───────────────────────────────────────────────────

struct RegisteredTool {
    tool: Box<dyn Tool>,
    def: ToolDef,
    category: String,
    stats: ToolStatsCell,
}

/// Name-keyed collection of tools with dispatch, stats and result limits.
///
/// Built once with the builder methods, then shared. Lookups take no lock;
/// stats are atomics so concurrent dispatches never contend.
///
/// ```ignore
/// let registry = ToolRegistry::new()
///     .with_max_result_bytes(15_000)
///     .with_arg_validation(true)
///     .with_default_timeout(Some(Duration::from_secs(30)))
///     .with(clock_tool())
///     .with(MyCustomTool::new());
///
/// let defs = registry.definitions();
/// ```
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    /// Registration order, for stable definition lists.
    order: Vec<String>,
    max_result_bytes: usize,
    validate_args: bool,
    default_timeout: Option<Duration>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .field("max_result_bytes", &self.max_result_bytes)
            .field("validate_args", &self.validate_args)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            validate_args: false,
            default_timeout: None,
        }
    }

    /// Set the maximum result size in bytes before truncation.
    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    /// Validate arguments against each tool's JSON Schema before execution.
    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// Per-call timeout. `None` disables it.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let def = tool.definition();
        let name = def.name.clone();
        let category = tool.category().to_string();
        if self.tools.contains_key(&name) {
            warn!("Tool '{name}' registered twice; replacing the earlier definition");
        } else {
            self.order.push(name.clone());
        }
        self.tools.insert(
            name,
            RegisteredTool {
                tool: Box::new(tool),
                def,
                category,
                stats: ToolStatsCell::default(),
            },
        );
    }

    /// Register a tool (builder pattern).
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Conditionally register a tool (builder pattern).
    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    /// All tool definitions in registration order.
    pub fn definitions(&self) -> Vec<ToolDef> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.def.clone())
            .collect()
    }

    /// Definitions for the given names, in the order given. Unknown names
    /// are skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDef> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.def.clone())
            .collect()
    }

    /// Names of tools in a category, in registration order.
    pub fn names_in_category(&self, category: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|n| {
                self.tools
                    .get(n.as_str())
                    .is_some_and(|t| t.category.eq_ignore_ascii_case(category))
            })
            .cloned()
            .collect()
    }

    /// Tool names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Look up a registered tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.tool.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Stats snapshot for one tool.
    pub fn stats(&self, name: &str) -> Option<ToolStats> {
        self.tools.get(name).map(|t| t.stats.snapshot())
    }

    /// Stats snapshots for every tool, in registration order.
    pub fn all_stats(&self) -> Vec<(String, ToolStats)> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n).map(|t| (n.clone(), t.stats.snapshot())))
            .collect()
    }

    /// Run a tool by name. Never fails: every problem becomes error text.
    ///
    /// Unknown names yield an "unknown tool" result without touching any
    /// stats. For known tools the call count and duration are always
    /// recorded, and the error count goes up by one when the call fails
    /// validation, times out, returns `Err`, or panics.
    pub async fn dispatch(&self, name: &str, arguments: &serde_json::Value) -> DispatchOutcome {
        let start = Instant::now();
        let Some(entry) = self.tools.get(name) else {
            warn!("Model requested unknown tool '{name}'");
            return DispatchOutcome::error(format!("Error: unknown tool '{name}'"), start.elapsed());
        };

        if self.validate_args
            && let Some(error) = validate_tool_arguments(&entry.def, arguments)
        {
            let elapsed = start.elapsed();
            entry.stats.record(elapsed, true);
            return DispatchOutcome::error(error, elapsed);
        }

        log_tool_call(name, arguments);

        // A tool may panic while building its future as well as while it runs.
        let started = std::panic::catch_unwind(AssertUnwindSafe(|| entry.tool.execute(arguments)));
        let outcome = match started {
            Err(panic) => Some(Err(panic)),
            Ok(future) => {
                let guarded = AssertUnwindSafe(future).catch_unwind();
                match self.default_timeout {
                    Some(limit) => tokio::time::timeout(limit, guarded).await.ok(),
                    None => Some(guarded.await),
                }
            }
        };

        let elapsed = start.elapsed();
        let (result, is_error) = match outcome {
            Some(Ok(Ok(text))) => (text, false),
            Some(Ok(Err(e))) => {
                info!("Tool {name} failed: {e}");
                (format!("Error: tool '{name}' failed: {e}"), true)
            }
            Some(Err(panic)) => {
                let msg = panic_message(panic.as_ref());
                warn!("Tool {name} panicked: {msg}");
                (format!("Error: tool '{name}' failed: {msg}"), true)
            }
            None => {
                let limit = self.default_timeout.unwrap_or_default();
                info!(
                    "Tool {name} timed out after {:.1}s (limit: {:.0}s)",
                    elapsed.as_secs_f64(),
                    limit.as_secs_f64(),
                );
                (
                    format!(
                        "Error: tool '{name}' timed out after {:.0} seconds. \
                         Consider breaking the task into smaller steps or using \
                         different arguments.",
                        limit.as_secs_f64(),
                    ),
                    true,
                )
            }
        };

        entry.stats.record(elapsed, is_error);
        debug!(
            "Tool {name} completed in {:.0}ms ({} bytes{})",
            elapsed.as_secs_f64() * 1000.0,
            result.len(),
            if is_error { ", error" } else { "" }
        );
        trace!("Tool {name} result preview: {}", preview(&result, 300));

        DispatchOutcome {
            result: truncate_result(result, self.max_result_bytes),
            is_error,
            duration: elapsed,
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── FnTool ────────────────────────────────────────────────────────

/// Type-erased async handler for [`FnTool`].
type ErasedToolHandler = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// A closure-based tool that auto-parses arguments and delegates to a handler.
///
/// Use it for stateless tools. Tools holding shared state (clients,
/// connections) read better as a struct implementing [`Tool`].
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct AddArgs { a: i64, b: i64 }
///
/// let add = FnTool::new(
///     ToolDef::from_schema::<AddArgs>("add", "Add two integers"),
///     |args: AddArgs| async move { Ok((args.a + args.b).to_string()) },
/// )
/// .with_category("math");
/// ```
pub struct FnTool {
    def: ToolDef,
    category: String,
    handler: ErasedToolHandler,
}

impl FnTool {
    /// Create a closure-based tool. Argument parse failures are reported as
    /// [`ToolError::InvalidArguments`].
    pub fn new<A, F, Fut>(def: ToolDef, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        let erased = move |raw: serde_json::Value| -> Pin<
            Box<dyn Future<Output = Result<String, ToolError>> + Send>,
        > {
            match parse_tool_args::<A>(&raw) {
                Ok(args) => Box::pin(handler(args)),
                Err(e) => Box::pin(async move { Err(e) }),
            }
        };

        Self {
            def,
            category: DEFAULT_CATEGORY.to_string(),
            handler: Box::new(erased),
        }
    }

    /// Set the router category (builder pattern).
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute(&self, arguments: &serde_json::Value) -> ToolFuture<'_> {
        (self.handler)(arguments.clone())
    }

    fn category(&self) -> &str {
        &self.category
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.def.name)
            .field("category", &self.category)
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate arguments against a tool's declared JSON Schema.
///
/// Returns `None` if valid (or if the schema itself cannot be compiled), or
/// an error string the model can use to self-correct.
pub fn validate_tool_arguments(def: &ToolDef, arguments: &serde_json::Value) -> Option<String> {
    let validator = match jsonschema::validator_for(&def.parameters) {
        Ok(v) => v,
        Err(_) => return None,
    };

    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Error: argument validation failed for tool '{}':\n{}\n\
             Please fix the arguments and try again.",
            def.name,
            errors.join("\n")
        ))
    }
}

/// Parse a JSON arguments object into a typed struct.
pub fn parse_tool_args<T: serde::de::DeserializeOwned>(
    arguments: &serde_json::Value,
) -> Result<T, ToolError> {
    serde_json::from_value(arguments.clone()).map_err(|e| {
        ToolError::InvalidArguments(format!(
            "{e}. Please provide valid JSON matching the tool's parameter schema."
        ))
    })
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &serde_json::Value) {
    let raw = arguments.to_string();
    info!(
        "[tool] {}({}{})",
        name,
        preview(&raw, 120),
        if raw.len() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {raw}");
}

/// Truncate a string to at most `max` bytes (on a char boundary), appending
/// a notice if trimmed.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}...\n[truncated: {} bytes total]",
        s.get(..cut).unwrap_or_default(),
        s.len()
    )
}

/// At most `max_chars` characters of `s`.
pub(crate) fn preview(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".to_string()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
