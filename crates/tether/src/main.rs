//! Run a tool-using conversation against any supported backend.
//!
//! API keys come from the environment (`ANTHROPIC_API_KEY`,
//! `OPENAI_API_KEY`) unless `--api-key` is given.
//!
//! # Examples
//!
//! ```sh
//! # One-shot question with the built-in clock and calculator tools
//! tether --backend anthropic --builtin-tools "What is 17 * 23?"
//!
//! # Local Ollama model, interactive (one message per stdin line)
//! tether --backend local --model qwen2.5 --builtin-tools
//!
//! # Shell-command tools from a JSON file, through the CLI backend
//! tether --backend cli --tools tools.json "How much disk is free?"
//!
//! # Verbose loop logging
//! tether --log-level tether=debug --backend openai "hi"
//! ```
//!
//! A tools file is a JSON array of entries:
//!
//! ```json
//! [{
//!   "name": "disk_free",
//!   "description": "Report free disk space for a path",
//!   "parameters": {"type": "object", "properties": {"path": {"type": "string"}}},
//!   "execute": "df -h {{path}}",
//!   "category": "system"
//! }]
//! ```

use clap::Parser;
use serde::Deserialize;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tether::agent::{
    CompositeEventHandler, Conversation, ConversationConfig, ConversationEvent, DispatchConfig,
    EventHandler, LoggingHandler,
};
use tether::api::RetryPolicy;
use tether::backend::{BackendKind, BackendSettings, build_backend};
use tether::error::{BackendError, ToolError};
use tether::tools::builtin::{calculator_tool, clock_tool};
use tether::tools::core::{DEFAULT_CATEGORY, Tool, ToolFuture, ToolRegistry};
use tether::tools::router::{KeywordGroup, ToolRouter};
use tether::ToolDef;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Run a tool-using conversation against any supported backend.
#[derive(Parser)]
#[command(name = "tether", version)]
struct Cli {
    /// Message to send. Without it, reads one message per line from stdin.
    prompt: Option<String>,

    // ── Backend ────────────────────────────────────────────────
    /// Backend: anthropic, openai, local or cli
    #[arg(long, default_value = "anthropic")]
    backend: BackendKind,

    /// Model name (adapter default when unset)
    #[arg(long)]
    model: Option<String>,

    /// Override the API base URL
    #[arg(long)]
    base_url: Option<String>,

    /// API key (otherwise read from the environment)
    #[arg(long)]
    api_key: Option<String>,

    /// Program for the cli backend
    #[arg(long)]
    program: Option<String>,

    /// Never advertise tools to the model
    #[arg(long)]
    text_only: bool,

    /// Check that the backend is reachable and exit
    #[arg(long)]
    ping: bool,

    // ── Tools ──────────────────────────────────────────────────
    /// Path to a JSON file of shell-command tools
    #[arg(long)]
    tools: Option<PathBuf>,

    /// Register the built-in clock and calculator tools
    #[arg(long)]
    builtin_tools: bool,

    /// Narrow advertised tools by message keywords
    #[arg(long)]
    route_tools: bool,

    /// Run tool calls one at a time instead of concurrently
    #[arg(long)]
    sequential_tools: bool,

    /// Concurrent tool workers per batch
    #[arg(long, default_value_t = 4)]
    max_workers: usize,

    // ── Loop limits ────────────────────────────────────────────
    /// System prompt
    #[arg(long, default_value = "You are a helpful assistant.")]
    system: String,

    /// Tool turns allowed per message
    #[arg(long, default_value_t = 25)]
    max_tool_turns: u32,

    /// Maximum output tokens per backend call
    #[arg(long, default_value_t = 4096)]
    max_tokens: u32,

    /// Attempts per backend call, including the first
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    // ── Output ─────────────────────────────────────────────────
    /// Log filter, e.g. "info" or "tether=debug" (RUST_LOG wins when set)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print token and tool statistics to stderr when done
    #[arg(long)]
    stats: bool,
}

// ── Tool file types ────────────────────────────────────────────────

/// One entry of a tools file: a definition plus a shell command template.
#[derive(Deserialize)]
struct ToolFileEntry {
    name: String,
    description: String,
    #[serde(default = "empty_object_schema")]
    parameters: serde_json::Value,
    /// Shell command template. `{{param}}` is replaced by the argument.
    execute: String,
    #[serde(default)]
    category: Option<String>,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A tool that runs a shell command rendered from its arguments.
struct ShellCommandTool {
    def: ToolDef,
    category: String,
    template: String,
}

impl Tool for ShellCommandTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn category(&self) -> &str {
        &self.category
    }

    fn execute(&self, arguments: &serde_json::Value) -> ToolFuture<'_> {
        let cmd = render_command(&self.template, arguments);
        let name = self.def.name.clone();
        Box::pin(async move {
            debug!("Shell tool {name}: {cmd}");
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&cmd)
                .kill_on_drop(true)
                .output()
                .await?;

            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();

            if !output.status.success() {
                Err(ToolError::Failed(format!(
                    "exited with {}.\nstdout:\n{stdout}\nstderr:\n{stderr}",
                    output.status
                )))
            } else if stderr.trim().is_empty() {
                Ok(stdout)
            } else {
                Ok(format!("{stdout}\n\n[stderr]\n{stderr}"))
            }
        })
    }
}

/// Substitute `{{param}}` placeholders with argument values. Placeholders
/// with no matching argument are removed and runs of spaces collapsed.
fn render_command(template: &str, arguments: &serde_json::Value) -> String {
    let mut cmd = template.to_string();
    if let Some(obj) = arguments.as_object() {
        for (key, value) in obj {
            let replacement = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            cmd = cmd.replace(&format!("{{{{{key}}}}}"), &replacement);
        }
    }

    let mut cleaned = String::with_capacity(cmd.len());
    let mut rest = cmd.as_str();
    while let Some(start) = rest.find("{{") {
        match rest[start + 2..].find("}}") {
            Some(end) => {
                cleaned.push_str(&rest[..start]);
                rest = &rest[start + 2 + end + 2..];
            }
            None => break,
        }
    }
    cleaned.push_str(rest);

    while cleaned.contains("  ") {
        cleaned = cleaned.replace("  ", " ");
    }
    cleaned.trim().to_string()
}

/// Read a tools file into shell-command tools.
fn load_tools(path: &Path) -> Result<Vec<ShellCommandTool>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read tools file '{}': {e}", path.display()))?;
    let entries: Vec<ToolFileEntry> = serde_json::from_str(&content)
        .map_err(|e| format!("failed to parse tools file '{}': {e}", path.display()))?;

    Ok(entries
        .into_iter()
        .map(|entry| ShellCommandTool {
            def: ToolDef::new(entry.name, entry.description, entry.parameters),
            category: entry
                .category
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            template: entry.execute,
        })
        .collect())
}

fn build_registry(cli: &Cli) -> Result<ToolRegistry, String> {
    let mut registry = ToolRegistry::new()
        .with_if(cli.builtin_tools, clock_tool())
        .with_if(cli.builtin_tools, calculator_tool());
    if let Some(path) = &cli.tools {
        let tools = load_tools(path)?;
        eprintln!("  Loaded {} tool(s) from {}", tools.len(), path.display());
        for tool in tools {
            registry.register(tool);
        }
    }
    Ok(registry)
}

/// Built-in keyword groups plus one group per tools-file category, matched
/// on the category name and its tool names.
fn build_router(registry: &ToolRegistry) -> ToolRouter {
    let mut router = ToolRouter::default().with_builtin_groups();
    let known: Vec<String> = router
        .groups()
        .iter()
        .map(|g| g.category.clone())
        .collect();
    let mut extra: Vec<(String, Vec<String>)> = Vec::new();
    for name in registry.names() {
        let Some(tool) = registry.get(name) else {
            continue;
        };
        let category = tool.category();
        if category == DEFAULT_CATEGORY || known.iter().any(|k| k == category) {
            continue;
        }
        match extra.iter_mut().find(|(c, _)| c == category) {
            Some((_, keywords)) => keywords.push(name.replace('_', " ")),
            None => extra.push((category.to_string(), vec![category.to_string(), name.replace('_', " ")])),
        }
    }
    for (category, keywords) in extra {
        let keywords: Vec<&str> = keywords.iter().map(String::as_str).collect();
        router.add_group(KeywordGroup::new(category.as_str(), &keywords));
    }
    router
}

/// Prints loop progress to stderr.
struct CliEventHandler;

impl EventHandler for CliEventHandler {
    fn on_event(&self, event: &ConversationEvent<'_>) {
        match event {
            ConversationEvent::ToolCallsReceived { turn, count } => {
                eprintln!("  [turn {turn}] {count} tool call(s)");
            }
            ConversationEvent::ToolResult { name, is_error, .. } => {
                let status = if *is_error { "failed" } else { "ok" };
                eprintln!("  [tool] {name}: {status}");
            }
            ConversationEvent::RetryScheduled {
                attempt,
                max_attempts,
                delay,
                ..
            } => {
                eprintln!(
                    "  [retry {attempt}/{max_attempts}] waiting {:.0}s",
                    delay.as_secs_f64()
                );
            }
            _ => {}
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<(), String> {
    let settings = BackendSettings {
        model: cli.model.clone(),
        base_url: cli.base_url.clone(),
        api_key: cli.api_key.clone(),
        program: cli.program.clone(),
        text_only: cli.text_only,
    };
    let backend = build_backend(cli.backend, &settings).map_err(|e| e.to_string())?;
    info!("Using backend {}", backend.name());

    if cli.ping {
        return match backend.ping().await {
            Ok(true) => {
                println!("{}: ok", backend.name());
                Ok(())
            }
            Ok(false) => Err(format!("{}: responded with an error", backend.name())),
            Err(e) => Err(format!("{}: {e}", backend.name())),
        };
    }

    let registry = Arc::new(build_registry(&cli)?);
    let config = ConversationConfig::new(cli.system.clone())
        .with_max_tool_turns(cli.max_tool_turns)
        .with_max_tokens(cli.max_tokens)
        .with_retry(RetryPolicy::default().with_max_attempts(cli.max_attempts))
        .with_dispatch(
            DispatchConfig::default()
                .with_max_workers(cli.max_workers)
                .with_sequential(cli.sequential_tools),
        );
    let handler = CompositeEventHandler::new()
        .with(LoggingHandler)
        .with(CliEventHandler);

    let mut conversation = Conversation::new(backend, registry.clone(), config)
        .with_event_handler(Arc::new(handler));
    if cli.route_tools {
        conversation = conversation.with_router(build_router(&registry));
    }

    match &cli.prompt {
        Some(prompt) => {
            let answer = conversation.send(prompt).await.map_err(describe)?;
            println!("{answer}");
        }
        None => interactive(&mut conversation).await?,
    }

    if cli.stats {
        let stats = conversation.stats();
        eprintln!(
            "  turns={} tool_calls={} tokens_in={} tokens_out={}",
            stats.total_turns,
            stats.total_tool_calls,
            stats.total_input_tokens,
            stats.total_output_tokens
        );
        for (name, tool) in registry.all_stats() {
            if tool.call_count > 0 {
                eprintln!(
                    "  {name}: calls={} errors={} avg={:?}",
                    tool.call_count,
                    tool.error_count,
                    tool.average_duration()
                );
            }
        }
    }
    Ok(())
}

/// One message per stdin line until EOF. Backend errors end the session.
async fn interactive(conversation: &mut Conversation) -> Result<(), String> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        eprint!("> ");
        io::stderr().flush().map_err(|e| e.to_string())?;
        let Some(line) = lines.next() else {
            return Ok(());
        };
        let line = line.map_err(|e| format!("failed to read stdin: {e}"))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/reset" {
            conversation.reset();
            eprintln!("  history cleared");
            continue;
        }
        let answer = conversation.send(line).await.map_err(describe)?;
        println!("{answer}");
    }
}

fn describe(error: BackendError) -> String {
    match error.status() {
        Some(status) => format!("backend returned HTTP {status}: {error}"),
        None => error.to_string(),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write as _;

    #[test]
    fn render_substitutes_and_drops_missing() {
        let cmd = render_command(
            "ls {{flags}} {{path}} {{missing}}",
            &json!({"path": "/tmp", "flags": "-la"}),
        );
        assert_eq!(cmd, "ls -la /tmp");
    }

    #[test]
    fn render_non_string_values() {
        let cmd = render_command("head -n {{lines}} {{file}}", &json!({"lines": 5, "file": null}));
        assert_eq!(cmd, "head -n 5");
    }

    #[test]
    fn render_keeps_unclosed_braces() {
        assert_eq!(render_command("echo {{oops", &json!({})), "echo {{oops");
    }

    #[test]
    fn load_tools_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"name": "greet", "description": "Say hi", "execute": "echo hi {{{{who}}}}",
                  "parameters": {{"type": "object", "properties": {{"who": {{"type": "string"}}}}}},
                  "category": "social"}},
                {{"name": "uptime", "description": "Uptime", "execute": "uptime"}}
            ]"#
        )
        .unwrap();

        let tools = load_tools(file.path()).unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].def.name, "greet");
        assert_eq!(tools[0].category, "social");
        assert_eq!(tools[0].template, "echo hi {{who}}");
        assert_eq!(tools[1].category, DEFAULT_CATEGORY);
        assert_eq!(tools[1].def.parameters["type"], "object");
    }

    #[test]
    fn load_tools_reports_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = load_tools(file.path()).err().unwrap();
        assert!(err.contains("failed to parse tools file"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_tool_runs_through_registry() {
        let registry = ToolRegistry::new().with(ShellCommandTool {
            def: ToolDef::new("say", "Echo", empty_object_schema()),
            category: DEFAULT_CATEGORY.to_string(),
            template: "echo {{word}}".into(),
        });
        let ok = registry.dispatch("say", &json!({"word": "hello"})).await;
        assert!(!ok.is_error);
        assert_eq!(ok.result.trim(), "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_tool_nonzero_exit_is_error() {
        let registry = ToolRegistry::new().with(ShellCommandTool {
            def: ToolDef::new("fail", "Fails", empty_object_schema()),
            category: DEFAULT_CATEGORY.to_string(),
            template: "echo nope >&2; exit 2".into(),
        });
        let outcome = registry.dispatch("fail", &json!({})).await;
        assert!(outcome.is_error);
        assert!(outcome.result.contains("nope"));
        assert_eq!(registry.stats("fail").unwrap().error_count, 1);
    }

    #[test]
    fn router_gets_a_group_per_file_category() {
        let registry = ToolRegistry::new()
            .with(clock_tool())
            .with(ShellCommandTool {
                def: ToolDef::new("disk_free", "Free space", empty_object_schema()),
                category: "system".into(),
                template: "df -h".into(),
            });
        let router = build_router(&registry);
        assert!(router.groups().iter().any(|g| g.category == "system"));

        let names: Vec<String> = router
            .select("how much disk free is left?", &registry)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert!(names.contains(&"disk_free".to_string()));
    }

    #[test]
    fn cli_parses_backend_aliases() {
        let cli = Cli::try_parse_from(["tether", "--backend", "ollama", "--text-only", "hi"]).unwrap();
        assert_eq!(cli.backend, BackendKind::Local);
        assert!(cli.text_only);
        assert_eq!(cli.prompt.as_deref(), Some("hi"));
        assert!(Cli::try_parse_from(["tether", "--backend", "fax"]).is_err());
    }
}
