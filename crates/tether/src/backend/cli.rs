//! Subprocess CLI adapter (default: `claude -p --output-format json`).
//!
//! The CLI has no structured tool protocol, so tools are described in the
//! prompt and the model is asked to answer with a JSON envelope:
//!
//! ```text
//! {"tool_calls": [{"name": "clock", "arguments": {}}], "text": "optional"}
//! ```
//!
//! Output is handled as a degrade-gracefully parser. A CLI JSON envelope
//! (`{"result": ..., "usage": ..., "is_error": ...}`) is unwrapped first,
//! then the model text is fence-stripped and strictly parsed as a tool
//! envelope. Anything that does not parse is a plain text answer.

use super::{Backend, BackendResponse, ToolResultMessages, Usage};
use crate::error::BackendError;
use crate::tools::core::preview;
use crate::{ContentBlock, Message, MessageContent, MessageRole, ToolCall, ToolDef, ToolOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_CLI_PROGRAM: &str = "claude";

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the child process.
    pub env: Vec<(String, String)>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_CLI_PROGRAM.into(),
            args: vec!["-p".into(), "--output-format".into(), "json".into()],
            timeout: Duration::from_secs(300),
            working_dir: None,
            env: Vec::new(),
        }
    }
}

impl CliConfig {
    /// Run `program` with no arguments; the prompt still goes to stdin.
    pub fn command(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ..Default::default()
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Append arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

// ── Envelopes ──────────────────────────────────────────────────────

/// The JSON the model is asked to produce when it wants tools.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToolEnvelope {
    pub tool_calls: Vec<EnvelopeCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EnvelopeCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// What the CLI itself prints with `--output-format json`.
#[derive(Deserialize, Debug)]
struct CliOutput {
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    subtype: Option<String>,
    usage: Option<CliUsage>,
}

impl CliOutput {
    fn usage(&self) -> Usage {
        self.usage
            .as_ref()
            .map(|u| Usage::new(u.input_tokens, u.output_tokens))
            .unwrap_or_default()
    }
}

#[derive(Deserialize, Debug, Default)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Remove a surrounding Markdown code fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`) on the opening line.
    match body.split_once('\n') {
        Some((info, inner))
            if info
                .trim()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') =>
        {
            inner.trim()
        }
        _ => body.trim(),
    }
}

/// Strictly parse model text as a tool envelope. `None` unless the text is
/// exactly one envelope with at least one named call.
pub fn parse_tool_envelope(text: &str) -> Option<ToolEnvelope> {
    let envelope: ToolEnvelope = serde_json::from_str(strip_code_fence(text)).ok()?;
    let valid = !envelope.tool_calls.is_empty()
        && envelope
            .tool_calls
            .iter()
            .all(|c| !c.name.trim().is_empty() && (c.arguments.is_object() || c.arguments.is_null()));
    valid.then_some(envelope)
}

/// Interpret the CLI's stdout.
///
/// Synthesized call ids are numbered from `first_call`, so a conversation
/// that passes the number of calls already in its history never reuses one.
pub fn parse_cli_output(stdout: &str, first_call: usize) -> BackendResponse {
    let trimmed = stdout.trim();
    let (model_text, usage) = match serde_json::from_str::<CliOutput>(trimmed) {
        Ok(output) => {
            let usage = output.usage();
            match (output.result, output.is_error) {
                (Some(result), true) => return BackendResponse::error_text(result, usage),
                (None, true) => {
                    let reason = output.subtype.as_deref().unwrap_or("unknown error");
                    warn!("CLI reported an error without a result: {reason}");
                    let message = format!("CLI run failed ({reason})");
                    return BackendResponse::error_text(message, usage);
                }
                (Some(result), false) => (result, usage),
                (None, false) => (trimmed.to_string(), Usage::default()),
            }
        }
        Err(_) => (trimmed.to_string(), Usage::default()),
    };

    match parse_tool_envelope(&model_text) {
        Some(envelope) => {
            let calls = envelope
                .tool_calls
                .into_iter()
                .enumerate()
                .map(|(i, c)| {
                    let id = c
                        .id
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| format!("cli_call_{}", first_call + i));
                    let arguments = if c.arguments.is_null() {
                        Value::Object(Default::default())
                    } else {
                        c.arguments
                    };
                    ToolCall::new(id, c.name, arguments)
                })
                .collect();
            BackendResponse::tool_calls(envelope.text, calls, usage)
        }
        None => {
            if model_text.contains("\"tool_calls\"") {
                warn!(
                    "CLI output mentions tool_calls but is not a valid envelope; treating as text"
                );
            }
            BackendResponse::text(model_text, usage)
        }
    }
}

/// Number of tool calls already stored as envelopes in assistant turns.
fn calls_in_history(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .filter_map(|m| parse_tool_envelope(&m.text()))
        .map(|envelope| envelope.tool_calls.len())
        .sum()
}

/// Canonical envelope text for an assistant tool-call turn.
fn envelope_text(blocks: &[ContentBlock]) -> String {
    let mut text = None;
    let mut calls = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text: t } if !t.is_empty() => text = Some(t.clone()),
            ContentBlock::ToolUse { id, name, input } => calls.push(EnvelopeCall {
                id: Some(id.clone()),
                name: name.clone(),
                arguments: input.clone(),
            }),
            _ => {}
        }
    }
    serde_json::to_string(&ToolEnvelope {
        tool_calls: calls,
        text,
    })
    .unwrap_or_default()
}

// ── Prompt rendering ───────────────────────────────────────────────

fn render_tools(out: &mut String, tools: &[ToolDef]) {
    let _ = writeln!(out, "## Tools\n");
    let _ = writeln!(
        out,
        "You can call the tools below. To call one or more tools, reply with ONLY \
         a JSON object and nothing else:\n\
         {{\"tool_calls\": [{{\"name\": \"<tool name>\", \"arguments\": {{...}}}}], \
         \"text\": \"<optional note>\"}}\n\
         Tool results will follow in the conversation. When you have the final \
         answer, reply in plain text (not JSON).\n"
    );
    for tool in tools {
        let _ = writeln!(out, "- `{}`: {}", tool.name, tool.description);
        let _ = writeln!(out, "  parameters: {}", tool.parameters);
    }
    out.push('\n');
}

/// Render system prompt, tool instructions and history as one prompt.
pub fn render_prompt(messages: &[Message], system_prompt: &str, tools: &[ToolDef]) -> String {
    let mut out = String::new();
    if !system_prompt.is_empty() {
        let _ = writeln!(out, "{system_prompt}\n");
    }
    if !tools.is_empty() {
        render_tools(&mut out, tools);
    }

    let _ = writeln!(out, "## Conversation\n");
    for message in messages {
        let label = match message.role {
            MessageRole::User => "User",
            MessageRole::Assistant => "Assistant",
            MessageRole::Tool => "Tool results",
        };
        let body = match &message.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => {
                let results = message.content.tool_results();
                if message.has_tool_calls() {
                    envelope_text(blocks)
                } else if !results.is_empty() {
                    render_results(results.into_iter().map(|(id, content, is_error)| {
                        (id.to_string(), content.to_string(), is_error)
                    }))
                } else {
                    message.text()
                }
            }
        };
        let _ = writeln!(out, "{label}: {body}\n");
    }
    let _ = write!(out, "Assistant:");
    out
}

fn render_results(results: impl Iterator<Item = (String, String, bool)>) -> String {
    results
        .map(|(id, content, is_error)| {
            let status = if is_error { " (error)" } else { "" };
            format!("[{id}]{status}\n{content}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ── Backend ────────────────────────────────────────────────────────

pub struct CliBackend {
    config: CliConfig,
}

impl CliBackend {
    pub fn new(config: CliConfig) -> Self {
        info!("CLI backend: {} {}", config.program, config.args.join(" "));
        Self { config }
    }

    async fn run(&self, prompt: &str) -> Result<String, BackendError> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let start = Instant::now();
        let mut child = command.spawn().map_err(|e| BackendError::Process {
            program: self.config.program.clone(),
            code: None,
            stderr: format!("failed to start: {e}"),
        })?;

        let Some(mut stdin) = child.stdin.take() else {
            return Err(BackendError::Other(format!(
                "failed to open stdin for `{}`",
                self.config.program
            )));
        };
        // Feed stdin concurrently so a child that streams output before
        // reading all input cannot deadlock on a full pipe.
        let payload = prompt.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&payload).await;
            drop(stdin);
            result
        });

        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| BackendError::Timeout(self.config.timeout))??;

        if let Ok(Err(e)) = writer.await
            && e.kind() != std::io::ErrorKind::BrokenPipe
        {
            warn!("Failed to write prompt to `{}`: {e}", self.config.program);
        }

        debug!(
            "CLI `{}` exited with {:?} in {:.1}s ({} bytes stdout)",
            self.config.program,
            output.status.code(),
            start.elapsed().as_secs_f64(),
            output.stdout.len()
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stderr = if stderr.is_empty() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                stderr
            };
            return Err(BackendError::Process {
                program: self.config.program.clone(),
                code: output.status.code(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        trace!("CLI stdout preview: {}", preview(&stdout, 500));
        Ok(stdout)
    }
}

#[async_trait]
impl Backend for CliBackend {
    fn name(&self) -> &str {
        "cli"
    }

    async fn send(
        &self,
        messages: &[Message],
        system_prompt: &str,
        tools: &[ToolDef],
        _max_tokens: u32,
    ) -> Result<BackendResponse, BackendError> {
        let prompt = render_prompt(messages, system_prompt, tools);
        debug!(
            "CLI request: {} message(s), {} tool(s), prompt {} bytes",
            messages.len(),
            tools.len(),
            prompt.len()
        );
        let stdout = self.run(&prompt).await?;
        Ok(parse_cli_output(&stdout, calls_in_history(messages)))
    }

    /// Tool-call turns are stored as the canonical envelope text.
    fn format_assistant_message(&self, response: &BackendResponse) -> Message {
        if response.has_tool_calls() {
            Message::assistant_text(envelope_text(response.blocks()))
        } else {
            Message::assistant_text(response.final_text().unwrap_or_default())
        }
    }

    fn format_tool_results(&self, results: &[ToolOutcome]) -> ToolResultMessages {
        let text = render_results(
            results
                .iter()
                .map(|r| (format!("{} {}", r.name, r.call_id), r.result.clone(), r.is_error)),
        );
        ToolResultMessages::Single(Message::tool_text(text))
    }
}
