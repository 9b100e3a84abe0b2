//! Error types for backend transport and tool execution.
//!
//! [`BackendError`] is what an adapter's `send` returns when the call itself
//! failed. Adapters construct the most specific variant they can; the retry
//! layer ([`crate::api::retry`]) decides what is worth retrying. Payloads that
//! arrive but cannot be parsed are *not* errors: adapters degrade them to
//! text responses.
//!
//! [`ToolError`] is what a tool callable returns. It never leaves the
//! registry: dispatch converts it to result text for the model.

use std::time::Duration;
use thiserror::Error;

/// Failure of a backend `send` call.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The vendor rejected the call for rate or quota reasons.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    /// The vendor reported it is temporarily overloaded.
    #[error("overloaded: {message}")]
    Overloaded { message: String },
    /// Non-success HTTP status not covered by a more specific variant.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// Credentials missing or rejected.
    #[error("authentication failed: {message}")]
    Auth { message: String },
    /// The request itself was malformed or too large.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    /// The call did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Connection-level failure (DNS, reset, refused).
    #[error("network error: {message}")]
    Network { message: String },
    /// A subprocess backend exited unsuccessfully.
    #[error("process `{program}` failed (exit={code:?}): {stderr}")]
    Process {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    /// Local I/O failure (spawning a process, writing its stdin).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Backend misconfiguration detected before any call was made.
    #[error("configuration error: {0}")]
    Config(String),
    /// Anything else; classified by message text.
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Map a non-success HTTP status and body onto the closest variant.
    ///
    /// `retry_after` is the parsed `Retry-After` header, if any.
    pub fn from_status(status: u16, body: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => BackendError::Auth { message: body },
            400 | 413 | 422 => BackendError::InvalidRequest { message: body },
            429 => BackendError::RateLimited {
                message: body,
                retry_after,
            },
            // Anthropic's "overloaded_error".
            529 => BackendError::Overloaded { message: body },
            _ => BackendError::Http { status, body },
        }
    }

    /// HTTP status carried by this error, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Http { status, .. } => Some(*status),
            BackendError::RateLimited { .. } => Some(429),
            BackendError::Overloaded { .. } => Some(529),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        // No limit is known here; `http::execute` reports timeouts with one.
        if e.is_timeout() {
            BackendError::Network {
                message: format!("request timed out: {e}"),
            }
        } else if e.is_connect() || e.is_request() {
            BackendError::Network {
                message: e.to_string(),
            }
        } else if let Some(status) = e.status() {
            BackendError::from_status(status.as_u16(), e.to_string(), None)
        } else {
            BackendError::Other(format!("request failed: {e}"))
        }
    }
}

/// Failure raised by a tool callable.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Arguments did not match what the tool expects.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// The tool ran and failed.
    #[error("{0}")]
    Failed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// Shorthand for [`ToolError::Failed`].
    pub fn msg(message: impl Into<String>) -> Self {
        ToolError::Failed(message.into())
    }
}
