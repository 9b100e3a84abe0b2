//! Automatic retry with rate-limit aware backoff.
//!
//! Every backend call goes through [`RetryPolicy::run`]. Errors fall into
//! three buckets:
//!
//! - **rate limit**: wait the (long) rate-limit interval, then retry;
//! - **transient**: exponential backoff, then retry;
//! - **fatal**: give up immediately.
//!
//! Typed [`BackendError`] variants are classified first. Free-text errors
//! (subprocess stderr, `Other`) fall back to keyword inspection, since a CLI
//! backend only reports rate limits in prose.

use crate::error::BackendError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry bucket for a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimit,
    Transient,
    Fatal,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total calls allowed, including the first (1 = never retry).
    pub max_attempts: u32,
    /// Fixed wait before retrying a rate-limited call.
    pub rate_limit_wait: Duration,
    /// Ceiling on any rate-limit wait, including a server's `Retry-After`.
    pub max_rate_limit_wait: Duration,
    /// Delay before the first transient retry.
    pub base_delay: Duration,
    /// Backoff multiplier for transient retries.
    pub multiplier: f64,
    /// Upper bound on a single transient delay.
    pub max_delay: Duration,
    /// Scale transient delays down by a deterministic factor so concurrent
    /// conversations do not retry in lockstep.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            rate_limit_wait: Duration::from_secs(90),
            max_rate_limit_wait: Duration::from_secs(600),
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }
}

/// What [`RetryPolicy::run`] reports before sleeping for a retry.
#[derive(Debug)]
pub struct RetryNotice<'a> {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub class: ErrorClass,
    pub delay: Duration,
    pub error: &'a BackendError,
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.rate_limit_wait = wait;
        self
    }

    pub fn with_max_rate_limit_wait(mut self, ceiling: Duration) -> Self {
        self.max_rate_limit_wait = ceiling;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before transient retry number `retry` (0-indexed).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter {
            let factor = match retry % 4 {
                0 => 0.75,
                1 => 0.90,
                2 => 0.60,
                _ => 0.85,
            };
            Duration::from_secs_f64(capped * factor)
        } else {
            Duration::from_secs_f64(capped)
        }
    }

    /// Wait before retrying after `error` in bucket `class`, or `None` when
    /// the error is not retried.
    fn wait_for(&self, class: ErrorClass, error: &BackendError, retry: u32) -> Option<Duration> {
        match class {
            ErrorClass::Fatal => None,
            ErrorClass::Transient => Some(self.delay_for_attempt(retry)),
            ErrorClass::RateLimit => {
                let hinted = match error {
                    BackendError::RateLimited {
                        retry_after: Some(after),
                        ..
                    } => *after,
                    _ => Duration::ZERO,
                };
                let ceiling = self.max_rate_limit_wait.max(self.rate_limit_wait);
                Some(self.rate_limit_wait.max(hinted).min(ceiling))
            }
        }
    }

    /// Call `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `on_retry` is invoked before each sleep. On exhaustion the error from
    /// the last attempt is returned unchanged.
    pub async fn run<T, F, Fut, R>(&self, mut op: F, mut on_retry: R) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
        R: FnMut(&RetryNotice<'_>),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        let mut transient_retries = 0;
        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let class = classify(&error);
            let Some(delay) = self.wait_for(class, &error, transient_retries) else {
                return Err(error);
            };
            if attempt >= max_attempts {
                warn!("Backend call failed after {attempt} attempt(s): {error}");
                return Err(error);
            }

            warn!(
                "Backend error ({class:?}, attempt {attempt}/{max_attempts}): {error}. \
                 Retrying in {delay:?}..."
            );
            on_retry(&RetryNotice {
                attempt,
                max_attempts,
                class,
                delay,
                error: &error,
            });
            tokio::time::sleep(delay).await;

            if class == ErrorClass::Transient {
                transient_retries += 1;
            }
            attempt += 1;
        }
    }

    /// [`run`](Self::run) without a retry callback.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.run(op, |_| {}).await
    }
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "overloaded",
    "quota",
    "usage limit",
    "http 429",
    "http 529",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "connection closed",
    "broken pipe",
    "temporarily unavailable",
    "service unavailable",
    "bad gateway",
    "http 500",
    "http 502",
    "http 503",
    "http 504",
];

/// Put an error into its retry bucket.
pub fn classify(error: &BackendError) -> ErrorClass {
    match error {
        BackendError::RateLimited { .. } | BackendError::Overloaded { .. } => ErrorClass::RateLimit,
        BackendError::Http { status, body } => match *status {
            429 | 529 => ErrorClass::RateLimit,
            408 | 500..=599 => ErrorClass::Transient,
            _ => classify_text(body).unwrap_or(ErrorClass::Fatal),
        },
        BackendError::Timeout(_) | BackendError::Network { .. } => ErrorClass::Transient,
        BackendError::Auth { .. } | BackendError::InvalidRequest { .. } | BackendError::Config(_) => {
            ErrorClass::Fatal
        }
        BackendError::Process { stderr, .. } => {
            classify_text(stderr).unwrap_or(ErrorClass::Fatal)
        }
        BackendError::Io(e) => classify_text(&e.to_string()).unwrap_or(ErrorClass::Fatal),
        BackendError::Other(message) => classify_text(message).unwrap_or(ErrorClass::Fatal),
    }
}

/// Keyword classification for free-text errors. `None` when nothing matched.
pub fn classify_text(text: &str) -> Option<ErrorClass> {
    let lower = text.to_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        Some(ErrorClass::RateLimit)
    } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        Some(ErrorClass::Transient)
    } else {
        None
    }
}
