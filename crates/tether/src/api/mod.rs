//! Backend call plumbing shared by every adapter.
//!
//! - [`retry`]: three-bucket error classification (rate limit, transient,
//!   fatal) and the [`RetryPolicy`] that wraps each backend call.

pub mod retry;

pub use retry::{ErrorClass, RetryNotice, RetryPolicy, classify};
