//! Shared HTTP plumbing for the REST adapters.

use crate::error::BackendError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const USER_AGENT: &str = concat!("tether/", env!("CARGO_PKG_VERSION"));

pub(crate) fn build_client(timeout: Duration) -> Result<reqwest::Client, BackendError> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| BackendError::Config(format!("failed to build HTTP client: {e}")))
}

/// `Retry-After` in whole seconds. HTTP-date values are ignored.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn map_transport_error(e: reqwest::Error, timeout: Duration) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(timeout)
    } else {
        BackendError::from(e)
    }
}

/// Send a prepared request and return the body of a successful response.
///
/// Non-success statuses become the matching [`BackendError`] variant.
pub(crate) async fn execute(
    vendor: &str,
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<String, BackendError> {
    let start = Instant::now();
    let resp = request
        .send()
        .await
        .map_err(|e| map_transport_error(e, timeout))?;

    let status = resp.status();
    let retry_after = parse_retry_after(resp.headers());
    let text = resp
        .text()
        .await
        .map_err(|e| map_transport_error(e, timeout))?;

    debug!(
        "{vendor} response: HTTP {} in {:.1}s ({} bytes)",
        status,
        start.elapsed().as_secs_f64(),
        text.len()
    );
    trace!(
        "{vendor} response preview: {}",
        crate::tools::core::preview(&text, 500)
    );

    if !status.is_success() {
        return Err(BackendError::from_status(status.as_u16(), text, retry_after));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    /// Accepts connections and never answers them.
    async fn silent_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn execute_reports_the_configured_timeout() {
        let url = silent_server().await;
        let limit = Duration::from_millis(150);
        let client = build_client(limit).unwrap();
        let err = execute("test", client.get(&url), limit).await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout(d) if d == limit), "{err:?}");
    }

    #[tokio::test]
    async fn bare_conversion_does_not_invent_a_duration() {
        let url = silent_server().await;
        let client = build_client(Duration::from_millis(150)).unwrap();
        let err = BackendError::from(client.get(&url).send().await.unwrap_err());
        assert!(matches!(err, BackendError::Network { .. }), "{err:?}");
        assert!(err.to_string().contains("timed out"));
        assert!(!err.to_string().contains("0ns"));
        assert_eq!(crate::api::retry::classify(&err), crate::api::retry::ErrorClass::Transient);
    }
}
