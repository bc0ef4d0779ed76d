//! HTTP client utilities for the configuration service.
//!
//! This module owns the shared `reqwest::Client`, classifies HTTP statuses into
//! the error taxonomy used by the sync engine, and provides the exponential
//! backoff helper shared by the fetch retry path and the long-poll loop.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Error taxonomy for outbound calls.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Credentials were rejected by the backend (401/403).
    #[error("unauthorized: status {0}")]
    Unauthorized(u16),
    /// Request was rejected as malformed or redirected unexpectedly (3xx/4xx).
    #[error("client error or unexpected redirect: status {0}")]
    Client(u16),
    /// Backend reported a server-side failure (5xx).
    #[error("transient backend error: status {0}")]
    Retryable(u16),
    /// The call exceeded its explicit timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Transport-level issue (DNS, TLS, connection refused, etc.).
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    /// Response payload could not be decoded as JSON.
    #[error("failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
    /// A base URL or path could not be turned into a request URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl HttpError {
    /// Returns true for timeouts, connection failures and 5xx responses.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HttpError::Retryable(_) | HttpError::Timeout(_) | HttpError::Transport(_)
        )
    }
}

/// Result of a conditional GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpOutcome<T> {
    /// 2xx with a decoded body.
    Body(T),
    /// 304: the server confirms nothing changed.
    NotModified,
    /// 404: the resource does not exist server-side.
    NotFound,
}

/// Options governing how the HTTP client is constructed.
#[derive(Debug, Clone)]
pub struct HttpClientOptions {
    /// Value sent in the `User-Agent` header.
    pub user_agent: String,
    /// Skip TLS certificate validation (test backends only).
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            user_agent: format!("config-sync/{}", env!("CARGO_PKG_VERSION")),
            accept_invalid_certs: false,
        }
    }
}

/// Thin wrapper around a shared `reqwest::Client`.
///
/// Every call carries its own timeout so that discovery, fetches and long polls
/// can use very different deadlines on the same connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Builds the client with default headers applied to every request.
    pub fn new(options: HttpClientOptions) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&options.user_agent)
                .map_err(|_| HttpError::InvalidUrl(format!("user agent {}", options.user_agent)))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .use_rustls_tls()
            .default_headers(headers)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .map_err(HttpError::Transport)?;
        Ok(Self { client })
    }

    /// Issues a GET and decodes a JSON body, mapping 304/404 to outcomes.
    pub async fn get_json<T>(&self, url: Url, timeout: Duration) -> Result<HttpOutcome<T>, HttpError>
    where
        T: DeserializeOwned,
    {
        tracing::debug!(method = "GET", url = %url, timeout = ?timeout, "config-sync HTTP request");

        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| map_transport_error(err, timeout))?;

        let status = response.status();
        let content_length = response
            .content_length()
            .map_or_else(|| "unknown".to_string(), |len| len.to_string());
        tracing::debug!(
            url = %url,
            status = %status,
            content_length = %content_length,
            "config-sync HTTP response"
        );

        match classify_status(status)? {
            StatusClass::NotModified => return Ok(HttpOutcome::NotModified),
            StatusClass::NotFound => return Ok(HttpOutcome::NotFound),
            StatusClass::Success => {}
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| map_transport_error(err, timeout))?;
        let body = serde_json::from_slice(&bytes)?;
        Ok(HttpOutcome::Body(body))
    }
}

/// Builds a URL from a base (`http://host:port/prefix`) and raw path segments.
///
/// Segments are percent-encoded individually so namespace names containing
/// reserved characters never alter the path structure.
pub fn build_url(base: &str, segments: &[&str]) -> Result<Url, HttpError> {
    let mut url = Url::parse(base).map_err(|err| HttpError::InvalidUrl(format!("{base}: {err}")))?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| HttpError::InvalidUrl(format!("{base}: cannot be a base")))?;
        path.pop_if_empty();
        path.extend(segments);
    }
    Ok(url)
}

#[derive(Debug, PartialEq, Eq)]
enum StatusClass {
    Success,
    NotModified,
    NotFound,
}

/// Maps HTTP status codes to the sync error taxonomy.
fn classify_status(status: StatusCode) -> Result<StatusClass, HttpError> {
    if status.is_success() {
        return Ok(StatusClass::Success);
    }
    if status == StatusCode::NOT_MODIFIED {
        return Ok(StatusClass::NotModified);
    }
    if status == StatusCode::NOT_FOUND {
        return Ok(StatusClass::NotFound);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(HttpError::Unauthorized(status.as_u16()));
    }
    if status.is_server_error() {
        return Err(HttpError::Retryable(status.as_u16()));
    }
    // Remaining redirects and 4xx codes point at a proxy or a malformed request.
    Err(HttpError::Client(status.as_u16()))
}

fn map_transport_error(err: reqwest::Error, timeout: Duration) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout(timeout)
    } else {
        HttpError::Transport(err)
    }
}

/// Exponential backoff parameters shared by fetch retries and long polls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay returned after the first error.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Growth applied per consecutive error.
    pub factor: f64,
    /// Successes needed in a row before the error count drops.
    /// Zero resets the error count on the first success.
    pub recovery_interval: usize,
}

impl BackoffConfig {
    /// Backoff applied between fetch attempts rotated across endpoints.
    pub fn fetch_retry() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
            factor: 2.0,
            recovery_interval: 0,
        }
    }

    /// Backoff applied between failed long polls.
    pub fn long_poll() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(120),
            factor: 2.0,
            recovery_interval: 0,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::fetch_retry()
    }
}

/// Error count and success streak driving the next delay.
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    error_count: usize,
    success_streak: usize,
}

impl BackoffState {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            error_count: 0,
            success_streak: 0,
        }
    }

    /// Counts a failure and returns how long to wait before the next attempt.
    pub fn register_error(&mut self) -> Duration {
        self.success_streak = 0;
        self.error_count = self.error_count.saturating_add(1);
        let exponent = self.error_count.saturating_sub(1);
        // powi takes an i32; anything past 64 doublings is far beyond every cap.
        let capped_exponent = exponent.min(64) as i32;
        let backoff_secs = self.config.base.as_secs_f64() * self.config.factor.powi(capped_exponent);
        let capped = backoff_secs.min(self.config.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Registers a success and decreases the error count once the streak is long enough.
    pub fn register_success(&mut self) {
        if self.config.recovery_interval == 0 {
            self.error_count = 0;
            self.success_streak = 0;
            return;
        }

        self.success_streak = self.success_streak.saturating_add(1);
        if self.success_streak >= self.config.recovery_interval {
            self.error_count = self.error_count.saturating_sub(2);
            self.success_streak = 0;
        }
    }

    /// Number of errors currently counted towards the next delay.
    pub fn error_count(&self) -> usize {
        self.error_count
    }
}
