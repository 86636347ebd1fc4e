//! HTTP client with classified retry and exponential backoff.
//!
//! Every failure is classified as retryable or terminal before any retry
//! decision:
//!
//! - connection failure, timeout, redirect loop: retryable
//! - status >= 500 or status == 429: retryable
//! - any other error status (4xx except 429): terminal, no retry
//! - anything else the transport reports: retryable (fail open toward retry)
//!
//! Retryable failures are retried up to `max_retries` times (default 3, so
//! up to 4 attempts) with a deterministic backoff of `2^min(attempt+1, 5)`
//! seconds: 2, 4, 8, 16, 32. All attempts of one logical call share a
//! correlation id so a full retry sequence can be reconstructed from logs.
//!
//! Calls block the current task for the duration of each attempt plus the
//! backoff sleeps, up to roughly a minute worst case. Do not call this from
//! a context that cannot tolerate multi-second stalls.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Default per-attempt timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default retry budget; the first attempt is not a retry.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors raised by [`HttpClient`], classified for the retry decision.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("connection failed: {0}")]
    Connect(#[source] reqwest::Error),

    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("redirect loop: {0}")]
    Redirect(#[source] reqwest::Error),

    /// Transport failure with no finer classification.
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// The server answered with an error status.
    #[error("HTTP status {status}")]
    Status { status: u16, body: String },
}

impl HttpError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            HttpError::Timeout(e)
        } else if e.is_connect() {
            HttpError::Connect(e)
        } else if e.is_redirect() {
            HttpError::Redirect(e)
        } else {
            HttpError::Transport(e)
        }
    }

    /// Whether this failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpError::Connect(_)
            | HttpError::Timeout(_)
            | HttpError::Redirect(_)
            | HttpError::Transport(_) => true,
            HttpError::Status { status, .. } => *status >= 500 || *status == 429,
        }
    }

    /// Short class name for structured logs.
    pub fn class(&self) -> &'static str {
        match self {
            HttpError::Connect(_) => "connect",
            HttpError::Timeout(_) => "timeout",
            HttpError::Redirect(_) => "redirect",
            HttpError::Transport(_) => "transport",
            HttpError::Status { .. } => "status",
        }
    }
}

/// Response body, JSON-decoded when the server sent valid JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Text(String),
}

impl Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(v) => Some(v),
            Body::Text(_) => None,
        }
    }
}

/// Uniform response shape for every verb.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub data: Body,
}

/// Blocking-style HTTP client with retry, backoff, and basic auth.
///
/// # Example
///
/// ```rust,ignore
/// let client = HttpClient::new()
///     .with_base_url("https://dev.service-now.com")
///     .with_basic_auth("admin", "secret")
///     .with_timeout(Duration::from_secs(30))
///     .with_max_retries(3);
///
/// let response = client.post_json("/api/now/table/incident", &body, None).await?;
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: Option<String>,
    default_headers: HashMap<String, String>,
    timeout: Duration,
    auth: Option<(String, String)>,
    max_retries: u32,
    /// Accepted for configuration compatibility but not applied: the backoff
    /// schedule is deterministic. See `backoff_delay`.
    jitter: bool,
}

impl HttpClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: None,
            default_headers: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            auth: None,
            max_retries: DEFAULT_MAX_RETRIES,
            jitter: false,
        }
    }

    /// Base URL prepended to relative request paths.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base: String = base_url.into();
        self.base_url = Some(base.trim_end_matches('/').to_string());
        self
    }

    /// Header sent on every request unless overridden per call.
    pub fn with_default_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Basic authentication credentials sent on every request.
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some((username.into(), password.into()));
        self
    }

    /// Retry budget for retryable failures.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Jitter knob. Present for configuration parity; the current backoff
    /// contract is deterministic and this flag does not change it.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// GET with retry and backoff.
    pub async fn get(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<HttpResponse, HttpError> {
        self.execute(Method::GET, url, None, headers).await
    }

    /// POST a JSON body with retry and backoff.
    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<HttpResponse, HttpError> {
        self.execute(Method::POST, url, Some(body), headers).await
    }

    /// Perform one logical call: attempt, classify, back off, repeat.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: Option<&HashMap<String, String>>,
    ) -> Result<HttpResponse, HttpError> {
        let full_url = self.build_url(url);
        let merged_headers = self.merge_headers(headers);

        self.retry_loop(&full_url, || {
            self.attempt(method.clone(), &full_url, body, &merged_headers)
        })
        .await
    }

    /// Drive `op` through the retry schedule. Factored out so the schedule
    /// can be exercised without a live server.
    async fn retry_loop<F, Fut>(&self, url: &str, mut op: F) -> Result<HttpResponse, HttpError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<HttpResponse, HttpError>>,
    {
        // One correlation id for all attempts of this logical call.
        let call_id = Uuid::new_v4();
        let total_attempts = self.max_retries + 1;
        let mut attempt: u32 = 0;

        loop {
            match op().await {
                Ok(response) => {
                    debug!(
                        call_id = %call_id,
                        url = %url,
                        status = response.status,
                        attempt = attempt + 1,
                        "Request succeeded"
                    );
                    return Ok(response);
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    error!(
                        call_id = %call_id,
                        url = %url,
                        attempt = attempt + 1,
                        total_attempts = total_attempts,
                        error_class = err.class(),
                        error = %err,
                        retryable = retryable,
                        "Request attempt failed"
                    );

                    if !retryable || attempt >= self.max_retries {
                        return Err(err);
                    }

                    // The jitter knob exists in configuration but the
                    // schedule stays deterministic; surface that in logs so
                    // nobody hunts for randomness that is not there.
                    if self.jitter {
                        debug!(call_id = %call_id, "jitter flag set but not applied to backoff");
                    }
                    let delay = backoff_delay(attempt);
                    info!(
                        call_id = %call_id,
                        url = %url,
                        delay_secs = delay.as_secs(),
                        next_attempt = attempt + 2,
                        total_attempts = total_attempts,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One network attempt; error statuses become [`HttpError::Status`].
    async fn attempt(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &HashMap<String, String>,
    ) -> Result<HttpResponse, HttpError> {
        let mut request = self
            .client
            .request(method, url)
            .timeout(self.timeout);

        if let Some((username, password)) = &self.auth {
            request = request.basic_auth(username, Some(password));
        }

        for (name, value) in headers {
            request = request.header(name, value);
        }

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(HttpError::from_reqwest)?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();

        let text = response.text().await.map_err(HttpError::from_reqwest)?;

        if status.is_client_error() || status.is_server_error() {
            return Err(HttpError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let data = match serde_json::from_str::<Value>(&text) {
            Ok(value) => Body::Json(value),
            Err(_) => Body::Text(text),
        };

        Ok(HttpResponse {
            status: status.as_u16(),
            headers,
            data,
        })
    }

    fn build_url(&self, url: &str) -> String {
        match &self.base_url {
            Some(base) if !url.starts_with("http://") && !url.starts_with("https://") => {
                format!("{}/{}", base, url.trim_start_matches('/'))
            }
            _ => url.to_string(),
        }
    }

    fn merge_headers(&self, headers: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        let mut merged = self.default_headers.clone();
        if let Some(extra) = headers {
            for (name, value) in extra {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff before retry number `attempt + 1`: `2^min(attempt+1, 5)` seconds,
/// so 2, 4, 8, 16, then 32 capped. No jitter; the schedule is a contract.
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = (attempt + 1).min(5);
    Duration::from_secs(1u64 << exponent)
}
