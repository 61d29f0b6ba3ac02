//! Rate-limited HTTP plumbing shared by the scheduling and CRM clients.
//!
//! One [`RateLimitedClient`] exists per credential set. It serializes its own calls,
//! honours header-driven cool-downs, retries 429/502 with a bounded exponential backoff,
//! and refreshes expired credentials once per call through an [`Authenticator`].

pub mod paging;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub use paging::{date_windows, fetch_pages, fetch_range, DateWindow, Page};

pub const CRATE_NAME: &str = "salesbridge-http";

/// Body fragments the CRM uses to signal an expired or revoked access token.
pub const AUTH_EXPIRED_SIGNATURES: [&str; 3] = [
    "access token has expired",
    "access token is invalid",
    "invalid jwt",
];

pub fn body_signals_expired_token(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    AUTH_EXPIRED_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(signature))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::BAD_GATEWAY => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total sends allowed for transient failures, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Added on top of the provider's reset hint when the remaining quota runs out.
    pub cool_down_padding: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            cool_down_padding: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Cool-down bookkeeping for one credential set.
#[derive(Debug, Default)]
pub struct RateLimiterState {
    cool_down_until: Option<Instant>,
    calls: u64,
}

impl RateLimiterState {
    /// Record rate-limit headers from a response. Once the remaining quota drops to one
    /// call, further calls wait for the advertised reset plus `padding`.
    pub fn observe(&mut self, headers: &HeaderMap, padding: Duration) {
        self.calls += 1;
        let Some(remaining) = header_number(headers, "ratelimit-remaining") else {
            return;
        };
        if remaining > 1.0 {
            return;
        }
        let reset = header_number(headers, "ratelimit-reset").unwrap_or(0.0);
        let until = Instant::now() + Duration::from_secs_f64(reset.max(0.0)) + padding;
        self.cool_down_until = Some(match self.cool_down_until {
            Some(existing) => existing.max(until),
            None => until,
        });
    }

    pub fn pending_wait(&self) -> Option<Duration> {
        self.cool_down_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .filter(|wait| !wait.is_zero())
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

fn header_number(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<f64>().ok())
}

/// Seconds from a `Retry-After` header. HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_number(headers, "retry-after").map(|secs| Duration::from_secs_f64(secs.max(0.0)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransientHttp,
    AuthExpired,
    NotFound,
    RemoteRejected,
    Transport,
    Decode,
    InvalidRequest,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{method} {endpoint} returned {status}: {body}")]
    Http {
        method: String,
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("{method} {endpoint} still failing with {status} after {attempts} attempts")]
    RetriesExhausted {
        method: String,
        endpoint: String,
        status: u16,
        attempts: usize,
    },
    #[error("token refresh failed for {endpoint}: {reason}")]
    AuthRefresh { endpoint: String, reason: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("decoding response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Http { status, body, .. } => {
                if *status == 404 || body.to_ascii_lowercase().contains("guest not found") {
                    ErrorKind::NotFound
                } else {
                    ErrorKind::RemoteRejected
                }
            }
            ApiError::RetriesExhausted { .. } => ErrorKind::TransientHttp,
            ApiError::AuthRefresh { .. } => ErrorKind::AuthExpired,
            ApiError::Transport(_) => ErrorKind::Transport,
            ApiError::Decode { .. } => ErrorKind::Decode,
            ApiError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } | ApiError::RetriesExhausted { status, .. } => {
                Some(*status)
            }
            ApiError::Transport(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

/// Supplies credentials for outbound calls and knows how to renew them.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Value for the `Authorization` header, if any.
    async fn authorization(&self) -> Option<String>;

    fn is_auth_expired(&self, _status: StatusCode, _body: &str) -> bool {
        false
    }

    /// Renew credentials and persist them. Called at most once per call.
    async fn refresh(&self) -> Result<(), ApiError> {
        Err(ApiError::AuthRefresh {
            endpoint: String::new(),
            reason: "credentials cannot be refreshed".to_string(),
        })
    }
}

/// Static `Authorization` header, e.g. `apikey <key>`.
#[derive(Debug, Clone)]
pub struct ApiKeyAuth {
    header_value: String,
}

impl ApiKeyAuth {
    pub fn new(scheme: &str, key: &str) -> Self {
        Self {
            header_value: format!("{scheme} {key}"),
        }
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuth {
    async fn authorization(&self) -> Option<String> {
        Some(self.header_value.clone())
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

/// A replayable request description. Retries re-send it unchanged.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub endpoint: String,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

impl ApiRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|err| ApiError::InvalidRequest(format!("{}: {err}", self.endpoint)))?;
        self.body = Some(RequestBody::Json(value));
        Ok(self)
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(fields));
        self
    }
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl RawResponse {
    pub fn json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        serde_json::from_str(&self.body).map_err(|source| ApiError::Decode {
            endpoint: endpoint.to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub default_headers: Vec<(String, String)>,
    pub backoff: BackoffPolicy,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            default_headers: Vec::new(),
            backoff: BackoffPolicy::default(),
        }
    }
}

pub struct RateLimitedClient {
    http: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
    auth: Arc<dyn Authenticator>,
    state: Mutex<RateLimiterState>,
}

impl std::fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedClient")
            .field("base_url", &self.base_url)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RateLimitedClient {
    pub fn new(config: ClientConfig, auth: Arc<dyn Authenticator>) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| ApiError::InvalidRequest(format!("header {name}: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| ApiError::InvalidRequest(format!("header value: {err}")))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            http: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
            auth,
            state: Mutex::new(RateLimiterState::default()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn calls_made(&self) -> u64 {
        self.state.lock().await.calls()
    }

    fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
        }
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<RawResponse, reqwest::Error> {
        let mut builder = self
            .http
            .request(request.method.clone(), self.url_for(&request.endpoint));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(value) = self.auth.authorization().await {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder = match &request.body {
            Some(RequestBody::Json(value)) => builder.json(value),
            Some(RequestBody::Form(fields)) => builder.form(fields),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    /// Send `request`, retrying transient failures and refreshing expired credentials once.
    ///
    /// Holds this client's limiter lock for the whole exchange, so calls sharing a
    /// credential set never overlap.
    pub async fn call(&self, request: &ApiRequest) -> Result<RawResponse, ApiError> {
        let span = info_span!(
            "api_call",
            method = %request.method,
            endpoint = %request.endpoint
        );
        async move {
            let mut state = self.state.lock().await;
            let mut failures = 0usize;
            let mut refreshed = false;

            loop {
                if let Some(wait) = state.pending_wait() {
                    debug!(wait_ms = wait.as_millis() as u64, "rate limit cool-down");
                    tokio::time::sleep(wait).await;
                }

                let response = match self.send_once(request).await {
                    Ok(response) => response,
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable {
                            failures += 1;
                            if failures < self.backoff.max_attempts {
                                warn!(
                                    attempt = failures,
                                    error = %err,
                                    "transport failure, retrying"
                                );
                                tokio::time::sleep(self.backoff.delay_for_attempt(failures - 1))
                                    .await;
                                continue;
                            }
                        }
                        return Err(ApiError::Transport(err));
                    }
                };

                state.observe(&response.headers, self.backoff.cool_down_padding);
                let status = response.status;
                if status.as_u16() <= 299 {
                    return Ok(response);
                }

                if classify_status(status) == RetryDisposition::Retryable {
                    failures += 1;
                    if failures >= self.backoff.max_attempts {
                        return Err(ApiError::RetriesExhausted {
                            method: request.method.to_string(),
                            endpoint: request.endpoint.clone(),
                            status: status.as_u16(),
                            attempts: failures,
                        });
                    }
                    let backoff = self.backoff.delay_for_attempt(failures - 1);
                    let wait = if status == StatusCode::TOO_MANY_REQUESTS {
                        retry_after(&response.headers).unwrap_or(backoff)
                    } else {
                        backoff
                    };
                    warn!(
                        attempt = failures,
                        status = status.as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "transient response, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }

                if !refreshed && self.auth.is_auth_expired(status, &response.body) {
                    warn!("access token expired, refreshing");
                    self.auth.refresh().await.map_err(|err| match err {
                        ApiError::AuthRefresh { reason, .. } => ApiError::AuthRefresh {
                            endpoint: request.endpoint.clone(),
                            reason,
                        },
                        other => ApiError::AuthRefresh {
                            endpoint: request.endpoint.clone(),
                            reason: other.to_string(),
                        },
                    })?;
                    refreshed = true;
                    continue;
                }

                return Err(ApiError::Http {
                    method: request.method.to_string(),
                    endpoint: request.endpoint.clone(),
                    status: status.as_u16(),
                    body: response.body,
                });
            }
        }
        .instrument(span)
        .await
    }

    pub async fn call_json<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
    ) -> Result<T, ApiError> {
        self.call(request).await?.json(&request.endpoint)
    }
}
