//! Provider client trait and structured error types.
//!
//! The ProviderClient trait abstracts over market-data sources (Alpaca feeds,
//! Yahoo Finance, the offline synthetic generator) so the coordinator can
//! drive any of them and tests can script one. Rate limiting, retries and the
//! circuit breaker sit above this trait in [`super::retry::ResilientClient`];
//! clients only build requests, parse responses and classify failures.

use super::alpaca::AlpacaClient;
use super::auth::AuthStrategy;
use super::rate_limit::FeedKey;
use super::synthetic::SyntheticClient;
use super::yahoo::YahooClient;
use crate::domain::{Bar, Symbol, TimeRange};
use chrono::Duration as ChronoDuration;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Opaque pagination position. Only the client that issued it interprets it;
/// everyone else stores and forwards it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One page request: fetch bars for `symbol` inside `range`, continuing from
/// `cursor` (`None` = from the beginning).
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub symbol: Symbol,
    pub range: TimeRange,
    pub cursor: Option<Cursor>,
    pub page_size: u32,
}

/// One page of bars in cursor order. `next_cursor == None` means the range is
/// exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub bars: Vec<Bar>,
    pub next_cursor: Option<Cursor>,
}

impl Page {
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_none()
    }
}

/// Structured error types for provider calls.
///
/// These are designed to be displayable in both logs and job failure reasons.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("request rejected (HTTP {status}): {message}")]
    RequestRejected { status: u16, message: String },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("access forbidden: {0}")]
    Forbidden(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("invalid cursor '{0}'")]
    InvalidCursor(String),

    #[error("hard stop: circuit breaker open for {feed}")]
    CircuitOpen { feed: String },

    #[error("provider misconfigured: {0}")]
    Misconfigured(String),
}

impl ProviderError {
    /// Transient failures worth another attempt: rate limits, 5xx, timeouts
    /// and connection failures. Everything else fails the fetch immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::NetworkUnreachable(_)
                | ProviderError::Timeout(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::ServerError { .. }
        )
    }

    /// Server-requested delay, if the error carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Map a non-success HTTP status to an error.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let message = snippet(body);
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED => ProviderError::AuthenticationFailed(message),
        StatusCode::FORBIDDEN => ProviderError::Forbidden(message),
        StatusCode::REQUEST_TIMEOUT => ProviderError::Timeout(message),
        s if s.is_server_error() => ProviderError::ServerError {
            status: s.as_u16(),
            message,
        },
        s => ProviderError::RequestRejected {
            status: s.as_u16(),
            message,
        },
    }
}

/// Map a transport-level reqwest failure to an error.
pub fn classify_transport(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else if err.is_decode() {
        ProviderError::ResponseFormatChanged(err.to_string())
    } else if err.is_builder() {
        ProviderError::Misconfigured(err.to_string())
    } else {
        // connect failures, resets and truncated bodies
        ProviderError::NetworkUnreachable(err.to_string())
    }
}

/// `Retry-After` in delta-seconds form.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn snippet(body: &str) -> String {
    const MAX: usize = 200;
    let trimmed = body.trim();
    match trimmed.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Capability set of one market-data provider feed.
pub trait ProviderClient: Send + Sync {
    /// Stable provider name, e.g. `alpaca`.
    fn name(&self) -> &str;

    /// Feed (data tier) this client talks to, e.g. `iex`.
    fn feed(&self) -> &str;

    /// Quota identity: distinct feeds get distinct rate limiters.
    fn feed_key(&self) -> FeedKey {
        FeedKey::new(self.name(), self.feed())
    }

    /// Fetch one page of bars.
    fn fetch_page(&self, request: &PageRequest) -> Result<Page, ProviderError>;

    /// Whether `error` is worth another attempt.
    fn should_retry(&self, error: &ProviderError) -> bool {
        error.is_retryable()
    }

    /// Headers authenticating a request to this provider.
    fn auth_headers(&self) -> Result<HeaderMap, ProviderError>;
}

/// Bar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Timeframe {
    #[default]
    #[serde(rename = "1min")]
    OneMinute,
    #[serde(rename = "5min")]
    FiveMinutes,
    #[serde(rename = "15min")]
    FifteenMinutes,
    #[serde(rename = "1hour")]
    OneHour,
    #[serde(rename = "1day")]
    OneDay,
}

impl Timeframe {
    pub fn duration(self) -> ChronoDuration {
        match self {
            Timeframe::OneMinute => ChronoDuration::minutes(1),
            Timeframe::FiveMinutes => ChronoDuration::minutes(5),
            Timeframe::FifteenMinutes => ChronoDuration::minutes(15),
            Timeframe::OneHour => ChronoDuration::hours(1),
            Timeframe::OneDay => ChronoDuration::days(1),
        }
    }
}

/// Which client variant to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Alpaca,
    Yahoo,
    Synthetic,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Alpaca => "alpaca",
            ProviderKind::Yahoo => "yahoo",
            ProviderKind::Synthetic => "synthetic",
        }
    }
}

/// Everything needed to construct a client.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub feed: String,
    pub timeframe: Timeframe,
    /// Overrides the provider's public endpoint.
    pub base_url: Option<String>,
    pub auth: AuthStrategy,
    pub request_timeout: Duration,
}

impl ProviderSettings {
    pub fn new(kind: ProviderKind, feed: impl Into<String>) -> Self {
        Self {
            kind,
            feed: feed.into(),
            timeframe: Timeframe::default(),
            base_url: None,
            auth: AuthStrategy::None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Build the client variant named by `settings.kind`.
pub fn build_client(settings: &ProviderSettings) -> Result<Arc<dyn ProviderClient>, ProviderError> {
    let client: Arc<dyn ProviderClient> = match settings.kind {
        ProviderKind::Alpaca => Arc::new(AlpacaClient::new(settings)?),
        ProviderKind::Yahoo => Arc::new(YahooClient::new(settings)?),
        ProviderKind::Synthetic => Arc::new(SyntheticClient::new(&settings.feed, settings.timeframe)),
    };
    tracing::debug!(provider = client.name(), feed = client.feed(), "provider client built");
    Ok(client)
}

/// Shared blocking HTTP client construction.
pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client, ProviderError> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("barlake/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProviderError::Misconfigured(format!("failed to build HTTP client: {e}")))
}

/// Send `request` and return the body of a 2xx response. Anything else is
/// classified into a [`ProviderError`].
pub(crate) fn send(request: reqwest::blocking::RequestBuilder) -> Result<String, ProviderError> {
    let resp = request.send().map_err(|e| classify_transport(&e))?;
    let status = resp.status();
    let retry_after = parse_retry_after(resp.headers());
    let body = resp.text().map_err(|e| classify_transport(&e))?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(classify_status(status, retry_after, &body))
    }
}
