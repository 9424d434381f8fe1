//! Alpaca market-data client (`/v2/stocks/{symbol}/bars`).
//!
//! Alpaca paginates with an opaque `next_page_token`, which is passed through
//! unchanged as the [`Cursor`]. Each data tier (`iex`, `sip`, ...) is a
//! separate feed with its own quota.

use super::auth::AuthStrategy;
use super::provider::{
    http_client, send, Cursor, Page, PageRequest, ProviderClient, ProviderError, ProviderSettings, Timeframe,
};
use crate::domain::{Bar, Symbol};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::HeaderMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

pub const DEFAULT_BASE_URL: &str = "https://data.alpaca.markets";

/// Largest `limit` the bars endpoint accepts.
const MAX_PAGE_SIZE: u32 = 10_000;

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Option<Vec<AlpacaBar>>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaBar {
    t: DateTime<Utc>,
    o: serde_json::Number,
    h: serde_json::Number,
    l: serde_json::Number,
    c: serde_json::Number,
    v: serde_json::Number,
}

pub struct AlpacaClient {
    http: reqwest::blocking::Client,
    base_url: String,
    feed: String,
    timeframe: Timeframe,
    auth: AuthStrategy,
}

impl AlpacaClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        if settings.feed.trim().is_empty() {
            return Err(ProviderError::Misconfigured("alpaca feed must not be empty".into()));
        }
        Ok(Self {
            http: http_client(settings.request_timeout)?,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            feed: settings.feed.clone(),
            timeframe: settings.timeframe,
            auth: settings.auth.clone(),
        })
    }

    fn timeframe_param(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::OneMinute => "1Min",
            Timeframe::FiveMinutes => "5Min",
            Timeframe::FifteenMinutes => "15Min",
            Timeframe::OneHour => "1Hour",
            Timeframe::OneDay => "1Day",
        }
    }

    fn query(&self, request: &PageRequest) -> Vec<(&'static str, String)> {
        let rfc3339 = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        let mut query = vec![
            ("timeframe", Self::timeframe_param(self.timeframe).to_string()),
            ("start", rfc3339(request.range.start())),
            ("end", rfc3339(request.range.end())),
            ("limit", request.page_size.clamp(1, MAX_PAGE_SIZE).to_string()),
            ("feed", self.feed.clone()),
            ("adjustment", "raw".to_string()),
            ("sort", "asc".to_string()),
        ];
        if let Some(cursor) = &request.cursor {
            query.push(("page_token", cursor.as_str().to_string()));
        }
        query
    }

    fn parse_response(symbol: &Symbol, body: &str) -> Result<Page, ProviderError> {
        let resp: BarsResponse = serde_json::from_str(body)
            .map_err(|e| ProviderError::ResponseFormatChanged(format!("bars response for {symbol}: {e}")))?;

        let bars = resp
            .bars
            .unwrap_or_default()
            .into_iter()
            .map(|b| {
                Ok(Bar {
                    symbol: symbol.clone(),
                    timestamp: b.t,
                    open: decimal(&b.o)?,
                    high: decimal(&b.h)?,
                    low: decimal(&b.l)?,
                    close: decimal(&b.c)?,
                    volume: volume(&b.v)?,
                })
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;

        let next_cursor = resp
            .next_page_token
            .filter(|t| !t.is_empty())
            .map(Cursor::new);

        Ok(Page { bars, next_cursor })
    }
}

/// Exact decimal from a JSON number, keeping the digits the provider sent.
fn decimal(n: &serde_json::Number) -> Result<Decimal, ProviderError> {
    let text = n.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| ProviderError::ResponseFormatChanged(format!("price '{text}': {e}")))
}

fn volume(n: &serde_json::Number) -> Result<i64, ProviderError> {
    if let Some(v) = n.as_i64() {
        return Ok(v);
    }
    match n.as_f64() {
        Some(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => Ok(v as i64),
        _ => Err(ProviderError::ResponseFormatChanged(format!("volume '{n}' is not an integer"))),
    }
}

impl ProviderClient for AlpacaClient {
    fn name(&self) -> &str {
        "alpaca"
    }

    fn feed(&self) -> &str {
        &self.feed
    }

    fn fetch_page(&self, request: &PageRequest) -> Result<Page, ProviderError> {
        let url = format!("{}/v2/stocks/{}/bars", self.base_url, request.symbol);
        let body = send(
            self.http
                .get(&url)
                .headers(self.auth_headers()?)
                .query(&self.query(request)),
        )
        .map_err(|e| match e {
            ProviderError::RequestRejected { status: 404, .. } => ProviderError::SymbolNotFound {
                symbol: request.symbol.to_string(),
            },
            ProviderError::RequestRejected { status: 400, message }
                if request.cursor.is_some() && message.contains("page_token") =>
            {
                ProviderError::InvalidCursor(message)
            }
            other => other,
        })?;
        Self::parse_response(&request.symbol, &body)
    }

    fn auth_headers(&self) -> Result<HeaderMap, ProviderError> {
        if self.auth.is_none() {
            return Err(ProviderError::AuthenticationFailed(
                "alpaca requires API key credentials".into(),
            ));
        }
        self.auth.headers()
    }
}
