//! Yahoo Finance chart client.
//!
//! The v8 chart API has no pagination, so this client pages by UTC day: each
//! page covers one calendar day of the requested range and the cursor holds
//! the unix start of the next day. `page_size` is ignored.
//!
//! Yahoo has no official API and changes its format without notice; anything
//! unexpected in the payload is reported as `ResponseFormatChanged`.

use super::provider::{
    http_client, send, Cursor, Page, PageRequest, ProviderClient, ProviderError, ProviderSettings, Timeframe,
};
use crate::domain::{Bar, Symbol, TimeRange};
use chrono::{DateTime, Days, Utc};
use reqwest::header::HeaderMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;

pub const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com";

/// Yahoo quotes carry float noise beyond this many decimals.
const PRICE_DECIMALS: u32 = 4;

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<i64>>,
}

pub struct YahooClient {
    http: reqwest::blocking::Client,
    base_url: String,
    feed: String,
    timeframe: Timeframe,
}

impl YahooClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
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
        })
    }

    fn interval(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::OneHour => "60m",
            Timeframe::OneDay => "1d",
        }
    }

    /// The window `[start, end)` this page covers and the cursor after it.
    fn window(request: &PageRequest) -> Result<(TimeRange, Option<Cursor>), ProviderError> {
        let range = request.range;
        let start = match &request.cursor {
            None => range.start(),
            Some(cursor) => {
                let secs: i64 = cursor
                    .as_str()
                    .parse()
                    .map_err(|_| ProviderError::InvalidCursor(cursor.to_string()))?;
                DateTime::from_timestamp(secs, 0)
                    .filter(|t| range.contains(*t))
                    .ok_or_else(|| ProviderError::InvalidCursor(cursor.to_string()))?
            }
        };
        let next_day = start
            .date_naive()
            .checked_add_days(Days::new(1))
            .map(|d| d.and_time(chrono::NaiveTime::MIN).and_utc())
            .ok_or_else(|| ProviderError::InvalidCursor(start.to_rfc3339()))?;
        let end = next_day.min(range.end());
        let next = (end < range.end()).then(|| Cursor::new(end.timestamp().to_string()));
        let window = TimeRange::new(start, end).map_err(|e| ProviderError::InvalidCursor(e.to_string()))?;
        Ok((window, next))
    }

    fn parse_response(symbol: &Symbol, window: &TimeRange, body: &str) -> Result<Vec<Bar>, ProviderError> {
        let resp: ChartResponse = serde_json::from_str(body)
            .map_err(|e| ProviderError::ResponseFormatChanged(format!("chart response for {symbol}: {e}")))?;

        let result = match (resp.chart.result, resp.chart.error) {
            (Some(result), _) => result,
            (None, Some(err)) if err.code == "Not Found" => {
                return Err(ProviderError::SymbolNotFound {
                    symbol: symbol.to_string(),
                })
            }
            (None, Some(err)) => {
                return Err(ProviderError::ResponseFormatChanged(format!(
                    "{}: {}",
                    err.code, err.description
                )))
            }
            (None, None) => {
                return Err(ProviderError::ResponseFormatChanged("empty result with no error".into()))
            }
        };

        let data = result
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ResponseFormatChanged("result array is empty".into()))?;

        // No timestamps: nothing traded in the window.
        let Some(timestamps) = data.timestamp else {
            return Ok(Vec::new());
        };

        let quote = data
            .indicators
            .quote
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ResponseFormatChanged("no quote data".into()))?;

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            let open = quote.open.get(i).copied().flatten();
            let high = quote.high.get(i).copied().flatten();
            let low = quote.low.get(i).copied().flatten();
            let close = quote.close.get(i).copied().flatten();
            let volume = quote.volume.get(i).copied().flatten();

            // All-null rows are halts and holidays.
            if open.is_none() && high.is_none() && low.is_none() && close.is_none() && volume.is_none() {
                continue;
            }

            let (Some(open), Some(high), Some(low), Some(close)) = (open, high, low, close) else {
                return Err(ProviderError::ResponseFormatChanged(format!(
                    "partially null quote at index {i} for {symbol}"
                )));
            };

            let timestamp = DateTime::from_timestamp(ts, 0)
                .ok_or_else(|| ProviderError::ResponseFormatChanged(format!("invalid timestamp: {ts}")))?;
            if !window.contains(timestamp) {
                continue;
            }

            bars.push(Bar {
                symbol: symbol.clone(),
                timestamp,
                open: price(open)?,
                high: price(high)?,
                low: price(low)?,
                close: price(close)?,
                volume: volume.unwrap_or(0),
            });
        }
        Ok(bars)
    }
}

fn price(value: f64) -> Result<Decimal, ProviderError> {
    if !value.is_finite() {
        return Err(ProviderError::ResponseFormatChanged(format!("non-finite price {value}")));
    }
    Decimal::from_str(&value.to_string())
        .or_else(|_| Decimal::from_scientific(&format!("{value:e}")))
        .map(|d| d.round_dp(PRICE_DECIMALS))
        .map_err(|e| ProviderError::ResponseFormatChanged(format!("price {value}: {e}")))
}

impl ProviderClient for YahooClient {
    fn name(&self) -> &str {
        "yahoo"
    }

    fn feed(&self) -> &str {
        &self.feed
    }

    fn fetch_page(&self, request: &PageRequest) -> Result<Page, ProviderError> {
        let (window, next_cursor) = Self::window(request)?;
        let url = format!("{}/v8/finance/chart/{}", self.base_url, request.symbol);
        let body = send(self.http.get(&url).headers(self.auth_headers()?).query(&[
            ("period1", window.start().timestamp().to_string()),
            ("period2", window.end().timestamp().to_string()),
            ("interval", Self::interval(self.timeframe).to_string()),
        ]))
        .map_err(|e| match e {
            ProviderError::RequestRejected { status: 404, .. } => ProviderError::SymbolNotFound {
                symbol: request.symbol.to_string(),
            },
            other => other,
        })?;

        let bars = Self::parse_response(&request.symbol, &window, &body)?;
        Ok(Page { bars, next_cursor })
    }

    fn auth_headers(&self) -> Result<HeaderMap, ProviderError> {
        Ok(HeaderMap::new())
    }
}
