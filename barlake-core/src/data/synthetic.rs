//! Offline provider producing deterministic bars.
//!
//! Sessions run 13:30-20:00 UTC on weekdays. Every bar is derived from a hash
//! of the symbol and its timestamp, so refetching any page yields identical
//! data. Used for dry runs, benchmarks and integration tests.

use super::provider::{Cursor, Page, PageRequest, ProviderClient, ProviderError, Timeframe};
use crate::domain::{is_weekday, Bar, Symbol, TimeRange};
use chrono::{DateTime, NaiveTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::header::HeaderMap;
use rust_decimal::Decimal;

const CURSOR_PREFIX: &str = "offset:";

pub struct SyntheticClient {
    feed: String,
    timeframe: Timeframe,
}

impl SyntheticClient {
    pub fn new(feed: &str, timeframe: Timeframe) -> Self {
        Self {
            feed: feed.to_string(),
            timeframe,
        }
    }

    /// Bar timestamps inside `range`, ascending.
    pub fn timestamps(&self, range: &TimeRange) -> Vec<DateTime<Utc>> {
        let step = self.timeframe.duration();
        let (Some(open), Some(close)) = (NaiveTime::from_hms_opt(13, 30, 0), NaiveTime::from_hms_opt(20, 0, 0))
        else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let first = range.start().date_naive();
        for day in first.iter_days() {
            if day.and_time(NaiveTime::MIN).and_utc() >= range.end() {
                break;
            }
            if !is_weekday(day) {
                continue;
            }
            let session_end = day.and_time(close).and_utc();
            let mut ts = day.and_time(open).and_utc();
            while ts < session_end {
                if range.contains(ts) {
                    out.push(ts);
                }
                ts += step;
            }
        }
        out
    }

    /// Every bar for `symbol` inside `range`.
    pub fn generate(&self, symbol: &Symbol, range: &TimeRange) -> Vec<Bar> {
        self.timestamps(range)
            .into_iter()
            .map(|ts| synthetic_bar(symbol, ts))
            .collect()
    }

    fn parse_cursor(cursor: &Cursor, total: usize) -> Result<usize, ProviderError> {
        cursor
            .as_str()
            .strip_prefix(CURSOR_PREFIX)
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n <= total)
            .ok_or_else(|| ProviderError::InvalidCursor(cursor.to_string()))
    }
}

fn synthetic_bar(symbol: &Symbol, timestamp: DateTime<Utc>) -> Bar {
    let base_seed = blake3::hash(symbol.as_str().as_bytes());
    let base_cents = 5_000 + i64::from(u16::from_le_bytes([base_seed.as_bytes()[0], base_seed.as_bytes()[1]])) % 45_000;

    let mut hasher = blake3::Hasher::new();
    hasher.update(symbol.as_str().as_bytes());
    hasher.update(&timestamp.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let mut rng = StdRng::from_seed(*hasher.finalize().as_bytes());

    let open = base_cents + rng.gen_range(-200..=200);
    let close = base_cents + rng.gen_range(-200..=200);
    let high = open.max(close) + rng.gen_range(0..=50);
    let low = open.min(close) - rng.gen_range(0..=50);

    Bar {
        symbol: symbol.clone(),
        timestamp,
        open: Decimal::new(open, 2),
        high: Decimal::new(high, 2),
        low: Decimal::new(low, 2),
        close: Decimal::new(close, 2),
        volume: rng.gen_range(100..=100_000),
    }
}

impl ProviderClient for SyntheticClient {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn feed(&self) -> &str {
        &self.feed
    }

    fn fetch_page(&self, request: &PageRequest) -> Result<Page, ProviderError> {
        let stamps = self.timestamps(&request.range);
        let start = match &request.cursor {
            None => 0,
            Some(cursor) => Self::parse_cursor(cursor, stamps.len())?,
        };
        let end = (start + request.page_size.max(1) as usize).min(stamps.len());

        let bars = stamps[start..end]
            .iter()
            .map(|ts| synthetic_bar(&request.symbol, *ts))
            .collect();
        let next_cursor = (end < stamps.len()).then(|| Cursor::new(format!("{CURSOR_PREFIX}{end}")));
        Ok(Page { bars, next_cursor })
    }

    fn auth_headers(&self) -> Result<HeaderMap, ProviderError> {
        Ok(HeaderMap::new())
    }
}
