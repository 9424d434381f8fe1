//! Core building blocks wired together by hand: fetch through the resilient
//! client, validate, write partitions, commit checkpoints.

use barlake_core::cancel::CancelToken;
use barlake_core::data::provider::{PageRequest, ProviderClient, Timeframe};
use barlake_core::data::synthetic::SyntheticClient;
use barlake_core::data::{
    validate, CircuitBreaker, PartitionCompression, PartitionWriter, Quota, RateLimiterRegistry, ResilientClient,
    RetryPolicy, ValidationContext,
};
use barlake_core::domain::{Bar, DateRange, Symbol};
use barlake_core::metrics::CounterMetrics;
use barlake_core::state::{CheckpointCommit, CheckpointScope, CheckpointStore, FileCheckpointStore};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;

fn week() -> DateRange {
    DateRange::new(
        NaiveDate::from_ymd_opt(2024, 6, 17).unwrap(),
        NaiveDate::from_ymd_opt(2024, 6, 21).unwrap(),
    )
    .unwrap()
}

fn resilient() -> ResilientClient {
    let client: Arc<dyn ProviderClient> = Arc::new(SyntheticClient::new("demo", Timeframe::FifteenMinutes));
    let registry = RateLimiterRegistry::new();
    let limiter = registry.limiter(&client.feed_key(), Quota::per_minute(6_000).unwrap());
    ResilientClient::new(
        client,
        limiter,
        Arc::new(CircuitBreaker::default_provider()),
        RetryPolicy::default(),
    )
}

/// Fetch every page for `symbol` and return them in cursor order.
fn fetch_all(client: &ResilientClient, symbol: &Symbol, metrics: &CounterMetrics) -> Vec<(Vec<Bar>, bool)> {
    let range = week().to_time_range().unwrap();
    let cancel = CancelToken::new();
    let mut cursor = None;
    let mut pages = Vec::new();
    loop {
        let request = PageRequest {
            symbol: symbol.clone(),
            range,
            cursor: cursor.clone(),
            page_size: 100,
        };
        let page = client.fetch_page(&request, &cancel, metrics).unwrap();
        let last = page.is_last();
        pages.push((page.bars, last));
        cursor = page.next_cursor;
        if last {
            return pages;
        }
    }
}

fn by_date(bars: &[Bar]) -> BTreeMap<NaiveDate, Vec<Bar>> {
    let mut out: BTreeMap<NaiveDate, Vec<Bar>> = BTreeMap::new();
    for bar in bars {
        out.entry(bar.trading_date()).or_default().push(bar.clone());
    }
    out
}

#[test]
fn a_week_of_pages_lands_in_daily_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let writer = PartitionWriter::new(dir.path(), PartitionCompression::Snappy);
    let checkpoints = FileCheckpointStore::in_state_dir(&dir.path().join("_state"));
    let metrics = CounterMetrics::new();
    let client = resilient();
    let symbol = Symbol::new("MSFT").unwrap();
    let range = week().to_time_range().unwrap();
    let scope = CheckpointScope {
        feed: client.client().feed_key(),
        range,
    };

    let pages = fetch_all(&client, &symbol, &metrics);
    // 13:30..20:00 in 15-minute steps is 26 bars a day.
    assert_eq!(pages.len(), 2);

    let mut previous = None;
    for (bars, last) in &pages {
        let report = validate(
            bars,
            &ValidationContext {
                symbol: symbol.clone(),
                range,
                previous_timestamp: previous,
            },
        );
        assert!(report.is_valid(), "{}", report.summary(3));
        for (date, day) in by_date(bars) {
            assert!(writer.write(&symbol, date, &day).unwrap().changed);
        }
        previous = bars.last().map(|b| b.timestamp);
        checkpoints
            .commit(
                &symbol,
                CheckpointCommit {
                    scope: scope.clone(),
                    next: if *last { None } else { Some(barlake_core::data::Cursor::new("more")) },
                    last_timestamp: previous,
                    bars: bars.len() as u64,
                },
            )
            .unwrap();
    }

    let dates = writer.list_dates(&symbol).unwrap();
    assert_eq!(dates, week().trading_days());
    for date in dates {
        assert_eq!(writer.row_count(&symbol, date).unwrap(), 26);
    }
    let cp = checkpoints.load(&symbol).unwrap().unwrap();
    assert!(cp.is_exhausted());
    assert_eq!(cp.bars_committed, 130);
    assert_eq!(cp.pages_committed, 2);
    assert_eq!(metrics.snapshot().retries, 0);
}

#[test]
fn replaying_a_week_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let writer = PartitionWriter::new(dir.path(), PartitionCompression::Zstd);
    let metrics = CounterMetrics::new();
    let client = resilient();
    let symbol = Symbol::new("NVDA").unwrap();

    let mut hashes = BTreeMap::new();
    for (bars, _) in fetch_all(&client, &symbol, &metrics) {
        for (date, day) in by_date(&bars) {
            let out = writer.write(&symbol, date, &day).unwrap();
            hashes.insert(date, out.content_hash);
        }
    }

    for (bars, _) in fetch_all(&client, &symbol, &metrics) {
        for (date, day) in by_date(&bars) {
            let out = writer.write(&symbol, date, &day).unwrap();
            assert!(!out.changed, "{date} rewritten");
            assert_eq!(hashes[&date], out.content_hash);
        }
    }
}
