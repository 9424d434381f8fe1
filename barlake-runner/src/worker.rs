//! One job, start to finish, on the calling thread.
//!
//! For every page: fetch (rate limited, retried), validate, merge into the
//! day partitions, then commit the checkpoint. A page is only checkpointed
//! once its partitions are durable, so a crash re-fetches at most one page
//! and the merge makes the replay a no-op.

use crate::job::{JobId, JobStats};
use barlake_core::cancel::{CancelToken, Cancelled};
use barlake_core::data::provider::{Cursor, PageRequest};
use barlake_core::data::retry::{FetchError, ResilientClient};
use barlake_core::data::validate::{validate, ValidationContext};
use barlake_core::data::{PartitionError, PartitionWriter};
use barlake_core::domain::{Bar, DateRange, RangeError, Symbol};
use barlake_core::metrics::{MetricEvent, MetricsSink};
use barlake_core::state::{CheckpointCommit, CheckpointScope, CheckpointStore, CompletenessStore, StateError};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Issues quoted in a validation failure reason.
const VALIDATION_SUMMARY_ISSUES: usize = 3;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("cancelled")]
    Cancelled,

    #[error("invalid date range: {0}")]
    Range(#[from] RangeError),

    #[error("fetch failed: {0}")]
    Fetch(FetchError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("provider returned cursor '{0}' again")]
    CursorStalled(Cursor),

    #[error("partition write failed: {0}")]
    Partition(#[from] PartitionError),

    #[error("checkpoint commit failed: {0}")]
    Checkpoint(StateError),

    #[error("completeness update failed: {0}")]
    Completeness(StateError),
}

impl From<Cancelled> for JobError {
    fn from(_: Cancelled) -> Self {
        JobError::Cancelled
    }
}

impl From<FetchError> for JobError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => JobError::Cancelled,
            other => JobError::Fetch(other),
        }
    }
}

/// Everything a worker borrows from the coordinator.
pub(crate) struct Pipeline<'a> {
    pub client: &'a ResilientClient,
    pub checkpoints: &'a dyn CheckpointStore,
    pub completeness: &'a dyn CompletenessStore,
    pub partitions: &'a PartitionWriter,
    pub metrics: &'a dyn MetricsSink,
    pub page_size: u32,
}

/// The part of a job a worker needs; copied out of the job table at dispatch.
#[derive(Debug, Clone)]
pub(crate) struct JobSpec {
    pub id: JobId,
    pub symbol: Symbol,
    pub range: DateRange,
}

pub(crate) fn ingest(
    p: &Pipeline<'_>,
    spec: &JobSpec,
    cancel: &CancelToken,
    stats: &mut JobStats,
) -> Result<(), JobError> {
    let symbol = &spec.symbol;
    let range = spec.range.to_time_range()?;
    let scope = CheckpointScope {
        feed: p.client.client().feed_key(),
        range,
    };
    let days = spec.range.trading_days();

    let checkpoint = p
        .checkpoints
        .load(symbol)
        .map_err(JobError::Checkpoint)?
        .filter(|cp| {
            let usable = cp.matches(&scope);
            if !usable {
                info!(job_id = %spec.id, %symbol, "ignoring checkpoint from a different feed or range");
            }
            usable
        });

    for day in &days {
        p.completeness.mark_started(symbol, *day).map_err(JobError::Completeness)?;
    }

    let (mut cursor, mut previous, exhausted) = match &checkpoint {
        Some(cp) => (cp.next.clone(), cp.last_timestamp, cp.is_exhausted()),
        None => (None, None, false),
    };
    if checkpoint.is_some() {
        stats.resumed_from = cursor.clone();
        info!(job_id = %spec.id, %symbol, cursor = ?cursor, exhausted, "resuming from checkpoint");
    }

    if !exhausted {
        let mut page_no: u64 = 0;
        loop {
            cancel.check()?;
            page_no += 1;

            let request = PageRequest {
                symbol: symbol.clone(),
                range,
                cursor: cursor.clone(),
                page_size: p.page_size,
            };
            let page = p.client.fetch_page(&request, cancel, p.metrics)?;

            let ctx = ValidationContext {
                symbol: symbol.clone(),
                range,
                previous_timestamp: previous,
            };
            let report = validate(&page.bars, &ctx);
            if !report.is_valid() {
                p.metrics.record(MetricEvent::ValidationErrors(report.errors.len() as u64));
                let label = format!("{}-page{page_no}", spec.id);
                if let Err(e) = p.partitions.quarantine(symbol, &label, &page.bars, &report.errors) {
                    warn!(job_id = %spec.id, %symbol, error = %e, "could not quarantine rejected page");
                }
                return Err(JobError::Validation(report.summary(VALIDATION_SUMMARY_ISSUES)));
            }

            if let Some(next) = &page.next_cursor {
                if cursor.as_ref() == Some(next) {
                    return Err(JobError::CursorStalled(next.clone()));
                }
            }

            for (date, bars) in by_date(&page.bars) {
                let written = p.partitions.write(symbol, date, &bars)?;
                p.metrics.record(MetricEvent::PartitionWritten {
                    rows: written.rows as u64,
                    changed: written.changed,
                });
            }

            cancel.check()?;
            let last_timestamp = page.bars.last().map(|b| b.timestamp).or(previous);
            let bars = page.bars.len() as u64;
            let committed = p
                .checkpoints
                .commit(
                    symbol,
                    CheckpointCommit {
                        scope: scope.clone(),
                        next: page.next_cursor.clone(),
                        last_timestamp,
                        bars,
                    },
                )
                .map_err(JobError::Checkpoint)?;

            stats.pages += 1;
            stats.bars += bars;
            p.metrics.record(MetricEvent::BarsIngested(bars));
            debug!(
                job_id = %spec.id,
                %symbol,
                page = page_no,
                bars,
                total = committed.bars_committed,
                "page committed"
            );

            previous = last_timestamp;
            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
    }

    for day in &days {
        let rows = p.partitions.row_count(symbol, *day)?;
        p.completeness
            .mark_complete(symbol, *day, rows as u64)
            .map_err(JobError::Completeness)?;
    }
    Ok(())
}

fn by_date(bars: &[Bar]) -> BTreeMap<NaiveDate, Vec<Bar>> {
    let mut days: BTreeMap<NaiveDate, Vec<Bar>> = BTreeMap::new();
    for bar in bars {
        days.entry(bar.trading_date()).or_default().push(bar.clone());
    }
    days
}
