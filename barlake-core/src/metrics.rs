//! Metrics sink handed to the coordinator at construction.
//!
//! The core only emits events; transport (Prometheus, StatsD, logs) belongs to
//! whoever implements [`MetricsSink`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One observation emitted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    BarsIngested(u64),
    ValidationErrors(u64),
    /// A fetch attempt is being retried.
    Retry,
    /// Time spent waiting for rate-limiter tokens.
    RateLimitWait(Duration),
    PartitionWritten { rows: u64, changed: bool },
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: MetricEvent) {}
}

/// Emits every event as a `tracing` debug record under the `barlake::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn record(&self, event: MetricEvent) {
        tracing::debug!(target: "barlake::metrics", ?event, "metric");
    }
}

/// In-process counters, readable through [`CounterMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct CounterMetrics {
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    bars_ingested: AtomicU64,
    validation_errors: AtomicU64,
    retries: AtomicU64,
    rate_limit_wait_micros: AtomicU64,
    partitions_written: AtomicU64,
    partitions_unchanged: AtomicU64,
}

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub bars_ingested: u64,
    pub validation_errors: u64,
    pub retries: u64,
    pub rate_limit_wait_ms: u64,
    pub partitions_written: u64,
    pub partitions_unchanged: u64,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            jobs_started: get(&self.jobs_started),
            jobs_completed: get(&self.jobs_completed),
            jobs_failed: get(&self.jobs_failed),
            jobs_cancelled: get(&self.jobs_cancelled),
            bars_ingested: get(&self.bars_ingested),
            validation_errors: get(&self.validation_errors),
            retries: get(&self.retries),
            rate_limit_wait_ms: get(&self.rate_limit_wait_micros) / 1_000,
            partitions_written: get(&self.partitions_written),
            partitions_unchanged: get(&self.partitions_unchanged),
        }
    }
}

impl MetricsSink for CounterMetrics {
    fn record(&self, event: MetricEvent) {
        let bump = |c: &AtomicU64, n: u64| {
            c.fetch_add(n, Ordering::Relaxed);
        };
        match event {
            MetricEvent::JobStarted => bump(&self.jobs_started, 1),
            MetricEvent::JobCompleted => bump(&self.jobs_completed, 1),
            MetricEvent::JobFailed => bump(&self.jobs_failed, 1),
            MetricEvent::JobCancelled => bump(&self.jobs_cancelled, 1),
            MetricEvent::BarsIngested(n) => bump(&self.bars_ingested, n),
            MetricEvent::ValidationErrors(n) => bump(&self.validation_errors, n),
            MetricEvent::Retry => bump(&self.retries, 1),
            MetricEvent::RateLimitWait(d) => {
                bump(&self.rate_limit_wait_micros, d.as_micros() as u64)
            }
            MetricEvent::PartitionWritten { changed: true, .. } => {
                bump(&self.partitions_written, 1)
            }
            MetricEvent::PartitionWritten { changed: false, .. } => {
                bump(&self.partitions_unchanged, 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = CounterMetrics::new();
        m.record(MetricEvent::JobStarted);
        m.record(MetricEvent::BarsIngested(200));
        m.record(MetricEvent::BarsIngested(190));
        m.record(MetricEvent::Retry);
        m.record(MetricEvent::Retry);
        m.record(MetricEvent::RateLimitWait(Duration::from_millis(3)));
        m.record(MetricEvent::PartitionWritten { rows: 10, changed: false });

        let snap = m.snapshot();
        assert_eq!(snap.jobs_started, 1);
        assert_eq!(snap.bars_ingested, 390);
        assert_eq!(snap.retries, 2);
        assert_eq!(snap.rate_limit_wait_ms, 3);
        assert_eq!(snap.partitions_unchanged, 1);
        assert_eq!(snap.partitions_written, 0);
    }

    #[test]
    fn sinks_are_object_safe() {
        let sinks: Vec<Box<dyn MetricsSink>> =
            vec![Box::new(NoopMetrics), Box::new(LogMetrics), Box::new(CounterMetrics::new())];
        for sink in &sinks {
            sink.record(MetricEvent::JobCompleted);
        }
    }
}
