//! Job table, FIFO queue and the worker pool that drains it.
//!
//! The job table lock is only ever held for bookkeeping (submit, cancel,
//! dispatch, finish). Workers run [`crate::worker::ingest`] without it, so
//! `cancel` and `job` stay responsive while pages are being fetched.

use crate::config::{ConfigError, IngestConfig};
use crate::job::{IngestionJob, JobId, JobState, JobStats};
use crate::summary::RunSummary;
use crate::worker::{self, JobError, JobSpec, Pipeline};
use barlake_core::cancel::CancelToken;
use barlake_core::data::{
    build_client, CircuitBreaker, PartitionWriter, ProviderError, RateLimiterRegistry, ResilientClient,
};
use barlake_core::domain::{DateRange, Symbol};
use barlake_core::metrics::{MetricEvent, MetricsSink};
use barlake_core::state::{CheckpointStore, CompletenessStore, FileCheckpointStore, FileCompletenessStore};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub workers: usize,
    pub page_size: u32,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            page_size: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("{symbol} already has an active job ({job})")]
    SymbolInFlight { symbol: Symbol, job: JobId },

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("{id} is {state}; only failed or cancelled jobs can be retried")]
    NotRetryable { id: JobId, state: JobState },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("{id} already finished as {state}")]
    AlreadyTerminal { id: JobId, state: JobState },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("worker pool needs at least one worker")]
    NoWorkers,

    #[error("failed to build worker pool: {0}")]
    Pool(String),
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Default)]
struct JobTable {
    jobs: BTreeMap<JobId, IngestionJob>,
    queue: VecDeque<JobId>,
    /// Symbol to its pending or in-progress job.
    in_flight: HashMap<Symbol, JobId>,
    cancels: HashMap<JobId, CancelToken>,
    next_id: u64,
}

pub struct IngestionCoordinator {
    client: ResilientClient,
    checkpoints: Arc<dyn CheckpointStore>,
    completeness: Arc<dyn CompletenessStore>,
    partitions: PartitionWriter,
    metrics: Arc<dyn MetricsSink>,
    settings: CoordinatorSettings,
    table: Mutex<JobTable>,
}

impl IngestionCoordinator {
    pub fn new(
        client: ResilientClient,
        checkpoints: Arc<dyn CheckpointStore>,
        completeness: Arc<dyn CompletenessStore>,
        partitions: PartitionWriter,
        metrics: Arc<dyn MetricsSink>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            client,
            checkpoints,
            completeness,
            partitions,
            metrics,
            settings,
            table: Mutex::new(JobTable {
                next_id: 1,
                ..JobTable::default()
            }),
        }
    }

    /// Wire a coordinator from configuration with file-backed stores and a
    /// private rate-limiter registry.
    pub fn from_config(config: &IngestConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self, SetupError> {
        Self::from_config_with(config, &RateLimiterRegistry::new(), metrics)
    }

    /// Like [`Self::from_config`], sharing limiters with other coordinators
    /// that talk to the same feed.
    pub fn from_config_with(
        config: &IngestConfig,
        registry: &RateLimiterRegistry,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, SetupError> {
        let client = build_client(&config.provider_settings()?)?;
        let limiter = registry.limiter(&client.feed_key(), config.quota()?);
        let breaker = Arc::new(CircuitBreaker::default_provider());
        let resilient = ResilientClient::new(client, limiter, breaker, config.retry.policy());

        let state_dir = config.state_dir();
        info!(
            provider = config.provider.as_str(),
            feed = %config.feed,
            output = %config.output_path.display(),
            state = %state_dir.display(),
            workers = config.workers,
            "coordinator configured"
        );
        Ok(Self::new(
            resilient,
            Arc::new(FileCheckpointStore::in_state_dir(&state_dir)),
            Arc::new(FileCompletenessStore::in_state_dir(&state_dir)),
            PartitionWriter::new(&config.output_path, config.compression),
            metrics,
            CoordinatorSettings {
                workers: config.workers,
                page_size: config.page_size,
            },
        ))
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings
    }

    pub fn checkpoints(&self) -> &dyn CheckpointStore {
        self.checkpoints.as_ref()
    }

    pub fn completeness(&self) -> &dyn CompletenessStore {
        self.completeness.as_ref()
    }

    pub fn partitions(&self) -> &PartitionWriter {
        &self.partitions
    }

    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a job for `symbol`. At most one active job per symbol.
    pub fn submit(&self, symbol: Symbol, range: DateRange) -> Result<JobId, SubmitError> {
        self.enqueue(&mut self.table(), symbol, range, None)
    }

    /// Queue one job per distinct symbol, in first-seen order.
    pub fn submit_all(
        &self,
        symbols: &[Symbol],
        range: DateRange,
    ) -> Vec<(Symbol, Result<JobId, SubmitError>)> {
        let mut seen = HashSet::new();
        let mut table = self.table();
        symbols
            .iter()
            .filter(|s| seen.insert((*s).clone()))
            .map(|s| (s.clone(), self.enqueue(&mut table, s.clone(), range, None)))
            .collect()
    }

    /// Queue a fresh job for the symbol and range of a failed or cancelled one.
    /// Resumes from whatever checkpoint the old job left.
    pub fn retry(&self, id: JobId) -> Result<JobId, SubmitError> {
        let mut table = self.table();
        let old = table.jobs.get(&id).ok_or(SubmitError::UnknownJob(id))?;
        if !matches!(old.state, JobState::Failed | JobState::Cancelled) {
            return Err(SubmitError::NotRetryable { id, state: old.state });
        }
        let (symbol, range) = (old.symbol.clone(), old.range);
        self.enqueue(&mut table, symbol, range, Some(id))
    }

    fn enqueue(
        &self,
        table: &mut JobTable,
        symbol: Symbol,
        range: DateRange,
        retry_of: Option<JobId>,
    ) -> Result<JobId, SubmitError> {
        if let Some(&job) = table.in_flight.get(&symbol) {
            return Err(SubmitError::SymbolInFlight { symbol, job });
        }
        let id = JobId(table.next_id);
        table.next_id += 1;

        let job = IngestionJob::new(id, symbol.clone(), range, self.client.client().feed_key(), retry_of);
        info!(job_id = %id, %symbol, start = %range.start, end = %range.end, "job submitted");
        table.jobs.insert(id, job);
        table.queue.push_back(id);
        table.in_flight.insert(symbol, id);
        table.cancels.insert(id, CancelToken::new());
        Ok(id)
    }

    /// Cancel a job. A pending job is cancelled at once; a running job stops at
    /// its next suspension point, keeping its last committed checkpoint.
    ///
    /// Returns the job's state after the call.
    pub fn cancel(&self, id: JobId) -> Result<JobState, CancelError> {
        let mut table = self.table();
        let job = table.jobs.get_mut(&id).ok_or(CancelError::UnknownJob(id))?;
        match job.state {
            JobState::Pending => {
                job.transition(JobState::Cancelled)
                    .map_err(|e| CancelError::AlreadyTerminal { id, state: e.from })?;
                let symbol = job.symbol.clone();
                table.queue.retain(|queued| *queued != id);
                table.cancels.remove(&id);
                if table.in_flight.get(&symbol) == Some(&id) {
                    table.in_flight.remove(&symbol);
                }
                self.metrics.record(MetricEvent::JobCancelled);
                info!(job_id = %id, %symbol, "pending job cancelled");
                Ok(JobState::Cancelled)
            }
            JobState::InProgress => {
                if let Some(token) = table.cancels.get(&id) {
                    token.cancel();
                }
                info!(job_id = %id, "cancellation requested");
                Ok(JobState::InProgress)
            }
            state => Err(CancelError::AlreadyTerminal { id, state }),
        }
    }

    pub fn job(&self, id: JobId) -> Option<IngestionJob> {
        self.table().jobs.get(&id).cloned()
    }

    /// Every job, in submission order.
    pub fn jobs(&self) -> Vec<IngestionJob> {
        self.table().jobs.values().cloned().collect()
    }

    /// Drain the queue on a private pool of `workers` threads. Returns once
    /// the queue is empty and every worker is idle.
    pub fn run(&self) -> Result<RunSummary, RunError> {
        let workers = self.settings.workers;
        if workers == 0 {
            return Err(RunError::NoWorkers);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("barlake-worker-{i}"))
            .build()
            .map_err(|e| RunError::Pool(e.to_string()))?;

        let pipeline = Pipeline {
            client: &self.client,
            checkpoints: self.checkpoints.as_ref(),
            completeness: self.completeness.as_ref(),
            partitions: &self.partitions,
            metrics: self.metrics.as_ref(),
            page_size: self.settings.page_size,
        };
        let pipeline = &pipeline;

        info!(workers, queued = self.table().queue.len(), "ingestion run started");
        pool.scope(|s| {
            for _ in 0..workers {
                s.spawn(move |_| self.work(pipeline));
            }
        });

        let summary = RunSummary::from_jobs(self.jobs());
        info!(
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "ingestion run finished"
        );
        Ok(summary)
    }

    fn work(&self, pipeline: &Pipeline<'_>) {
        while let Some((spec, cancel)) = self.dispatch() {
            self.metrics.record(MetricEvent::JobStarted);
            info!(job_id = %spec.id, symbol = %spec.symbol, "job started");
            let mut stats = JobStats::default();
            let result = worker::ingest(pipeline, &spec, &cancel, &mut stats);
            self.finish(&spec, stats, result);
        }
    }

    /// Pop the next pending job and mark it in progress on this thread.
    fn dispatch(&self) -> Option<(JobSpec, CancelToken)> {
        let mut table = self.table();
        while let Some(id) = table.queue.pop_front() {
            let cancel = table.cancels.get(&id).cloned().unwrap_or_default();
            let Some(job) = table.jobs.get_mut(&id) else {
                continue;
            };
            if job.transition(JobState::InProgress).is_err() {
                continue;
            }
            job.worker = rayon::current_thread_index();
            return Some((
                JobSpec {
                    id,
                    symbol: job.symbol.clone(),
                    range: job.range,
                },
                cancel,
            ));
        }
        None
    }

    fn finish(&self, spec: &JobSpec, stats: JobStats, result: Result<(), JobError>) {
        let mut table = self.table();
        let id = spec.id;
        let (state, event, failure) = match result {
            Ok(()) => {
                info!(job_id = %id, symbol = %spec.symbol, pages = stats.pages, bars = stats.bars, "job completed");
                (JobState::Completed, MetricEvent::JobCompleted, None)
            }
            Err(JobError::Cancelled) => {
                info!(job_id = %id, symbol = %spec.symbol, pages = stats.pages, "job cancelled");
                (JobState::Cancelled, MetricEvent::JobCancelled, None)
            }
            Err(e) => {
                warn!(job_id = %id, symbol = %spec.symbol, error = %e, "job failed");
                (JobState::Failed, MetricEvent::JobFailed, Some(e.to_string()))
            }
        };

        if let Some(job) = table.jobs.get_mut(&id) {
            job.stats = stats;
            job.failure = failure;
            if let Err(e) = job.transition(state) {
                error!(job_id = %id, error = %e, "job finished in an unexpected state");
            }
        }
        table.cancels.remove(&id);
        if table.in_flight.get(&spec.symbol) == Some(&id) {
            table.in_flight.remove(&spec.symbol);
        }
        drop(table);
        self.metrics.record(event);
    }
}
