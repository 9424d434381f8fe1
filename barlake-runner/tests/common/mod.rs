//! Shared fixtures for the coordinator integration tests: a provider whose
//! failures are scripted per cursor, and a coordinator wired to temp dirs.
#![allow(dead_code)]

use barlake_core::data::provider::{Cursor, Page, PageRequest, ProviderClient, ProviderError, Timeframe};
use barlake_core::data::synthetic::SyntheticClient;
use barlake_core::data::{
    CircuitBreaker, PartitionCompression, PartitionWriter, Quota, RateLimiter, ResilientClient, RetryPolicy,
};
use barlake_core::domain::{DateRange, Symbol};
use barlake_core::metrics::CounterMetrics;
use barlake_core::state::{
    Checkpoint, CheckpointCommit, CheckpointStore, CompletenessStore, FileCheckpointStore, FileCompletenessStore,
    StateError,
};
use barlake_runner::{CoordinatorSettings, IngestionCoordinator};
use chrono::NaiveDate;
use reqwest::header::HeaderMap;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

type Hook = Box<dyn Fn(&PageRequest) + Send + Sync>;

/// Synthetic data with injectable failures.
///
/// Failures are keyed by the request cursor (`None` = first page) and
/// consumed in order before the real page is served.
pub struct ScriptedClient {
    inner: SyntheticClient,
    errors: Mutex<HashMap<Option<String>, VecDeque<ProviderError>>>,
    corrupt: Mutex<HashSet<Option<String>>>,
    hook: Mutex<Option<Hook>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Option<Cursor>>>,
}

impl ScriptedClient {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            inner: SyntheticClient::new("scripted", timeframe),
            errors: Mutex::new(HashMap::new()),
            corrupt: Mutex::new(HashSet::new()),
            hook: Mutex::new(None),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Queue `errors` for requests at `cursor`.
    pub fn fail_at(self, cursor: Option<&str>, errors: Vec<ProviderError>) -> Self {
        self.errors
            .lock()
            .unwrap()
            .entry(cursor.map(str::to_string))
            .or_default()
            .extend(errors);
        self
    }

    /// Serve the page at `cursor` with its first bar's high below its low.
    pub fn corrupt_at(self, cursor: Option<&str>) -> Self {
        self.corrupt.lock().unwrap().insert(cursor.map(str::to_string));
        self
    }

    /// Run `hook` before every fetch attempt.
    pub fn on_fetch(self, hook: impl Fn(&PageRequest) + Send + Sync + 'static) -> Self {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Cursor of every attempt, in order.
    pub fn cursors(&self) -> Vec<Option<Cursor>> {
        self.seen.lock().unwrap().clone()
    }
}

impl ProviderClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    fn feed(&self) -> &str {
        "test"
    }

    fn fetch_page(&self, request: &PageRequest) -> Result<Page, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.cursor.clone());
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(request);
        }

        let key = request.cursor.as_ref().map(|c| c.as_str().to_string());
        if let Some(err) = self.errors.lock().unwrap().get_mut(&key).and_then(VecDeque::pop_front) {
            return Err(err);
        }

        let mut page = self.inner.fetch_page(request)?;
        if self.corrupt.lock().unwrap().contains(&key) {
            if let Some(bar) = page.bars.first_mut() {
                bar.high = bar.low - Decimal::ONE;
            }
        }
        Ok(page)
    }

    fn auth_headers(&self) -> Result<HeaderMap, ProviderError> {
        Ok(HeaderMap::new())
    }
}

/// Checkpoint store that fails every commit.
#[derive(Debug)]
pub struct FailingCheckpoints {
    inner: FileCheckpointStore,
}

impl FailingCheckpoints {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            inner: FileCheckpointStore::new(dir),
        }
    }
}

impl CheckpointStore for FailingCheckpoints {
    fn load(&self, symbol: &Symbol) -> Result<Option<Checkpoint>, StateError> {
        self.inner.load(symbol)
    }

    fn commit(&self, _symbol: &Symbol, _commit: CheckpointCommit) -> Result<Checkpoint, StateError> {
        Err(StateError::Io {
            path: PathBuf::from("/dev/full"),
            message: "disk full".into(),
        })
    }

    fn clear(&self, symbol: &Symbol) -> Result<bool, StateError> {
        self.inner.clear(symbol)
    }
}

/// Retries quickly and deterministically.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        factor: 2.0,
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub client: Arc<ScriptedClient>,
    pub breaker: Arc<CircuitBreaker>,
    pub metrics: Arc<CounterMetrics>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub completeness: Arc<FileCompletenessStore>,
    pub coordinator: IngestionCoordinator,
}

pub struct HarnessBuilder {
    client: ScriptedClient,
    settings: CoordinatorSettings,
    policy: RetryPolicy,
    failing_commits: bool,
    dir: Option<TempDir>,
}

impl HarnessBuilder {
    pub fn new(client: ScriptedClient) -> Self {
        Self {
            client,
            settings: CoordinatorSettings {
                workers: 2,
                page_size: 200,
            },
            policy: fast_retry(5),
            failing_commits: false,
            dir: None,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.settings.workers = workers;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.settings.page_size = page_size;
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn failing_commits(mut self) -> Self {
        self.failing_commits = true;
        self
    }

    /// Reuse an existing output directory (simulates a restart).
    pub fn in_dir(mut self, dir: TempDir) -> Self {
        self.dir = Some(dir);
        self
    }

    pub fn build(self) -> Harness {
        let dir = match self.dir {
            Some(dir) => dir,
            None => tempfile::tempdir().unwrap(),
        };
        let state = dir.path().join("_state");
        let client = Arc::new(self.client);
        let limiter = Arc::new(RateLimiter::new(client.feed_key(), Quota::new(1_000, 10_000.0).unwrap()));
        let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(60)));
        let metrics = Arc::new(CounterMetrics::new());
        let checkpoints: Arc<dyn CheckpointStore> = if self.failing_commits {
            Arc::new(FailingCheckpoints::new(state.join("checkpoints")))
        } else {
            Arc::new(FileCheckpointStore::in_state_dir(&state))
        };
        let completeness = Arc::new(FileCompletenessStore::in_state_dir(&state));

        let coordinator = IngestionCoordinator::new(
            ResilientClient::new(client.clone(), limiter, breaker.clone(), self.policy),
            checkpoints.clone(),
            completeness.clone(),
            PartitionWriter::new(dir.path(), PartitionCompression::Zstd),
            metrics.clone(),
            self.settings,
        );
        Harness {
            dir,
            client,
            breaker,
            metrics,
            checkpoints,
            completeness,
            coordinator,
        }
    }
}

impl Harness {
    pub fn partitions(&self) -> &PartitionWriter {
        self.coordinator.partitions()
    }

    pub fn completeness(&self) -> &dyn CompletenessStore {
        self.completeness.as_ref()
    }
}

pub fn sym(s: &str) -> Symbol {
    Symbol::new(s).unwrap()
}

/// 2024-06-20, a Thursday.
pub fn thursday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 20).unwrap()
}

pub fn one_day() -> DateRange {
    DateRange::day(thursday()).unwrap()
}
