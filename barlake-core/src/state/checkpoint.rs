//! Resumable per-symbol cursor state.

use super::{read_json, StateError, SymbolLocks};
use crate::data::provider::Cursor;
use crate::data::rate_limit::FeedKey;
use crate::domain::{Symbol, TimeRange};
use crate::fsutil;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What a checkpoint is a position in. A checkpoint from a different feed or
/// range is meaningless for the current job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointScope {
    pub feed: FeedKey,
    pub range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub symbol: Symbol,
    pub scope: CheckpointScope,
    /// Where to resume. `None` once the provider has reported the range done.
    pub next: Option<Cursor>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub pages_committed: u64,
    pub bars_committed: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn is_exhausted(&self) -> bool {
        self.next.is_none()
    }

    pub fn matches(&self, scope: &CheckpointScope) -> bool {
        &self.scope == scope
    }
}

/// One committed page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointCommit {
    pub scope: CheckpointScope,
    pub next: Option<Cursor>,
    pub last_timestamp: Option<DateTime<Utc>>,
    /// Bars in the committed page.
    pub bars: u64,
}

pub trait CheckpointStore: Send + Sync {
    fn load(&self, symbol: &Symbol) -> Result<Option<Checkpoint>, StateError>;

    /// Durably record a committed page. Counters accumulate while the scope
    /// stays the same and restart when it changes.
    fn commit(&self, symbol: &Symbol, commit: CheckpointCommit) -> Result<Checkpoint, StateError>;

    /// Remove the checkpoint. Returns whether one existed.
    fn clear(&self, symbol: &Symbol) -> Result<bool, StateError>;
}

/// `{dir}/{SYMBOL}.json` per symbol.
#[derive(Debug)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: SymbolLocks,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: SymbolLocks::default(),
        }
    }

    /// Store rooted at `{state_dir}/checkpoints`.
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join("checkpoints"))
    }

    fn path(&self, symbol: &Symbol) -> PathBuf {
        self.dir.join(format!("{symbol}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, symbol: &Symbol) -> Result<Option<Checkpoint>, StateError> {
        let lock = self.locks.get(symbol);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        read_json(&self.path(symbol))
    }

    fn commit(&self, symbol: &Symbol, commit: CheckpointCommit) -> Result<Checkpoint, StateError> {
        let lock = self.locks.get(symbol);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.path(symbol);

        let previous: Option<Checkpoint> = read_json(&path)?;
        let (pages, bars) = match previous {
            Some(p) if p.matches(&commit.scope) => (p.pages_committed, p.bars_committed),
            _ => (0, 0),
        };
        let checkpoint = Checkpoint {
            symbol: symbol.clone(),
            scope: commit.scope,
            next: commit.next,
            last_timestamp: commit.last_timestamp,
            pages_committed: pages + 1,
            bars_committed: bars + commit.bars,
            updated_at: Utc::now(),
        };

        let json = serde_json::to_vec_pretty(&checkpoint).map_err(|e| StateError::Serde(e.to_string()))?;
        fsutil::write_atomic(&path, &json).map_err(|e| StateError::io(&path, e))?;
        debug!(
            %symbol,
            next = ?checkpoint.next,
            pages = checkpoint.pages_committed,
            "checkpoint committed"
        );
        Ok(checkpoint)
    }

    fn clear(&self, symbol: &Symbol) -> Result<bool, StateError> {
        let lock = self.locks.get(symbol);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.path(symbol);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::io(&path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DateRange;
    use chrono::NaiveDate;

    fn aapl() -> Symbol {
        Symbol::new("AAPL").unwrap()
    }

    fn scope(feed: &str) -> CheckpointScope {
        CheckpointScope {
            feed: FeedKey::new("alpaca", feed),
            range: DateRange::day(NaiveDate::from_ymd_opt(2024, 6, 20).unwrap())
                .unwrap()
                .to_time_range()
                .unwrap(),
        }
    }

    fn commit(feed: &str, next: Option<&str>, bars: u64) -> CheckpointCommit {
        CheckpointCommit {
            scope: scope(feed),
            next: next.map(Cursor::new),
            last_timestamp: None,
            bars,
        }
    }

    #[test]
    fn missing_checkpoint_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert_eq!(store.load(&aapl()).unwrap(), None);
        assert!(!store.clear(&aapl()).unwrap());
    }

    #[test]
    fn commits_accumulate_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.commit(&aapl(), commit("iex", Some("p2"), 200)).unwrap();
        let last = store.commit(&aapl(), commit("iex", None, 190)).unwrap();

        assert!(last.is_exhausted());
        assert_eq!(last.pages_committed, 2);
        assert_eq!(last.bars_committed, 390);

        let reopened = FileCheckpointStore::new(dir.path());
        assert_eq!(reopened.load(&aapl()).unwrap(), Some(last));
    }

    #[test]
    fn new_scope_restarts_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.commit(&aapl(), commit("iex", Some("p2"), 200)).unwrap();
        let cp = store.commit(&aapl(), commit("sip", Some("q2"), 50)).unwrap();
        assert_eq!(cp.pages_committed, 1);
        assert_eq!(cp.bars_committed, 50);
        assert!(cp.matches(&scope("sip")));
        assert!(!cp.matches(&scope("iex")));
    }

    #[test]
    fn clear_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        store.commit(&aapl(), commit("iex", Some("p2"), 1)).unwrap();
        assert!(store.clear(&aapl()).unwrap());
        assert_eq!(store.load(&aapl()).unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        fs::write(dir.path().join("AAPL.json"), b"{ truncated").unwrap();
        assert!(matches!(store.load(&aapl()), Err(StateError::Corrupt { .. })));
        assert!(store.commit(&aapl(), commit("iex", None, 1)).is_err());
    }
}
