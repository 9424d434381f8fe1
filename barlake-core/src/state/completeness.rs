//! Per (symbol, trading date) collection status with optimistic concurrency.

use super::{read_json, StateError, SymbolLocks};
use crate::domain::Symbol;
use crate::fsutil;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Attempts made by the provided read-modify-write helpers before giving up
/// on a contended record.
const MAX_CONFLICT_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolBarsAggregate {
    pub symbol: Symbol,
    pub trading_date: NaiveDate,
    /// Bumped on every mutation. Zero is reserved for "no record".
    pub version: u64,
    pub bar_count: u64,
    pub collection_started: bool,
    pub is_complete: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletenessUpdate {
    /// Collection began (or restarted); the day is no longer complete.
    Started,
    /// Collection finished with `bar_count` rows in the partition.
    Completed { bar_count: u64 },
}

pub trait CompletenessStore: Send + Sync {
    fn get(&self, symbol: &Symbol, date: NaiveDate) -> Result<Option<SymbolBarsAggregate>, StateError>;

    /// All records for `symbol`, ascending by date.
    fn list(&self, symbol: &Symbol) -> Result<Vec<SymbolBarsAggregate>, StateError>;

    /// Apply `update` if the stored version equals `expected_version`
    /// (0 = the record must not exist yet).
    fn apply(
        &self,
        symbol: &Symbol,
        date: NaiveDate,
        expected_version: u64,
        update: CompletenessUpdate,
    ) -> Result<SymbolBarsAggregate, StateError>;

    fn mark_started(&self, symbol: &Symbol, date: NaiveDate) -> Result<SymbolBarsAggregate, StateError> {
        apply_latest(self, symbol, date, CompletenessUpdate::Started)
    }

    fn mark_complete(
        &self,
        symbol: &Symbol,
        date: NaiveDate,
        bar_count: u64,
    ) -> Result<SymbolBarsAggregate, StateError> {
        apply_latest(self, symbol, date, CompletenessUpdate::Completed { bar_count })
    }
}

fn apply_latest<S: CompletenessStore + ?Sized>(
    store: &S,
    symbol: &Symbol,
    date: NaiveDate,
    update: CompletenessUpdate,
) -> Result<SymbolBarsAggregate, StateError> {
    let mut attempt = 0;
    loop {
        let expected = store.get(symbol, date)?.map_or(0, |r| r.version);
        match store.apply(symbol, date, expected, update) {
            Err(StateError::VersionConflict { .. }) if attempt + 1 < MAX_CONFLICT_RETRIES => attempt += 1,
            other => return other,
        }
    }
}

/// `{dir}/{SYMBOL}.json` holding every date's record for the symbol.
#[derive(Debug)]
pub struct FileCompletenessStore {
    dir: PathBuf,
    locks: SymbolLocks,
}

impl FileCompletenessStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: SymbolLocks::default(),
        }
    }

    /// Store rooted at `{state_dir}/completeness`.
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join("completeness"))
    }

    fn path(&self, symbol: &Symbol) -> PathBuf {
        self.dir.join(format!("{symbol}.json"))
    }

    fn records(&self, symbol: &Symbol) -> Result<Vec<SymbolBarsAggregate>, StateError> {
        Ok(read_json(&self.path(symbol))?.unwrap_or_default())
    }
}

impl CompletenessStore for FileCompletenessStore {
    fn get(&self, symbol: &Symbol, date: NaiveDate) -> Result<Option<SymbolBarsAggregate>, StateError> {
        let lock = self.locks.get(symbol);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        Ok(self.records(symbol)?.into_iter().find(|r| r.trading_date == date))
    }

    fn list(&self, symbol: &Symbol) -> Result<Vec<SymbolBarsAggregate>, StateError> {
        let lock = self.locks.get(symbol);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.records(symbol)
    }

    fn apply(
        &self,
        symbol: &Symbol,
        date: NaiveDate,
        expected_version: u64,
        update: CompletenessUpdate,
    ) -> Result<SymbolBarsAggregate, StateError> {
        let lock = self.locks.get(symbol);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut records = self.records(symbol)?;
        let pos = records.iter().position(|r| r.trading_date == date);
        let found = pos.map_or(0, |i| records[i].version);
        if found != expected_version {
            return Err(StateError::VersionConflict {
                symbol: symbol.to_string(),
                date,
                expected: expected_version,
                found,
            });
        }

        let mut record = match pos {
            Some(i) => records.remove(i),
            None => SymbolBarsAggregate {
                symbol: symbol.clone(),
                trading_date: date,
                version: 0,
                bar_count: 0,
                collection_started: false,
                is_complete: false,
                updated_at: Utc::now(),
            },
        };
        match update {
            CompletenessUpdate::Started => {
                record.collection_started = true;
                record.is_complete = false;
            }
            CompletenessUpdate::Completed { bar_count } => {
                record.collection_started = true;
                record.is_complete = true;
                record.bar_count = bar_count;
            }
        }
        record.version += 1;
        record.updated_at = Utc::now();

        let at = records.partition_point(|r| r.trading_date < date);
        records.insert(at, record.clone());

        let path = self.path(symbol);
        let json = serde_json::to_vec_pretty(&records).map_err(|e| StateError::Serde(e.to_string()))?;
        fsutil::write_atomic(&path, &json).map_err(|e| StateError::io(&path, e))?;
        Ok(record)
    }
}
