//! Durable ingestion state: per-symbol checkpoints and per-day completeness.
//!
//! Both file stores keep one JSON document per symbol and replace it with
//! [`crate::fsutil::write_atomic`], so a crash mid-write leaves the previous
//! document intact.

pub mod checkpoint;
pub mod completeness;

pub use checkpoint::{Checkpoint, CheckpointCommit, CheckpointScope, CheckpointStore, FileCheckpointStore};
pub use completeness::{CompletenessStore, CompletenessUpdate, FileCompletenessStore, SymbolBarsAggregate};

use crate::domain::Symbol;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state I/O error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("state file {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("version conflict for {symbol} on {date}: expected {expected}, found {found}")]
    VersionConflict {
        symbol: String,
        date: NaiveDate,
        expected: u64,
        found: u64,
    },

    #[error("state serialization failed: {0}")]
    Serde(String),
}

impl StateError {
    pub(crate) fn io(path: &Path, err: impl std::fmt::Display) -> Self {
        StateError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// One lock per symbol, so a store never serializes writers of different
/// symbols against each other.
#[derive(Debug, Default)]
pub(crate) struct SymbolLocks {
    locks: Mutex<HashMap<Symbol, Arc<Mutex<()>>>>,
}

impl SymbolLocks {
    pub(crate) fn get(&self, symbol: &Symbol) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(symbol.clone()).or_default())
    }
}

/// Read and parse a JSON document; `None` if the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StateError::io(path, e)),
    };
    serde_json::from_slice(&bytes).map(Some).map_err(|e| StateError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
