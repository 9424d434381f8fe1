//! Hive-partitioned Parquet writer.
//!
//! Layout: `{root}/symbol={SYMBOL}/year=YYYY/month=MM/day=DD.parquet`
//!
//! - Writes merge with the existing partition, one row per timestamp, newest
//!   fetch winning, sorted ascending
//! - A merge that changes nothing leaves the file untouched (content hash)
//! - Atomic replacement: write `.parquet.tmp`, fsync, rename into place
//! - An unreadable existing partition fails the write instead of being replaced
//! - Rejected batches are dumped to `{root}/_quarantine/` for inspection

use super::schema::{BarSchema, SchemaError};
use super::validate::ValidationIssue;
use crate::domain::{Bar, Symbol};
use crate::fsutil;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Parquet codec for partition files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionCompression {
    Uncompressed,
    Snappy,
    Gzip,
    Lz4,
    #[default]
    Zstd,
}

impl PartitionCompression {
    fn codec(self) -> ParquetCompression {
        match self {
            PartitionCompression::Uncompressed => ParquetCompression::Uncompressed,
            PartitionCompression::Snappy => ParquetCompression::Snappy,
            PartitionCompression::Gzip => ParquetCompression::Gzip(None),
            PartitionCompression::Lz4 => ParquetCompression::Lz4Raw,
            PartitionCompression::Zstd => ParquetCompression::Zstd(None),
        }
    }
}

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("partition I/O error at {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("existing partition {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("bar {timestamp} for {symbol} does not belong in partition {expected}")]
    Misrouted {
        symbol: String,
        timestamp: String,
        expected: String,
    },

    #[error("refusing to write an empty partition batch")]
    Empty,
}

impl PartitionError {
    fn io(path: &Path, err: impl std::fmt::Display) -> Self {
        PartitionError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one partition write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionWrite {
    pub path: PathBuf,
    /// Rows in the partition after the merge.
    pub rows: usize,
    pub content_hash: String,
    /// False when the merge matched the existing file and nothing was written.
    pub changed: bool,
}

#[derive(Debug, Serialize)]
struct QuarantineRecord<'a> {
    symbol: &'a str,
    label: &'a str,
    quarantined_at: DateTime<Utc>,
    issues: &'a [ValidationIssue],
    bars: &'a [Bar],
}

/// Owner of the partition namespace under `root`.
#[derive(Debug, Clone)]
pub struct PartitionWriter {
    root: PathBuf,
    compression: PartitionCompression,
}

impl PartitionWriter {
    pub fn new(root: impl Into<PathBuf>, compression: PartitionCompression) -> Self {
        Self {
            root: root.into(),
            compression,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn symbol_dir(&self, symbol: &Symbol) -> PathBuf {
        self.root.join(format!("symbol={symbol}"))
    }

    pub fn partition_path(&self, symbol: &Symbol, date: NaiveDate) -> PathBuf {
        self.symbol_dir(symbol)
            .join(format!("year={:04}", date.year()))
            .join(format!("month={:02}", date.month()))
            .join(format!("day={:02}.parquet", date.day()))
    }

    /// Merge `bars` into the partition for (`symbol`, `date`).
    pub fn write(&self, symbol: &Symbol, date: NaiveDate, bars: &[Bar]) -> Result<PartitionWrite, PartitionError> {
        if bars.is_empty() {
            return Err(PartitionError::Empty);
        }
        if let Some(stray) = bars.iter().find(|b| &b.symbol != symbol || b.trading_date() != date) {
            return Err(PartitionError::Misrouted {
                symbol: stray.symbol.to_string(),
                timestamp: stray.timestamp.to_rfc3339(),
                expected: format!("{symbol}/{date}"),
            });
        }

        let path = self.partition_path(symbol, date);
        let existing = self.read_path(&path)?;
        let existing_hash = match &existing {
            Some(rows) => Some(BarSchema::content_hash(rows)?),
            None => None,
        };

        let mut merged: BTreeMap<DateTime<Utc>, Bar> = BTreeMap::new();
        for bar in existing.into_iter().flatten() {
            merged.insert(bar.timestamp, bar);
        }
        for bar in bars {
            merged.insert(bar.timestamp, bar.clone());
        }
        let merged: Vec<Bar> = merged.into_values().collect();
        let content_hash = BarSchema::content_hash(&merged)?;

        if existing_hash.as_deref() == Some(content_hash.as_str()) {
            debug!(path = %path.display(), rows = merged.len(), "partition unchanged");
            return Ok(PartitionWrite {
                path,
                rows: merged.len(),
                content_hash,
                changed: false,
            });
        }

        let mut df = BarSchema::to_frame(&merged)?;
        let codec = self.compression.codec();
        fsutil::write_atomic_with(&path, |file| {
            ParquetWriter::new(file)
                .with_compression(codec)
                .finish(&mut df)
                .map(|_| ())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
        })
        .map_err(|e| PartitionError::io(&path, e))?;

        debug!(path = %path.display(), rows = merged.len(), "partition written");
        Ok(PartitionWrite {
            path,
            rows: merged.len(),
            content_hash,
            changed: true,
        })
    }

    /// Bars stored for (`symbol`, `date`), or `None` if no partition exists.
    pub fn read(&self, symbol: &Symbol, date: NaiveDate) -> Result<Option<Vec<Bar>>, PartitionError> {
        self.read_path(&self.partition_path(symbol, date))
    }

    /// Rows stored for (`symbol`, `date`); zero if no partition exists.
    pub fn row_count(&self, symbol: &Symbol, date: NaiveDate) -> Result<usize, PartitionError> {
        Ok(self.read(symbol, date)?.map_or(0, |bars| bars.len()))
    }

    fn read_path(&self, path: &Path) -> Result<Option<Vec<Bar>>, PartitionError> {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PartitionError::io(path, e)),
        };
        let corrupt = |reason: String| PartitionError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };
        let df = ParquetReader::new(file)
            .finish()
            .map_err(|e| corrupt(format!("read: {e}")))?;
        BarSchema::from_frame(&df)
            .map(Some)
            .map_err(|e| corrupt(e.to_string()))
    }

    /// Trading dates with a partition file for `symbol`, ascending.
    pub fn list_dates(&self, symbol: &Symbol) -> Result<Vec<NaiveDate>, PartitionError> {
        let mut dates = Vec::new();
        let dir = self.symbol_dir(symbol);
        for year_dir in subdirs(&dir)? {
            let Some(year) = hive_value(&year_dir, "year") else { continue };
            for month_dir in subdirs(&year_dir)? {
                let Some(month) = hive_value(&month_dir, "month") else { continue };
                let entries = fs::read_dir(&month_dir).map_err(|e| PartitionError::io(&month_dir, e))?;
                for entry in entries {
                    let path = entry.map_err(|e| PartitionError::io(&month_dir, e))?.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                        continue;
                    }
                    let day = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| s.strip_prefix("day="))
                        .and_then(|d| d.parse::<u32>().ok());
                    match day.and_then(|d| NaiveDate::from_ymd_opt(year as i32, month, d)) {
                        Some(date) => dates.push(date),
                        None => warn!(path = %path.display(), "ignoring unrecognised partition file"),
                    }
                }
            }
        }
        dates.sort();
        Ok(dates)
    }

    /// Dump a rejected batch as JSON under `{root}/_quarantine/{symbol}/`.
    pub fn quarantine(
        &self,
        symbol: &Symbol,
        label: &str,
        bars: &[Bar],
        issues: &[ValidationIssue],
    ) -> Result<PathBuf, PartitionError> {
        let label: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = self
            .root
            .join("_quarantine")
            .join(symbol.as_str())
            .join(format!("{label}.json"));
        let record = QuarantineRecord {
            symbol: symbol.as_str(),
            label: &label,
            quarantined_at: Utc::now(),
            issues,
            bars,
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|e| PartitionError::io(&path, e))?;
        fsutil::write_atomic(&path, &json).map_err(|e| PartitionError::io(&path, e))?;
        warn!(path = %path.display(), bars = bars.len(), issues = issues.len(), "batch quarantined");
        Ok(path)
    }
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, PartitionError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PartitionError::io(dir, e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| PartitionError::io(dir, e))?.path();
        if path.is_dir() {
            out.push(path);
        }
    }
    Ok(out)
}

fn hive_value(dir: &Path, key: &str) -> Option<u32> {
    dir.file_name()?
        .to_str()?
        .strip_prefix(key)?
        .strip_prefix('=')?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::validate::IssueKind;
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;

    fn spy() -> Symbol {
        Symbol::new("SPY").unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 20).unwrap()
    }

    fn bar(minute: i64, close_cents: i64) -> Bar {
        Bar {
            symbol: spy(),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 20, 13, 30, 0).unwrap() + Duration::minutes(minute),
            open: Decimal::new(54400, 2),
            high: Decimal::new(54600, 2),
            low: Decimal::new(54300, 2),
            close: Decimal::new(close_cents, 2),
            volume: 1_000 + minute,
        }
    }

    #[test]
    fn hive_layout() {
        let w = PartitionWriter::new("/lake", PartitionCompression::default());
        assert_eq!(
            w.partition_path(&spy(), NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()),
            Path::new("/lake/symbol=SPY/year=2024/month=01/day=05.parquet")
        );
    }

    #[test]
    fn write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let w = PartitionWriter::new(dir.path(), PartitionCompression::Zstd);
        let bars: Vec<Bar> = (0..5).map(|m| bar(m, 54500)).collect();

        let out = w.write(&spy(), date(), &bars).unwrap();
        assert!(out.changed);
        assert_eq!(out.rows, 5);
        assert!(out.path.exists());
        assert!(!fsutil::tmp_path(&out.path).exists());
        assert_eq!(w.read(&spy(), date()).unwrap().unwrap(), bars);
        assert_eq!(w.row_count(&spy(), date()).unwrap(), 5);
    }

    #[test]
    fn rewriting_identical_rows_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let w = PartitionWriter::new(dir.path(), PartitionCompression::Snappy);
        let bars: Vec<Bar> = (0..3).map(|m| bar(m, 54500)).collect();

        let first = w.write(&spy(), date(), &bars).unwrap();
        let modified = fs::metadata(&first.path).unwrap().modified().unwrap();
        let second = w.write(&spy(), date(), &bars[1..]).unwrap();

        assert!(!second.changed);
        assert_eq!(second.rows, 3);
        assert_eq!(second.content_hash, first.content_hash);
        assert_eq!(fs::metadata(&first.path).unwrap().modified().unwrap(), modified);
    }

    #[test]
    fn merge_dedups_and_incoming_wins() {
        let dir = tempfile::tempdir().unwrap();
        let w = PartitionWriter::new(dir.path(), PartitionCompression::Uncompressed);
        w.write(&spy(), date(), &[bar(0, 54500), bar(2, 54500)]).unwrap();

        let out = w.write(&spy(), date(), &[bar(2, 54550), bar(1, 54400)]).unwrap();
        assert!(out.changed);
        assert_eq!(out.rows, 3);

        let stored = w.read(&spy(), date()).unwrap().unwrap();
        let minutes: Vec<i64> = stored.iter().map(|b| b.volume - 1_000).collect();
        assert_eq!(minutes, vec![0, 1, 2]);
        assert_eq!(stored[2].close, Decimal::new(54550, 2));
    }

    #[test]
    fn misrouted_bars_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let w = PartitionWriter::new(dir.path(), PartitionCompression::default());
        let next_day = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        assert!(matches!(
            w.write(&spy(), next_day, &[bar(0, 54500)]),
            Err(PartitionError::Misrouted { .. })
        ));
        assert!(matches!(w.write(&spy(), date(), &[]), Err(PartitionError::Empty)));
        assert!(!w.partition_path(&spy(), next_day).exists());
    }

    #[test]
    fn corrupt_partition_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let w = PartitionWriter::new(dir.path(), PartitionCompression::default());
        let path = w.partition_path(&spy(), date());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not parquet").unwrap();

        let err = w.write(&spy(), date(), &[bar(0, 54500)]).unwrap_err();
        assert!(matches!(err, PartitionError::Corrupt { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"not parquet");
    }

    #[test]
    fn list_dates_walks_the_layout() {
        let dir = tempfile::tempdir().unwrap();
        let w = PartitionWriter::new(dir.path(), PartitionCompression::default());
        assert!(w.list_dates(&spy()).unwrap().is_empty());

        w.write(&spy(), date(), &[bar(0, 54500)]).unwrap();
        let mut later = bar(0, 54500);
        later.timestamp += Duration::days(13);
        w.write(&spy(), later.trading_date(), &[later]).unwrap();

        assert_eq!(
            w.list_dates(&spy()).unwrap(),
            vec![date(), NaiveDate::from_ymd_opt(2024, 7, 3).unwrap()]
        );
    }

    #[test]
    fn quarantine_lands_outside_symbol_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let w = PartitionWriter::new(dir.path(), PartitionCompression::default());
        let b = bar(0, 54500);
        let issues = vec![ValidationIssue {
            index: 0,
            timestamp: b.timestamp,
            kind: IssueKind::HighBelowLow,
        }];

        let path = w.quarantine(&spy(), "job-7/page 2", &[b], &issues).unwrap();
        assert_eq!(path, dir.path().join("_quarantine/SPY/job-7_page_2.json"));
        let json: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["issues"][0]["kind"], "high_below_low");
        assert!(w.list_dates(&spy()).unwrap().is_empty());
    }
}
