//! Bar: one OHLCV interval for one symbol.

use super::symbol::Symbol;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// OHLCV bar for a single symbol over one fixed interval.
///
/// Prices are decimals so nothing drifts through float rounding between the
/// provider response and the partition file. `volume` is signed on purpose: a
/// negative value from a provider must reach the validator and fail the batch
/// instead of disappearing into a parse error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: Symbol,
    /// Interval start, nanosecond precision. Unique per symbol.
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
}

impl Bar {
    /// UTC calendar date of the bar, which selects its partition.
    pub fn trading_date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    /// `low <= {open, close} <= high` and `low <= high`.
    pub fn is_consistent(&self) -> bool {
        self.low <= self.high
            && self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
    }
}
