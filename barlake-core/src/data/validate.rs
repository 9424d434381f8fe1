//! Batch validation of fetched bars.
//!
//! Validation is pure and fail-closed: one bad bar rejects the whole page,
//! nothing is repaired or dropped. The report lists every problem found so a
//! quarantined batch can be diagnosed without refetching it.

use crate::domain::{Bar, Symbol, TimeRange};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decimal places the partition schema can store.
pub const MAX_PRICE_SCALE: u32 = 8;

/// What the batch is checked against.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub symbol: Symbol,
    pub range: TimeRange,
    /// Last timestamp already committed for this job; the batch must start
    /// strictly after it.
    pub previous_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueKind {
    HighBelowLow,
    OpenOutsideRange,
    CloseOutsideRange,
    NonPositivePrice,
    NegativeVolume { volume: i64 },
    EpochTimestamp,
    /// Outside what nanosecond storage can hold (about 1677 to 2262).
    UnrepresentableTimestamp,
    NotIncreasing { previous: DateTime<Utc> },
    Duplicate,
    OutsideRequestedRange,
    SymbolMismatch { found: String },
    ExcessPrecision { scale: u32 },
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueKind::HighBelowLow => f.write_str("high below low"),
            IssueKind::OpenOutsideRange => f.write_str("open outside [low, high]"),
            IssueKind::CloseOutsideRange => f.write_str("close outside [low, high]"),
            IssueKind::NonPositivePrice => f.write_str("non-positive price"),
            IssueKind::NegativeVolume { volume } => write!(f, "negative volume {volume}"),
            IssueKind::EpochTimestamp => f.write_str("timestamp at or before the unix epoch"),
            IssueKind::UnrepresentableTimestamp => {
                f.write_str("timestamp not representable at nanosecond precision")
            }
            IssueKind::NotIncreasing { previous } => {
                write!(f, "timestamp not after previous {}", previous.to_rfc3339())
            }
            IssueKind::Duplicate => f.write_str("duplicate timestamp"),
            IssueKind::OutsideRequestedRange => f.write_str("timestamp outside requested range"),
            IssueKind::SymbolMismatch { found } => write!(f, "bar for symbol {found}"),
            IssueKind::ExcessPrecision { scale } => {
                write!(f, "price has {scale} decimal places (max {MAX_PRICE_SCALE})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Position of the bar in the batch.
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: IssueKind,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bar {} ({}): {}", self.index, self.timestamp.to_rfc3339(), self.kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    /// Bars examined.
    pub checked: usize,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// First `max` issues joined for a failure reason.
    pub fn summary(&self, max: usize) -> String {
        let mut parts: Vec<String> = self.errors.iter().take(max).map(|e| e.to_string()).collect();
        if self.errors.len() > max {
            parts.push(format!("and {} more", self.errors.len() - max));
        }
        format!("{} invalid bar issue(s): {}", self.errors.len(), parts.join("; "))
    }
}

/// Check a batch of bars against `ctx`.
pub fn validate(bars: &[Bar], ctx: &ValidationContext) -> ValidationReport {
    let mut errors = Vec::new();
    let mut previous = ctx.previous_timestamp;

    for (index, bar) in bars.iter().enumerate() {
        let mut push = |kind| {
            errors.push(ValidationIssue {
                index,
                timestamp: bar.timestamp,
                kind,
            })
        };

        if bar.symbol != ctx.symbol {
            push(IssueKind::SymbolMismatch {
                found: bar.symbol.to_string(),
            });
        }

        if bar.high < bar.low {
            push(IssueKind::HighBelowLow);
        }
        if bar.open < bar.low || bar.open > bar.high {
            push(IssueKind::OpenOutsideRange);
        }
        if bar.close < bar.low || bar.close > bar.high {
            push(IssueKind::CloseOutsideRange);
        }
        let prices = [bar.open, bar.high, bar.low, bar.close];
        if prices.iter().any(|p| *p <= Decimal::ZERO) {
            push(IssueKind::NonPositivePrice);
        }
        if let Some(scale) = prices.iter().map(|p| p.normalize().scale()).max() {
            if scale > MAX_PRICE_SCALE {
                push(IssueKind::ExcessPrecision { scale });
            }
        }
        if bar.volume < 0 {
            push(IssueKind::NegativeVolume { volume: bar.volume });
        }

        match bar.timestamp.timestamp_nanos_opt() {
            Some(nanos) if nanos > 0 => {}
            Some(_) => push(IssueKind::EpochTimestamp),
            None => push(IssueKind::UnrepresentableTimestamp),
        }
        if !ctx.range.contains(bar.timestamp) {
            push(IssueKind::OutsideRequestedRange);
        }

        if let Some(prev) = previous {
            if bar.timestamp == prev {
                push(IssueKind::Duplicate);
            } else if bar.timestamp < prev {
                push(IssueKind::NotIncreasing { previous: prev });
            }
        }
        previous = Some(previous.map_or(bar.timestamp, |p| p.max(bar.timestamp)));
    }

    ValidationReport {
        errors,
        checked: bars.len(),
    }
}
