//! Time ranges: half-open instant ranges for provider requests and inclusive
//! trading-date ranges for jobs and completeness tracking.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("range start {start} is not before end {end}")]
    Empty { start: String, end: String },

    #[error("date {0} is out of the supported calendar range")]
    OutOfCalendar(NaiveDate),
}

/// `[start, end)` pair of UTC instants. `start < end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, RangeError> {
        if start >= end {
            return Err(RangeError::Empty {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// True if `ts` falls inside the half-open range.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Inclusive range of trading dates, as requested by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, RangeError> {
        if start > end {
            return Err(RangeError::Empty {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        // end + 1 must exist for the instant range conversion
        end.checked_add_days(Days::new(1))
            .ok_or(RangeError::OutOfCalendar(end))?;
        Ok(Self { start, end })
    }

    /// Single trading date.
    pub fn day(date: NaiveDate) -> Result<Self, RangeError> {
        Self::new(date, date)
    }

    /// `[start 00:00 UTC, end+1 00:00 UTC)`.
    pub fn to_time_range(&self) -> Result<TimeRange, RangeError> {
        let after_end = self
            .end
            .checked_add_days(Days::new(1))
            .ok_or(RangeError::OutOfCalendar(self.end))?;
        TimeRange::new(
            self.start.and_time(NaiveTime::MIN).and_utc(),
            after_end.and_time(NaiveTime::MIN).and_utc(),
        )
    }

    /// Every calendar date in the range.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }

    /// Weekdays in the range. No exchange holiday calendar is applied.
    pub fn trading_days(&self) -> Vec<NaiveDate> {
        self.days().filter(|d| is_weekday(*d)).collect()
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}
