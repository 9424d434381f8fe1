//! Ingestion job records and their state machine.

use barlake_core::data::provider::Cursor;
use barlake_core::data::rate_limit::FeedKey;
use barlake_core::domain::{DateRange, Symbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coordinator-assigned job identifier, unique within one coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    /// `Pending -> InProgress -> {Completed | Failed | Cancelled}` and
    /// `Pending -> Cancelled`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Cancelled) | (InProgress, Completed | Failed | Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Pending => "PENDING",
            JobState::InProgress => "IN_PROGRESS",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub id: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// Progress recorded when a job finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pages: u64,
    pub bars: u64,
    /// Cursor the job resumed from, if a checkpoint was reused.
    pub resumed_from: Option<Cursor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: JobId,
    pub symbol: Symbol,
    pub range: DateRange,
    pub feed: FeedKey,
    /// Pool thread index the job was dispatched to.
    pub worker: Option<usize>,
    pub state: JobState,
    pub failure: Option<String>,
    /// Job this one retries.
    pub retry_of: Option<JobId>,
    pub stats: JobStats,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IngestionJob {
    pub fn new(id: JobId, symbol: Symbol, range: DateRange, feed: FeedKey, retry_of: Option<JobId>) -> Self {
        Self {
            id,
            symbol,
            range,
            feed,
            worker: None,
            state: JobState::Pending,
            failure: None,
            retry_of,
            stats: JobStats::default(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`, stamping start/finish times. Terminal states are final.
    pub fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            JobState::InProgress => self.started_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Pending or in progress.
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn job() -> IngestionJob {
        let day = NaiveDate::from_ymd_opt(2024, 6, 20).unwrap();
        IngestionJob::new(
            JobId(1),
            Symbol::new("AAPL").unwrap(),
            DateRange::day(day).unwrap(),
            FeedKey::new("alpaca", "iex"),
            None,
        )
    }

    #[test]
    fn happy_path_stamps_times() {
        let mut j = job();
        assert!(j.is_active());
        j.transition(JobState::InProgress).unwrap();
        assert!(j.started_at.is_some());
        j.transition(JobState::Completed).unwrap();
        assert!(j.finished_at.is_some());
        assert!(!j.is_active());
    }

    #[test]
    fn pending_can_be_cancelled_directly() {
        let mut j = job();
        j.transition(JobState::Cancelled).unwrap();
        assert!(j.started_at.is_none());
        assert!(j.finished_at.is_some());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            for next in [
                JobState::Pending,
                JobState::InProgress,
                JobState::Completed,
                JobState::Failed,
                JobState::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
        let mut j = job();
        j.transition(JobState::Cancelled).unwrap();
        let err = j.transition(JobState::InProgress).unwrap_err();
        assert_eq!(err.from, JobState::Cancelled);
        assert_eq!(err.to_string(), "job-1 cannot move from CANCELLED to IN_PROGRESS");
    }

    #[test]
    fn pending_cannot_skip_to_completion() {
        let mut j = job();
        assert!(j.transition(JobState::Completed).is_err());
        assert!(j.transition(JobState::Failed).is_err());
        assert_eq!(j.state, JobState::Pending);
    }

    fn any_state() -> impl Strategy<Value = JobState> {
        prop_oneof![
            Just(JobState::Pending),
            Just(JobState::InProgress),
            Just(JobState::Completed),
            Just(JobState::Failed),
            Just(JobState::Cancelled),
        ]
    }

    proptest! {
        /// Whatever transitions are attempted, a job never leaves a terminal
        /// state and its timestamps never go missing once set.
        #[test]
        fn random_transitions_respect_the_machine(steps in prop::collection::vec(any_state(), 0..12)) {
            let mut j = job();
            for next in steps {
                let before = j.state;
                match j.transition(next) {
                    Ok(()) => prop_assert!(before.can_transition_to(next)),
                    Err(_) => prop_assert_eq!(j.state, before),
                }
                if j.state != JobState::Pending && j.state != JobState::Cancelled {
                    prop_assert!(j.started_at.is_some());
                }
                prop_assert_eq!(j.finished_at.is_some(), j.state.is_terminal());
            }
        }
    }
}
