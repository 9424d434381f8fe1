//! End-of-run report.

use crate::job::{IngestionJob, JobId, JobState};
use barlake_core::domain::Symbol;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub id: JobId,
    pub symbol: Symbol,
    pub reason: String,
}

/// Counts by terminal state, plus every failure reason.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Jobs still pending or in progress; non-zero only if `run` was
    /// called while work was being submitted.
    pub unfinished: usize,
    pub failures: Vec<JobFailure>,
    pub jobs: Vec<IngestionJob>,
}

impl RunSummary {
    pub fn from_jobs(jobs: Vec<IngestionJob>) -> Self {
        let mut summary = RunSummary::default();
        for job in &jobs {
            match job.state {
                JobState::Completed => summary.completed += 1,
                JobState::Cancelled => summary.cancelled += 1,
                JobState::Failed => {
                    summary.failed += 1;
                    summary.failures.push(JobFailure {
                        id: job.id,
                        symbol: job.symbol.clone(),
                        reason: job.failure.clone().unwrap_or_default(),
                    });
                }
                JobState::Pending | JobState::InProgress => summary.unfinished += 1,
            }
        }
        summary.jobs = jobs;
        summary
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    pub fn total_bars(&self) -> u64 {
        self.jobs.iter().map(|j| j.stats.bars).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} job(s): {} completed, {} failed, {} cancelled ({} bars ingested)",
            self.jobs.len(),
            self.completed,
            self.failed,
            self.cancelled,
            self.total_bars()
        )?;
        for job in &self.jobs {
            write!(f, "  {:<8} {:<8} {:<11}", job.id.to_string(), job.symbol.as_str(), job.state.to_string())?;
            write!(f, " pages={} bars={}", job.stats.pages, job.stats.bars)?;
            if let Some(reason) = &job.failure {
                write!(f, "  {reason}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
