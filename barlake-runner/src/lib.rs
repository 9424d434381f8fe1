//! barlake runner: ingestion orchestration on top of `barlake-core`.
//!
//! This crate provides:
//! - TOML configuration loading and validation
//! - The ingestion job record and its state machine
//! - The coordinator: job table, per-symbol mutual exclusion, FIFO queue
//! - The worker pipeline (fetch, validate, write partitions, checkpoint)
//! - The end-of-run summary

pub mod config;
pub mod coordinator;
pub mod job;
pub mod summary;
mod worker;

pub use config::{AuthConfig, ConfigError, DateRangeConfig, IngestConfig, RetryConfig};
pub use coordinator::{
    CancelError, CoordinatorSettings, IngestionCoordinator, RunError, SetupError, SubmitError,
};
pub use job::{IngestionJob, JobId, JobState, JobStats, TransitionError};
pub use summary::{JobFailure, RunSummary};
pub use worker::JobError;
