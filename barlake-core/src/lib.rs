//! barlake core: domain types, provider clients, rate limiting, validation,
//! partitioned Parquet storage and durable ingestion state.
//!
//! This crate holds everything a single ingestion job touches:
//! - Domain types (symbols, time ranges, bars)
//! - Provider clients behind one trait, plus the rate limiter, retry policy
//!   and circuit breaker that wrap them
//! - The batch validator
//! - The atomic Hive-partitioned Parquet writer
//! - Checkpoint and completeness stores
//!
//! Scheduling and job lifecycle live in `barlake-runner`.

pub mod cancel;
pub mod data;
pub mod domain;
pub mod fsutil;
pub mod metrics;
pub mod state;
