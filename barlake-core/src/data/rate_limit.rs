//! Token-bucket rate limiting, one bucket per provider feed.
//!
//! [`TokenBucket`] holds the arithmetic and takes explicit instants so the
//! grant bound (`capacity + rate * t` over any window `t`) can be checked
//! without real clocks. [`RateLimiter`] wraps it for concurrent use: callers
//! block in arrival order until their tokens are available, so a small request
//! can never overtake a larger one that queued first.

use crate::cancel::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Longest a waiter sleeps before re-checking cancellation.
const POLL_SLICE: Duration = Duration::from_millis(20);

/// Identity of a rate-limited quota: a provider plus one of its feeds.
///
/// Feeds of the same provider have separate quotas and never share a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedKey {
    pub provider: String,
    pub feed: String,
}

impl FeedKey {
    pub fn new(provider: impl Into<String>, feed: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            feed: feed.into(),
        }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.feed)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RateLimitError {
    #[error("requested {requested} tokens but bucket capacity is {capacity}")]
    ExceedsCapacity { requested: u32, capacity: u32 },

    #[error("invalid quota: {0}")]
    InvalidQuota(String),

    #[error("cancelled while waiting for rate-limit tokens")]
    Cancelled,
}

/// Static bucket configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quota {
    /// Maximum tokens held (burst size).
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl Quota {
    /// `per_minute` tokens per minute with a burst of the same size.
    pub fn per_minute(per_minute: u32) -> Result<Self, RateLimitError> {
        Self::new(per_minute, f64::from(per_minute) / 60.0)
    }

    pub fn new(capacity: u32, refill_per_sec: f64) -> Result<Self, RateLimitError> {
        if capacity == 0 {
            return Err(RateLimitError::InvalidQuota("capacity must be > 0".into()));
        }
        if !(refill_per_sec.is_finite() && refill_per_sec > 0.0) {
            return Err(RateLimitError::InvalidQuota(format!(
                "refill rate must be a positive number, got {refill_per_sec}"
            )));
        }
        Ok(Self {
            capacity,
            refill_per_sec,
        })
    }

    /// Replace the burst size, keeping the refill rate.
    pub fn with_capacity(self, capacity: u32) -> Result<Self, RateLimitError> {
        Self::new(capacity, self.refill_per_sec)
    }
}

/// Token bucket state machine. Starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    quota: Quota,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(quota: Quota, now: Instant) -> Self {
        Self {
            quota,
            tokens: f64::from(quota.capacity),
            last_refill: now,
        }
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Tokens currently held (after the last refill).
    pub fn available(&self) -> f64 {
        self.tokens
    }

    /// Add tokens accrued since the last refill, capped at capacity.
    /// Instants earlier than the last refill are ignored.
    pub fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let cap = f64::from(self.quota.capacity);
        self.tokens = (self.tokens + elapsed * self.quota.refill_per_sec).min(cap);
        self.last_refill = now;
    }

    /// Refill, then take `n` tokens if they are all available.
    pub fn try_take(&mut self, n: u32, now: Instant) -> bool {
        self.refill(now);
        let n = f64::from(n);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Time until `n` tokens will be available, assuming no other takers.
    pub fn time_until(&self, n: u32) -> Duration {
        let missing = f64::from(n) - self.tokens;
        if missing <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(missing / self.quota.refill_per_sec)
        }
    }
}

struct LimiterState {
    bucket: TokenBucket,
    queue: VecDeque<u64>,
    next_ticket: u64,
}

/// Thread-safe, FIFO-fair rate limiter over a [`TokenBucket`].
pub struct RateLimiter {
    key: FeedKey,
    quota: Quota,
    state: Mutex<LimiterState>,
    turn: Condvar,
}

impl RateLimiter {
    pub fn new(key: FeedKey, quota: Quota) -> Self {
        Self {
            key,
            quota,
            state: Mutex::new(LimiterState {
                bucket: TokenBucket::new(quota, Instant::now()),
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            turn: Condvar::new(),
        }
    }

    pub fn key(&self) -> &FeedKey {
        &self.key
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Block until `n` tokens are granted. Returns how long the caller waited.
    ///
    /// Waiters are served strictly in arrival order. Cancellation is checked at
    /// least every [`POLL_SLICE`]; a cancelled waiter leaves the queue and the
    /// bucket is untouched.
    pub fn acquire(&self, n: u32, cancel: &CancelToken) -> Result<Duration, RateLimitError> {
        if n > self.quota.capacity {
            return Err(RateLimitError::ExceedsCapacity {
                requested: n,
                capacity: self.quota.capacity,
            });
        }

        let started = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        loop {
            if cancel.is_cancelled() {
                state.queue.retain(|t| *t != ticket);
                drop(state);
                self.turn.notify_all();
                return Err(RateLimitError::Cancelled);
            }

            let wait = if state.queue.front() == Some(&ticket) {
                if state.bucket.try_take(n, Instant::now()) {
                    state.queue.pop_front();
                    drop(state);
                    self.turn.notify_all();
                    let waited = started.elapsed();
                    if waited > POLL_SLICE {
                        tracing::debug!(feed = %self.key, tokens = n, ?waited, "rate limit wait");
                    }
                    return Ok(waited);
                }
                state
                    .bucket
                    .time_until(n)
                    .clamp(Duration::from_millis(1), POLL_SLICE)
            } else {
                POLL_SLICE
            };

            state = self
                .turn
                .wait_timeout(state, wait)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Tokens currently in the bucket, refilled to now.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.bucket.refill(Instant::now());
        state.bucket.available()
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("key", &self.key)
            .field("quota", &self.quota)
            .finish()
    }
}

/// One limiter per [`FeedKey`], created on first use.
///
/// State is not persisted: after a restart buckets start full from the
/// configured quota.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<FeedKey, Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limiter for `key`. The quota only applies when the limiter is created;
    /// later callers share the existing bucket.
    pub fn limiter(&self, key: &FeedKey, quota: Quota) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|e| e.into_inner());
        limiters
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RateLimiter::new(key.clone(), quota)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.limiters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
