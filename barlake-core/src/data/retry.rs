//! Retry policy and the rate-limited, retrying wrapper around a provider client.

use super::circuit_breaker::CircuitBreaker;
use super::provider::{Page, PageRequest, ProviderClient, ProviderError};
use super::rate_limit::{RateLimitError, RateLimiter};
use crate::cancel::CancelToken;
use crate::metrics::{MetricEvent, MetricsSink};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per page, first attempt included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Fraction of the delay added or subtracted at random (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if !(self.factor.is_finite() && self.factor >= 1.0) {
            return Err(format!("factor must be >= 1.0, got {}", self.factor));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(format!("jitter must be in [0, 1), got {}", self.jitter));
        }
        if self.base_delay > self.max_delay {
            return Err("base_delay exceeds max_delay".into());
        }
        Ok(())
    }

    /// Un-jittered delay before retry number `retry` (1-based), capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = self.factor.powi(retry.saturating_sub(1).min(64) as i32);
        let secs = self.base_delay.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Jittered delay before retry number `retry`, never above `max_delay`.
    pub fn delay_for<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base = self.backoff(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let scale = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64(base.as_secs_f64() * scale).min(self.max_delay)
    }
}

/// Why a page could not be fetched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("fetch cancelled")]
    Cancelled,

    #[error("{0}")]
    Permanent(ProviderError),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ProviderError },

    #[error("rate limiter: {0}")]
    RateLimit(RateLimitError),
}

/// A provider client with its feed's rate limiter, circuit breaker and retry
/// policy applied. Every attempt, retries included, takes a rate-limit token.
pub struct ResilientClient {
    client: Arc<dyn ProviderClient>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
}

impl ResilientClient {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            limiter,
            breaker,
            policy,
        }
    }

    pub fn client(&self) -> &dyn ProviderClient {
        self.client.as_ref()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn fetch_page(
        &self,
        request: &PageRequest,
        cancel: &CancelToken,
        metrics: &dyn MetricsSink,
    ) -> Result<Page, FetchError> {
        let feed = self.client.feed_key();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            cancel.check().map_err(|_| FetchError::Cancelled)?;

            if !self.breaker.is_allowed() {
                return Err(FetchError::Permanent(ProviderError::CircuitOpen {
                    feed: feed.to_string(),
                }));
            }

            let waited = self.limiter.acquire(1, cancel).map_err(|e| match e {
                RateLimitError::Cancelled => FetchError::Cancelled,
                other => FetchError::RateLimit(other),
            })?;
            metrics.record(MetricEvent::RateLimitWait(waited));

            let err = match self.client.fetch_page(request) {
                Ok(page) => {
                    self.breaker.record_success();
                    debug!(
                        symbol = %request.symbol,
                        attempt,
                        bars = page.bars.len(),
                        last = page.is_last(),
                        "page fetched"
                    );
                    return Ok(page);
                }
                Err(e) => e,
            };

            if matches!(err, ProviderError::Forbidden(_)) {
                warn!(%feed, error = %err, "provider refused access, tripping circuit breaker");
                self.breaker.trip();
                return Err(FetchError::Permanent(err));
            }
            if !self.client.should_retry(&err) {
                return Err(FetchError::Permanent(err));
            }
            if attempt >= self.policy.max_attempts {
                self.breaker.record_failure();
                return Err(FetchError::RetriesExhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let mut delay = self.policy.delay_for(attempt, &mut rand::thread_rng());
            if let Some(requested) = err.retry_after() {
                delay = delay.max(requested.min(self.policy.max_delay));
            }
            warn!(
                symbol = %request.symbol,
                attempt,
                max_attempts = self.policy.max_attempts,
                ?delay,
                error = %err,
                "retrying page fetch"
            );
            metrics.record(MetricEvent::Retry);
            cancel.sleep(delay).map_err(|_| FetchError::Cancelled)?;
        }
    }
}
