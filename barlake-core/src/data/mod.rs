//! Fetching, validating and persisting bars.

pub mod alpaca;
pub mod auth;
pub mod circuit_breaker;
pub mod partition;
pub mod provider;
pub mod rate_limit;
pub mod retry;
pub mod schema;
pub mod synthetic;
pub mod validate;
pub mod yahoo;

pub use auth::AuthStrategy;
pub use circuit_breaker::CircuitBreaker;
pub use partition::{PartitionCompression, PartitionError, PartitionWrite, PartitionWriter};
pub use provider::{
    build_client, Cursor, Page, PageRequest, ProviderClient, ProviderError, ProviderKind, ProviderSettings,
    Timeframe,
};
pub use rate_limit::{FeedKey, Quota, RateLimitError, RateLimiter, RateLimiterRegistry, TokenBucket};
pub use retry::{FetchError, ResilientClient, RetryPolicy};
pub use schema::{BarSchema, SchemaError};
pub use validate::{validate, IssueKind, ValidationContext, ValidationIssue, ValidationReport};
