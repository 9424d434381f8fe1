//! Ingestion run configuration, loaded from TOML.
//!
//! ```toml
//! provider = "alpaca"
//! feed = "iex"
//! timeframe = "1min"
//! symbols = ["AAPL", "MSFT"]
//! workers = 4
//! rate_limit_per_min = 200
//! page_size = 1000
//! output_path = "./lake"
//!
//! [date_range]
//! start = "2024-06-17"
//! end = "2024-06-21"
//!
//! [auth]
//! type = "api_key"
//! key_id_env = "APCA_API_KEY_ID"
//! secret_env = "APCA_API_SECRET_KEY"
//! ```

use barlake_core::data::auth::AuthStrategy;
use barlake_core::data::partition::PartitionCompression;
use barlake_core::data::provider::{ProviderKind, ProviderSettings, Timeframe};
use barlake_core::data::rate_limit::Quota;
use barlake_core::data::retry::RetryPolicy;
use barlake_core::domain::{DateRange, Symbol};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("failed to parse config TOML: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("environment variable {0} is not set")]
    MissingEnv(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    pub provider: ProviderKind,
    pub feed: String,
    #[serde(default)]
    pub timeframe: Timeframe,
    pub symbols: Vec<String>,
    pub date_range: DateRangeConfig,
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub rate_limit_per_min: u32,
    /// Bucket capacity; defaults to `rate_limit_per_min`.
    #[serde(default)]
    pub burst: Option<u32>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    pub output_path: PathBuf,
    /// Defaults to `{output_path}/_state`.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default)]
    pub compression: PartitionCompression,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRangeConfig {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// `[retry]` table. Delays are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let p = RetryPolicy::default();
        Self {
            max_attempts: p.max_attempts,
            base_delay_ms: p.base_delay.as_millis() as u64,
            factor: p.factor,
            max_delay_ms: p.max_delay.as_millis() as u64,
            jitter: p.jitter,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            factor: self.factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
        }
    }
}

/// `[auth]` table. Secrets are never written in the file, only the names of
/// the environment variables holding them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    ApiKey {
        key_id_env: String,
        secret_env: String,
        /// Header names; default to Alpaca's.
        #[serde(default)]
        key_id_header: Option<String>,
        #[serde(default)]
        secret_header: Option<String>,
    },
    Bearer {
        token_env: String,
    },
}

impl AuthConfig {
    /// Resolve credentials from the process environment.
    pub fn resolve(&self) -> Result<AuthStrategy, ConfigError> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve credentials through `lookup`.
    pub fn resolve_with<F>(&self, lookup: F) -> Result<AuthStrategy, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).ok_or_else(|| ConfigError::MissingEnv(name.to_string()));
        Ok(match self {
            AuthConfig::None => AuthStrategy::None,
            AuthConfig::ApiKey {
                key_id_env,
                secret_env,
                key_id_header,
                secret_header,
            } => match AuthStrategy::alpaca(var(key_id_env)?, var(secret_env)?) {
                AuthStrategy::ApiKey {
                    key_id_header: default_key_header,
                    key_id,
                    secret_header: default_secret_header,
                    secret,
                } => AuthStrategy::ApiKey {
                    key_id_header: key_id_header.clone().unwrap_or(default_key_header),
                    key_id,
                    secret_header: secret_header.clone().unwrap_or(default_secret_header),
                    secret,
                },
                other => other,
            },
            AuthConfig::Bearer { token_env } => AuthStrategy::Bearer { token: var(token_env)? },
        })
    }
}

fn default_workers() -> usize {
    4
}

fn default_page_size() -> u32 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl IngestConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.feed.trim().is_empty() {
            return invalid("feed must not be empty".into());
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1".into());
        }
        if self.rate_limit_per_min == 0 {
            return invalid("rate_limit_per_min must be at least 1".into());
        }
        if self.burst == Some(0) {
            return invalid("burst must be at least 1".into());
        }
        if self.page_size == 0 {
            return invalid("page_size must be at least 1".into());
        }
        if self.request_timeout_secs == 0 {
            return invalid("request_timeout_secs must be at least 1".into());
        }
        self.symbols()?;
        self.date_range()?;
        self.retry.policy().validate().map_err(|e| ConfigError::Invalid(format!("retry: {e}")))?;
        Ok(())
    }

    /// Parsed symbols, de-duplicated, in file order.
    pub fn symbols(&self) -> Result<Vec<Symbol>, ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("symbols must not be empty".into()));
        }
        let mut out: Vec<Symbol> = Vec::with_capacity(self.symbols.len());
        for raw in &self.symbols {
            let symbol = Symbol::new(raw.trim()).map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if !out.contains(&symbol) {
                out.push(symbol);
            }
        }
        Ok(out)
    }

    pub fn date_range(&self) -> Result<DateRange, ConfigError> {
        DateRange::new(self.date_range.start, self.date_range.end)
            .map_err(|e| ConfigError::Invalid(format!("date_range: {e}")))
    }

    pub fn quota(&self) -> Result<Quota, ConfigError> {
        let quota = Quota::per_minute(self.rate_limit_per_min).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        match self.burst {
            Some(burst) => quota.with_capacity(burst).map_err(|e| ConfigError::Invalid(e.to_string())),
            None => Ok(quota),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| self.output_path.join("_state"))
    }

    /// Client settings with credentials resolved from the environment.
    pub fn provider_settings(&self) -> Result<ProviderSettings, ConfigError> {
        let mut settings = ProviderSettings::new(self.provider, self.feed.clone());
        settings.timeframe = self.timeframe;
        settings.base_url = self.base_url.clone();
        settings.auth = self.auth.resolve()?;
        settings.request_timeout = Duration::from_secs(self.request_timeout_secs);
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        provider = "synthetic"
        feed = "demo"
        symbols = ["AAPL", "MSFT", "AAPL"]
        rate_limit_per_min = 120
        output_path = "/tmp/lake"

        [date_range]
        start = "2024-06-17"
        end = "2024-06-21"
    "#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = IngestConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.timeframe, Timeframe::OneMinute);
        assert_eq!(config.compression, PartitionCompression::Zstd);
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        assert_eq!(config.auth, AuthConfig::None);
        assert_eq!(config.state_dir(), PathBuf::from("/tmp/lake/_state"));

        let symbols: Vec<String> = config.symbols().unwrap().iter().map(|s| s.to_string()).collect();
        assert_eq!(symbols, vec!["AAPL", "MSFT"]);

        let quota = config.quota().unwrap();
        assert_eq!(quota.capacity, 120);
        assert!((quota.refill_per_sec - 2.0).abs() < 1e-12);
    }

    #[test]
    fn full_config_parses() {
        let toml = r#"
            provider = "alpaca"
            feed = "sip"
            timeframe = "5min"
            symbols = ["SPY"]
            workers = 2
            rate_limit_per_min = 200
            burst = 20
            page_size = 5000
            output_path = "lake"
            state_path = "state"
            compression = "snappy"
            base_url = "http://localhost:8080"

            [date_range]
            start = "2024-01-02"
            end = "2024-01-31"

            [retry]
            max_attempts = 3
            base_delay_ms = 250

            [auth]
            type = "api_key"
            key_id_env = "KEY"
            secret_env = "SECRET"
        "#;
        let config = IngestConfig::from_toml(toml).unwrap();
        assert_eq!(config.provider, ProviderKind::Alpaca);
        assert_eq!(config.quota().unwrap().capacity, 20);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.policy().base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.state_dir(), PathBuf::from("state"));
        assert_eq!(config.compression, PartitionCompression::Snappy);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            MINIMAL.replace("rate_limit_per_min = 120", "rate_limit_per_min = 0"),
            MINIMAL.replace("[\"AAPL\", \"MSFT\", \"AAPL\"]", "[]"),
            MINIMAL.replace("[\"AAPL\", \"MSFT\", \"AAPL\"]", "[\"BRK/B\"]"),
            MINIMAL.replace("start = \"2024-06-17\"", "start = \"2024-07-01\""),
            format!("workers = 0\n{MINIMAL}"),
            format!("page_size = 0\n{MINIMAL}"),
        ];
        for toml in cases {
            assert!(
                matches!(IngestConfig::from_toml(&toml), Err(ConfigError::Invalid(_))),
                "accepted:\n{toml}"
            );
        }
    }

    #[test]
    fn unknown_keys_are_parse_errors() {
        let toml = format!("wokers = 3\n{MINIMAL}");
        assert!(matches!(IngestConfig::from_toml(&toml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn auth_resolves_from_lookup() {
        let lookup = |name: &str| match name {
            "KEY" => Some("key-id".to_string()),
            "SECRET" => Some("s3cret".to_string()),
            _ => None,
        };
        let api_key = AuthConfig::ApiKey {
            key_id_env: "KEY".into(),
            secret_env: "SECRET".into(),
            key_id_header: None,
            secret_header: Some("X-Secret".into()),
        };
        let headers = api_key.resolve_with(lookup).unwrap().headers().unwrap();
        assert_eq!(headers["APCA-API-KEY-ID"], "key-id");
        assert_eq!(headers["X-Secret"], "s3cret");

        let bearer = AuthConfig::Bearer {
            token_env: "MISSING".into(),
        };
        assert!(matches!(bearer.resolve_with(lookup), Err(ConfigError::MissingEnv(v)) if v == "MISSING"));
    }
}
