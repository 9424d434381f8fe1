//! Request authentication strategies.

use super::provider::ProviderError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use std::fmt;

/// How a client authenticates. Secrets never appear in `Debug` output.
#[derive(Clone, Default)]
pub enum AuthStrategy {
    #[default]
    None,
    /// Key id and secret sent in two provider-specific headers.
    ApiKey {
        key_id_header: String,
        key_id: String,
        secret_header: String,
        secret: String,
    },
    /// `Authorization: Bearer <token>`.
    Bearer { token: String },
}

impl AuthStrategy {
    /// Alpaca's `APCA-API-KEY-ID` / `APCA-API-SECRET-KEY` pair.
    pub fn alpaca(key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        AuthStrategy::ApiKey {
            key_id_header: "APCA-API-KEY-ID".into(),
            key_id: key_id.into(),
            secret_header: "APCA-API-SECRET-KEY".into(),
            secret: secret.into(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, AuthStrategy::None)
    }

    /// Build request headers. Malformed credentials are a permanent error.
    pub fn headers(&self) -> Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        match self {
            AuthStrategy::None => {}
            AuthStrategy::ApiKey {
                key_id_header,
                key_id,
                secret_header,
                secret,
            } => {
                headers.insert(header_name(key_id_header)?, header_value(key_id, false)?);
                headers.insert(header_name(secret_header)?, header_value(secret, true)?);
            }
            AuthStrategy::Bearer { token } => {
                headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"), true)?);
            }
        }
        Ok(headers)
    }
}

fn header_name(name: &str) -> Result<HeaderName, ProviderError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ProviderError::AuthenticationFailed(format!("invalid header name '{name}': {e}")))
}

fn header_value(value: &str, sensitive: bool) -> Result<HeaderValue, ProviderError> {
    if value.trim().is_empty() {
        return Err(ProviderError::AuthenticationFailed("empty credential".into()));
    }
    let mut v = HeaderValue::from_str(value)
        .map_err(|_| ProviderError::AuthenticationFailed("credential contains invalid characters".into()))?;
    v.set_sensitive(sensitive);
    Ok(v)
}

impl fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStrategy::None => f.write_str("None"),
            AuthStrategy::ApiKey { key_id_header, secret_header, .. } => f
                .debug_struct("ApiKey")
                .field("key_id_header", key_id_header)
                .field("secret_header", secret_header)
                .finish_non_exhaustive(),
            AuthStrategy::Bearer { .. } => f.write_str("Bearer(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpaca_headers() {
        let headers = AuthStrategy::alpaca("KEY", "SECRET").headers().unwrap();
        assert_eq!(headers["APCA-API-KEY-ID"], "KEY");
        assert_eq!(headers["APCA-API-SECRET-KEY"], "SECRET");
        assert!(headers["APCA-API-SECRET-KEY"].is_sensitive());
    }

    #[test]
    fn bearer_header() {
        let headers = AuthStrategy::Bearer { token: "abc".into() }.headers().unwrap();
        assert_eq!(headers[AUTHORIZATION], "Bearer abc");
    }

    #[test]
    fn none_is_empty() {
        assert!(AuthStrategy::None.headers().unwrap().is_empty());
    }

    #[test]
    fn malformed_credentials_fail_permanently() {
        let err = AuthStrategy::alpaca("KEY", "bad\nsecret").headers().unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
        assert!(!err.is_retryable());
        assert!(AuthStrategy::alpaca("", "s").headers().is_err());
    }

    #[test]
    fn debug_hides_secrets() {
        let dbg = format!("{:?}", AuthStrategy::alpaca("key-123", "secret-456"));
        assert!(!dbg.contains("key-123"));
        assert!(!dbg.contains("secret-456"));
        assert!(!format!("{:?}", AuthStrategy::Bearer { token: "tok".into() }).contains("tok"));
    }
}
