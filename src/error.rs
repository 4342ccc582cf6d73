//! Error types for the evacore data-access layer

use std::time::Duration;
use thiserror::Error;

/// Result type alias for evacore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the library
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Remote-call failure classification.
///
/// Only `TransientServer` and `Timeout` are retried by the client; everything
/// else fails fast on first occurrence so programmer and permission errors
/// are not masked as flakiness.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not authenticated. Log in before making authenticated ESI calls.")]
    NotAuthenticated,

    #[error("Authentication expired. Log in again to continue.")]
    AuthenticationExpired,

    #[error("Access denied. The logged-in character lacks a required scope.")]
    PermissionDenied,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("ESI rate limit exceeded. Retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("ESI server error: {0}")]
    TransientServer(String),

    #[error("Request timed out or the network is unreachable")]
    Timeout,

    #[error("Invalid ESI response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Total attempts the client may spend on this error kind (1 = no retry).
    pub fn max_attempts(&self) -> u32 {
        match self {
            ApiError::TransientServer(_) => 3,
            ApiError::Timeout => 2,
            _ => 1,
        }
    }

    /// Whether a stale cache entry may be served in place of this failure.
    ///
    /// Stale authenticated data is misleading after a credential change, so
    /// auth failures must surface to the caller instead of degrading.
    pub fn allows_stale_fallback(&self) -> bool {
        !matches!(
            self,
            ApiError::NotAuthenticated | ApiError::AuthenticationExpired
        )
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ApiError::Timeout
        } else {
            ApiError::InvalidResponse(err.to_string())
        }
    }
}

/// SSO login-flow errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authorization state token mismatch - possible forged callback")]
    StateMismatch,

    #[error("Authorization denied by the provider: {0}")]
    Denied(String),

    #[error("Authorization flow timed out. Try logging in again.")]
    FlowTimeout,

    #[error("Authorization flow superseded by a newer login attempt")]
    Superseded,

    #[error("Malformed authorization callback: {0}")]
    BadCallback(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Could not decode access token claims: {0}")]
    BadToken(String),

    #[error("Callback listener error: {0}")]
    Listener(String),
}

/// Cache storage errors.
///
/// These never propagate past the cache store: disk-tier failures degrade to
/// memory-only operation and are logged, not raised.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Could not determine cache directory")]
    NoHome,

    #[error("Cache I/O error: {0}")]
    Io(String),

    #[error("Cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine configuration directory")]
    NoHome,

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to save configuration: {0}")]
    SaveError(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
