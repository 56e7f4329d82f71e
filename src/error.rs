use std::time::Duration;
use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur while evaluating or enforcing rate limits
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service error: {0}")]
    Service(String),

    /// The watched key was modified between read and commit.
    #[error("Optimistic transaction aborted: key modified concurrently")]
    TransactionConflict,

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Corrupt bucket state: {0}")]
    CorruptState(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Whether the error is a transient optimistic-concurrency conflict that
    /// may be retried in place. Every other error is terminal for a call.
    pub fn is_conflict(&self) -> bool {
        matches!(self, RateLimitError::TransactionConflict)
    }
}

impl From<config::ConfigError> for RateLimitError {
    fn from(err: config::ConfigError) -> Self {
        RateLimitError::Config(err.to_string())
    }
}

impl axum::response::IntoResponse for RateLimitError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            RateLimitError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            RateLimitError::Redis(_)
            | RateLimitError::Pool(_)
            | RateLimitError::Timeout(_)
            | RateLimitError::TransactionConflict => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}
