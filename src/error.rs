//! Error taxonomy shared by the aggregator, the store, the category index and the limiter.
//!
//! Failures that have a safe fallback (stale cache, empty provider slice, fail-open limiter)
//! are absorbed inside the component that owns them. What reaches a caller is one of these
//! variants, and [`NewsError::kind`] gives the router a stable tag to pick a status from.

use serde::Serialize;

/// Stable, machine-readable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UpstreamUnavailable,
    BackendUnavailable,
    ValidationFailure,
    RateLimited,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::ValidationFailure => "validation_failure",
            ErrorKind::RateLimited => "rate_limited",
        }
    }
}

/// `Clone` so one coalesced fetch outcome can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NewsError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

impl NewsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NewsError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            NewsError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            NewsError::Validation(_) => ErrorKind::ValidationFailure,
            NewsError::RateLimited { .. } => ErrorKind::RateLimited,
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        NewsError::UpstreamUnavailable(msg.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        NewsError::BackendUnavailable(msg.into())
    }
}

impl From<redis::RedisError> for NewsError {
    fn from(e: redis::RedisError) -> Self {
        NewsError::BackendUnavailable(format!("redis: {e}"))
    }
}

pub type NewsResult<T> = Result<T, NewsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_tags() {
        assert_eq!(
            NewsError::upstream("x").kind().as_str(),
            "upstream_unavailable"
        );
        assert_eq!(NewsError::backend("x").kind().as_str(), "backend_unavailable");
        assert_eq!(
            NewsError::Validation("bad".into()).kind(),
            ErrorKind::ValidationFailure
        );
        let rl = NewsError::RateLimited {
            retry_after_secs: 7,
        };
        assert_eq!(rl.kind(), ErrorKind::RateLimited);
        assert_eq!(rl.to_string(), "rate limited, retry after 7s");
    }
}
