//! Gateway error type and its mapping onto the wire error-code set

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias used throughout the gateway.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of error codes the wire protocol can carry.
///
/// Every [`Error`] variant maps to exactly one of these via [`Error::code`].
/// Clients match on this string, never on the human-readable `message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    UnknownOperation,
    ValidationError,
    Unauthorized,
    Forbidden,
    NotFound,
    AlreadyExists,
    Conflict,
    RateLimited,
    BucketNotDefined,
    QueryNotDefined,
    RulesNotAvailable,
    SessionRevoked,
    InternalError,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::UnknownOperation => "UNKNOWN_OPERATION",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::BucketNotDefined => "BUCKET_NOT_DEFINED",
            Self::QueryNotDefined => "QUERY_NOT_DEFINED",
            Self::RulesNotAvailable => "RULES_NOT_AVAILABLE",
            Self::SessionRevoked => "SESSION_REVOKED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Gateway error type, closed over the operations this crate performs.
///
/// Every variant carries the information needed to build a wire error
/// envelope: a stable [`ErrorCode`] and a message that is safe to show a
/// client (never a raw `Store`/`RuleEngine` error string — those are logged
/// and collapsed to [`Error::Internal`]).
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not parse frame: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("bucket not defined: {0}")]
    BucketNotDefined(String),

    #[error("query not defined: {0}")]
    QueryNotDefined(String),

    #[error("rules engine not available")]
    RulesNotAvailable,

    #[error("session revoked")]
    SessionRevoked,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable wire error code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) => ErrorCode::ParseError,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::UnknownOperation(_) => ErrorCode::UnknownOperation,
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::BucketNotDefined(_) => ErrorCode::BucketNotDefined,
            Self::QueryNotDefined(_) => ErrorCode::QueryNotDefined,
            Self::RulesNotAvailable => ErrorCode::RulesNotAvailable,
            Self::SessionRevoked => ErrorCode::SessionRevoked,
            Self::Internal(_) | Self::Config(_) | Self::Io(_) => ErrorCode::InternalError,
        }
    }

    /// `retryAfterMs` to attach to the wire envelope, if any.
    #[must_use]
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Message safe to expose to a client when `exposeErrorDetails` is on.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            // Never leak internals, even with details exposed.
            Self::Internal(_) | Self::Config(_) | Self::Io(_) => {
                "an internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_never_expose_their_message() {
        let err = Error::Internal("leaked connection string".to_string());
        assert_eq!(err.client_message(), "an internal error occurred");
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = Error::RateLimited { retry_after_ms: 250 };
        assert_eq!(err.code(), ErrorCode::RateLimited);
        assert_eq!(err.retry_after_ms(), Some(250));
    }

    #[test]
    fn code_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::BucketNotDefined).unwrap();
        assert_eq!(json, "\"BUCKET_NOT_DEFINED\"");
    }
}
