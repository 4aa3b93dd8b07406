//! Error types for `toolmount-http-tools`.

use serde_json::Value;
use thiserror::Error;

/// Arguments rejected before any network I/O.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("arguments must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("missing required argument '{0}'")]
    Missing(String),

    #[error("argument '{field}' must be of type {expected}, got {found}")]
    WrongType {
        field: String,
        expected: String,
        found: &'static str,
    },

    /// The arguments produced a request that cannot be sent (bad URL, bad header value).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Failure of one tool invocation.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("invalid arguments: {0}")]
    Validation(#[from] ValidationError),

    /// Connect refused, timeout, TLS failure, truncated body.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with a non-2xx status.
    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: Value },
}

impl CallError {
    /// Stable machine-readable code surfaced to clients in failed tool results.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            CallError::Validation(_) => "validation_error",
            CallError::Unavailable(_) => "backend_unavailable",
            CallError::Status { .. } => "backend_error",
        }
    }
}

/// Adapter construction errors (bootstrap time).
#[derive(Error, Debug)]
pub enum AdapterBuildError {
    #[error("invalid base URL '{url}': {message}")]
    InvalidBaseUrl { url: String, message: String },

    #[error("invalid default header '{0}'")]
    InvalidHeader(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}
