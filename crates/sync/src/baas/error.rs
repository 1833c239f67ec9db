//! Transport-level errors from the hosted backend.

use thiserror::Error;

/// Errors returned by any backend collaborator call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The request never produced a response (DNS, TLS, connection reset).
    #[error("network error: {0}")]
    Network(String),

    /// The auth endpoint rejected the email/password pair.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend answered with a non-success status.
    #[error("backend returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error message from the response body, if any.
        message: String,
    },

    /// The response body did not match the expected shape.
    #[error("failed to decode backend response: {0}")]
    Decode(String),

    /// The realtime socket failed or rejected a channel.
    #[error("realtime error: {0}")]
    Realtime(String),
}

impl BackendError {
    /// Whether the error means the row is absent rather than the call failed.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::Network(err.to_string())
        }
    }
}
