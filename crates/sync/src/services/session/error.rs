//! Authentication error types.

use thiserror::Error;

use crate::baas::BackendError;

/// Errors returned across the sign-in/sign-up/sign-out boundary.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Invalid email format.
    #[error("invalid email: {0}")]
    InvalidEmail(#[from] tutorial_portal_core::EmailError),

    /// Password does not meet the minimum requirements.
    #[error("password validation failed: {0}")]
    WeakPassword(String),

    /// Wrong email/password pair.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// The auth service could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// Any other backend failure.
    #[error("auth backend error: {0}")]
    Backend(BackendError),
}

impl From<BackendError> for AuthError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::InvalidCredentials => Self::InvalidCredentials,
            BackendError::Network(message) => Self::Network(message),
            other => Self::Backend(other),
        }
    }
}
