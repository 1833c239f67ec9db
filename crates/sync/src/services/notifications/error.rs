//! Notification and subscription error types.

use thiserror::Error;

use crate::baas::BackendError;
use crate::error::ErrorKind;

/// Errors from the notification cache.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Pulling notifications from the backend failed.
    #[error("failed to load notifications: {0}")]
    Fetch(BackendError),

    /// A read/delete mutation failed remotely.
    #[error("failed to update notification: {0}")]
    Mutation(BackendError),

    /// The store is not bound to an identity.
    #[error("no signed-in identity")]
    NoIdentity,
}

impl NotificationError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(_) => ErrorKind::NotificationFetch,
            Self::Mutation(_) | Self::NoIdentity => ErrorKind::NotificationMutation,
        }
    }
}

/// Realtime channel creation or teardown failure. Never retried here.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("failed to open notification channel: {0}")]
    Open(BackendError),

    #[error("failed to close notification channel: {0}")]
    Close(BackendError),
}
