//! Unified error handling.
//!
//! Each component returns its own `thiserror` enum. At the boundary to UI
//! collaborators and the binary, those are folded into [`PortalError`], a
//! tagged `{kind, message, cause}` value that callers match on via
//! [`ErrorKind`].

use core::fmt;

use thiserror::Error;

use crate::baas::BackendError;
use crate::config::ConfigError;
use crate::services::notifications::{NotificationError, SubscriptionError};
use crate::services::profile::ProfileError;
use crate::services::session::AuthError;
use crate::services::stats::StatsError;

/// Classification of every error the engine can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Sign-in/sign-up/sign-out failures.
    Auth,
    /// Profile lookup or update failures (usually degraded, not surfaced).
    ProfileFetch,
    NotificationFetch,
    NotificationMutation,
    /// Realtime channel creation or teardown failure.
    Subscription,
    /// Progress statistics could not be recomputed.
    Stats,
    Config,
    /// Any other backend transport failure.
    Backend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auth => "auth",
            Self::ProfileFetch => "profile_fetch",
            Self::NotificationFetch => "notification_fetch",
            Self::NotificationMutation => "notification_mutation",
            Self::Subscription => "subscription",
            Self::Stats => "stats",
            Self::Config => "config",
            Self::Backend => "backend",
        };
        f.write_str(name)
    }
}

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Tagged engine error: `{kind, message, cause}`.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct PortalError {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<Cause>,
}

impl PortalError {
    /// Wrap a component error, keeping it as the source.
    fn wrap<E>(kind: ErrorKind, err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            message: err.to_string(),
            cause: Some(Box::new(err)),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<AuthError> for PortalError {
    fn from(err: AuthError) -> Self {
        Self::wrap(ErrorKind::Auth, err)
    }
}

impl From<ProfileError> for PortalError {
    fn from(err: ProfileError) -> Self {
        Self::wrap(ErrorKind::ProfileFetch, err)
    }
}

impl From<NotificationError> for PortalError {
    fn from(err: NotificationError) -> Self {
        Self::wrap(err.kind(), err)
    }
}

impl From<SubscriptionError> for PortalError {
    fn from(err: SubscriptionError) -> Self {
        Self::wrap(ErrorKind::Subscription, err)
    }
}

impl From<StatsError> for PortalError {
    fn from(err: StatsError) -> Self {
        Self::wrap(err.kind(), err)
    }
}

impl From<ConfigError> for PortalError {
    fn from(err: ConfigError) -> Self {
        Self::wrap(ErrorKind::Config, err)
    }
}

impl From<BackendError> for PortalError {
    fn from(err: BackendError) -> Self {
        Self::wrap(ErrorKind::Backend, err)
    }
}

/// Result type alias for `PortalError`.
pub type Result<T> = std::result::Result<T, PortalError>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_kind_follows_component_error() {
        let err = PortalError::from(NotificationError::Mutation(BackendError::Network(
            "reset".into(),
        )));
        assert_eq!(err.kind(), ErrorKind::NotificationMutation);
        assert!(err.source().is_some());
    }

    #[test]
    fn test_display_is_tagged() {
        let err = PortalError::from(SubscriptionError::Open(BackendError::Realtime(
            "join rejected".into(),
        )));
        assert_eq!(
            err.to_string(),
            "subscription: failed to open notification channel: realtime error: join rejected"
        );
        assert_eq!(err.kind(), ErrorKind::Subscription);
    }
}
