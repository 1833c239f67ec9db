//! State enums for sessions and realtime subscriptions.

use serde::{Deserialize, Serialize};

use super::identity::Role;

/// Lifecycle of the identity session.
///
/// ```text
/// Unauthenticated -> Authenticating -> Authenticated(role) -> Expiring -> Unauthenticated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "role", rename_all = "snake_case")]
pub enum AuthState {
    #[default]
    Unauthenticated,
    /// A sign-in request is in flight.
    Authenticating,
    /// A session is established for the given role.
    Authenticated(Role),
    /// The inactivity timer fired and a forced sign-out is running.
    Expiring,
}

impl AuthState {
    /// Whether a session is currently established.
    #[must_use]
    pub const fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}

/// Status of the realtime notification subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Idle,
    /// Channel requested, join not yet acknowledged.
    Opening,
    /// Join acknowledged; push events flow.
    Open,
    Closed,
}

impl SubscriptionStatus {
    /// `Opening` or `Open`.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Opening | Self::Open)
    }
}

/// User-activity signals that reset the inactivity timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySignal {
    Pointer,
    Key,
    Scroll,
    Touch,
}
