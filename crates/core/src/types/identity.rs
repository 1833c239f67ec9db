//! Authenticated identity and its role classification.

use core::fmt;

use serde::{Deserialize, Serialize};

use super::email::Email;
use super::id::UserId;

/// Portal role derived from the `is_admin` flag on the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Content administrator. Sessions expire on inactivity.
    Admin,
    /// Regular learner.
    #[default]
    Standard,
}

impl Role {
    /// Role for a profile's admin flag.
    #[must_use]
    pub const fn from_admin_flag(is_admin: bool) -> Self {
        if is_admin { Self::Admin } else { Self::Standard }
    }

    /// Whether this role is subject to the inactivity timeout.
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

/// The system a standard user is scoped to (the `sistema` column).
///
/// Videos are tagged with the system they document; a standard user only sees
/// the videos for their system. The set of systems is data-driven in the
/// lookup table, so this is an opaque, trimmed, non-empty label rather than a
/// closed enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SystemScope(String);

impl SystemScope {
    /// Build a scope from a raw lookup value. Blank values mean "no scope".
    #[must_use]
    pub fn new(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_owned()))
    }

    /// The scope label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SystemScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is signed in, computed wholesale on every auth event.
///
/// An `Identity` is immutable for a given session generation. Consumers
/// compare whole values to detect changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Auth user ID (also the profile ID).
    pub id: UserId,
    /// Normalized email address.
    pub email: Email,
    /// Role from the profile.
    pub role: Role,
    /// System scope, only ever looked up for standard users.
    pub system_scope: Option<SystemScope>,
}

impl Identity {
    /// Whether the identity holds the admin role.
    #[must_use]
    pub const fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_admin_flag() {
        assert_eq!(Role::from_admin_flag(true), Role::Admin);
        assert_eq!(Role::from_admin_flag(false), Role::Standard);
        assert_eq!(Role::default(), Role::Standard);
    }

    #[test]
    fn test_system_scope_blank_is_none() {
        assert!(SystemScope::new("   ").is_none());
        assert_eq!(SystemScope::new(" ERP ").unwrap().as_str(), "ERP");
    }

    #[test]
    fn test_role_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"admin\"");
        assert_eq!(
            serde_json::to_string(&Role::Standard).unwrap(),
            "\"standard\""
        );
    }
}
