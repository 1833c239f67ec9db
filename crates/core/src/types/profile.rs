//! Profile record (`profiles` table).

use serde::{Deserialize, Serialize};

use super::id::UserId;

/// UI theme preference stored on the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThemePreference {
    Light,
    Dark,
    #[default]
    System,
}

/// A user's profile row.
///
/// Created lazily on first access with `is_admin = false`. Never deleted by
/// the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme_preference: Option<ThemePreference>,
}

impl Profile {
    /// The default profile for an identity that has none yet.
    ///
    /// Also used as the non-persisted fallback when the profile layer fails.
    #[must_use]
    pub const fn default_for(id: UserId) -> Self {
        Self {
            id,
            is_admin: false,
            full_name: None,
            theme_preference: None,
        }
    }
}
