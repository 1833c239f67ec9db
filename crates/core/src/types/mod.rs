//! Core types for the tutorial portal.
//!
//! This module provides type-safe wrappers for the portal data model.

pub mod email;
pub mod id;
pub mod identity;
pub mod notification;
pub mod profile;
pub mod stats;
pub mod status;

pub use email::{Email, EmailError};
pub use id::*;
pub use identity::{Identity, Role, SystemScope};
pub use notification::{
    Notification, NotificationKind, NotificationRecord, NotificationSnapshot, RelatedUser,
    VideoRef,
};
pub use profile::{Profile, ThemePreference};
pub use stats::ProgressStats;
pub use status::*;
