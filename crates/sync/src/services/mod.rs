//! Engine services.
//!
//! - [`session`] - identity, role, system scope, inactivity expiry
//! - [`profile`] - fail-soft profile resolution
//! - [`notifications`] - realtime channel and notification cache
//! - [`stats`] - throttled progress statistics

pub mod notifications;
pub mod profile;
pub mod session;
pub mod stats;
