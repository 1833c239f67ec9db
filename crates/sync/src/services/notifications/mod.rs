//! Notification inbox: the realtime channel and the cache it refreshes.
//!
//! The notification subsystem never reads session state. Callers pass the
//! owning identity's [`UserId`](tutorial_portal_core::UserId) in explicitly.

mod channel;
mod error;
mod store;

pub use channel::{NotificationChannelManager, Subscription};
pub use error::{NotificationError, SubscriptionError};
pub use store::NotificationStore;
