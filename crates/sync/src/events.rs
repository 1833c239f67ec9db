//! Typed event bus for UI collaborators.
//!
//! A single broadcast channel per engine instance. Components publish
//! [`PortalEvent`]s; UI collaborators subscribe independently. Nothing is
//! global: each [`EventBus`] is created by the owning state and injected.

use tokio::sync::broadcast;
use tracing::trace;

use tutorial_portal_core::{Identity, NotificationSnapshot, ProgressStats, VideoId};

/// Capacity of the broadcast buffer. Slow receivers lag, they never block.
const EVENT_BUFFER: usize = 256;

/// How a notice should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeSeverity {
    /// Transient error; the user may dismiss it.
    Dismissible,
    /// Must be acknowledged; used for session expiry.
    Blocking,
}

/// A message to show the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNotice {
    pub severity: NoticeSeverity,
    pub message: String,
}

impl UserNotice {
    #[must_use]
    pub fn dismissible(message: impl Into<String>) -> Self {
        Self {
            severity: NoticeSeverity::Dismissible,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn blocking(message: impl Into<String>) -> Self {
        Self {
            severity: NoticeSeverity::Blocking,
            message: message.into(),
        }
    }
}

/// Every signal exchanged between the engine and its UI collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum PortalEvent {
    /// A new identity was established, or the session ended (`None`).
    IdentityChanged(Option<Identity>),
    /// The notification cache changed.
    NotificationsChanged(NotificationSnapshot),
    /// The inactivity timer forced a sign-out.
    SessionExpired,
    Notice(UserNotice),
    /// External input: the user finished watching a video.
    ContentWatched { video_id: VideoId },
    StatsUpdated(ProgressStats),
}

/// Broadcast bus carrying [`PortalEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PortalEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PortalEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: PortalEvent) {
        if self.tx.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    /// Convenience for publishing a notice.
    pub fn notice(&self, notice: UserNotice) {
        self.emit(PortalEvent::Notice(notice));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
