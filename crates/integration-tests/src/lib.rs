//! Integration tests for the tutorial portal sync engine.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p tutorial-portal-integration-tests
//! ```
//!
//! Every test drives a full [`PortalState`] over the in-memory backend, so
//! no network or hosted project is needed.
//!
//! # Test Categories
//!
//! - `session_lifecycle` - sign-in, sign-out, expiry, and their effect on sync
//! - `notification_sync` - channel ownership across identities and the cache
//! - `stats_throttle` - content-watched bursts through the event bus

#![allow(clippy::unwrap_used, clippy::missing_panics_doc)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use secrecy::SecretString;
use tokio::sync::broadcast;

use tutorial_portal_core::{NotificationId, NotificationKind, NotificationRecord, UserId};
use tutorial_portal_sync::baas::BackendHandles;
use tutorial_portal_sync::baas::memory::InMemoryBackend;
use tutorial_portal_sync::{PortalEvent, PortalState, SyncSettings};

pub const PASSWORD: &str = "correct-horse";

/// Upper bound for anything the engine does in the background.
pub const WAIT: Duration = Duration::from_secs(5);

/// A started engine over an in-memory backend.
pub struct TestContext {
    pub backend: Arc<InMemoryBackend>,
    pub state: PortalState,
    pub events: broadcast::Receiver<PortalEvent>,
}

impl TestContext {
    /// Build and start an engine with default settings.
    pub async fn new() -> Self {
        Self::with_backend(Arc::new(InMemoryBackend::new())).await
    }

    /// Build and start an engine over a pre-seeded backend.
    pub async fn with_backend(backend: Arc<InMemoryBackend>) -> Self {
        let state = PortalState::new(
            BackendHandles::from_backend(Arc::clone(&backend)),
            SyncSettings::default(),
        );
        let events = state.events().subscribe();
        state.start().await;
        Self {
            backend,
            state,
            events,
        }
    }

    /// Sign in and wait until the identity is published.
    pub async fn sign_in(&self, email: &str) {
        self.state
            .session()
            .sign_in(email, &password())
            .await
            .unwrap();
        self.until(|state| {
            state
                .session()
                .identity()
                .is_some_and(|identity| identity.email.as_str() == email)
        })
        .await;
    }

    /// Poll `condition` until it holds, failing after [`WAIT`].
    pub async fn until(&self, mut condition: impl FnMut(&PortalState) -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition(&self.state) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Every event received so far.
    pub fn drain(&mut self) -> Vec<PortalEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

#[must_use]
pub fn password() -> SecretString {
    SecretString::from(PASSWORD)
}

/// A `new_video` notification for `user_id`, created `minute` minutes into
/// a fixed hour.
#[must_use]
pub fn notification(user_id: UserId, minute: u32, read: bool) -> NotificationRecord {
    NotificationRecord {
        id: NotificationId::random(),
        user_id,
        kind: NotificationKind::NewVideo,
        title: format!("Novo vídeo {minute}"),
        message: "Um novo tutorial foi publicado no seu sistema".into(),
        video_id: None,
        comment_id: None,
        related_user_id: None,
        read,
        created_at: at_minute(minute),
    }
}

fn at_minute(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 10, minute, 0).unwrap()
}
