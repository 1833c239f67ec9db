//! Engine state shared with UI collaborators.

use std::sync::Arc;

use tracing::info;

use tutorial_portal_core::AuthState;

use crate::baas::BackendHandles;
use crate::config::SyncSettings;
use crate::coordinator::SyncCoordinator;
use crate::events::EventBus;
use crate::services::notifications::{NotificationChannelManager, NotificationStore};
use crate::services::session::IdentitySessionManager;
use crate::services::stats::ProgressStatsService;

/// One engine instance: every component plus the bus connecting them.
///
/// This struct is cheaply cloneable via `Arc`. Nothing in it is global; two
/// instances over two backends are fully independent.
#[derive(Clone)]
pub struct PortalState {
    inner: Arc<PortalStateInner>,
}

struct PortalStateInner {
    settings: SyncSettings,
    events: EventBus,
    session: IdentitySessionManager,
    store: NotificationStore,
    channels: NotificationChannelManager,
    stats: ProgressStatsService,
    coordinator: SyncCoordinator,
}

impl PortalState {
    /// Assemble the engine. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(backend: BackendHandles, settings: SyncSettings) -> Self {
        let events = EventBus::new();

        let session = IdentitySessionManager::new(&backend, &settings, events.clone());
        let store = NotificationStore::new(
            Arc::clone(&backend.data),
            settings.notification_limit,
            events.clone(),
        );
        let channels = NotificationChannelManager::new(
            Arc::clone(&backend.realtime),
            store.clone(),
            &settings,
        );
        let stats = ProgressStatsService::new(
            Arc::clone(&backend.data),
            settings.stats_throttle,
            events.clone(),
        );
        let coordinator = SyncCoordinator::new(
            session.clone(),
            store.clone(),
            channels.clone(),
            stats.clone(),
            events.clone(),
        );

        Self {
            inner: Arc::new(PortalStateInner {
                settings,
                events,
                session,
                store,
                channels,
                stats,
                coordinator,
            }),
        }
    }

    /// Start the coordinator and recover any persisted session.
    ///
    /// Returns the settled auth state.
    pub async fn start(&self) -> AuthState {
        self.inner.coordinator.start();
        let state = self.inner.session.initialize().await;
        info!(?state, "portal engine started");
        state
    }

    /// Tear down background work: the coordinator first, then the session.
    pub async fn shutdown(&self) {
        self.inner.coordinator.shutdown().await;
        self.inner.session.shutdown();
        info!("portal engine stopped");
    }

    #[must_use]
    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// The bus carrying every [`PortalEvent`](crate::events::PortalEvent).
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    #[must_use]
    pub fn session(&self) -> &IdentitySessionManager {
        &self.inner.session
    }

    #[must_use]
    pub fn notifications(&self) -> &NotificationStore {
        &self.inner.store
    }

    #[must_use]
    pub fn channels(&self) -> &NotificationChannelManager {
        &self.inner.channels
    }

    #[must_use]
    pub fn stats(&self) -> &ProgressStatsService {
        &self.inner.stats
    }

    #[must_use]
    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.inner.coordinator
    }
}

impl std::fmt::Debug for PortalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalState")
            .field("settings", &self.inner.settings)
            .field("session", &self.inner.session)
            .field("coordinator", &self.inner.coordinator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;
    use tutorial_portal_core::SubscriptionStatus;

    use super::*;
    use crate::baas::memory::InMemoryBackend;

    #[tokio::test]
    async fn test_start_settles_and_shutdown_releases_channel() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.register_user("learner@portal.test", "correct-horse");
        backend.persist_session_for("learner@portal.test");
        let state = PortalState::new(
            BackendHandles::from_backend(Arc::clone(&backend)),
            SyncSettings::default(),
        );

        assert!(state.start().await.is_authenticated());
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.channels().status() != SubscriptionStatus::Open {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        state.shutdown().await;

        assert_eq!(backend.open_channels(), 0);
        assert!(!state.coordinator().is_running());
    }

    #[tokio::test]
    async fn test_instances_are_independent() {
        let first = Arc::new(InMemoryBackend::new());
        let second = Arc::new(InMemoryBackend::new());
        first.register_user("learner@portal.test", "correct-horse");
        let a = PortalState::new(
            BackendHandles::from_backend(Arc::clone(&first)),
            SyncSettings::default(),
        );
        let b = PortalState::new(
            BackendHandles::from_backend(Arc::clone(&second)),
            SyncSettings::default(),
        );
        a.start().await;
        b.start().await;

        a.session()
            .sign_in("learner@portal.test", &SecretString::from("correct-horse"))
            .await
            .unwrap();

        assert!(b.session().identity().is_none());
        assert_eq!(second.calls().sign_in, 0);
        a.shutdown().await;
        b.shutdown().await;
    }
}
