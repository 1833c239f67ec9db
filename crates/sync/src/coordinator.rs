//! Wires the session to the notification and stats services.
//!
//! The coordinator is the owning scope for the background work of one engine
//! instance. It watches the identity published by the session manager and:
//!
//! - on a new identity, subscribes the notification channel and loads the store
//! - on sign-out, closes the channel, clears the store, and drops cached stats
//! - on [`PortalEvent::ContentWatched`], asks the stats service to recompute
//!
//! Identity is passed to the notification services as a value; they never
//! reach back into the session manager.

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tutorial_portal_core::{Identity, UserId, VideoId};

use crate::events::{EventBus, PortalEvent};
use crate::services::notifications::{NotificationChannelManager, NotificationStore};
use crate::services::session::{IdentitySessionManager, SessionSnapshot};
use crate::services::stats::{ProgressStatsService, RefetchOutcome};
use crate::util::lock;

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct CoordinatorInner {
    session: IdentitySessionManager,
    store: NotificationStore,
    channels: NotificationChannelManager,
    stats: ProgressStatsService,
    events: EventBus,
    running: Mutex<Option<Running>>,
}

/// Background wiring between identity, notifications, and stats.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    #[must_use]
    pub fn new(
        session: IdentitySessionManager,
        store: NotificationStore,
        channels: NotificationChannelManager,
        stats: ProgressStatsService,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                session,
                store,
                channels,
                stats,
                events,
                running: Mutex::new(None),
            }),
        }
    }

    /// Start the background tasks. Calling it again while running is a no-op.
    ///
    /// The identity already published when this is called is applied first.
    pub fn start(&self) {
        let mut running = lock(&self.inner.running);
        if running.is_some() {
            debug!("coordinator already running");
            return;
        }

        let cancel = CancellationToken::new();
        let identities = self.inner.session.subscribe();
        // Subscribe before spawning so no event emitted after `start` is missed.
        let events = self.inner.events.subscribe();

        let tasks = vec![
            tokio::spawn(follow_identity(
                Arc::clone(&self.inner),
                identities,
                cancel.clone(),
            )),
            tokio::spawn(route_events(Arc::clone(&self.inner), events, cancel.clone())),
        ];

        *running = Some(Running { cancel, tasks });
        info!("sync coordinator started");
    }

    /// Whether the background tasks are running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.inner.running).is_some()
    }

    /// Signal that the user finished watching a video.
    pub fn content_watched(&self, video_id: VideoId) {
        self.inner
            .events
            .emit(PortalEvent::ContentWatched { video_id });
    }

    /// Stop the background tasks and close the notification channel.
    ///
    /// Work already in flight finishes first; nothing runs afterwards.
    /// Safe to call more than once.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let Some(running) = lock(&self.inner.running).take() else {
            return;
        };
        running.cancel.cancel();

        for result in join_all(running.tasks).await {
            if let Err(err) = result {
                error!(error = %err, "coordinator task failed");
            }
        }

        if let Err(err) = self.inner.channels.unsubscribe().await {
            warn!(error = %err, "failed to close notification channel on shutdown");
        }
        info!("sync coordinator stopped");
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// Apply every identity change, in order, until cancelled.
async fn follow_identity(
    inner: Arc<CoordinatorInner>,
    mut identities: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
) {
    let mut applied: Option<UserId> = None;

    loop {
        let identity = identities.borrow_and_update().identity.clone();
        if identity.as_ref().map(|i| i.id) != applied {
            applied = identity.as_ref().map(|i| i.id);
            apply_identity(&inner, identity).await;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = identities.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!("identity follower stopped");
}

async fn apply_identity(inner: &CoordinatorInner, identity: Option<Identity>) {
    match identity {
        Some(identity) => {
            debug!(user_id = %identity.id, "identity established");
            if let Err(err) = inner.channels.subscribe(identity.id).await {
                // No retry; the next identity change subscribes again.
                warn!(user_id = %identity.id, error = %err, "notification channel unavailable");
            }
            if let Err(err) = inner.store.fetch(identity.id).await {
                debug!(error = %err, "initial notification load failed");
            }
        }
        None => {
            debug!("identity cleared");
            if let Err(err) = inner.channels.unsubscribe().await {
                warn!(error = %err, "failed to close notification channel");
            }
            inner.store.clear();
            inner.stats.reset();
        }
    }
}

/// Route bus events the engine itself consumes.
async fn route_events(
    inner: Arc<CoordinatorInner>,
    mut events: broadcast::Receiver<PortalEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(PortalEvent::ContentWatched { video_id }) => {
                let Some(identity) = inner.session.identity() else {
                    debug!(%video_id, "content watched while signed out");
                    continue;
                };
                match inner.stats.request_refetch(&identity).await {
                    Ok(RefetchOutcome::Recomputed(_)) => {}
                    Ok(RefetchOutcome::Skipped) => debug!(%video_id, "stats refetch coalesced"),
                    Err(err) => warn!(error = %err, "stats refetch failed"),
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event router lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("event router stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use secrecy::SecretString;
    use tutorial_portal_core::{
        NotificationId, NotificationKind, NotificationRecord, ProgressStats, SubscriptionStatus,
    };

    use super::*;
    use crate::baas::BackendHandles;
    use crate::baas::memory::InMemoryBackend;
    use crate::config::SyncSettings;

    const PASSWORD: &str = "correct-horse";

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        session: IdentitySessionManager,
        store: NotificationStore,
        channels: NotificationChannelManager,
        stats: ProgressStatsService,
        coordinator: SyncCoordinator,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryBackend::new());
        let handles = BackendHandles::from_backend(Arc::clone(&backend));
        let settings = SyncSettings::default();
        let events = EventBus::new();

        let session = IdentitySessionManager::new(&handles, &settings, events.clone());
        let store = NotificationStore::new(
            Arc::clone(&handles.data),
            settings.notification_limit,
            events.clone(),
        );
        let channels =
            NotificationChannelManager::new(Arc::clone(&handles.realtime), store.clone(), &settings);
        let stats = ProgressStatsService::new(
            Arc::clone(&handles.data),
            settings.stats_throttle,
            events.clone(),
        );
        let coordinator = SyncCoordinator::new(
            session.clone(),
            store.clone(),
            channels.clone(),
            stats.clone(),
            events,
        );

        Fixture {
            backend,
            session,
            store,
            channels,
            stats,
            coordinator,
        }
    }

    fn record(user_id: UserId, read: bool) -> NotificationRecord {
        NotificationRecord {
            id: NotificationId::random(),
            user_id,
            kind: NotificationKind::NewVideo,
            title: "Novo vídeo".into(),
            message: "Um novo tutorial foi publicado".into(),
            video_id: None,
            comment_id: None,
            related_user_id: None,
            read,
            created_at: Utc::now(),
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn sign_in(fixture: &Fixture, email: &str) {
        fixture
            .session
            .sign_in(email, &SecretString::from(PASSWORD))
            .await
            .unwrap();
    }

    // =========================================================================
    // Identity wiring
    // =========================================================================

    #[tokio::test]
    async fn test_sign_in_opens_channel_and_loads_store() {
        let fixture = fixture();
        let user = fixture.backend.register_user("learner@portal.test", PASSWORD);
        fixture.backend.put_notification(record(user, false));
        fixture.backend.put_notification(record(user, true));
        fixture.session.initialize().await;
        fixture.coordinator.start();

        sign_in(&fixture, "learner@portal.test").await;

        eventually(|| fixture.store.snapshot().notifications.len() == 2).await;
        eventually(|| fixture.channels.status() == SubscriptionStatus::Open).await;
        assert_eq!(fixture.store.unread_count(), 1);
        assert_eq!(fixture.channels.subscription().unwrap().owner, user);
    }

    #[tokio::test]
    async fn test_recovered_session_is_applied_on_start() {
        let fixture = fixture();
        let user = fixture.backend.register_user("learner@portal.test", PASSWORD);
        fixture.backend.persist_session_for("learner@portal.test");
        fixture.backend.put_notification(record(user, false));
        fixture.session.initialize().await;

        fixture.coordinator.start();

        eventually(|| fixture.store.unread_count() == 1).await;
        assert_eq!(fixture.backend.open_channels(), 1);
    }

    #[tokio::test]
    async fn test_sign_out_closes_channel_and_clears_store() {
        let fixture = fixture();
        let user = fixture.backend.register_user("learner@portal.test", PASSWORD);
        fixture.backend.put_notification(record(user, false));
        fixture.session.initialize().await;
        fixture.coordinator.start();
        sign_in(&fixture, "learner@portal.test").await;
        eventually(|| fixture.store.unread_count() == 1).await;

        fixture.session.sign_out().await.unwrap();

        eventually(|| fixture.backend.open_channels() == 0).await;
        eventually(|| fixture.store.snapshot().notifications.is_empty()).await;
        assert_eq!(fixture.store.owner(), None);
        assert_eq!(fixture.channels.status(), SubscriptionStatus::Closed);
    }

    #[tokio::test]
    async fn test_pushed_notification_reaches_store() {
        let fixture = fixture();
        let user = fixture.backend.register_user("learner@portal.test", PASSWORD);
        fixture.session.initialize().await;
        fixture.coordinator.start();
        sign_in(&fixture, "learner@portal.test").await;
        eventually(|| fixture.channels.status() == SubscriptionStatus::Open).await;

        fixture.backend.push_notification(record(user, false));

        eventually(|| fixture.store.unread_count() == 1).await;
    }

    // =========================================================================
    // Stats routing
    // =========================================================================

    #[tokio::test]
    async fn test_content_watched_recomputes_stats() {
        let fixture = fixture();
        let user = fixture.backend.register_user("learner@portal.test", PASSWORD);
        fixture.backend.set_completed_videos(user, 3);
        fixture.session.initialize().await;
        fixture.coordinator.start();
        sign_in(&fixture, "learner@portal.test").await;
        eventually(|| fixture.session.identity().is_some()).await;

        fixture.coordinator.content_watched(VideoId::random());

        eventually(|| fixture.stats.latest().is_some()).await;
        assert_eq!(
            fixture.stats.latest(),
            Some(ProgressStats {
                total_videos: 0,
                completed_videos: 3,
            })
        );
    }

    #[tokio::test]
    async fn test_content_watched_while_signed_out_is_ignored() {
        let fixture = fixture();
        fixture.session.initialize().await;
        fixture.coordinator.start();

        fixture.coordinator.content_watched(VideoId::random());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fixture.backend.calls().fetch_progress, 0);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    #[tokio::test]
    async fn test_shutdown_closes_channel_and_stops_reacting() {
        let fixture = fixture();
        fixture.backend.register_user("learner@portal.test", PASSWORD);
        fixture.session.initialize().await;
        fixture.coordinator.start();
        sign_in(&fixture, "learner@portal.test").await;
        eventually(|| fixture.backend.open_channels() == 1).await;

        fixture.coordinator.shutdown().await;

        assert!(!fixture.coordinator.is_running());
        assert_eq!(fixture.backend.open_channels(), 0);

        fixture.coordinator.content_watched(VideoId::random());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fixture.backend.calls().fetch_progress, 0);

        fixture.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_spawns_once() {
        let fixture = fixture();
        fixture.backend.register_user("learner@portal.test", PASSWORD);
        fixture.session.initialize().await;
        fixture.coordinator.start();
        fixture.coordinator.start();

        sign_in(&fixture, "learner@portal.test").await;

        eventually(|| fixture.backend.open_channels() == 1).await;
        assert_eq!(fixture.backend.peak_open_channels(), 1);
        fixture.coordinator.shutdown().await;
    }
}
