//! Integration tests for the session lifecycle and its effect on sync.
//!
//! These tests run the whole engine: a sign-in must open the notification
//! channel and load the cache, and every way out of a session must close the
//! channel and clear the cache.

use std::sync::Arc;
use std::time::Duration;

use tutorial_portal_core::{AuthState, Role, SubscriptionStatus};
use tutorial_portal_integration_tests::{TestContext, notification, password};
use tutorial_portal_sync::baas::BackendError;
use tutorial_portal_sync::baas::memory::InMemoryBackend;
use tutorial_portal_sync::{NoticeSeverity, PortalEvent};

const TIMEOUT: Duration = Duration::from_secs(30 * 60);

// =============================================================================
// Sign-in
// =============================================================================

#[tokio::test]
async fn test_recovered_session_syncs_on_start() {
    let backend = Arc::new(InMemoryBackend::new());
    let user = backend.register_user("learner@portal.test", "correct-horse");
    backend.put_notification(notification(user, 1, false));
    backend.persist_session_for("learner@portal.test");

    let ctx = TestContext::with_backend(backend).await;

    assert_eq!(
        ctx.state.session().state(),
        AuthState::Authenticated(Role::Standard)
    );
    ctx.until(|state| state.notifications().unread_count() == 1)
        .await;
    ctx.until(|state| state.channels().status() == SubscriptionStatus::Open)
        .await;
}

#[tokio::test]
async fn test_network_failure_on_sign_in_leaves_nothing_behind() {
    let mut ctx = TestContext::new().await;
    ctx.backend
        .register_user("learner@portal.test", "correct-horse");
    ctx.backend
        .fail_sign_in(Some(BackendError::Network("connection reset".into())));

    let result = ctx
        .state
        .session()
        .sign_in("learner@portal.test", &password())
        .await;

    assert!(result.is_err());
    assert_eq!(ctx.state.session().state(), AuthState::Unauthenticated);
    assert_eq!(ctx.backend.open_channels(), 0);
    assert!(
        !ctx.drain()
            .iter()
            .any(|e| matches!(e, PortalEvent::IdentityChanged(Some(_))))
    );
}

#[tokio::test]
async fn test_profile_outage_still_syncs_as_standard() {
    let ctx = TestContext::new().await;
    let user = ctx
        .backend
        .register_admin("admin@portal.test", "correct-horse");
    ctx.backend.put_notification(notification(user, 1, false));
    ctx.backend
        .fail_profiles(Some(BackendError::Network("profiles offline".into())));

    ctx.sign_in("admin@portal.test").await;

    assert_eq!(
        ctx.state.session().state(),
        AuthState::Authenticated(Role::Standard)
    );
    assert!(!ctx.state.session().inactivity_timer_armed());
    ctx.until(|state| state.notifications().unread_count() == 1)
        .await;
}

// =============================================================================
// Sign-out
// =============================================================================

#[tokio::test]
async fn test_sign_out_with_remote_failure_still_tears_down_sync() {
    let ctx = TestContext::new().await;
    let user = ctx
        .backend
        .register_user("learner@portal.test", "correct-horse");
    ctx.backend.put_notification(notification(user, 1, false));
    ctx.sign_in("learner@portal.test").await;
    ctx.until(|state| state.notifications().unread_count() == 1)
        .await;
    ctx.backend
        .fail_sign_out(Some(BackendError::Network("offline".into())));

    let _ = ctx.state.session().sign_out().await;

    assert_eq!(ctx.state.session().state(), AuthState::Unauthenticated);
    ctx.until(|state| state.notifications().snapshot().notifications.is_empty())
        .await;
    ctx.until(|_| ctx.backend.open_channels() == 0).await;
    assert_eq!(ctx.state.notifications().owner(), None);
}

// =============================================================================
// Inactivity
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_admin_expiry_closes_channel_and_clears_cache() {
    let mut ctx = TestContext::new().await;
    let admin = ctx
        .backend
        .register_admin("admin@portal.test", "correct-horse");
    ctx.backend.put_notification(notification(admin, 1, false));
    ctx.sign_in("admin@portal.test").await;
    ctx.until(|state| state.notifications().unread_count() == 1)
        .await;
    ctx.drain();

    tokio::time::sleep(TIMEOUT + Duration::from_secs(1)).await;
    ctx.until(|state| state.session().state() == AuthState::Unauthenticated)
        .await;
    ctx.until(|_| ctx.backend.open_channels() == 0).await;
    ctx.until(|state| state.notifications().snapshot().notifications.is_empty())
        .await;

    let events = ctx.drain();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, PortalEvent::SessionExpired))
            .count(),
        1
    );
    assert!(events.iter().any(|e| matches!(
        e,
        PortalEvent::Notice(notice) if notice.severity == NoticeSeverity::Blocking
    )));
    assert_eq!(ctx.backend.calls().sign_out, 1);
}

#[tokio::test(start_paused = true)]
async fn test_standard_session_outlives_the_timeout() {
    let ctx = TestContext::new().await;
    ctx.backend
        .register_user("learner@portal.test", "correct-horse");
    ctx.sign_in("learner@portal.test").await;

    tokio::time::sleep(TIMEOUT * 3).await;

    assert!(ctx.state.session().state().is_authenticated());
    assert_eq!(ctx.backend.open_channels(), 1);
    assert_eq!(ctx.backend.calls().sign_out, 0);
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let ctx = TestContext::new().await;
    ctx.backend
        .register_admin("admin@portal.test", "correct-horse");
    ctx.sign_in("admin@portal.test").await;
    ctx.until(|_| ctx.backend.open_channels() == 1).await;

    ctx.state.shutdown().await;

    assert_eq!(ctx.backend.open_channels(), 0);
    assert!(!ctx.state.coordinator().is_running());
    // The session stays; only background work stops.
    assert!(ctx.state.session().state().is_authenticated());
}
