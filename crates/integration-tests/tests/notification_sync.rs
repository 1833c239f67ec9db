//! Integration tests for realtime notification sync.
//!
//! These tests verify channel ownership across identity changes and the
//! consistency of the notification cache under mixed operations.

use futures::future::join_all;

use tutorial_portal_core::SubscriptionStatus;
use tutorial_portal_integration_tests::{TestContext, notification};
use tutorial_portal_sync::baas::BackendError;
use tutorial_portal_sync::baas::memory::ChannelLogEntry;
use tutorial_portal_sync::{ErrorKind, PortalError, PortalEvent};

fn unread_matches_cache(ctx: &TestContext) -> bool {
    let snapshot = ctx.state.notifications().snapshot();
    snapshot.unread_count == snapshot.notifications.iter().filter(|n| !n.read).count()
}

// =============================================================================
// Cache operations
// =============================================================================

#[tokio::test]
async fn test_fetch_mark_delete_scenario() {
    let ctx = TestContext::new().await;
    let user = ctx
        .backend
        .register_user("learner@portal.test", "correct-horse");
    let first = notification(user, 1, false);
    let second = notification(user, 2, false);
    ctx.backend.put_notification(first.clone());
    ctx.backend.put_notification(second.clone());
    ctx.backend.put_notification(notification(user, 3, true));
    ctx.sign_in("learner@portal.test").await;
    ctx.until(|state| state.notifications().snapshot().notifications.len() == 3)
        .await;
    assert_eq!(ctx.state.notifications().unread_count(), 2);

    ctx.state
        .notifications()
        .mark_as_read(first.id)
        .await
        .unwrap();
    assert_eq!(ctx.state.notifications().unread_count(), 1);

    ctx.state.notifications().delete(second.id).await.unwrap();
    assert_eq!(ctx.state.notifications().unread_count(), 0);
    assert_eq!(ctx.state.notifications().snapshot().notifications.len(), 2);
    assert!(ctx.backend.notification(first.id).unwrap().read);
    assert!(ctx.backend.notification(second.id).is_none());
}

#[tokio::test]
async fn test_unread_count_stays_consistent_across_mixed_operations() {
    let ctx = TestContext::new().await;
    let user = ctx
        .backend
        .register_user("learner@portal.test", "correct-horse");
    let records: Vec<_> = (0..8)
        .map(|minute| notification(user, minute, minute % 3 == 0))
        .collect();
    for record in &records {
        ctx.backend.put_notification(record.clone());
    }
    ctx.sign_in("learner@portal.test").await;
    ctx.until(|state| state.notifications().snapshot().notifications.len() == 8)
        .await;

    let store = ctx.state.notifications();
    store.mark_as_read(records[1].id).await.unwrap();
    assert!(unread_matches_cache(&ctx));
    store.mark_as_read(records[1].id).await.unwrap();
    assert!(unread_matches_cache(&ctx));
    store.delete(records[0].id).await.unwrap();
    assert!(unread_matches_cache(&ctx));
    store.delete(records[2].id).await.unwrap();
    assert!(unread_matches_cache(&ctx));

    ctx.backend
        .fail_notification_mutations(Some(BackendError::Network("offline".into())));
    let _ = store.mark_as_read(records[4].id).await;
    assert!(unread_matches_cache(&ctx));
    ctx.backend.fail_notification_mutations(None);

    store.fetch(user).await.unwrap();
    assert!(unread_matches_cache(&ctx));
    store.mark_all_as_read().await.unwrap();
    assert!(unread_matches_cache(&ctx));
    assert_eq!(store.unread_count(), 0);
}

#[tokio::test]
async fn test_mutation_failure_surfaces_dismissible_notice() {
    let mut ctx = TestContext::new().await;
    let user = ctx
        .backend
        .register_user("learner@portal.test", "correct-horse");
    let record = notification(user, 1, false);
    ctx.backend.put_notification(record.clone());
    ctx.sign_in("learner@portal.test").await;
    ctx.until(|state| state.notifications().unread_count() == 1)
        .await;
    ctx.drain();
    ctx.backend
        .fail_notification_mutations(Some(BackendError::Network("offline".into())));

    let err = ctx
        .state
        .notifications()
        .delete(record.id)
        .await
        .unwrap_err();

    assert_eq!(
        PortalError::from(err).kind(),
        ErrorKind::NotificationMutation
    );
    assert_eq!(ctx.state.notifications().unread_count(), 1);
    assert!(
        ctx.drain()
            .iter()
            .any(|e| matches!(e, PortalEvent::Notice(_)))
    );
}

// =============================================================================
// Channel ownership
// =============================================================================

#[tokio::test]
async fn test_identity_switch_closes_old_channel_first() {
    let ctx = TestContext::new().await;
    let alice = ctx
        .backend
        .register_user("alice@portal.test", "correct-horse");
    let bob = ctx.backend.register_user("bob@portal.test", "correct-horse");
    ctx.backend.put_notification(notification(alice, 1, false));
    ctx.backend.put_notification(notification(bob, 2, true));
    ctx.backend.put_notification(notification(bob, 3, true));

    ctx.sign_in("alice@portal.test").await;
    ctx.until(|state| state.channels().status() == SubscriptionStatus::Open)
        .await;

    ctx.sign_in("bob@portal.test").await;
    ctx.until(|state| {
        state
            .channels()
            .subscription()
            .is_some_and(|s| s.owner == bob && s.status == SubscriptionStatus::Open)
    })
    .await;
    ctx.until(|state| state.notifications().owner() == Some(bob))
        .await;
    ctx.until(|state| state.notifications().snapshot().notifications.len() == 2)
        .await;

    assert_eq!(ctx.backend.peak_open_channels(), 1);
    assert_eq!(ctx.backend.open_channels(), 1);
    let log = ctx.backend.channel_log();
    let alice_channel = format!("notifications:{alice}");
    let bob_channel = format!("notifications:{bob}");
    let removed_alice = log
        .iter()
        .position(|e| matches!(e, ChannelLogEntry::Removed { name } if *name == alice_channel))
        .unwrap();
    let opened_bob = log
        .iter()
        .position(|e| matches!(e, ChannelLogEntry::Opened { name, .. } if *name == bob_channel))
        .unwrap();
    assert!(removed_alice < opened_bob);
    assert_eq!(ctx.state.notifications().unread_count(), 0);
}

#[tokio::test]
async fn test_subscribe_storm_opens_one_channel() {
    let ctx = TestContext::new().await;
    let user = ctx
        .backend
        .register_user("learner@portal.test", "correct-horse");
    ctx.sign_in("learner@portal.test").await;

    let channels = ctx.state.channels();
    let results = join_all((0..20).map(|_| channels.subscribe(user))).await;

    assert!(results.iter().all(Result::is_ok));
    ctx.until(|_| ctx.backend.open_channels() == 1).await;
    assert_eq!(ctx.backend.peak_open_channels(), 1);
}

#[tokio::test]
async fn test_pushed_insert_refreshes_cache() {
    let mut ctx = TestContext::new().await;
    let user = ctx
        .backend
        .register_user("learner@portal.test", "correct-horse");
    ctx.backend.put_notification(notification(user, 1, true));
    ctx.sign_in("learner@portal.test").await;
    ctx.until(|state| state.channels().status() == SubscriptionStatus::Open)
        .await;
    ctx.until(|state| state.notifications().snapshot().notifications.len() == 1)
        .await;
    ctx.drain();

    ctx.backend.push_notification(notification(user, 2, false));

    ctx.until(|state| state.notifications().unread_count() == 1)
        .await;
    let snapshot = ctx.state.notifications().snapshot();
    assert_eq!(snapshot.notifications.len(), 2);
    assert!(!snapshot.notifications[0].read);
    assert!(
        ctx.drain()
            .iter()
            .any(|e| matches!(e, PortalEvent::NotificationsChanged(s) if s.unread_count == 1))
    );
}

#[tokio::test]
async fn test_channel_open_failure_still_loads_cache() {
    let ctx = TestContext::new().await;
    let user = ctx
        .backend
        .register_user("learner@portal.test", "correct-horse");
    ctx.backend.put_notification(notification(user, 1, false));
    ctx.backend
        .fail_open_channel(Some(BackendError::Realtime("join rejected".into())));

    ctx.sign_in("learner@portal.test").await;

    ctx.until(|state| state.notifications().unread_count() == 1)
        .await;
    assert_eq!(ctx.state.channels().status(), SubscriptionStatus::Closed);
    assert_eq!(ctx.backend.open_channels(), 0);
}
