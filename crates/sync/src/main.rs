//! Portal Sync - headless runner for the session and notification engine.
//!
//! Recovers the persisted session (or signs in with `PORTAL_EMAIL` /
//! `PORTAL_PASSWORD`), keeps the realtime notification channel open for the
//! signed-in identity, and logs every engine event until Ctrl-C.
//!
//! # Usage
//!
//! ```bash
//! BAAS_URL=https://abc.example.co BAAS_ANON_KEY=... portal-sync
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::sync::Arc;

use sentry::integrations::tracing as sentry_tracing;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tutorial_portal_sync::baas::{BackendHandles, HostedBackend};
use tutorial_portal_sync::{PortalConfig, PortalEvent, PortalState};

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &PortalConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

#[tokio::main]
async fn main() -> tutorial_portal_sync::Result<()> {
    // Load configuration from environment (needed for Sentry init)
    let config = PortalConfig::from_env()?;

    // Initialize Sentry (must be done before tracing subscriber)
    let _sentry_guard = init_sentry(&config);

    // Defaults to info level for our crate if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tutorial_portal_sync=info".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();

    let backend = Arc::new(HostedBackend::new(&config.baas)?);
    let state = PortalState::new(BackendHandles::from_backend(backend), config.sync.clone());

    let logger = tokio::spawn(log_events(state.events().subscribe()));

    let auth = state.start().await;
    if !auth.is_authenticated()
        && let Some(credentials) = config.credentials.as_ref()
    {
        tracing::info!(email = %credentials.email, "signing in with startup credentials");
        if let Err(err) = state
            .session()
            .sign_in(&credentials.email, &credentials.password)
            .await
        {
            tracing::error!(error = %err, "startup sign-in failed");
        }
    }

    shutdown_signal().await;

    state.shutdown().await;
    logger.abort();
    Ok(())
}

/// Log every engine event until the bus closes.
async fn log_events(mut events: tokio::sync::broadcast::Receiver<PortalEvent>) {
    loop {
        match events.recv().await {
            Ok(PortalEvent::IdentityChanged(Some(identity))) => tracing::info!(
                user_id = %identity.id,
                role = ?identity.role,
                scope = ?identity.system_scope.as_ref().map(ToString::to_string),
                "identity changed"
            ),
            Ok(PortalEvent::IdentityChanged(None)) => tracing::info!("signed out"),
            Ok(PortalEvent::NotificationsChanged(snapshot)) => tracing::info!(
                total = snapshot.notifications.len(),
                unread = snapshot.unread_count,
                "notifications changed"
            ),
            Ok(PortalEvent::SessionExpired) => tracing::warn!("session expired"),
            Ok(PortalEvent::Notice(notice)) => {
                tracing::info!(severity = ?notice.severity, message = %notice.message, "notice");
            }
            Ok(PortalEvent::ContentWatched { video_id }) => {
                tracing::debug!(%video_id, "content watched");
            }
            Ok(PortalEvent::StatsUpdated(stats)) => tracing::info!(
                completed = stats.completed_videos,
                total = stats.total_videos,
                percent = stats.completion_percent(),
                "progress updated"
            ),
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, stopping engine");
}
