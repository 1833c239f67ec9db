//! Hosted backend (BaaS) collaborator seams.
//!
//! The engine never talks to a global client. Every component receives the
//! slice of the backend it needs as an injected trait object:
//!
//! - [`AuthApi`] - password sign-in/sign-up, sign-out, session recovery, and the
//!   ordered auth-state event stream
//! - [`DataApi`] - `profiles`, the role/system lookup table, `notifications`,
//!   and the read-only `videos` lookups
//! - [`RealtimeApi`] - push channels over row-change events
//!
//! # Implementations
//!
//! - [`HostedBackend`] - HTTP client for the hosted auth and table endpoints
//! - [`RealtimeClient`] - websocket client for the hosted realtime service
//! - `InMemoryBackend` (feature `testing`) - deterministic backend for tests

mod error;
mod hosted;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
mod realtime;

pub use error::BackendError;
pub use hosted::HostedBackend;
pub use realtime::RealtimeClient;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tokio::sync::{broadcast, mpsc};

use tutorial_portal_core::{
    Email, NotificationId, NotificationRecord, Profile, ProgressStats, RelatedUser, SystemScope,
    ThemePreference, UserId, VideoId, VideoRef,
};

// =============================================================================
// Auth types
// =============================================================================

/// The user object attached to a backend session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: UserId,
    /// Raw email as stored by the auth service; may be absent for phone users.
    pub email: Option<String>,
}

/// A session exactly as the auth service hands it out, before validation.
#[derive(Debug, Clone)]
pub struct RawSession {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    pub user: Option<AuthUser>,
}

/// Kind of auth-state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// An auth-state change, delivered in order to every subscriber.
#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub kind: AuthEventKind,
    pub session: Option<RawSession>,
}

/// Result of a sign-up request.
#[derive(Debug, Clone)]
pub enum SignUpResponse {
    /// The account is active and a session was issued.
    Session(RawSession),
    /// The account must be confirmed by email before signing in.
    ConfirmationRequired,
}

/// Authentication endpoints.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange an email/password pair for a session.
    async fn sign_in_with_password(
        &self,
        email: &Email,
        password: &SecretString,
    ) -> Result<RawSession, BackendError>;

    /// Register a new account with profile metadata.
    async fn sign_up(
        &self,
        email: &Email,
        password: &SecretString,
        full_name: Option<&str>,
    ) -> Result<SignUpResponse, BackendError>;

    /// Revoke the current session.
    async fn sign_out(&self) -> Result<(), BackendError>;

    /// Recover the persisted session, if any.
    async fn get_session(&self) -> Result<Option<RawSession>, BackendError>;

    /// Subscribe to auth-state changes. Events arrive in delivery order.
    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent>;
}

// =============================================================================
// Data access
// =============================================================================

/// Table reads and writes the engine depends on.
#[async_trait]
pub trait DataApi: Send + Sync {
    /// Fetch a profile. Returns [`BackendError::NotFound`] when the row is absent.
    async fn fetch_profile(&self, id: UserId) -> Result<Profile, BackendError>;

    /// Insert a profile row and return it as stored.
    async fn insert_profile(&self, profile: &Profile) -> Result<Profile, BackendError>;

    /// Persist a theme preference.
    async fn update_theme(&self, id: UserId, theme: ThemePreference) -> Result<(), BackendError>;

    /// Look up the system a user is scoped to, keyed by email.
    async fn lookup_system_scope(&self, email: &Email)
    -> Result<Option<SystemScope>, BackendError>;

    /// The `limit` most recent notifications for a user, newest first.
    async fn fetch_notifications(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, BackendError>;

    /// Resolve a video reference.
    async fn fetch_video(&self, id: VideoId) -> Result<Option<VideoRef>, BackendError>;

    /// Resolve a user reference.
    async fn fetch_related_user(&self, id: UserId) -> Result<Option<RelatedUser>, BackendError>;

    /// Set `read = true` on one notification.
    async fn mark_notification_read(&self, id: NotificationId) -> Result<(), BackendError>;

    /// Set `read = true` on all of a user's unread notifications.
    async fn mark_all_notifications_read(&self, user_id: UserId) -> Result<(), BackendError>;

    /// Delete one notification.
    async fn delete_notification(&self, id: NotificationId) -> Result<(), BackendError>;

    /// Count the videos visible in `scope` and how many the user completed.
    async fn fetch_progress(
        &self,
        user_id: UserId,
        scope: Option<&SystemScope>,
    ) -> Result<ProgressStats, BackendError>;
}

// =============================================================================
// Realtime
// =============================================================================

/// Row-change subscription request (INSERT events on one filtered table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub schema: String,
    pub table: String,
    /// Row filter, e.g. `user_id=eq.<uuid>`.
    pub filter: String,
}

/// Channel lifecycle status reported by the realtime service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// Something that happened on an open channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    /// A row matching the filter was inserted.
    Insert(serde_json::Value),
}

/// Opaque handle to an open channel.
///
/// Not `Clone`: [`RealtimeApi::remove_channel`] consumes it, so a handle can
/// be released at most once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    id: u64,
    name: String,
}

impl ChannelHandle {
    /// Create a handle. Only backends mint these.
    #[must_use]
    pub const fn new(id: u64, name: String) -> Self {
        Self { id, name }
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Push channels over row-change events.
#[async_trait]
pub trait RealtimeApi: Send + Sync {
    /// Open a channel; status changes and inserts are sent to `events`.
    async fn open_channel(
        &self,
        spec: ChannelSpec,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<ChannelHandle, BackendError>;

    /// Close a channel and release its resources.
    async fn remove_channel(&self, handle: ChannelHandle) -> Result<(), BackendError>;
}

// =============================================================================
// Handles
// =============================================================================

/// One injected handle per backend seam.
#[derive(Clone)]
pub struct BackendHandles {
    pub auth: Arc<dyn AuthApi>,
    pub data: Arc<dyn DataApi>,
    pub realtime: Arc<dyn RealtimeApi>,
}

impl BackendHandles {
    /// Split a backend implementing every seam into per-seam handles.
    #[must_use]
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: AuthApi + DataApi + RealtimeApi + 'static,
    {
        Self {
            auth: backend.clone(),
            data: backend.clone(),
            realtime: backend,
        }
    }
}

impl std::fmt::Debug for BackendHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandles").finish_non_exhaustive()
    }
}
