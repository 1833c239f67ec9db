//! Deterministic in-memory backend.
//!
//! Implements every backend seam against plain collections, with failure
//! injection and call/channel accounting so tests can assert on what the
//! engine asked for. Auth events and realtime inserts are delivered the same
//! way the hosted backend delivers them: through the auth broadcast and the
//! per-channel event sender.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast, mpsc};

use tutorial_portal_core::{
    Email, NotificationId, NotificationRecord, Profile, ProgressStats, RelatedUser, SystemScope,
    ThemePreference, UserId, VideoId, VideoRef,
};

use super::{
    AuthApi, AuthEvent, AuthEventKind, AuthUser, BackendError, ChannelEvent, ChannelHandle,
    ChannelSpec, ChannelStatus, DataApi, RawSession, RealtimeApi, SignUpResponse,
};
use crate::util::lock;

/// Which backend calls should fail, and with what.
#[derive(Debug, Clone, Default)]
struct Failures {
    sign_in: Option<BackendError>,
    sign_out: Option<BackendError>,
    get_session: Option<BackendError>,
    profiles: Option<BackendError>,
    scope_lookup: Option<BackendError>,
    notification_fetch: Option<BackendError>,
    notification_mutations: Option<BackendError>,
    progress: Option<BackendError>,
    open_channel: Option<BackendError>,
    remove_channel: Option<BackendError>,
}

/// Number of times each observable call was made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub sign_in: usize,
    pub sign_out: usize,
    pub scope_lookup: usize,
    pub fetch_notifications: usize,
    pub fetch_video: usize,
    pub fetch_related_user: usize,
    pub fetch_progress: usize,
    pub remove_channel: usize,
}

/// Channel lifecycle record, in the order the calls happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelLogEntry {
    Opened { name: String, filter: String },
    Removed { name: String },
}

#[derive(Debug)]
struct Account {
    id: UserId,
    password: String,
}

#[derive(Debug)]
struct OpenChannel {
    spec: ChannelSpec,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<Email, Account>,
    current: Option<RawSession>,
    require_confirmation: bool,
    profiles: HashMap<UserId, Profile>,
    scopes: HashMap<Email, SystemScope>,
    notifications: Vec<NotificationRecord>,
    videos: HashMap<VideoId, VideoRef>,
    completed: HashMap<UserId, u64>,
    failures: Failures,
    fetch_latency: Option<Duration>,
    channels: HashMap<u64, OpenChannel>,
    peak_open_channels: usize,
    channel_log: Vec<ChannelLogEntry>,
    calls: CallCounts,
}

/// Backend over in-process collections.
#[derive(Debug)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
    auth_events: broadcast::Sender<AuthEvent>,
    next_channel: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        let (auth_events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(MemoryState::default()),
            auth_events,
            next_channel: AtomicU64::new(1),
        }
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    /// Register an account. Its profile is created lazily by the engine.
    ///
    /// # Panics
    ///
    /// Panics if `email` is not a valid address.
    #[allow(clippy::expect_used)]
    pub fn register_user(&self, email: &str, password: &str) -> UserId {
        let email = Email::parse(email).expect("test email must be valid");
        let id = UserId::random();
        lock(&self.state).accounts.insert(
            email,
            Account {
                id,
                password: password.to_owned(),
            },
        );
        id
    }

    /// Register an account with an admin profile.
    pub fn register_admin(&self, email: &str, password: &str) -> UserId {
        let id = self.register_user(email, password);
        self.put_profile(Profile {
            is_admin: true,
            ..Profile::default_for(id)
        });
        id
    }

    pub fn put_profile(&self, profile: Profile) {
        lock(&self.state).profiles.insert(profile.id, profile);
    }

    #[must_use]
    pub fn profile(&self, id: UserId) -> Option<Profile> {
        lock(&self.state).profiles.get(&id).cloned()
    }

    /// Map an email to a system in the lookup table.
    ///
    /// # Panics
    ///
    /// Panics if `email` or `scope` is invalid.
    #[allow(clippy::expect_used)]
    pub fn set_system_scope(&self, email: &str, scope: &str) {
        let email = Email::parse(email).expect("test email must be valid");
        let scope = SystemScope::new(scope).expect("test scope must be non-blank");
        lock(&self.state).scopes.insert(email, scope);
    }

    pub fn put_video(&self, video: VideoRef) {
        lock(&self.state).videos.insert(video.id, video);
    }

    /// Store a notification without delivering a push event.
    pub fn put_notification(&self, record: NotificationRecord) {
        lock(&self.state).notifications.push(record);
    }

    /// Store a notification and deliver an INSERT to every matching channel.
    pub fn push_notification(&self, record: NotificationRecord) {
        let mut state = lock(&self.state);
        let filter = format!("user_id=eq.{}", record.user_id);
        let payload = serde_json::to_value(&record).unwrap_or(serde_json::Value::Null);
        for channel in state.channels.values() {
            if channel.spec.table == "notifications" && channel.spec.filter == filter {
                let _ = channel.events.send(ChannelEvent::Insert(payload.clone()));
            }
        }
        state.notifications.push(record);
    }

    /// Report a status change on every open channel.
    pub fn emit_channel_status(&self, status: &ChannelStatus) {
        for channel in lock(&self.state).channels.values() {
            let _ = channel.events.send(ChannelEvent::Status(status.clone()));
        }
    }

    #[must_use]
    pub fn notification(&self, id: NotificationId) -> Option<NotificationRecord> {
        lock(&self.state)
            .notifications
            .iter()
            .find(|n| n.id == id)
            .cloned()
    }

    pub fn set_completed_videos(&self, user_id: UserId, completed: u64) {
        lock(&self.state).completed.insert(user_id, completed);
    }

    /// Make `sign_up` return `ConfirmationRequired` instead of a session.
    pub fn require_confirmation(&self, required: bool) {
        lock(&self.state).require_confirmation = required;
    }

    /// Set the current session without emitting an auth event, as if it had
    /// been persisted by an earlier run.
    ///
    /// # Panics
    ///
    /// Panics if no account exists for `email`.
    #[allow(clippy::expect_used)]
    pub fn persist_session_for(&self, email: &str) {
        let email = Email::parse(email).expect("test email must be valid");
        let mut state = lock(&self.state);
        let id = state.accounts.get(&email).expect("account must exist").id;
        state.current = Some(issue_session(id, &email));
    }

    /// Deliver an arbitrary auth event to subscribers.
    pub fn emit_auth_event(&self, event: AuthEvent) {
        let _ = self.auth_events.send(event);
    }

    /// Delay every notification fetch by `latency`.
    pub fn set_fetch_latency(&self, latency: Option<Duration>) {
        lock(&self.state).fetch_latency = latency;
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    pub fn fail_sign_in(&self, err: Option<BackendError>) {
        lock(&self.state).failures.sign_in = err;
    }

    pub fn fail_sign_out(&self, err: Option<BackendError>) {
        lock(&self.state).failures.sign_out = err;
    }

    pub fn fail_get_session(&self, err: Option<BackendError>) {
        lock(&self.state).failures.get_session = err;
    }

    pub fn fail_profiles(&self, err: Option<BackendError>) {
        lock(&self.state).failures.profiles = err;
    }

    pub fn fail_scope_lookup(&self, err: Option<BackendError>) {
        lock(&self.state).failures.scope_lookup = err;
    }

    pub fn fail_notification_fetch(&self, err: Option<BackendError>) {
        lock(&self.state).failures.notification_fetch = err;
    }

    pub fn fail_notification_mutations(&self, err: Option<BackendError>) {
        lock(&self.state).failures.notification_mutations = err;
    }

    pub fn fail_progress(&self, err: Option<BackendError>) {
        lock(&self.state).failures.progress = err;
    }

    pub fn fail_open_channel(&self, err: Option<BackendError>) {
        lock(&self.state).failures.open_channel = err;
    }

    pub fn fail_remove_channel(&self, err: Option<BackendError>) {
        lock(&self.state).failures.remove_channel = err;
    }

    // =========================================================================
    // Accounting
    // =========================================================================

    #[must_use]
    pub fn calls(&self) -> CallCounts {
        lock(&self.state).calls
    }

    /// Channels currently open.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        lock(&self.state).channels.len()
    }

    /// Highest number of channels ever open at the same time.
    #[must_use]
    pub fn peak_open_channels(&self) -> usize {
        lock(&self.state).peak_open_channels
    }

    #[must_use]
    pub fn channel_log(&self) -> Vec<ChannelLogEntry> {
        lock(&self.state).channel_log.clone()
    }

    #[must_use]
    pub fn has_session(&self) -> bool {
        lock(&self.state).current.is_some()
    }
}

fn issue_session(id: UserId, email: &Email) -> RawSession {
    RawSession {
        access_token: SecretString::from(uuid::Uuid::new_v4().to_string()),
        refresh_token: Some(SecretString::from(uuid::Uuid::new_v4().to_string())),
        expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
        user: Some(AuthUser {
            id,
            email: Some(email.as_str().to_owned()),
        }),
    }
}

#[async_trait]
impl AuthApi for InMemoryBackend {
    async fn sign_in_with_password(
        &self,
        email: &Email,
        password: &SecretString,
    ) -> Result<RawSession, BackendError> {
        let session = {
            let mut state = lock(&self.state);
            state.calls.sign_in += 1;
            if let Some(err) = state.failures.sign_in.clone() {
                return Err(err);
            }
            let account = state
                .accounts
                .get(email)
                .filter(|account| account.password == password.expose_secret())
                .ok_or(BackendError::InvalidCredentials)?;
            let session = issue_session(account.id, email);
            state.current = Some(session.clone());
            session
        };

        self.emit_auth_event(AuthEvent {
            kind: AuthEventKind::SignedIn,
            session: Some(session.clone()),
        });
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &Email,
        password: &SecretString,
        full_name: Option<&str>,
    ) -> Result<SignUpResponse, BackendError> {
        let session = {
            let mut state = lock(&self.state);
            if state.accounts.contains_key(email) {
                return Err(BackendError::Status {
                    status: 422,
                    message: "User already registered".into(),
                });
            }
            let id = UserId::random();
            state.accounts.insert(
                email.clone(),
                Account {
                    id,
                    password: password.expose_secret().to_owned(),
                },
            );
            if let Some(name) = full_name {
                state.profiles.insert(
                    id,
                    Profile {
                        full_name: Some(name.to_owned()),
                        ..Profile::default_for(id)
                    },
                );
            }
            if state.require_confirmation {
                return Ok(SignUpResponse::ConfirmationRequired);
            }
            let session = issue_session(id, email);
            state.current = Some(session.clone());
            session
        };

        self.emit_auth_event(AuthEvent {
            kind: AuthEventKind::SignedIn,
            session: Some(session.clone()),
        });
        Ok(SignUpResponse::Session(session))
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        {
            let mut state = lock(&self.state);
            state.calls.sign_out += 1;
            if let Some(err) = state.failures.sign_out.clone() {
                return Err(err);
            }
            state.current = None;
        }
        self.emit_auth_event(AuthEvent {
            kind: AuthEventKind::SignedOut,
            session: None,
        });
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<RawSession>, BackendError> {
        let state = lock(&self.state);
        if let Some(err) = state.failures.get_session.clone() {
            return Err(err);
        }
        Ok(state.current.clone())
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_events.subscribe()
    }
}

#[async_trait]
impl DataApi for InMemoryBackend {
    async fn fetch_profile(&self, id: UserId) -> Result<Profile, BackendError> {
        let state = lock(&self.state);
        if let Some(err) = state.failures.profiles.clone() {
            return Err(err);
        }
        state
            .profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("profile {id}")))
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<Profile, BackendError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.failures.profiles.clone() {
            return Err(err);
        }
        state.profiles.insert(profile.id, profile.clone());
        Ok(profile.clone())
    }

    async fn update_theme(&self, id: UserId, theme: ThemePreference) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.failures.profiles.clone() {
            return Err(err);
        }
        let profile = state
            .profiles
            .get_mut(&id)
            .ok_or_else(|| BackendError::NotFound(format!("profile {id}")))?;
        profile.theme_preference = Some(theme);
        Ok(())
    }

    async fn lookup_system_scope(
        &self,
        email: &Email,
    ) -> Result<Option<SystemScope>, BackendError> {
        let mut state = lock(&self.state);
        state.calls.scope_lookup += 1;
        if let Some(err) = state.failures.scope_lookup.clone() {
            return Err(err);
        }
        Ok(state.scopes.get(email).cloned())
    }

    async fn fetch_notifications(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, BackendError> {
        let latency = {
            let mut state = lock(&self.state);
            state.calls.fetch_notifications += 1;
            state.fetch_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let state = lock(&self.state);
        if let Some(err) = state.failures.notification_fetch.clone() {
            return Err(err);
        }
        let mut records: Vec<NotificationRecord> = state
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn fetch_video(&self, id: VideoId) -> Result<Option<VideoRef>, BackendError> {
        let mut state = lock(&self.state);
        state.calls.fetch_video += 1;
        Ok(state.videos.get(&id).cloned())
    }

    async fn fetch_related_user(&self, id: UserId) -> Result<Option<RelatedUser>, BackendError> {
        let mut state = lock(&self.state);
        state.calls.fetch_related_user += 1;
        Ok(state.profiles.get(&id).map(|profile| RelatedUser {
            id,
            full_name: profile.full_name.clone(),
        }))
    }

    async fn mark_notification_read(&self, id: NotificationId) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.failures.notification_mutations.clone() {
            return Err(err);
        }
        if let Some(record) = state.notifications.iter_mut().find(|n| n.id == id) {
            record.read = true;
        }
        Ok(())
    }

    async fn mark_all_notifications_read(&self, user_id: UserId) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.failures.notification_mutations.clone() {
            return Err(err);
        }
        state
            .notifications
            .iter_mut()
            .filter(|n| n.user_id == user_id && !n.read)
            .for_each(|n| n.read = true);
        Ok(())
    }

    async fn delete_notification(&self, id: NotificationId) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.failures.notification_mutations.clone() {
            return Err(err);
        }
        state.notifications.retain(|n| n.id != id);
        Ok(())
    }

    async fn fetch_progress(
        &self,
        user_id: UserId,
        scope: Option<&SystemScope>,
    ) -> Result<ProgressStats, BackendError> {
        let mut state = lock(&self.state);
        state.calls.fetch_progress += 1;
        if let Some(err) = state.failures.progress.clone() {
            return Err(err);
        }
        let total = state
            .videos
            .values()
            .filter(|video| {
                scope.is_none_or(|scope| video.system.as_deref() == Some(scope.as_str()))
            })
            .count();
        Ok(ProgressStats {
            total_videos: u64::try_from(total).unwrap_or(u64::MAX),
            completed_videos: state.completed.get(&user_id).copied().unwrap_or(0),
        })
    }
}

#[async_trait]
impl RealtimeApi for InMemoryBackend {
    async fn open_channel(
        &self,
        spec: ChannelSpec,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<ChannelHandle, BackendError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.failures.open_channel.clone() {
            return Err(err);
        }

        let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let handle = ChannelHandle::new(id, spec.name.clone());
        let _ = events.send(ChannelEvent::Status(ChannelStatus::Subscribed));

        state.channel_log.push(ChannelLogEntry::Opened {
            name: spec.name.clone(),
            filter: spec.filter.clone(),
        });
        state.channels.insert(id, OpenChannel { spec, events });
        state.peak_open_channels = state.peak_open_channels.max(state.channels.len());
        Ok(handle)
    }

    async fn remove_channel(&self, handle: ChannelHandle) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        state.calls.remove_channel += 1;
        if let Some(err) = state.failures.remove_channel.clone() {
            return Err(err);
        }
        if state.channels.remove(&handle.id()).is_some() {
            state.channel_log.push(ChannelLogEntry::Removed {
                name: handle.name().to_owned(),
            });
        }
        Ok(())
    }
}
