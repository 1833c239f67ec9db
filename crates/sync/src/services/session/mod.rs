//! Identity session management.
//!
//! Owns who is signed in, their role and system scope, and the admin
//! inactivity timer. State only ever becomes `Authenticated` through
//! [`IdentitySessionManager::reconcile`], which is fed by the backend's
//! ordered auth-event stream; `sign_in` merely starts the exchange.
//!
//! ```text
//! Unauthenticated -> Authenticating -> Authenticated(role) -> Expiring -> Unauthenticated
//! ```

mod error;
mod timer;

pub use error::AuthError;
pub use timer::InactivityTimer;

use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use moka::future::Cache;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use tutorial_portal_core::{
    ActivitySignal, AuthState, Email, Identity, Profile, Role, SystemScope, ThemePreference,
    UserId,
};

use crate::baas::{
    AuthApi, AuthEvent, AuthEventKind, BackendHandles, DataApi, RawSession, SignUpResponse,
};
use crate::config::SyncSettings;
use crate::events::{EventBus, PortalEvent, UserNotice};
use crate::services::profile::{ProfileError, ProfileResolver};
use crate::util::lock;

/// Minimum password length accepted by the auth service.
const MIN_PASSWORD_LENGTH: usize = 6;

/// Upper bound on cached role/system lookups.
const SCOPE_CACHE_CAPACITY: u64 = 1_000;

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: AuthState,
    pub identity: Option<Identity>,
    /// True until the first `initialize` settles.
    pub loading: bool,
}

/// Timing of the current session. Tokens stay with the backend client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    /// When the access token expires, as reported by the auth service.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the inactivity timer fires; admin sessions only.
    pub inactivity_deadline: Option<tokio::time::Instant>,
}

/// Result of a sign-up request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignUpOutcome {
    /// The session will arrive through the auth-event stream.
    SessionIssued,
    /// The user has to confirm their email first.
    ConfirmationRequired,
}

#[derive(Debug, Default)]
struct SessionState {
    auth: AuthState,
    identity: Option<Identity>,
    profile: Option<Profile>,
    expires_at: Option<DateTime<Utc>>,
    loading: bool,
    /// Bumped whenever local state is cleared; in-flight reconciliations
    /// started under an older generation are discarded.
    generation: u64,
}

struct Inner {
    auth: Arc<dyn AuthApi>,
    data: Arc<dyn DataApi>,
    profiles: ProfileResolver,
    scopes: Cache<Email, Option<SystemScope>>,
    state: Mutex<SessionState>,
    snapshot: watch::Sender<SessionSnapshot>,
    timer: InactivityTimer,
    events: EventBus,
    listener: Mutex<Option<CancellationToken>>,
}

/// Tracks the authenticated identity and its session lifecycle.
#[derive(Clone)]
pub struct IdentitySessionManager {
    inner: Arc<Inner>,
}

impl IdentitySessionManager {
    /// Create a manager. Nothing happens until [`initialize`](Self::initialize).
    #[must_use]
    pub fn new(backend: &BackendHandles, settings: &SyncSettings, events: EventBus) -> Self {
        let initial = SessionSnapshot {
            state: AuthState::Unauthenticated,
            identity: None,
            loading: true,
        };
        let (snapshot, _) = watch::channel(initial);

        Self {
            inner: Arc::new(Inner {
                auth: Arc::clone(&backend.auth),
                data: Arc::clone(&backend.data),
                profiles: ProfileResolver::new(Arc::clone(&backend.data)),
                scopes: Cache::builder()
                    .max_capacity(SCOPE_CACHE_CAPACITY)
                    .time_to_live(settings.scope_cache_ttl)
                    .build(),
                state: Mutex::new(SessionState {
                    loading: true,
                    ..SessionState::default()
                }),
                snapshot,
                timer: InactivityTimer::new(settings.inactivity_timeout),
                events,
                listener: Mutex::new(None),
            }),
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    /// Watch the session snapshot. Always holds the latest value.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn state(&self) -> AuthState {
        lock(&self.inner.state).auth
    }

    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        lock(&self.inner.state).identity.clone()
    }

    #[must_use]
    pub fn profile(&self) -> Option<Profile> {
        lock(&self.inner.state).profile.clone()
    }

    /// Timing of the current session, if one is established.
    #[must_use]
    pub fn session_info(&self) -> Option<SessionInfo> {
        let state = lock(&self.inner.state);
        state.identity.as_ref().map(|_| SessionInfo {
            expires_at: state.expires_at,
            inactivity_deadline: self.inner.timer.deadline(),
        })
    }

    /// Whether the inactivity timer is currently armed.
    #[must_use]
    pub fn inactivity_timer_armed(&self) -> bool {
        self.inner.timer.is_armed()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start listening for auth events and recover a persisted session.
    ///
    /// Always settles: on a recovered session the state is
    /// `Authenticated(role)`, on absence or error it is `Unauthenticated`.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> AuthState {
        self.start_listener();

        match self.inner.auth.get_session().await {
            Ok(Some(session)) => {
                debug!("recovered persisted session");
                self.reconcile(AuthEvent {
                    kind: AuthEventKind::InitialSession,
                    session: Some(session),
                })
                .await;
            }
            Ok(None) => debug!("no persisted session"),
            Err(err) => warn!(error = %err, "session recovery failed"),
        }

        self.settle();
        self.state()
    }

    /// Stop the auth listener and cancel the inactivity timer.
    pub fn shutdown(&self) {
        if let Some(listener) = lock(&self.inner.listener).take() {
            listener.cancel();
        }
        self.inner.timer.disarm();
    }

    // =========================================================================
    // Auth operations
    // =========================================================================

    /// Start a password sign-in.
    ///
    /// Moves to `Authenticating` and calls the auth service. On success the
    /// session arrives through the auth-event stream; this method does not set
    /// `Authenticated` itself. On failure the previous state is restored.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidEmail` before any state change if the email
    /// is malformed, `AuthError::InvalidCredentials` or `AuthError::Network`
    /// if the auth service rejects or cannot be reached.
    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, email: &str, password: &SecretString) -> Result<(), AuthError> {
        let email = Email::parse(email)?;
        let previous = self.transition(AuthState::Authenticating);

        match self.inner.auth.sign_in_with_password(&email, password).await {
            Ok(_) => {
                debug!(email = %email, "sign-in accepted, awaiting auth event");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "sign-in failed");
                {
                    let mut state = lock(&self.inner.state);
                    if state.auth == AuthState::Authenticating {
                        state.auth = previous;
                        self.publish(&state);
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Register a new account.
    ///
    /// Like `sign_in`, a resulting session is applied only through the
    /// auth-event stream.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidEmail`, `AuthError::WeakPassword`, or the
    /// mapped backend error.
    #[instrument(skip(self, password))]
    pub async fn sign_up(
        &self,
        email: &str,
        password: &SecretString,
        full_name: Option<&str>,
    ) -> Result<SignUpOutcome, AuthError> {
        let email = Email::parse(email)?;
        if password.expose_secret().chars().count() < MIN_PASSWORD_LENGTH {
            return Err(AuthError::WeakPassword(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters"
            )));
        }

        match self.inner.auth.sign_up(&email, password, full_name).await? {
            SignUpResponse::Session(_) => Ok(SignUpOutcome::SessionIssued),
            SignUpResponse::ConfirmationRequired => {
                info!(email = %email, "sign-up requires email confirmation");
                Ok(SignUpOutcome::ConfirmationRequired)
            }
        }
    }

    /// Sign out.
    ///
    /// Local state is cleared (timer cancelled, identity/profile dropped,
    /// `Unauthenticated`) before the backend is called, so the engine is never
    /// left authenticated even if the remote call fails.
    ///
    /// # Errors
    ///
    /// Returns the backend error from the remote sign-out, after local state
    /// has already been cleared.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        self.clear_local();
        self.inner.auth.sign_out().await.map_err(|err| {
            warn!(error = %err, "remote sign-out failed; local session already cleared");
            AuthError::from(err)
        })
    }

    /// Record a user-activity signal, restarting the admin inactivity countdown.
    pub fn record_activity(&self, signal: ActivitySignal) {
        if self.inner.timer.touch() {
            trace!(?signal, "activity");
        }
    }

    /// Persist a theme preference for the signed-in user.
    ///
    /// # Errors
    ///
    /// Returns `ProfileError::NoIdentity` when signed out, or the backend error.
    pub async fn update_theme(&self, theme: ThemePreference) -> Result<(), ProfileError> {
        let id = self
            .identity()
            .map(|identity| identity.id)
            .ok_or(ProfileError::NoIdentity)?;
        self.inner.profiles.update_theme(id, theme).await?;

        let mut state = lock(&self.inner.state);
        if let Some(profile) = state.profile.as_mut().filter(|p| p.id == id) {
            profile.theme_preference = Some(theme);
        }
        Ok(())
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Apply an auth event. The single path by which a session is established.
    ///
    /// Validates the session's user, resolves the profile (fail-soft),
    /// derives role and system scope (scope only for non-admins), arms or
    /// disarms the inactivity timer, and publishes the new identity if it
    /// changed. Events that lose a race with a sign-out are discarded.
    #[instrument(skip(self, event), fields(kind = ?event.kind))]
    pub async fn reconcile(&self, event: AuthEvent) {
        let generation = lock(&self.inner.state).generation;

        let session = match (event.kind, event.session) {
            (AuthEventKind::SignedOut, _) | (_, None) => {
                self.clear_local();
                return;
            }
            (_, Some(session)) => session,
        };

        let Some((user_id, email)) = usable_identity(&session) else {
            warn!("auth event carried no usable identity; clearing session");
            self.clear_local();
            return;
        };

        let profile = self.inner.profiles.resolve(user_id).await;
        let role = Role::from_admin_flag(profile.is_admin);
        let system_scope = if role.is_admin() {
            None
        } else {
            self.lookup_scope(&email).await
        };

        let identity = Identity {
            id: user_id,
            email,
            role,
            system_scope,
        };

        let changed = {
            let mut state = lock(&self.inner.state);
            if state.generation != generation {
                debug!("discarding auth event superseded by sign-out");
                return;
            }

            let changed = state.identity.as_ref() != Some(&identity);
            state.identity = Some(identity.clone());
            state.profile = Some(profile);
            state.expires_at = session.expires_at;
            state.auth = AuthState::Authenticated(role);

            if role.is_admin() {
                if changed || !self.inner.timer.is_armed() {
                    self.arm_timer();
                }
            } else {
                self.inner.timer.disarm();
            }

            self.publish(&state);
            changed
        };

        if changed {
            info!(user_id = %identity.id, role = ?identity.role, "identity established");
            self.inner
                .events
                .emit(PortalEvent::IdentityChanged(Some(identity)));
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn start_listener(&self) {
        let mut slot = lock(&self.inner.listener);
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mut rx = self.inner.auth.on_auth_state_change();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(event) => {
                        let Some(manager) = Self::upgrade(&weak) else { break };
                        manager.reconcile(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "auth event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("auth listener stopped");
        });

        *slot = Some(cancel);
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Arm the inactivity timer. Caller holds the state lock.
    fn arm_timer(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.timer.arm(move || async move {
            if let Some(manager) = Self::upgrade(&weak) {
                manager.expire().await;
            }
        });
    }

    /// Forced sign-out after inactivity.
    async fn expire(&self) {
        {
            let mut state = lock(&self.inner.state);
            if !state.identity.as_ref().is_some_and(Identity::is_admin) {
                return;
            }
            state.auth = AuthState::Expiring;
            self.publish(&state);
        }

        warn!("admin session expired after inactivity");
        // Local state is cleared regardless; the remote failure is already logged.
        let _ = self.sign_out().await;

        let minutes = self.inner.timer.timeout().as_secs() / 60;
        self.inner.events.emit(PortalEvent::SessionExpired);
        self.inner.events.notice(UserNotice::blocking(format!(
            "Your session expired after {minutes} minutes of inactivity. Please sign in again."
        )));
    }

    fn clear_local(&self) {
        let had_identity = {
            let mut state = lock(&self.inner.state);
            state.generation += 1;
            self.inner.timer.disarm();
            let had_identity = state.identity.take().is_some();
            state.profile = None;
            state.expires_at = None;
            state.auth = AuthState::Unauthenticated;
            self.publish(&state);
            had_identity
        };

        if had_identity {
            info!("session cleared");
            self.inner.events.emit(PortalEvent::IdentityChanged(None));
        }
    }

    /// Settle after initialization: never leave the state loading or pending.
    fn settle(&self) {
        let mut state = lock(&self.inner.state);
        state.loading = false;
        if !state.auth.is_authenticated() && state.auth != AuthState::Authenticating {
            state.auth = AuthState::Unauthenticated;
        }
        self.publish(&state);
    }

    fn transition(&self, next: AuthState) -> AuthState {
        let mut state = lock(&self.inner.state);
        let previous = std::mem::replace(&mut state.auth, next);
        self.publish(&state);
        previous
    }

    fn publish(&self, state: &SessionState) {
        self.inner.snapshot.send_replace(SessionSnapshot {
            state: state.auth,
            identity: state.identity.clone(),
            loading: state.loading,
        });
    }

    async fn lookup_scope(&self, email: &Email) -> Option<SystemScope> {
        let data = Arc::clone(&self.inner.data);
        let key = email.clone();
        let lookup = self
            .inner
            .scopes
            .try_get_with(email.clone(), async move { data.lookup_system_scope(&key).await })
            .await;

        match lookup {
            Ok(scope) => scope,
            Err(err) => {
                warn!(error = %err, "system scope lookup failed; continuing without scope");
                None
            }
        }
    }
}

impl std::fmt::Debug for IdentitySessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySessionManager")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

/// The user ID and parsed email of a session, if both are present and valid.
fn usable_identity(session: &RawSession) -> Option<(UserId, Email)> {
    let user = session.user.as_ref()?;
    let email = Email::parse(user.email.as_deref()?).ok()?;
    Some((user.id, email))
}
