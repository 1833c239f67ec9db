//! HTTP client for the hosted backend.
//!
//! Auth goes through `/auth/v1`, table access through the `/rest/v1` row API
//! with `eq.` filters. The current session is held in memory, mirrored to
//! `PORTAL_SESSION_FILE` when configured, and refreshed with its refresh
//! token shortly before the access token expires.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, info, instrument, warn};
use url::Url;

use tutorial_portal_core::{
    Email, NotificationId, NotificationRecord, Profile, ProgressStats, RelatedUser, SystemScope,
    ThemePreference, UserId, VideoId, VideoRef,
};

use super::{
    AuthApi, AuthEvent, AuthEventKind, AuthUser, BackendError, ChannelEvent, ChannelHandle,
    ChannelSpec, DataApi, RawSession, RealtimeApi, RealtimeClient, SignUpResponse,
};
use crate::config::BaasConfig;

/// Refresh the access token when it expires within this window.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Request timeout for every HTTP call.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Table with one row per (user, video) watch record.
const PROGRESS_TABLE: &str = "video_progress";

// =============================================================================
// Wire types
// =============================================================================

// No `Debug`: carries raw tokens.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    #[serde(default)]
    user: Option<UserResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserResponse {
    id: UserId,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorBody {
    fn into_message(self) -> Option<String> {
        self.error_description
            .or(self.msg)
            .or(self.message)
            .or(self.error)
    }
}

/// Session as written to the session file.
#[derive(Serialize, Deserialize)]
struct PersistedSession {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    user: Option<UserResponse>,
}

impl From<&RawSession> for PersistedSession {
    fn from(session: &RawSession) -> Self {
        Self {
            access_token: session.access_token.expose_secret().to_owned(),
            refresh_token: session
                .refresh_token
                .as_ref()
                .map(|t| t.expose_secret().to_owned()),
            expires_at: session.expires_at,
            user: session.user.as_ref().map(|u| UserResponse {
                id: u.id,
                email: u.email.clone(),
            }),
        }
    }
}

impl From<PersistedSession> for RawSession {
    fn from(stored: PersistedSession) -> Self {
        Self {
            access_token: SecretString::from(stored.access_token),
            refresh_token: stored.refresh_token.map(SecretString::from),
            expires_at: stored.expires_at,
            user: stored.user.map(UserResponse::into_auth_user),
        }
    }
}

impl UserResponse {
    fn into_auth_user(self) -> AuthUser {
        AuthUser {
            id: self.id,
            email: self.email,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScopeRow {
    #[serde(default)]
    sistema: Option<String>,
}

// =============================================================================
// Client
// =============================================================================

struct HostedInner {
    http: reqwest::Client,
    base_url: Url,
    anon_key: SecretString,
    schema: String,
    scope_table: String,
    session_file: Option<PathBuf>,
    session: RwLock<Option<RawSession>>,
    auth_events: broadcast::Sender<AuthEvent>,
    realtime: RealtimeClient,
}

/// Backend client for the hosted auth, table, and realtime services.
#[derive(Clone)]
pub struct HostedBackend {
    inner: Arc<HostedInner>,
}

impl HostedBackend {
    /// Build a client from connection settings.
    ///
    /// # Errors
    ///
    /// Returns `BackendError` if the HTTP client cannot be built or the
    /// realtime URL cannot be derived from `config.url`.
    pub fn new(config: &BaasConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let realtime = RealtimeClient::new(&config.url, config.anon_key.clone())?;
        let (auth_events, _) = broadcast::channel(32);

        Ok(Self {
            inner: Arc::new(HostedInner {
                http,
                base_url: config.url.clone(),
                anon_key: config.anon_key.clone(),
                schema: config.schema.clone(),
                scope_table: config.scope_table.clone(),
                session_file: config.session_file.clone(),
                session: RwLock::new(None),
                auth_events,
                realtime,
            }),
        })
    }

    // =========================================================================
    // Session handling
    // =========================================================================

    /// Install a session: memory, session file, realtime token, then event.
    async fn install_session(&self, session: RawSession, kind: AuthEventKind) {
        *self.inner.session.write().await = Some(session.clone());
        self.inner
            .realtime
            .set_access_token(Some(session.access_token.clone()));
        self.persist(Some(&session)).await;
        let _ = self.inner.auth_events.send(AuthEvent {
            kind,
            session: Some(session),
        });
    }

    async fn clear_session(&self) {
        *self.inner.session.write().await = None;
        self.inner.realtime.set_access_token(None);
        self.persist(None).await;
        let _ = self.inner.auth_events.send(AuthEvent {
            kind: AuthEventKind::SignedOut,
            session: None,
        });
    }

    /// Mirror the session to disk. Failures only cost persistence.
    async fn persist(&self, session: Option<&RawSession>) {
        let Some(path) = self.inner.session_file.as_ref() else {
            return;
        };
        let result = match session {
            Some(session) => match serde_json::to_vec(&PersistedSession::from(session)) {
                Ok(bytes) => tokio::fs::write(path, bytes).await,
                Err(err) => {
                    warn!(error = %err, "failed to encode session");
                    return;
                }
            },
            None => match tokio::fs::remove_file(path).await {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(err) = result {
            warn!(error = %err, path = %path.display(), "failed to persist session");
        }
    }

    async fn load_persisted(&self) -> Option<RawSession> {
        let path = self.inner.session_file.as_ref()?;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to read session file");
                return None;
            }
        };
        match serde_json::from_slice::<PersistedSession>(&bytes) {
            Ok(stored) => Some(stored.into()),
            Err(err) => {
                warn!(error = %err, "ignoring unreadable session file");
                None
            }
        }
    }

    /// The current session, refreshed if it is about to expire.
    async fn current_session(&self) -> Result<Option<RawSession>, BackendError> {
        let Some(session) = self.inner.session.read().await.clone() else {
            return Ok(None);
        };
        if !expires_soon(&session) {
            return Ok(Some(session));
        }
        let Some(refresh_token) = session.refresh_token.clone() else {
            return Ok(Some(session));
        };
        let refreshed = self.refresh(&refresh_token).await?;
        self.install_session(refreshed.clone(), AuthEventKind::TokenRefreshed)
            .await;
        Ok(Some(refreshed))
    }

    /// Bearer for table calls: the user's access token, else the anon key.
    async fn bearer(&self) -> Result<SecretString, BackendError> {
        Ok(self
            .current_session()
            .await?
            .map_or_else(|| self.inner.anon_key.clone(), |s| s.access_token))
    }

    #[instrument(skip(self, refresh_token))]
    async fn refresh(&self, refresh_token: &SecretString) -> Result<RawSession, BackendError> {
        let response = self
            .auth_request(Method::POST, "token", &[("grant_type", "refresh_token")])?
            .json(&json!({ "refresh_token": refresh_token.expose_secret() }))
            .send()
            .await?;
        let token: TokenResponse = check(response).await?.json().await?;
        debug!("access token refreshed");
        Ok(session_from_token(token))
    }

    async fn revoke(&self, session: &RawSession) -> Result<(), BackendError> {
        let response = self
            .auth_request(Method::POST, "logout", &[])?
            .bearer_auth(session.access_token.expose_secret())
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    // =========================================================================
    // Request helpers
    // =========================================================================

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, BackendError> {
        let mut url = self
            .inner
            .base_url
            .join(path)
            .map_err(|e| BackendError::Network(format!("invalid endpoint {path}: {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    fn auth_request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<RequestBuilder, BackendError> {
        let url = self.endpoint(&format!("auth/v1/{path}"), query)?;
        Ok(self
            .inner
            .http
            .request(method, url)
            .header("apikey", self.inner.anon_key.expose_secret()))
    }

    async fn rest_request(
        &self,
        method: Method,
        table: &str,
        query: &[(&str, &str)],
    ) -> Result<RequestBuilder, BackendError> {
        let profile_header = if method == Method::GET || method == Method::HEAD {
            "Accept-Profile"
        } else {
            "Content-Profile"
        };
        let url = self.endpoint(&format!("rest/v1/{table}"), query)?;
        let bearer = self.bearer().await?;
        Ok(self
            .inner
            .http
            .request(method, url)
            .header("apikey", self.inner.anon_key.expose_secret())
            .bearer_auth(bearer.expose_secret())
            .header(profile_header, &self.inner.schema))
    }

    async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, BackendError> {
        let response = self
            .rest_request(Method::GET, table, query)
            .await?
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn count(&self, table: &str, query: &[(&str, &str)]) -> Result<u64, BackendError> {
        let response = self
            .rest_request(Method::HEAD, table, query)
            .await?
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let response = check(response).await?;
        response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| BackendError::Decode(format!("missing row count for {table}")))
    }

    async fn update(
        &self,
        table: &str,
        query: &[(&str, &str)],
        body: serde_json::Value,
    ) -> Result<(), BackendError> {
        let response = self
            .rest_request(Method::PATCH, table, query)
            .await?
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

impl std::fmt::Debug for HostedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedBackend")
            .field("base_url", &self.inner.base_url.as_str())
            .field("anon_key", &"[REDACTED]")
            .field("schema", &self.inner.schema)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Auth
// =============================================================================

#[async_trait]
impl AuthApi for HostedBackend {
    #[instrument(skip(self, password), fields(email = %email))]
    async fn sign_in_with_password(
        &self,
        email: &Email,
        password: &SecretString,
    ) -> Result<RawSession, BackendError> {
        let response = self
            .auth_request(Method::POST, "token", &[("grant_type", "password")])?
            .json(&json!({
                "email": email.as_str(),
                "password": password.expose_secret(),
            }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            debug!(%status, "credentials rejected");
            return Err(BackendError::InvalidCredentials);
        }

        let token: TokenResponse = check(response).await?.json().await?;
        let session = session_from_token(token);
        info!("signed in");
        self.install_session(session.clone(), AuthEventKind::SignedIn)
            .await;
        Ok(session)
    }

    #[instrument(skip(self, password), fields(email = %email))]
    async fn sign_up(
        &self,
        email: &Email,
        password: &SecretString,
        full_name: Option<&str>,
    ) -> Result<SignUpResponse, BackendError> {
        let response = self
            .auth_request(Method::POST, "signup", &[])?
            .json(&json!({
                "email": email.as_str(),
                "password": password.expose_secret(),
                "data": { "full_name": full_name },
            }))
            .send()
            .await?;

        let body: serde_json::Value = check(response).await?.json().await?;
        if body.get("access_token").is_none() {
            return Ok(SignUpResponse::ConfirmationRequired);
        }
        let token: TokenResponse =
            serde_json::from_value(body).map_err(|e| BackendError::Decode(e.to_string()))?;
        let session = session_from_token(token);
        self.install_session(session.clone(), AuthEventKind::SignedIn)
            .await;
        Ok(SignUpResponse::Session(session))
    }

    #[instrument(skip(self))]
    async fn sign_out(&self) -> Result<(), BackendError> {
        let session = self.inner.session.read().await.clone();
        let remote = match session {
            Some(session) => self.revoke(&session).await,
            None => Ok(()),
        };

        // The local session goes regardless of the remote outcome.
        self.clear_session().await;
        remote
    }

    #[instrument(skip(self))]
    async fn get_session(&self) -> Result<Option<RawSession>, BackendError> {
        if self.inner.session.read().await.is_none() {
            let Some(stored) = self.load_persisted().await else {
                return Ok(None);
            };
            debug!("loaded persisted session");
            *self.inner.session.write().await = Some(stored.clone());
            self.inner
                .realtime
                .set_access_token(Some(stored.access_token));
        }

        match self.current_session().await {
            Ok(session) => Ok(session),
            Err(err) => {
                warn!(error = %err, "persisted session could not be refreshed");
                *self.inner.session.write().await = None;
                self.persist(None).await;
                Ok(None)
            }
        }
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.auth_events.subscribe()
    }
}

// =============================================================================
// Tables
// =============================================================================

#[async_trait]
impl DataApi for HostedBackend {
    #[instrument(skip(self), fields(user_id = %id))]
    async fn fetch_profile(&self, id: UserId) -> Result<Profile, BackendError> {
        let filter = format!("eq.{id}");
        self.select::<Profile>("profiles", &[("id", filter.as_str()), ("select", "*")])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::NotFound(format!("profile {id}")))
    }

    #[instrument(skip(self, profile), fields(user_id = %profile.id))]
    async fn insert_profile(&self, profile: &Profile) -> Result<Profile, BackendError> {
        let response = self
            .rest_request(Method::POST, "profiles", &[])
            .await?
            .header("Prefer", "return=representation")
            .json(profile)
            .send()
            .await?;
        let rows: Vec<Profile> = check(response).await?.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::Decode("insert returned no rows".into()))
    }

    #[instrument(skip(self), fields(user_id = %id))]
    async fn update_theme(&self, id: UserId, theme: ThemePreference) -> Result<(), BackendError> {
        let filter = format!("eq.{id}");
        self.update(
            "profiles",
            &[("id", filter.as_str())],
            json!({ "theme_preference": theme }),
        )
        .await
    }

    #[instrument(skip(self), fields(email = %email))]
    async fn lookup_system_scope(
        &self,
        email: &Email,
    ) -> Result<Option<SystemScope>, BackendError> {
        let filter = format!("eq.{email}");
        let rows: Vec<ScopeRow> = self
            .select(
                &self.inner.scope_table,
                &[("email", filter.as_str()), ("select", "sistema"), ("limit", "1")],
            )
            .await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.sistema)
            .and_then(|raw| SystemScope::new(&raw)))
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn fetch_notifications(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, BackendError> {
        let filter = format!("eq.{user_id}");
        let limit = limit.to_string();
        self.select(
            "notifications",
            &[
                ("user_id", filter.as_str()),
                ("select", "*"),
                ("order", "created_at.desc"),
                ("limit", limit.as_str()),
            ],
        )
        .await
    }

    async fn fetch_video(&self, id: VideoId) -> Result<Option<VideoRef>, BackendError> {
        let filter = format!("eq.{id}");
        Ok(self
            .select("videos", &[("id", filter.as_str()), ("select", "id,titulo,sistema")])
            .await?
            .into_iter()
            .next())
    }

    async fn fetch_related_user(&self, id: UserId) -> Result<Option<RelatedUser>, BackendError> {
        let filter = format!("eq.{id}");
        Ok(self
            .select("profiles", &[("id", filter.as_str()), ("select", "id,full_name")])
            .await?
            .into_iter()
            .next())
    }

    #[instrument(skip(self), fields(notification_id = %id))]
    async fn mark_notification_read(&self, id: NotificationId) -> Result<(), BackendError> {
        let filter = format!("eq.{id}");
        self.update("notifications", &[("id", filter.as_str())], json!({ "read": true }))
            .await
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn mark_all_notifications_read(&self, user_id: UserId) -> Result<(), BackendError> {
        let filter = format!("eq.{user_id}");
        self.update(
            "notifications",
            &[("user_id", filter.as_str()), ("read", "eq.false")],
            json!({ "read": true }),
        )
        .await
    }

    #[instrument(skip(self), fields(notification_id = %id))]
    async fn delete_notification(&self, id: NotificationId) -> Result<(), BackendError> {
        let filter = format!("eq.{id}");
        let response = self
            .rest_request(Method::DELETE, "notifications", &[("id", filter.as_str())])
            .await?
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    #[instrument(skip(self, scope), fields(user_id = %user_id))]
    async fn fetch_progress(
        &self,
        user_id: UserId,
        scope: Option<&SystemScope>,
    ) -> Result<ProgressStats, BackendError> {
        let scope_filter = scope.map(|s| format!("eq.{s}"));
        let mut video_query = vec![("select", "id")];
        if let Some(filter) = scope_filter.as_deref() {
            video_query.push(("sistema", filter));
        }
        let total_videos = self.count("videos", &video_query).await?;

        let user_filter = format!("eq.{user_id}");
        let completed_videos = self
            .count(
                PROGRESS_TABLE,
                &[
                    ("user_id", user_filter.as_str()),
                    ("completed", "eq.true"),
                    ("select", "video_id"),
                ],
            )
            .await?;

        Ok(ProgressStats {
            total_videos,
            completed_videos,
        })
    }
}

// =============================================================================
// Realtime
// =============================================================================

#[async_trait]
impl RealtimeApi for HostedBackend {
    async fn open_channel(
        &self,
        spec: ChannelSpec,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<ChannelHandle, BackendError> {
        // Ensures the realtime client joins with a fresh token.
        self.current_session().await?;
        self.inner.realtime.open_channel(spec, events).await
    }

    async fn remove_channel(&self, handle: ChannelHandle) -> Result<(), BackendError> {
        self.inner.realtime.remove_channel(handle).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Pass successful responses through; turn the rest into `BackendError`.
async fn check(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(ErrorBody::into_message)
        .unwrap_or(text);

    if status == StatusCode::NOT_FOUND {
        Err(BackendError::NotFound(message))
    } else {
        Err(BackendError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

fn session_from_token(token: TokenResponse) -> RawSession {
    let expires_at = token
        .expires_at
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .or_else(|| {
            token
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs))
        })
        .or_else(|| jwt_expiry(&token.access_token));

    RawSession {
        access_token: SecretString::from(token.access_token),
        refresh_token: token.refresh_token.map(SecretString::from),
        expires_at,
        user: token.user.map(UserResponse::into_auth_user),
    }
}

fn expires_soon(session: &RawSession) -> bool {
    session
        .expires_at
        .is_some_and(|at| at - Utc::now() < ChronoDuration::seconds(REFRESH_MARGIN_SECS))
}

/// Read the `exp` claim of a JWT without verifying it.
fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    DateTime::from_timestamp(claims.get("exp")?.as_i64()?, 0)
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.parse().ok()
}
