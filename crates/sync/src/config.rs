//! Engine configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `BAAS_URL` - Base URL of the hosted backend project (e.g., `https://abc.example.co`)
//! - `BAAS_ANON_KEY` - Public (anon) API key for the project
//!
//! ## Optional
//! - `PORTAL_SESSION_FILE` - Path where the session is persisted between runs
//! - `PORTAL_INACTIVITY_TIMEOUT_SECS` - Admin inactivity timeout (default: 1800)
//! - `PORTAL_NOTIFICATION_LIMIT` - Notifications fetched per refresh (default: 50)
//! - `PORTAL_STATS_THROTTLE_MS` - Stats refetch throttle window (default: 2000)
//! - `PORTAL_DB_SCHEMA` - Schema holding the portal tables (default: public)
//! - `PORTAL_SCOPE_TABLE` - Role/system lookup table keyed by email (default: `user_systems`)
//! - `PORTAL_EMAIL` / `PORTAL_PASSWORD` - Credentials the binary signs in with at startup
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use url::Url;

const MIN_API_KEY_LENGTH: usize = 20;

/// Blocklist of common placeholder patterns (case-insensitive)
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "example-key",
    "xxx",
    "todo",
    "insert",
    "put-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Tunables of the session and notification engine.
///
/// The defaults are the production values; tests construct this directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Admin sessions are signed out after this long without activity.
    pub inactivity_timeout: Duration,
    /// Maximum notifications held in the cache.
    pub notification_limit: usize,
    /// Minimum spacing between accepted stats recomputations.
    pub stats_throttle: Duration,
    /// How long a role/system lookup is reused across auth events.
    pub scope_cache_ttl: Duration,
    pub notifications_schema: String,
    pub notifications_table: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(30 * 60),
            notification_limit: 50,
            stats_throttle: Duration::from_secs(2),
            scope_cache_ttl: Duration::from_secs(10 * 60),
            notifications_schema: "public".to_string(),
            notifications_table: "notifications".to_string(),
        }
    }
}

/// Hosted backend connection settings.
///
/// Implements `Debug` manually to redact the API key.
#[derive(Clone)]
pub struct BaasConfig {
    /// Project base URL
    pub url: Url,
    /// Public API key sent as `apikey` on every request
    pub anon_key: SecretString,
    /// Schema holding `profiles`, `notifications`, `videos`
    pub schema: String,
    /// Role/system lookup table keyed by email
    pub scope_table: String,
    /// Where to persist the session between runs
    pub session_file: Option<PathBuf>,
}

impl std::fmt::Debug for BaasConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaasConfig")
            .field("url", &self.url.as_str())
            .field("anon_key", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("scope_table", &self.scope_table)
            .field("session_file", &self.session_file)
            .finish()
    }
}

/// Credentials for signing in at startup.
#[derive(Debug, Clone)]
pub struct StartupCredentials {
    pub email: String,
    pub password: SecretString,
}

/// Full configuration for the `portal-sync` binary.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub baas: BaasConfig,
    pub sync: SyncSettings,
    pub credentials: Option<StartupCredentials>,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    pub sentry_environment: Option<String>,
}

impl PortalConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid, or
    /// if the API key looks like a placeholder.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let url = Url::parse(&get_required_env("BAAS_URL")?)
            .map_err(|e| ConfigError::InvalidEnvVar("BAAS_URL".to_string(), e.to_string()))?;
        let anon_key = get_validated_api_key("BAAS_ANON_KEY")?;

        let baas = BaasConfig {
            url,
            anon_key,
            schema: get_env_or_default("PORTAL_DB_SCHEMA", "public"),
            scope_table: get_env_or_default("PORTAL_SCOPE_TABLE", "user_systems"),
            session_file: get_optional_env("PORTAL_SESSION_FILE").map(PathBuf::from),
        };

        let defaults = SyncSettings::default();
        let sync = SyncSettings {
            inactivity_timeout: Duration::from_secs(get_parsed_or(
                "PORTAL_INACTIVITY_TIMEOUT_SECS",
                defaults.inactivity_timeout.as_secs(),
            )?),
            notification_limit: get_parsed_or(
                "PORTAL_NOTIFICATION_LIMIT",
                defaults.notification_limit,
            )?,
            stats_throttle: Duration::from_millis(get_parsed_or(
                "PORTAL_STATS_THROTTLE_MS",
                2000_u64,
            )?),
            notifications_schema: baas.schema.clone(),
            ..defaults
        };

        let credentials = match (
            get_optional_env("PORTAL_EMAIL"),
            get_optional_env("PORTAL_PASSWORD"),
        ) {
            (Some(email), Some(password)) => Some(StartupCredentials {
                email,
                password: SecretString::from(password),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingEnvVar("PORTAL_PASSWORD".into())),
            (None, Some(_)) => return Err(ConfigError::MissingEnvVar("PORTAL_EMAIL".into())),
        };

        Ok(Self {
            baas,
            sync,
            credentials,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a required environment variable.
fn get_required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get an optional environment variable. Empty values count as unset.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    get_optional_env(key).unwrap_or_else(|| default.to_string())
}

/// Parse an optional environment variable, falling back to `default`.
fn get_parsed_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_optional_env(key).map_or(Ok(default), |raw| {
        raw.trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
    })
}

/// Whether `value` has the shape of a signed JWT: three base64url segments
/// with a JSON header.
fn looks_like_jwt(value: &str) -> bool {
    let segments: Vec<&str> = value.split('.').collect();
    segments.len() == 3
        && value.starts_with("eyJ")
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

/// Validate that an API key is not a placeholder and is plausibly long.
///
/// JWT-shaped keys skip the placeholder scan; their random segments can
/// contain any pattern.
fn validate_api_key(key: &SecretString, var_name: &str) -> Result<(), ConfigError> {
    let value = key.expose_secret();
    let lower = value.to_lowercase();
    let patterns = if looks_like_jwt(value) {
        &[][..]
    } else {
        PLACEHOLDER_PATTERNS
    };

    for pattern in patterns {
        if lower.contains(pattern) {
            return Err(ConfigError::InsecureSecret(
                var_name.to_string(),
                format!("appears to be a placeholder (contains '{pattern}')"),
            ));
        }
    }

    if value.len() < MIN_API_KEY_LENGTH {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            format!(
                "must be at least {MIN_API_KEY_LENGTH} characters (got {})",
                value.len()
            ),
        ));
    }

    Ok(())
}

/// Load and validate an API key from environment.
fn get_validated_api_key(key: &str) -> Result<SecretString, ConfigError> {
    let value = SecretString::from(get_required_env(key)?);
    validate_api_key(&value, key)?;
    Ok(value)
}
