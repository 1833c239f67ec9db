//! Profile resolution.
//!
//! Fetches the profile for an identity, creating a default one on first
//! access. Resolution is fail-soft: profile-layer outages degrade to a
//! non-persisted default profile and never block sign-in.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use tutorial_portal_core::{Profile, ThemePreference, UserId};

use crate::baas::{BackendError, DataApi};

/// Errors from the profile layer.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// The profile row does not exist.
    #[error("profile not found")]
    NotFound,

    /// No identity is signed in.
    #[error("no signed-in identity")]
    NoIdentity,

    /// Any other backend failure.
    #[error("profile backend error: {0}")]
    Backend(BackendError),
}

impl From<BackendError> for ProfileError {
    fn from(err: BackendError) -> Self {
        if err.is_not_found() {
            Self::NotFound
        } else {
            Self::Backend(err)
        }
    }
}

/// Fetches or lazily creates profiles.
#[derive(Clone)]
pub struct ProfileResolver {
    data: Arc<dyn DataApi>,
}

impl ProfileResolver {
    #[must_use]
    pub fn new(data: Arc<dyn DataApi>) -> Self {
        Self { data }
    }

    /// Resolve the profile for `id`. Never fails.
    ///
    /// - Found: returned as stored.
    /// - Not found: a default profile (`is_admin = false`) is created and returned.
    /// - Any other error, including a failed create: an in-memory default is
    ///   returned without being persisted.
    #[instrument(skip(self), fields(user_id = %id))]
    pub async fn resolve(&self, id: UserId) -> Profile {
        match self.fetch(id).await {
            Ok(profile) => profile,
            Err(ProfileError::NotFound) => self.create_default(id).await,
            Err(err) => {
                warn!(error = %err, "profile fetch failed, using fallback profile");
                Profile::default_for(id)
            }
        }
    }

    /// Fetch a profile, classifying "not found" separately.
    ///
    /// # Errors
    ///
    /// Returns `ProfileError::NotFound` if no row exists, or
    /// `ProfileError::Backend` for any other failure.
    pub async fn fetch(&self, id: UserId) -> Result<Profile, ProfileError> {
        Ok(self.data.fetch_profile(id).await?)
    }

    /// Persist a new theme preference.
    ///
    /// # Errors
    ///
    /// Returns `ProfileError` if the update fails.
    #[instrument(skip(self), fields(user_id = %id))]
    pub async fn update_theme(
        &self,
        id: UserId,
        theme: ThemePreference,
    ) -> Result<(), ProfileError> {
        self.data.update_theme(id, theme).await?;
        debug!(?theme, "theme preference updated");
        Ok(())
    }

    async fn create_default(&self, id: UserId) -> Profile {
        let profile = Profile::default_for(id);
        match self.data.insert_profile(&profile).await {
            Ok(created) => {
                info!("created default profile");
                created
            }
            Err(err) => {
                warn!(error = %err, "profile create failed, using fallback profile");
                profile
            }
        }
    }
}

impl std::fmt::Debug for ProfileResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileResolver").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::baas::memory::InMemoryBackend;

    fn resolver(backend: &Arc<InMemoryBackend>) -> ProfileResolver {
        ProfileResolver::new(backend.clone())
    }

    #[tokio::test]
    async fn test_resolve_existing_profile() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = UserId::random();
        backend.put_profile(Profile {
            is_admin: true,
            full_name: Some("Ana".into()),
            ..Profile::default_for(id)
        });

        let profile = resolver(&backend).resolve(id).await;
        assert!(profile.is_admin);
        assert_eq!(profile.full_name.as_deref(), Some("Ana"));
    }

    #[tokio::test]
    async fn test_resolve_missing_profile_creates_default() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = UserId::random();

        let profile = resolver(&backend).resolve(id).await;
        assert!(!profile.is_admin);
        assert_eq!(backend.profile(id), Some(Profile::default_for(id)));
    }

    #[tokio::test]
    async fn test_resolve_backend_failure_falls_back_without_persisting() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_profiles(Some(BackendError::Network("connection reset".into())));
        let id = UserId::random();

        let profile = resolver(&backend).resolve(id).await;
        assert_eq!(profile, Profile::default_for(id));
        assert!(backend.profile(id).is_none());
    }

    #[tokio::test]
    async fn test_fetch_classifies_not_found() {
        let backend = Arc::new(InMemoryBackend::new());
        let err = resolver(&backend).fetch(UserId::random()).await.unwrap_err();
        assert!(matches!(err, ProfileError::NotFound));
    }

    #[tokio::test]
    async fn test_update_theme_persists() {
        let backend = Arc::new(InMemoryBackend::new());
        let id = UserId::random();
        backend.put_profile(Profile::default_for(id));

        resolver(&backend)
            .update_theme(id, ThemePreference::Dark)
            .await
            .unwrap();
        assert_eq!(
            backend.profile(id).unwrap().theme_preference,
            Some(ThemePreference::Dark)
        );
    }
}
