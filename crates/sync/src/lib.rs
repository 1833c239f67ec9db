//! Tutorial Portal Sync - session lifecycle and realtime notification engine.
//!
//! This crate keeps a portal client's view of "who is signed in" and "what
//! notifications they have" consistent with the hosted backend:
//!
//! - who is signed in, their role and system scope, and the admin inactivity
//!   timeout ([`services::session`])
//! - one realtime notification channel per identity, and a bounded,
//!   optimistically-updated notification cache ([`services::notifications`])
//! - throttled watch-progress statistics ([`services::stats`])
//!
//! # Architecture
//!
//! The hosted backend is reached only through the injected traits in
//! [`baas`]. Components publish [`events::PortalEvent`]s on an
//! [`events::EventBus`]; [`coordinator::SyncCoordinator`] routes identity
//! changes to the notification services. [`state::PortalState`] bundles one
//! engine instance.
//!
//! # Example
//!
//! ```rust,ignore
//! let backend = Arc::new(HostedBackend::new(&config.baas)?);
//! let state = PortalState::new(BackendHandles::from_backend(backend), config.sync);
//! state.start().await;
//! state.session().sign_in("learner@portal.test", &password).await?;
//! ```

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod baas;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod services;
pub mod state;
pub(crate) mod util;

pub use config::{ConfigError, PortalConfig, SyncSettings};
pub use error::{ErrorKind, PortalError, Result};
pub use events::{EventBus, NoticeSeverity, PortalEvent, UserNotice};
pub use state::PortalState;
