//! Tutorial Portal Core - Shared domain types.
//!
//! This crate provides the types exchanged between the session/notification
//! engine (`tutorial-portal-sync`) and the UI collaborators that consume it:
//! identities and roles, profiles, notifications, subscription and auth
//! states, and progress statistics.
//!
//! # Architecture
//!
//! The core crate contains only types - no I/O, no HTTP clients, no timers.
//! Everything that talks to the hosted backend lives in the sync crate.
//!
//! # Modules
//!
//! - [`types`] - Newtype IDs, validated emails, and the portal data model

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
