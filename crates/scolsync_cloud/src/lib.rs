//! # scolsync Cloud
//!
//! The central, multi-tenant half of the protocol.
//!
//! This crate provides:
//! - The license & device gateway (`activate`, `status`, admin operations)
//! - Signed bearer tokens (HMAC-SHA256) embedding tenant and license
//! - AES-256-GCM protection of the tenant setup password at rest
//! - The tenant-scoped store with `(tenant_id, local_id)` composite-unique
//!   upserts and the append-only tombstone table
//! - The pull/push protocol handlers: phase-ordered referential application,
//!   per-row outcome isolation, and an explicit conflict policy
//!
//! Handlers are transport-agnostic: they validate credentials, touch the
//! store, and return typed results; [`ApiError::status_code`] carries the
//! HTTP classification for whichever front end mounts them.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod crypto;
mod error;
mod gateway;
mod handler;
mod server;
mod store;
mod token;

pub use config::CloudConfig;
pub use crypto::PasswordCipher;
pub use error::{ApiError, ApiResult};
pub use gateway::Gateway;
pub use handler::SyncHandler;
pub use server::CloudServer;
pub use store::{CloudStore, LicenseRow};
pub use token::{TokenClaims, TokenSigner};
