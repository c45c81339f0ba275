//! # scolsync Engine
//!
//! The device-side synchronization engine.
//!
//! This crate provides:
//! - The sync cycle state machine (idle → pushing → pulling → synced)
//! - Cursor management over the store's `last_sync_time` setting
//! - The [`CloudTransport`] abstraction over the cloud endpoints
//! - Dirty-row collection, id-mapping persistence, and pulled-delta
//!   application
//!
//! ## Cycle order
//!
//! A cycle pushes first, then pulls: local edits reach the cloud before the
//! device takes the cloud's view, and the pull's `server_time` becomes the
//! next cursor only after both halves succeed. There is no mid-cycle
//! cancellation; a disconnect leaves committed phases in place, which is safe
//! because every push upsert is idempotent.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod transport;

pub use config::EngineConfig;
pub use engine::{CycleResult, SyncEngine, SyncState, SyncStats};
pub use error::{SyncError, SyncResult};
pub use transport::{CloudTransport, MockTransport};
