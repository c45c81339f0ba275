//! # scolsync Store
//!
//! The device-local relational store.
//!
//! This crate provides:
//! - Versioned schema migration for the embedded SQLite database
//! - Prepared-statement upserts with `(student, subject, period)` grade cells
//! - Dirty-row bookkeeping feeding the cloud push
//! - The deletion queue and its tombstone handshake
//! - Settings (sync cursor, bearer token, tenant metadata)
//! - Read projections consumed by the LAN hub
//!
//! Every mutation that originates on this device marks the touched row dirty;
//! the sync engine collects dirty rows into a push batch and clears the flag
//! once the cloud has acknowledged the row. Pulled rows never overwrite a
//! dirty local row.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod schema;
mod store;
mod sync;

pub use error::{StoreError, StoreResult};
pub use store::{ClassFull, ClassSummary, GradeCell, GradeRow, LocalStore, StudentRow, SubjectRow};
pub use sync::SyncHistoryEntry;

/// Returns the current UTC time as an RFC 3339 string.
///
/// All timestamps in the store and on the wire use this format so that
/// `since` comparisons work lexicographically.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
