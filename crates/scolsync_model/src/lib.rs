//! # scolsync Model
//!
//! Wire and domain types shared by every scolsync crate.
//!
//! This crate provides:
//! - Domain entity payloads (academic years, classes, domains, students,
//!   subjects, grades, notes)
//! - The [`EntityKind`] closed union over synchronizable tables
//! - Tombstones and deletion records
//! - Push/pull envelopes with per-row outcomes
//! - The explicit [`ConflictPolicy`] for push upserts
//!
//! This is a pure protocol crate with no I/O operations. All wire bodies are
//! JSON; field names on the wire are camelCase.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod entity;
mod messages;

pub use conflict::ConflictPolicy;
pub use entity::{
    AcademicYear, Class, Deletion, Domain, EntityKind, Grade, LocalId, Note, ServerId, Student,
    Subject, Tombstone,
};
pub use messages::{
    Activation, DeletionOutcome, LicenseSnapshot, PullDelta, Pulled, PushBatch, PushReport,
    RowOutcome, TenantInfo, TenantProfile,
};
