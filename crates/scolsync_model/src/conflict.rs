//! Conflict policy for push upserts.

use serde::{Deserialize, Serialize};

/// How the cloud resolves a push against an already-stored row.
///
/// Cross-device writes carry no version vector, so the policy is named and
/// passed explicitly to the push handler instead of being an implicit
/// property of the upsert SQL. Stronger strategies can be added here without
/// touching the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// The incoming row overwrites the stored row (blind upsert).
    ///
    /// This is the historical behavior: two devices editing the same row
    /// offline will clobber one another, mitigated only by the LAN hub
    /// serializing edits among co-located devices.
    LastWriteWins,
    /// The stored row wins; the incoming row is applied only on first insert.
    KeepExisting,
}

impl ConflictPolicy {
    /// Returns a stable name for logging and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::LastWriteWins => "last-write-wins",
            ConflictPolicy::KeepExisting => "keep-existing",
        }
    }

    /// Parses a policy name.
    pub fn from_str_opt(name: &str) -> Option<Self> {
        match name {
            "last-write-wins" => Some(ConflictPolicy::LastWriteWins),
            "keep-existing" => Some(ConflictPolicy::KeepExisting),
            _ => None,
        }
    }
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::LastWriteWins
    }
}
