//! Error types for the hub.

use thiserror::Error;

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Errors that can occur in the LAN hub.
#[derive(Error, Debug)]
pub enum HubError {
    /// Local store failure.
    #[error("store error: {0}")]
    Store(#[from] scolsync_store::StoreError),

    /// Filesystem failure in the staging area or while binding.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A transfer file could not be encoded or decoded.
    #[error("transfer encoding error: {0}")]
    Transfer(#[from] serde_json::Error),

    /// mDNS registration or browsing failure.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// A client supplied an unusable file name.
    #[error("invalid transfer name: {0}")]
    InvalidName(String),
}
