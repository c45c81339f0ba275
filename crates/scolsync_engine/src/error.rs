//! Error types for the sync engine.

use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during a sync cycle.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport failure.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the cycle can be retried.
        retryable: bool,
    },

    /// The cloud rejected the request.
    #[error("cloud error ({status}): {message}")]
    Cloud {
        /// HTTP status classification.
        status: u16,
        /// Error string from the cloud.
        message: String,
    },

    /// Local store failure.
    #[error("store error: {0}")]
    Store(#[from] scolsync_store::StoreError),

    /// The device has never been activated.
    #[error("device is not linked to a tenant")]
    NotLinked,

    /// A cycle was started while another is running.
    #[error("cannot start a cycle from state {0}")]
    CycleInProgress(&'static str),

    /// Malformed response from the cloud.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the next cycle may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Cloud { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
