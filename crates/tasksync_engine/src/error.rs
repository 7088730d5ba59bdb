//! Error types for the sync engine.

use crate::adapter::AdapterError;
use tasksync_protocol::{BackendId, LogicalKey, ProtocolError};
use tasksync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that abort a sync cycle.
///
/// Failures of individual remote operations do not abort the cycle; they
/// are reported per backend in the cycle report instead.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A backend could not be fetched.
    #[error("fetch from backend {backend} failed: {source}")]
    Fetch {
        /// Backend that failed.
        backend: BackendId,
        /// Adapter error.
        #[source]
        source: AdapterError,
    },

    /// Fetched task data is malformed.
    #[error("malformed task data: {0}")]
    Protocol(#[from] ProtocolError),

    /// The snapshot store failed.
    #[error("snapshot store error: {0}")]
    Store(#[from] StoreError),

    /// The conflict policy could not order the competing values.
    #[error("conflict on {key} cannot be resolved: {reason}")]
    ConflictResolution {
        /// Logical key in conflict.
        key: LogicalKey,
        /// Why no winner could be chosen.
        reason: String,
    },

    /// The cycle was cancelled before any operation executed.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Returns true if running the cycle again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Fetch { source, .. } => source.is_retryable(),
            SyncError::Cancelled => false,
            SyncError::Store(StoreError::Io(_)) => true,
            _ => false,
        }
    }
}
