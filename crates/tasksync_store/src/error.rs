//! Error types for snapshot storage.

use std::io;
use std::path::PathBuf;
use tasksync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while reading or committing sync state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persisted state could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A persisted file is not valid sync state.
    #[error("corrupted state file {path}: {message}")]
    Corrupted {
        /// Offending file.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },

    /// Another process owns the state directory.
    #[error("state directory is locked by another process")]
    Locked,

    /// Persisted data violates a protocol rule.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A commit was rejected (used for fault injection in tests). Names the
    /// backend or the mapping table.
    #[error("commit rejected: {0}")]
    CommitRejected(String),
}
