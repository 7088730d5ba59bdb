//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised when task data is malformed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A backend identifier is empty or contains unsupported characters.
    #[error("invalid backend id: {0:?}")]
    InvalidBackendId(String),

    /// A task has no backend-local id.
    #[error("task {logical_key:?} from backend {backend} has an empty id")]
    EmptyTaskId {
        /// Backend that produced the task.
        backend: String,
        /// Logical key of the task (may be empty).
        logical_key: String,
    },

    /// Two tasks in one fetch share a backend-local id.
    #[error("duplicate task id {id:?} in backend {backend}")]
    DuplicateTaskId {
        /// Backend that produced the tasks.
        backend: String,
        /// The repeated id.
        id: String,
    },

    /// Two tasks in one fetch resolve to the same logical key.
    #[error("duplicate logical key {logical_key:?} in backend {backend}")]
    DuplicateLogicalKey {
        /// Backend that produced the tasks.
        backend: String,
        /// The repeated logical key.
        logical_key: String,
    },
}
