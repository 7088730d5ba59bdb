//! Backend adapter interface.

use tasksync_protocol::{IdempotenceToken, Task, Tombstone};
use thiserror::Error;

/// Result type for adapter calls.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors reported by a backend adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Network failure, timeout, rate limit. Retried with backoff.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Authentication or validation failure. Never retried.
    #[error("permanent backend error: {0}")]
    Permanent(String),

    /// The targeted task does not exist on the backend.
    #[error("task not found: {0}")]
    NotFound(String),
}

impl AdapterError {
    /// Creates a retryable error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a non-retryable error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Creates a not-found error for `id`.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

/// A task-tracking service the engine reconciles.
///
/// Implemented once per real service (calendar, project tracker, ...);
/// the engine only talks to backends through this trait.
///
/// # Contract
///
/// - `fetch_tasks` returns the backend's complete current task list
/// - `create_task` returns the backend-assigned id of the new task and must
///   persist `task.logical_key`; the mapping table written at the end of a
///   cycle can fail after the backend already changed, and the stored key is
///   what maps the task back on the next fetch
/// - writes carry an [`IdempotenceToken`] naming one transition; adapters
///   that can attach it to the remote request (idempotency keys) make
///   retried writes safe, and a recorded token only short-circuits a write
///   while its effect is still in place
pub trait BackendAdapter: Send + Sync {
    /// Fetches every task.
    ///
    /// # Errors
    ///
    /// `Transient` or `Permanent`.
    fn fetch_tasks(&self) -> AdapterResult<Vec<Task>>;

    /// Reports tasks deleted on the backend, with deletion times.
    ///
    /// Backends that do not track deletions keep the default, in which case
    /// a deletion is dated to the previous sync.
    ///
    /// # Errors
    ///
    /// `Transient` or `Permanent`.
    fn fetch_tombstones(&self) -> AdapterResult<Vec<Tombstone>> {
        Ok(Vec::new())
    }

    /// Creates a task and returns its backend-assigned id.
    ///
    /// # Errors
    ///
    /// `Transient` or `Permanent`.
    fn create_task(&self, task: &Task, token: &IdempotenceToken) -> AdapterResult<String>;

    /// Overwrites the task `id` with `task`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Transient` or `Permanent`.
    fn update_task(&self, id: &str, task: &Task, token: &IdempotenceToken) -> AdapterResult<()>;

    /// Deletes the task `id`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Transient` or `Permanent`.
    fn delete_task(&self, id: &str, token: &IdempotenceToken) -> AdapterResult<()>;

    /// Drops the tombstones of `ids`.
    ///
    /// Called once the backend's committed snapshot no longer holds those
    /// tasks, so their deletion times are not needed again. The default
    /// keeps them.
    ///
    /// # Errors
    ///
    /// `Transient` or `Permanent`; the engine logs and carries on.
    fn forget_tombstones(&self, ids: &[String]) -> AdapterResult<()> {
        let _ = ids;
        Ok(())
    }
}
