//! Canonical task representation.

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{BackendId, LogicalKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A task as observed on one backend during one sync cycle.
///
/// # Fields
///
/// - `id`: backend-local identifier, unique within that backend
/// - `logical_key`: cross-backend identity (empty if the backend does not store it)
/// - `title`, `completed`, `due_date`: the task content
/// - `updated_at`: last modification time, used for conflict ordering
/// - `version`: monotonic counter maintained by the backend
///
/// Only the content fields take part in change detection; `updated_at` and
/// `version` are metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Backend-local id.
    pub id: String,
    /// Cross-backend identity.
    #[serde(default, skip_serializing_if = "LogicalKey::is_empty")]
    pub logical_key: LogicalKey,
    /// Task title.
    pub title: String,
    /// Completion flag.
    pub completed: bool,
    /// Optional due date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Backend-maintained version counter.
    #[serde(default)]
    pub version: u64,
}

impl Task {
    /// Creates an open task with no due date and version 1.
    pub fn new(id: impl Into<String>, title: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            logical_key: LogicalKey::default(),
            title: title.into(),
            completed: false,
            due_date: None,
            updated_at,
            version: 1,
        }
    }

    /// Sets the logical key.
    pub fn with_logical_key(mut self, key: impl Into<LogicalKey>) -> Self {
        self.logical_key = key.into();
        self
    }

    /// Sets the completion flag.
    pub fn with_completed(mut self, completed: bool) -> Self {
        self.completed = completed;
        self
    }

    /// Sets the due date.
    pub fn with_due_date(mut self, due_date: Option<DateTime<Utc>>) -> Self {
        self.due_date = due_date;
        self
    }

    /// Sets the version counter.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Returns a copy of this task carrying another backend's id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Returns the content view used for equality and hashing.
    pub fn content(&self) -> TaskContent<'_> {
        TaskContent {
            title: &self.title,
            completed: self.completed,
            due_date: self.due_date,
        }
    }

    /// Returns true if both tasks carry the same title, completion and due date.
    pub fn same_content(&self, other: &Task) -> bool {
        self.content() == other.content()
    }

    /// SHA-256 of the content fields.
    pub fn content_hash(&self) -> [u8; 32] {
        self.content().hash()
    }

    /// Checks that the task is well formed for the given backend.
    pub fn validate(&self, backend: &BackendId) -> ProtocolResult<()> {
        if self.id.trim().is_empty() {
            return Err(ProtocolError::EmptyTaskId {
                backend: backend.to_string(),
                logical_key: self.logical_key.to_string(),
            });
        }
        Ok(())
    }
}

/// Borrowed view of the fields that define a task's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskContent<'a> {
    /// Task title.
    pub title: &'a str,
    /// Completion flag.
    pub completed: bool,
    /// Optional due date.
    pub due_date: Option<DateTime<Utc>>,
}

impl TaskContent<'_> {
    /// SHA-256 over a length-prefixed encoding of the content.
    pub fn hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update((self.title.len() as u64).to_le_bytes());
        hasher.update(self.title.as_bytes());
        hasher.update([u8::from(self.completed)]);
        match self.due_date {
            Some(due) => {
                hasher.update([1]);
                hasher.update(due.timestamp().to_le_bytes());
                hasher.update(due.timestamp_subsec_nanos().to_le_bytes());
            }
            None => hasher.update([0]),
        }
        hasher.finalize().into()
    }
}

/// Record of a task deleted on a backend since the last sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    /// Backend-local id of the deleted task.
    pub id: String,
    /// When the deletion happened.
    pub deleted_at: DateTime<Utc>,
}

impl Tombstone {
    /// Creates a tombstone.
    pub fn new(id: impl Into<String>, deleted_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            deleted_at,
        }
    }
}
