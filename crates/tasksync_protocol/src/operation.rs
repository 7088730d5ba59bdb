//! Remote mutations planned by the engine.

use crate::ids::{BackendId, LogicalKey};
use crate::task::Task;
use std::fmt;

/// Type of remote mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperationKind {
    /// Create the task on the backend.
    Create,
    /// Overwrite the task's content on the backend.
    Update,
    /// Remove the task from the backend.
    Delete,
}

impl OperationKind {
    /// Execution rank within one backend: creates, then updates, then deletes.
    pub fn rank(&self) -> u8 {
        match self {
            OperationKind::Create => 0,
            OperationKind::Update => 1,
            OperationKind::Delete => 2,
        }
    }

    /// Returns a short lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one transition of a task on a backend so a retried write is
/// not applied twice.
///
/// Built from the operation kind, logical key, target version and a prefix
/// of the target content hash, followed by the state the write starts from:
/// the backend's existing copy (`<b-7@2#...`) or `<new` for a first copy,
/// e.g. `update:T1@3#5f2c9a01d4e6b870<b-7@2#0c1d2e3f40516273`. Planning the
/// same target again from a different starting state yields a new token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdempotenceToken(String);

impl IdempotenceToken {
    /// Builds the token for applying `kind` with `task` under `key`, starting
    /// from `base`.
    pub fn new(kind: OperationKind, key: &LogicalKey, task: &Task, base: Option<&Task>) -> Self {
        let base = match base {
            Some(base) => format!("{}@{}#{}", base.id, base.version, hash_prefix(base)),
            None => "new".to_string(),
        };
        Self(format!(
            "{kind}:{key}@{}#{}<{base}",
            task.version,
            hash_prefix(task)
        ))
    }

    /// Returns the token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn hash_prefix(task: &Task) -> String {
    task.content_hash()[..8]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

impl fmt::Display for IdempotenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An intended mutation against one backend.
///
/// # Fields
///
/// - `backend`: the backend the operation targets
/// - `kind`: create, update or delete
/// - `key`: logical key of the affected task
/// - `remote_id`: backend-local id (absent for creates)
/// - `payload`: target task (for deletes, the value being removed)
/// - `token`: idempotence token
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// Target backend.
    pub backend: BackendId,
    /// Operation type.
    pub kind: OperationKind,
    /// Logical key.
    pub key: LogicalKey,
    /// Backend-local id of the existing task.
    pub remote_id: Option<String>,
    /// Target value.
    pub payload: Task,
    /// Idempotence token.
    pub token: IdempotenceToken,
}

impl Operation {
    /// Creates `payload` on `backend`.
    ///
    /// `previous` is the copy the backend held at its last sync, if any, so
    /// recreating a removed task is a different transition from the first
    /// create.
    pub fn create(
        backend: BackendId,
        key: LogicalKey,
        payload: Task,
        previous: Option<&Task>,
    ) -> Self {
        let payload = payload.with_id(String::new()).with_logical_key(key.clone());
        let token = IdempotenceToken::new(OperationKind::Create, &key, &payload, previous);
        Self {
            backend,
            kind: OperationKind::Create,
            key,
            remote_id: None,
            payload,
            token,
        }
    }

    /// Overwrites `current` on `backend` with `payload`.
    pub fn update(backend: BackendId, key: LogicalKey, current: &Task, payload: Task) -> Self {
        let payload = payload
            .with_id(current.id.clone())
            .with_logical_key(key.clone());
        let token = IdempotenceToken::new(OperationKind::Update, &key, &payload, Some(current));
        Self {
            backend,
            kind: OperationKind::Update,
            key,
            remote_id: Some(current.id.clone()),
            payload,
            token,
        }
    }

    /// Removes `current` from `backend`.
    pub fn delete(backend: BackendId, key: LogicalKey, current: Task) -> Self {
        let token = IdempotenceToken::new(OperationKind::Delete, &key, &current, Some(&current));
        Self {
            backend,
            kind: OperationKind::Delete,
            key,
            remote_id: Some(current.id.clone()),
            payload: current,
            token,
        }
    }

    /// Ordering key within one backend's plan.
    pub fn sort_key(&self) -> (u8, &LogicalKey) {
        (self.kind.rank(), &self.key)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} on {}", self.kind, self.key, self.backend)
    }
}
