//! Per-backend snapshot of the last synced state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tasksync_protocol::{LogicalKey, Task};

/// Tasks of one backend as of the end of its last committed sync.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// When the snapshot was committed (`None` before the first sync).
    pub synced_at: Option<DateTime<Utc>>,
    /// Tasks by logical key.
    pub tasks: BTreeMap<LogicalKey, Task>,
}

impl Snapshot {
    /// Creates an empty snapshot (first sync).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a snapshot committed at `synced_at`.
    pub fn new(tasks: BTreeMap<LogicalKey, Task>, synced_at: DateTime<Utc>) -> Self {
        Self {
            synced_at: Some(synced_at),
            tasks,
        }
    }

    /// Returns the task stored under `key`.
    pub fn get(&self, key: &LogicalKey) -> Option<&Task> {
        self.tasks.get(key)
    }

    /// Returns the number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the snapshot holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// On-disk form of a task inside a snapshot; the logical key is the map key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Backend-local id.
    pub id: String,
    /// Task title.
    pub title: String,
    /// Completion flag.
    pub completed: bool,
    /// Optional due date.
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Backend version counter.
    pub version: u64,
}

impl TaskRecord {
    /// Rebuilds the task stored under `key`.
    pub fn into_task(self, key: LogicalKey) -> Task {
        Task {
            id: self.id,
            logical_key: key,
            title: self.title,
            completed: self.completed,
            due_date: self.due_date,
            updated_at: self.updated_at,
            version: self.version,
        }
    }
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            completed: task.completed,
            due_date: task.due_date,
            updated_at: task.updated_at,
            version: task.version,
        }
    }
}

/// Serialized snapshot file.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SnapshotFile {
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks: BTreeMap<LogicalKey, TaskRecord>,
}

impl From<&Snapshot> for SnapshotFile {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            synced_at: snapshot.synced_at,
            tasks: snapshot
                .tasks
                .iter()
                .map(|(key, task)| (key.clone(), TaskRecord::from(task)))
                .collect(),
        }
    }
}

impl From<SnapshotFile> for Snapshot {
    fn from(file: SnapshotFile) -> Self {
        Self {
            synced_at: file.synced_at,
            tasks: file
                .tasks
                .into_iter()
                .map(|(key, record)| {
                    let task = record.into_task(key.clone());
                    (key, task)
                })
                .collect(),
        }
    }
}
