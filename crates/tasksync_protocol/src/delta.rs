//! Per-backend change classification.

use crate::ids::LogicalKey;
use crate::task::Task;
use chrono::{DateTime, Utc};

/// Kind of change observed for one task on one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    /// Present now, absent from the last snapshot.
    Created,
    /// Present in both with different content.
    Updated,
    /// Present in the last snapshot, absent now.
    Deleted,
    /// Present in both with the same content.
    Unchanged,
}

impl DeltaKind {
    /// Returns a short lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaKind::Created => "created",
            DeltaKind::Updated => "updated",
            DeltaKind::Deleted => "deleted",
            DeltaKind::Unchanged => "unchanged",
        }
    }
}

/// A single task's change on one backend in one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    /// Logical key of the task.
    pub key: LogicalKey,
    /// Change classification.
    pub kind: DeltaKind,
    /// Value from the last snapshot.
    pub old: Option<Task>,
    /// Value from the current fetch.
    pub new: Option<Task>,
    /// Time of deletion (only for [`DeltaKind::Deleted`]).
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Delta {
    /// A task that appeared since the last snapshot.
    pub fn created(key: LogicalKey, new: Task) -> Self {
        Self {
            key,
            kind: DeltaKind::Created,
            old: None,
            new: Some(new),
            deleted_at: None,
        }
    }

    /// A task whose content changed.
    pub fn updated(key: LogicalKey, old: Task, new: Task) -> Self {
        Self {
            key,
            kind: DeltaKind::Updated,
            old: Some(old),
            new: Some(new),
            deleted_at: None,
        }
    }

    /// A task that disappeared, deleted at `deleted_at`.
    pub fn deleted(key: LogicalKey, old: Task, deleted_at: DateTime<Utc>) -> Self {
        Self {
            key,
            kind: DeltaKind::Deleted,
            old: Some(old),
            new: None,
            deleted_at: Some(deleted_at),
        }
    }

    /// A task whose content did not change.
    pub fn unchanged(key: LogicalKey, old: Task, new: Task) -> Self {
        Self {
            key,
            kind: DeltaKind::Unchanged,
            old: Some(old),
            new: Some(new),
            deleted_at: None,
        }
    }

    /// Returns true for anything other than [`DeltaKind::Unchanged`].
    pub fn is_change(&self) -> bool {
        self.kind != DeltaKind::Unchanged
    }

    /// Timestamp that orders this change against competing ones.
    ///
    /// Upserts use the new value's `updated_at`; deletions use `deleted_at`.
    pub fn changed_at(&self) -> Option<DateTime<Utc>> {
        match self.kind {
            DeltaKind::Deleted => self.deleted_at,
            _ => self.new.as_ref().map(|task| task.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn change_timestamps() {
        let t1 = Utc.timestamp_opt(10, 0).unwrap();
        let t2 = Utc.timestamp_opt(20, 0).unwrap();
        let old = Task::new("1", "a", t1);
        let new = Task::new("1", "b", t2);

        let updated = Delta::updated("k".into(), old.clone(), new.clone());
        assert!(updated.is_change());
        assert_eq!(updated.changed_at(), Some(t2));

        let deleted = Delta::deleted("k".into(), old.clone(), t2);
        assert_eq!(deleted.changed_at(), Some(t2));
        assert!(deleted.new.is_none());

        let unchanged = Delta::unchanged("k".into(), old.clone(), old);
        assert!(!unchanged.is_change());
        assert_eq!(unchanged.kind.as_str(), "unchanged");
    }
}
