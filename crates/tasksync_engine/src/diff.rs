//! Per-backend change detection.
//!
//! Compares what a backend holds now against its last committed snapshot.
//! Pure functions: no I/O, no clock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tasksync_protocol::{
    BackendId, Delta, LogicalKey, ProtocolError, ProtocolResult, Task, Tombstone,
};
use tasksync_store::{IdMap, Snapshot};

/// Assigns a logical key to every fetched task and indexes them by key.
///
/// A task keeps the logical key it carries. Otherwise the mapping table is
/// consulted for its backend-local id, and a task seen for the first time
/// gets a key minted from `<backend>:<id>`.
///
/// # Errors
///
/// Fails on an empty id, an id repeated within the fetch, or two tasks
/// resolving to the same logical key.
pub fn index_tasks(
    backend: &BackendId,
    tasks: Vec<Task>,
    mappings: &IdMap,
) -> ProtocolResult<BTreeMap<LogicalKey, Task>> {
    let known: HashMap<String, LogicalKey> = mappings.reverse_index(backend);
    let mut seen_ids = HashSet::with_capacity(tasks.len());
    let mut indexed = BTreeMap::new();

    for mut task in tasks {
        task.validate(backend)?;
        if !seen_ids.insert(task.id.clone()) {
            return Err(ProtocolError::DuplicateTaskId {
                backend: backend.to_string(),
                id: task.id,
            });
        }

        if task.logical_key.is_empty() {
            task.logical_key = match known.get(&task.id) {
                Some(key) => key.clone(),
                None => LogicalKey::minted(backend, &task.id),
            };
        }

        let key = task.logical_key.clone();
        if indexed.insert(key.clone(), task).is_some() {
            return Err(ProtocolError::DuplicateLogicalKey {
                backend: backend.to_string(),
                logical_key: key.to_string(),
            });
        }
    }

    Ok(indexed)
}

/// Classifies every key of `current` and `snapshot`.
///
/// Deltas come out in logical key order. A deletion is dated by the
/// backend's tombstone for the removed id when there is one, otherwise by
/// the time of the previous sync (the latest moment the task is known to
/// have existed).
pub fn diff(
    current: &BTreeMap<LogicalKey, Task>,
    snapshot: &Snapshot,
    tombstones: &[Tombstone],
) -> Vec<Delta> {
    let keys: BTreeSet<&LogicalKey> = current.keys().chain(snapshot.tasks.keys()).collect();
    let mut deltas = Vec::with_capacity(keys.len());

    for key in keys {
        let delta = match (snapshot.get(key), current.get(key)) {
            (None, Some(new)) => Delta::created(key.clone(), new.clone()),
            (Some(old), Some(new)) if old.same_content(new) => {
                Delta::unchanged(key.clone(), old.clone(), new.clone())
            }
            (Some(old), Some(new)) => Delta::updated(key.clone(), old.clone(), new.clone()),
            (Some(old), None) => {
                let deleted_at = tombstones
                    .iter()
                    .filter(|t| t.id == old.id)
                    .map(|t| t.deleted_at)
                    .max()
                    .or(snapshot.synced_at)
                    .unwrap_or(old.updated_at);
                Delta::deleted(key.clone(), old.clone(), deleted_at)
            }
            (None, None) => continue,
        };
        deltas.push(delta);
    }

    deltas
}

/// Everything the engine knows about one backend during a cycle.
#[derive(Debug, Clone)]
pub struct BackendView {
    /// Backend identity.
    pub backend: BackendId,
    /// Fetched tasks by logical key.
    pub current: BTreeMap<LogicalKey, Task>,
    /// Last committed snapshot.
    pub snapshot: Snapshot,
    /// Changes since the snapshot, by logical key.
    pub deltas: BTreeMap<LogicalKey, Delta>,
    /// Deletion records reported by the backend.
    pub tombstones: Vec<Tombstone>,
}

impl BackendView {
    /// Indexes a fetch and diffs it against `snapshot`.
    ///
    /// # Errors
    ///
    /// See [`index_tasks`].
    pub fn build(
        backend: BackendId,
        tasks: Vec<Task>,
        tombstones: &[Tombstone],
        snapshot: Snapshot,
        mappings: &IdMap,
    ) -> ProtocolResult<Self> {
        let current = index_tasks(&backend, tasks, mappings)?;
        let deltas = diff(&current, &snapshot, tombstones)
            .into_iter()
            .map(|delta| (delta.key.clone(), delta))
            .collect();
        Ok(Self {
            backend,
            current,
            snapshot,
            deltas,
            tombstones: tombstones.to_vec(),
        })
    }

    /// Returns the delta for `key`.
    pub fn delta(&self, key: &LogicalKey) -> Option<&Delta> {
        self.deltas.get(key)
    }

    /// Returns the task currently stored under `key`.
    pub fn current(&self, key: &LogicalKey) -> Option<&Task> {
        self.current.get(key)
    }

    /// Number of keys that changed since the snapshot.
    pub fn change_count(&self) -> usize {
        self.deltas.values().filter(|d| d.is_change()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use tasksync_protocol::DeltaKind;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn backend(id: &str) -> BackendId {
        BackendId::new(id).unwrap()
    }

    fn keyed(id: &str, key: &str, title: &str, secs: i64) -> Task {
        Task::new(id, title, at(secs)).with_logical_key(key)
    }

    fn snapshot(tasks: &[Task], synced: i64) -> Snapshot {
        Snapshot::new(
            tasks
                .iter()
                .map(|t| (t.logical_key.clone(), t.clone()))
                .collect(),
            at(synced),
        )
    }

    #[test]
    fn index_uses_carried_mapped_and_minted_keys() {
        let mut mappings = IdMap::new();
        mappings.record("T7".into(), backend("a"), "7");

        let indexed = index_tasks(
            &backend("a"),
            vec![
                keyed("1", "T1", "carried", 1),
                Task::new("7", "mapped", at(1)),
                Task::new("9", "new", at(1)),
            ],
            &mappings,
        )
        .unwrap();

        let keys: Vec<&str> = indexed.keys().map(LogicalKey::as_str).collect();
        assert_eq!(keys, vec!["T1", "T7", "a:9"]);
        assert_eq!(indexed[&LogicalKey::from("a:9")].logical_key.as_str(), "a:9");
    }

    #[test]
    fn index_rejects_malformed_fetches() {
        let map = IdMap::new();
        let a = backend("a");

        assert!(matches!(
            index_tasks(&a, vec![Task::new("", "x", at(1))], &map),
            Err(ProtocolError::EmptyTaskId { .. })
        ));
        assert!(matches!(
            index_tasks(&a, vec![Task::new("1", "x", at(1)), Task::new("1", "y", at(1))], &map),
            Err(ProtocolError::DuplicateTaskId { .. })
        ));
        assert!(matches!(
            index_tasks(&a, vec![keyed("1", "T", "x", 1), keyed("2", "T", "y", 1)], &map),
            Err(ProtocolError::DuplicateLogicalKey { .. })
        ));
    }

    #[test]
    fn first_sync_reports_everything_created() {
        let current = index_tasks(
            &backend("a"),
            vec![keyed("1", "T1", "x", 1), keyed("2", "T2", "y", 1)],
            &IdMap::new(),
        )
        .unwrap();
        let deltas = diff(&current, &Snapshot::empty(), &[]);

        assert_eq!(deltas.len(), 2);
        assert!(deltas.iter().all(|d| d.kind == DeltaKind::Created));
    }

    #[test]
    fn classifies_each_kind() {
        let prior = snapshot(
            &[
                keyed("1", "T1", "same", 1),
                keyed("2", "T2", "old title", 1),
                keyed("3", "T3", "gone", 1),
            ],
            50,
        );
        let current: BTreeMap<_, _> = [
            keyed("1", "T1", "same", 9),
            keyed("2", "T2", "new title", 9),
            keyed("4", "T4", "fresh", 9),
        ]
        .into_iter()
        .map(|t| (t.logical_key.clone(), t))
        .collect();

        let deltas = diff(&current, &prior, &[]);
        let kinds: Vec<(&str, DeltaKind)> =
            deltas.iter().map(|d| (d.key.as_str(), d.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("T1", DeltaKind::Unchanged),
                ("T2", DeltaKind::Updated),
                ("T3", DeltaKind::Deleted),
                ("T4", DeltaKind::Created),
            ]
        );
        // No tombstone: dated to the previous sync
        assert_eq!(deltas[2].deleted_at, Some(at(50)));
    }

    #[test]
    fn metadata_only_change_is_unchanged() {
        let prior = snapshot(&[keyed("1", "T1", "x", 1).with_version(1)], 5);
        let current: BTreeMap<_, _> = [keyed("1", "T1", "x", 99).with_version(7)]
            .into_iter()
            .map(|t| (t.logical_key.clone(), t))
            .collect();

        let deltas = diff(&current, &prior, &[]);
        assert_eq!(deltas[0].kind, DeltaKind::Unchanged);
    }

    #[test]
    fn tombstone_dates_deletion() {
        let prior = snapshot(&[keyed("3", "T3", "x", 1)], 50);
        let deltas = diff(
            &BTreeMap::new(),
            &prior,
            &[Tombstone::new("3", at(30)), Tombstone::new("8", at(40))],
        );
        assert_eq!(deltas[0].kind, DeltaKind::Deleted);
        assert_eq!(deltas[0].deleted_at, Some(at(30)));
    }

    #[test]
    fn view_counts_changes() {
        let prior = snapshot(&[keyed("1", "T1", "x", 1)], 5);
        let view = BackendView::build(
            backend("a"),
            vec![keyed("1", "T1", "x", 1), keyed("2", "T2", "y", 6)],
            &[],
            prior,
            &IdMap::new(),
        )
        .unwrap();

        assert_eq!(view.change_count(), 1);
        assert!(view.current(&"T2".into()).is_some());
        assert!(!view.delta(&"T1".into()).unwrap().is_change());
    }
}
