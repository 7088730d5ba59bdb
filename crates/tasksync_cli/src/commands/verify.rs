//! Verify command implementation.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tasksync_protocol::{BackendId, LogicalKey};
use tasksync_store::{FileSnapshotStore, IdMap, Snapshot, SnapshotStore};

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of snapshots checked.
    pub snapshots_checked: usize,
    /// Number of tasks checked.
    pub tasks_checked: usize,
    /// Inconsistencies that make the state unusable.
    pub errors: Vec<String>,
    /// Disagreements a later cycle repairs.
    pub warnings: Vec<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(state: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying state directory at {:?}", state);
    println!();

    let store = FileSnapshotStore::open(state, false)?;
    let mut snapshots = BTreeMap::new();
    for backend in store.backends()? {
        let snapshot = store.get(&backend)?;
        snapshots.insert(backend, snapshot);
    }
    let result = verify(&snapshots, &store.mappings()?);

    println!("Snapshots checked: {}", result.snapshots_checked);
    println!("Tasks checked:     {}", result.tasks_checked);
    for warning in &result.warnings {
        println!("  warning: {warning}");
    }
    for error in &result.errors {
        println!("  error:   {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ State verification passed");
        Ok(())
    } else {
        println!("✗ State verification failed");
        Err("Verification failed".into())
    }
}

/// Checks snapshots against each other and against the mapping table.
pub fn verify(snapshots: &BTreeMap<BackendId, Snapshot>, mappings: &IdMap) -> VerifyResult {
    let mut result = VerifyResult::default();

    for (backend, snapshot) in snapshots {
        result.snapshots_checked += 1;
        let mut seen: HashMap<&str, &LogicalKey> = HashMap::new();

        for (key, task) in &snapshot.tasks {
            result.tasks_checked += 1;

            if let Some(other) = seen.insert(task.id.as_str(), key) {
                result.errors.push(format!(
                    "{backend}: id {} used by both {other} and {key}",
                    task.id
                ));
            }

            match mappings.id_for(key, backend) {
                Some(id) if id == task.id => {}
                Some(id) => result.warnings.push(format!(
                    "{backend}: {key} is {} in the snapshot but {id} in the mapping table",
                    task.id
                )),
                None => result
                    .warnings
                    .push(format!("{backend}: {key} is not in the mapping table")),
            }

            if let Some(at) = mappings.tombstone_of(key) {
                result.warnings.push(format!(
                    "{backend}: {key} was deleted at {} but is still in the snapshot",
                    at.to_rfc3339()
                ));
            }
        }
    }

    let mut owners: HashMap<(&BackendId, &str), &LogicalKey> = HashMap::new();
    for (key, entry) in mappings.entries() {
        for (backend, id) in &entry.ids {
            if let Some(other) = owners.insert((backend, id.as_str()), key) {
                result.errors.push(format!(
                    "{backend}: mapping table assigns id {id} to both {other} and {key}"
                ));
            }
            let in_snapshot = snapshots
                .get(backend)
                .is_some_and(|snapshot| snapshot.get(key).is_some());
            if !in_snapshot {
                result.warnings.push(format!(
                    "{backend}: mapping table has {key} but the snapshot does not"
                ));
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tasksync_protocol::Task;

    fn backend(id: &str) -> BackendId {
        BackendId::new(id).unwrap()
    }

    fn snapshot(tasks: &[(&str, &str)]) -> Snapshot {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let tasks = tasks
            .iter()
            .map(|(key, id)| {
                (
                    LogicalKey::from(*key),
                    Task::new(*id, *key, at).with_logical_key(*key),
                )
            })
            .collect();
        Snapshot::new(tasks, at)
    }

    #[test]
    fn consistent_state_passes() {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(backend("a"), snapshot(&[("T1", "1")]));
        snapshots.insert(backend("b"), snapshot(&[("T1", "b-1")]));
        let mut map = IdMap::new();
        map.record("T1".into(), backend("a"), "1");
        map.record("T1".into(), backend("b"), "b-1");

        let result = verify(&snapshots, &map);
        assert!(result.is_ok());
        assert!(result.warnings.is_empty());
        assert_eq!(result.tasks_checked, 2);
    }

    #[test]
    fn duplicate_ids_are_errors() {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(backend("a"), snapshot(&[("T1", "1"), ("T2", "1")]));
        let mut map = IdMap::new();
        map.record("T1".into(), backend("a"), "1");
        map.record("T2".into(), backend("a"), "1");

        let result = verify(&snapshots, &map);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn lagging_backend_only_warns() {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(backend("a"), snapshot(&[("T1", "1")]));
        let mut map = IdMap::new();
        map.record("T1".into(), backend("a"), "1");
        map.record("T2".into(), backend("a"), "2");
        map.tombstone("T1".into(), Utc.timestamp_opt(5, 0).unwrap());

        let result = verify(&snapshots, &map);
        assert!(result.is_ok());
        assert_eq!(result.warnings.len(), 2);
    }
}
