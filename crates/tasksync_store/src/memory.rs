//! In-memory snapshot store.

use crate::error::{StoreError, StoreResult};
use crate::mappings::IdMap;
use crate::snapshot::Snapshot;
use crate::store::SnapshotStore;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tasksync_protocol::BackendId;

/// A snapshot store that keeps everything in memory.
///
/// Commits swap whole values under a write lock, so readers never observe a
/// half-replaced snapshot. Commits for selected backends, or of the mapping
/// table, can be made to fail to exercise partial-failure handling.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<BTreeMap<BackendId, Snapshot>>,
    mappings: RwLock<IdMap>,
    rejected: RwLock<BTreeSet<BackendId>>,
    mappings_rejected: AtomicBool,
}

impl MemorySnapshotStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every future commit for `backend` fail.
    pub fn reject_commits(&self, backend: &BackendId) {
        self.rejected.write().insert(backend.clone());
    }

    /// Lets commits for `backend` succeed again.
    pub fn accept_commits(&self, backend: &BackendId) {
        self.rejected.write().remove(backend);
    }

    /// Makes mapping table commits fail, or succeed again.
    pub fn reject_mapping_commits(&self, reject: bool) {
        self.mappings_rejected.store(reject, Ordering::SeqCst);
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn get(&self, backend: &BackendId) -> StoreResult<Snapshot> {
        Ok(self
            .snapshots
            .read()
            .get(backend)
            .cloned()
            .unwrap_or_default())
    }

    fn commit(&self, backend: &BackendId, snapshot: Snapshot) -> StoreResult<()> {
        if self.rejected.read().contains(backend) {
            return Err(StoreError::CommitRejected(backend.to_string()));
        }
        self.snapshots.write().insert(backend.clone(), snapshot);
        Ok(())
    }

    fn mappings(&self) -> StoreResult<IdMap> {
        Ok(self.mappings.read().clone())
    }

    fn commit_mappings(&self, mappings: IdMap) -> StoreResult<()> {
        if self.mappings_rejected.load(Ordering::SeqCst) {
            return Err(StoreError::CommitRejected("mapping table".into()));
        }
        *self.mappings.write() = mappings;
        Ok(())
    }

    fn backends(&self) -> StoreResult<Vec<BackendId>> {
        Ok(self.snapshots.read().keys().cloned().collect())
    }
}
