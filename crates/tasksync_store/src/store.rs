//! Snapshot store trait definition.

use crate::error::StoreResult;
use crate::mappings::IdMap;
use crate::snapshot::Snapshot;
use std::sync::Arc;
use tasksync_protocol::BackendId;

/// Durable home of the engine's cross-cycle state.
///
/// # Invariants
///
/// - `get` of a backend that was never committed returns an empty snapshot
/// - `commit` replaces the whole snapshot or, on error, leaves the previous
///   one untouched
/// - commits for different backends are independent of each other
///
/// # Implementors
///
/// - [`super::MemorySnapshotStore`] - For testing
/// - [`super::FileSnapshotStore`] - For persistent state
pub trait SnapshotStore: Send + Sync {
    /// Returns the last committed snapshot of `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be read or decoded.
    fn get(&self, backend: &BackendId) -> StoreResult<Snapshot>;

    /// Atomically replaces the snapshot of `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot could not be made durable; the
    /// previous snapshot is then still in place.
    fn commit(&self, backend: &BackendId, snapshot: Snapshot) -> StoreResult<()>;

    /// Returns the mapping table.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be read or decoded.
    fn mappings(&self) -> StoreResult<IdMap>;

    /// Atomically replaces the mapping table.
    ///
    /// # Errors
    ///
    /// Returns an error if the table could not be made durable.
    fn commit_mappings(&self, mappings: IdMap) -> StoreResult<()>;

    /// Lists backends that have a committed snapshot, in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be enumerated.
    fn backends(&self) -> StoreResult<Vec<BackendId>>;
}

impl<S: SnapshotStore + ?Sized> SnapshotStore for Arc<S> {
    fn get(&self, backend: &BackendId) -> StoreResult<Snapshot> {
        (**self).get(backend)
    }

    fn commit(&self, backend: &BackendId, snapshot: Snapshot) -> StoreResult<()> {
        (**self).commit(backend, snapshot)
    }

    fn mappings(&self) -> StoreResult<IdMap> {
        (**self).mappings()
    }

    fn commit_mappings(&self, mappings: IdMap) -> StoreResult<()> {
        (**self).commit_mappings(mappings)
    }

    fn backends(&self) -> StoreResult<Vec<BackendId>> {
        (**self).backends()
    }
}
