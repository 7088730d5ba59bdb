//! # tasksync store
//!
//! Durable cross-cycle state for tasksync.
//!
//! The engine keeps exactly two kinds of durable state:
//! - one [`Snapshot`] per backend: the tasks as they were at the end of the
//!   last fully committed sync with that backend
//! - one global [`IdMap`]: logical key to backend-local ids, plus deletion
//!   tombstones that have not reached every backend yet
//!
//! ## Design Principles
//!
//! - A commit replaces the whole value or leaves the previous one intact
//! - A missing snapshot is a valid first-sync state (empty)
//! - Stores are passed to the engine explicitly, never global
//!
//! ## Available Stores
//!
//! - [`MemorySnapshotStore`] - For testing and ephemeral runs
//! - [`FileSnapshotStore`] - JSON files with write-then-rename commits

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod mappings;
mod memory;
mod snapshot;
mod store;

pub use error::{StoreError, StoreResult};
pub use file::FileSnapshotStore;
pub use mappings::{IdMap, KeyEntry};
pub use memory::MemorySnapshotStore;
pub use snapshot::{Snapshot, TaskRecord};
pub use store::SnapshotStore;
