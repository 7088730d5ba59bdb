//! # tasksync engine
//!
//! Reconciliation engine that keeps tasks consistent across several
//! independent task-tracking backends.
//!
//! This crate provides:
//! - The [`BackendAdapter`] interface and an in-memory [`MemoryBackend`]
//! - Per-backend change detection against committed snapshots
//! - Cross-backend merge with last-writer-wins or manual conflict policy
//! - Operation planning with idempotence tokens
//! - Parallel execution with retry and exponential backoff
//! - The [`SyncEngine`] state machine tying the stages together
//!
//! ## Architecture
//!
//! A cycle runs fetch → diff → merge → plan → execute → commit:
//! 1. Every backend is fetched and diffed against its own snapshot
//! 2. Changes to the same logical key are merged across backends
//! 3. Each backend receives the creates, updates and deletes that bring it
//!    to the merged state
//! 4. Only backends whose operations all settled get a new snapshot
//!
//! ## Key Invariants
//!
//! - A snapshot only ever reflects a state the backend actually reached
//! - A failed backend keeps its old snapshot and catches up next cycle
//! - Running a cycle twice with no external change plans nothing
//! - Conflict resolution is deterministic given the same inputs

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod config;
mod diff;
mod error;
mod executor;
mod memory;
mod merge;
mod planner;
mod report;
mod state;

pub use adapter::{AdapterError, AdapterResult, BackendAdapter};
pub use config::{RetryConfig, SyncConfig};
pub use diff::{diff, index_tasks, BackendView};
pub use error::{SyncError, SyncResult};
pub use executor::{BackendOutcome, Executor, OperationOutcome, OperationStatus, SkipReason};
pub use memory::{CallCounts, FailOn, MemoryBackend};
pub use merge::{Decision, Resolution, Resolver};
pub use planner::Plan;
pub use report::{CycleReport, SkippedOperation};
pub use state::{CyclePreview, SyncEngine, SyncState, SyncStats};
