//! # tasksync protocol
//!
//! Value types shared by every tasksync component.
//!
//! This crate provides:
//! - [`Task`] and its content equality / hashing rules
//! - [`BackendId`] and [`LogicalKey`] identifiers
//! - [`Delta`] for per-backend change classification
//! - [`Conflict`] and [`ConflictPolicy`] for cross-backend disagreements
//! - [`Operation`] with its [`IdempotenceToken`]
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod delta;
mod error;
mod ids;
mod operation;
mod task;

pub use conflict::{Conflict, ConflictOutcome, ConflictPolicy, Proposal, ProposalKind};
pub use delta::{Delta, DeltaKind};
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{BackendId, LogicalKey};
pub use operation::{IdempotenceToken, Operation, OperationKind};
pub use task::{Task, TaskContent, Tombstone};
