//! # tasksync testkit
//!
//! Test utilities for tasksync.
//!
//! This crate provides:
//! - Fixtures: timestamps, task builders and a ready-made engine harness
//!   over in-memory backends
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tasksync_testkit::prelude::*;
//!
//! #[test]
//! fn propagates_new_task() {
//!     let harness = SyncHarness::new(&["a", "b"]);
//!     harness.backend("a").put(task("1", "T2", "Buy milk", 10));
//!     harness.sync();
//!     assert!(harness.is_converged());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
