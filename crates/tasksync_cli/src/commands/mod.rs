//! CLI command implementations.

pub mod demo;
pub mod inspect;
pub mod json_backend;
pub mod sync;
pub mod verify;
