//! Shared identifier types used across the coordinator crates.

pub mod types;

pub use types::{InvalidOperationId, OperationId};
