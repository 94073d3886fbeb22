use thiserror::Error;

use crate::{OperationId, OperationStatus, Version};

/// Errors that can occur when interacting with the operation store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An operation with this id already exists.
    #[error("Operation already exists: {0}")]
    AlreadyExists(OperationId),

    /// The operation was not found in the store.
    #[error("Operation not found: {0}")]
    NotFound(OperationId),

    /// The stored version did not match the version the caller read.
    #[error(
        "Version conflict for operation {operation_id}: expected version {expected}, found {actual}"
    )]
    VersionConflict {
        operation_id: OperationId,
        expected: Version,
        actual: Version,
    },

    /// The requested status change is not an edge of the workflow graph.
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: OperationStatus,
        to: OperationStatus,
    },

    /// The operation reached a terminal status and accepts no further writes.
    #[error("Operation is {status} and can no longer be modified")]
    Immutable { status: OperationStatus },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for errors caused by a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Result type for operation store calls.
pub type Result<T> = std::result::Result<T, StoreError>;
