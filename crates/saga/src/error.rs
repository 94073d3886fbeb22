//! Saga error types.

use common::OperationId;
use operation_store::StoreError;
use thiserror::Error;

use crate::workflow::EventKind;

/// Errors that can occur while coordinating an operation.
///
/// The message that caused any of them is never acknowledged. Transient
/// failures of the store or the broker are retried in place, see
/// [`SagaError::is_transient`]; everything else is redelivered.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The operation was not found.
    #[error("Operation not found: {0}")]
    NotFound(OperationId),

    /// Operation store error.
    #[error("Operation store error: {0}")]
    Store(#[from] StoreError),

    /// The broker did not accept a command.
    #[error("Failed to publish to '{queue}': {reason}")]
    Publish { queue: String, reason: String },

    /// Concurrent writers kept winning the compare-and-swap.
    #[error("Gave up on operation {operation_id} after {attempts} conflicting writes")]
    RetriesExhausted {
        operation_id: OperationId,
        attempts: u32,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if the store or the broker was unreachable.
    ///
    /// These clear up once the dependency is back and say nothing about the
    /// message itself.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaError::Store(e) => {
                matches!(e, StoreError::Database(_) | StoreError::Migration(_))
            }
            SagaError::Publish { .. } => true,
            _ => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

/// A message that can never be processed, no matter how often it is
/// redelivered. It is acknowledged and discarded.
#[derive(Debug, Error)]
pub enum MalformedMessage {
    /// The body is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The body is JSON but not an object.
    #[error("message body is not a JSON object")]
    NotAnObject,

    /// `operation_id` is absent, not a string, or empty.
    #[error("missing or empty operation_id")]
    MissingOperationId,

    /// `status` is absent.
    #[error("missing status")]
    MissingStatus,

    /// `status` is not one of SUCCESS, ERROR or SKIPPED.
    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    /// The result fields do not match the event schema.
    #[error("invalid {event} payload: {source}")]
    InvalidPayload {
        event: EventKind,
        #[source]
        source: serde_json::Error,
    },
}
