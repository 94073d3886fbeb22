use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{OperationId, OperationStatus, StoreError};

/// Caller-supplied operation attributes (rates, account numbers, recipients).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Logical file role mapped to its storage location.
pub type FilePaths = BTreeMap<String, String>;

/// Step name mapped to the payload that step reported.
pub type StepResults = BTreeMap<String, serde_json::Value>;

/// Version number of an operation record, used for compare-and-swap writes.
///
/// A freshly created operation is at version 1 and every accepted mutation
/// increments it by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the version of a newly created operation.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// A command committed together with a transition and not yet confirmed
/// by the broker (transactional outbox entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    /// The step whose transition produced the command.
    pub step: String,
    /// The serialized command.
    pub command: serde_json::Value,
}

/// The persisted state of one saga operation.
///
/// Mutators enforce the record's invariants: the status only follows the
/// workflow graph, results are written once per step, and nothing but the
/// outbox changes after a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    operation_id: OperationId,
    status: OperationStatus,
    metadata: Metadata,
    file_paths: FilePaths,
    results: StepResults,
    error_message: Option<String>,
    pending_command: Option<PendingCommand>,
    version: Version,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Operation {
    /// Creates a new operation in `RECEIVED` status at version 1.
    pub fn new(operation_id: OperationId, metadata: Metadata, file_paths: FilePaths) -> Self {
        let now = Utc::now();
        Self {
            operation_id,
            status: OperationStatus::Received,
            metadata,
            file_paths,
            results: StepResults::new(),
            error_message: None,
            pending_command: None,
            version: Version::first(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuilds an operation from its persisted columns.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        operation_id: OperationId,
        status: OperationStatus,
        metadata: Metadata,
        file_paths: FilePaths,
        results: StepResults,
        error_message: Option<String>,
        pending_command: Option<PendingCommand>,
        version: Version,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            operation_id,
            status,
            metadata,
            file_paths,
            results,
            error_message,
            pending_command,
            version,
            created_at,
            updated_at,
        }
    }

    fn ensure_mutable(&self) -> Result<(), StoreError> {
        if self.status.is_terminal() {
            return Err(StoreError::Immutable {
                status: self.status,
            });
        }
        Ok(())
    }

    /// Records a step result; returns false if the step already has one.
    pub fn record_result(
        &mut self,
        step: &str,
        payload: serde_json::Value,
    ) -> Result<bool, StoreError> {
        self.ensure_mutable()?;
        if self.results.contains_key(step) {
            return Ok(false);
        }
        self.results.insert(step.to_string(), payload);
        Ok(true)
    }

    /// Moves to the next status along the workflow graph.
    pub fn advance_to(&mut self, next: OperationStatus) -> Result<(), StoreError> {
        self.ensure_mutable()?;
        if next == OperationStatus::Failed || !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Moves to `FAILED` and records the error message.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), StoreError> {
        self.ensure_mutable()?;
        self.status = OperationStatus::Failed;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Stores a command in the outbox, replacing any previous entry.
    pub fn set_pending_command(&mut self, pending: PendingCommand) {
        self.pending_command = Some(pending);
    }

    /// Clears the outbox if it still holds the command for `step`.
    ///
    /// Returns true if an entry was removed.
    pub fn clear_pending_command(&mut self, step: &str) -> bool {
        match &self.pending_command {
            Some(pending) if pending.step == step => {
                self.pending_command = None;
                true
            }
            _ => false,
        }
    }

    /// Bumps the version and modification time after an accepted write.
    pub(crate) fn touch(&mut self) {
        self.version = self.version.next();
        self.updated_at = Utc::now();
    }
}

// Query methods
impl Operation {
    /// Returns the operation id.
    pub fn id(&self) -> &OperationId {
        &self.operation_id
    }

    /// Returns the current status.
    pub fn status(&self) -> OperationStatus {
        self.status
    }

    /// Returns the caller-supplied metadata.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Returns the file role to path mapping.
    pub fn file_paths(&self) -> &FilePaths {
        &self.file_paths
    }

    /// Returns the recorded step results.
    pub fn results(&self) -> &StepResults {
        &self.results
    }

    /// Returns the result recorded for `step`, if any.
    pub fn result(&self, step: &str) -> Option<&serde_json::Value> {
        self.results.get(step)
    }

    /// Returns true if `step` already has a recorded result.
    pub fn has_result(&self, step: &str) -> bool {
        self.results.contains_key(step)
    }

    /// Returns the failure message, if the operation failed.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Returns the outbox entry, if a command awaits publication.
    pub fn pending_command(&self) -> Option<&PendingCommand> {
        self.pending_command.as_ref()
    }

    /// Returns the record version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns when the operation was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns when the operation was last modified.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}
