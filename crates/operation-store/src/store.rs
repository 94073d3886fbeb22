use async_trait::async_trait;

use crate::{FilePaths, Metadata, Operation, OperationId, Result, StoreError, Version};

/// A change applied to an operation inside a compare-and-swap write.
///
/// The mutation works on a copy of the stored record; returning an error
/// discards the copy and leaves the stored record untouched.
pub type Mutation = Box<dyn FnOnce(&mut Operation) -> Result<()> + Send>;

/// Core trait for operation store implementations.
///
/// The store is the single source of truth for saga progress. Every write
/// after creation goes through [`compare_and_update`](Self::compare_and_update)
/// or [`record_step_result`](Self::record_step_result), both of which bump
/// the record version. All implementations must be thread-safe.
#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Creates a new operation in `RECEIVED` status.
    ///
    /// Fails with `AlreadyExists` if the id is taken.
    async fn create(
        &self,
        operation_id: OperationId,
        metadata: Metadata,
        file_paths: FilePaths,
    ) -> Result<Operation>;

    /// Retrieves an operation, failing with `NotFound` if it is unknown.
    async fn get(&self, operation_id: &OperationId) -> Result<Operation>;

    /// Applies `mutation` only if the stored version equals `expected_version`.
    ///
    /// Returns the updated operation, or `VersionConflict` if another writer
    /// got there first. The caller is expected to re-read and retry.
    async fn compare_and_update(
        &self,
        operation_id: &OperationId,
        expected_version: Version,
        mutation: Mutation,
    ) -> Result<Operation>;

    /// Idempotently records a step result.
    ///
    /// Returns true if the result was written, false if the step already had
    /// one. Terminal operations reject the write with `Immutable`.
    async fn record_step_result(
        &self,
        operation_id: &OperationId,
        step: &str,
        payload: serde_json::Value,
    ) -> Result<bool>;
}

/// Extension trait providing convenience methods for operation stores.
#[async_trait]
pub trait OperationStoreExt: OperationStore {
    /// Retrieves an operation, mapping `NotFound` to `None`.
    async fn find(&self, operation_id: &OperationId) -> Result<Option<Operation>> {
        match self.get(operation_id).await {
            Ok(operation) => Ok(Some(operation)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Creates an operation, returning the stored one if it already exists.
    ///
    /// The boolean is true when this call created the record.
    async fn create_or_get(
        &self,
        operation_id: OperationId,
        metadata: Metadata,
        file_paths: FilePaths,
    ) -> Result<(Operation, bool)> {
        match self.create(operation_id.clone(), metadata, file_paths).await {
            Ok(operation) => Ok((operation, true)),
            Err(StoreError::AlreadyExists(_)) => Ok((self.get(&operation_id).await?, false)),
            Err(e) => Err(e),
        }
    }
}

// Blanket implementation for all OperationStore implementations
impl<T: OperationStore + ?Sized> OperationStoreExt for T {}
