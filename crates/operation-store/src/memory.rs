use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    FilePaths, Metadata, Operation, OperationId, Result, StoreError, Version,
    store::{Mutation, OperationStore},
};

/// In-memory operation store for tests and single-process runs.
///
/// Provides the same compare-and-swap semantics as the PostgreSQL store:
/// the write lock is held across the version check and the write.
#[derive(Clone, Default)]
pub struct InMemoryOperationStore {
    operations: Arc<RwLock<HashMap<OperationId, Operation>>>,
}

impl InMemoryOperationStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored operations.
    pub async fn operation_count(&self) -> usize {
        self.operations.read().await.len()
    }

    /// Clears all operations.
    pub async fn clear(&self) {
        self.operations.write().await.clear();
    }
}

#[async_trait]
impl OperationStore for InMemoryOperationStore {
    async fn create(
        &self,
        operation_id: OperationId,
        metadata: Metadata,
        file_paths: FilePaths,
    ) -> Result<Operation> {
        let mut store = self.operations.write().await;
        if store.contains_key(&operation_id) {
            return Err(StoreError::AlreadyExists(operation_id));
        }

        let operation = Operation::new(operation_id.clone(), metadata, file_paths);
        store.insert(operation_id, operation.clone());
        metrics::counter!("operation_store_created_total").increment(1);
        Ok(operation)
    }

    async fn get(&self, operation_id: &OperationId) -> Result<Operation> {
        let store = self.operations.read().await;
        store
            .get(operation_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(operation_id.clone()))
    }

    async fn compare_and_update(
        &self,
        operation_id: &OperationId,
        expected_version: Version,
        mutation: Mutation,
    ) -> Result<Operation> {
        let mut store = self.operations.write().await;
        let stored = store
            .get_mut(operation_id)
            .ok_or_else(|| StoreError::NotFound(operation_id.clone()))?;

        if stored.version() != expected_version {
            return Err(StoreError::VersionConflict {
                operation_id: operation_id.clone(),
                expected: expected_version,
                actual: stored.version(),
            });
        }

        let mut updated = stored.clone();
        mutation(&mut updated)?;
        updated.touch();
        *stored = updated.clone();

        Ok(updated)
    }

    async fn record_step_result(
        &self,
        operation_id: &OperationId,
        step: &str,
        payload: serde_json::Value,
    ) -> Result<bool> {
        let mut store = self.operations.write().await;
        let stored = store
            .get_mut(operation_id)
            .ok_or_else(|| StoreError::NotFound(operation_id.clone()))?;

        let changed = stored.record_result(step, payload)?;
        if changed {
            stored.touch();
        }
        Ok(changed)
    }
}
