//! Read-only status query.

use chrono::{DateTime, Utc};
use common::OperationId;
use operation_store::{Operation, OperationStatus, OperationStore, StepResults, StoreError};
use serde::Serialize;

use crate::error::{Result, SagaError};

/// A snapshot of an operation's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationStatusView {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    pub results: StepResults,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Operation> for OperationStatusView {
    fn from(operation: &Operation) -> Self {
        Self {
            operation_id: operation.id().clone(),
            status: operation.status(),
            results: operation.results().clone(),
            error_message: operation.error_message().map(String::from),
            created_at: operation.created_at(),
            updated_at: operation.updated_at(),
        }
    }
}

/// Answers status queries straight from the operation store.
#[derive(Clone)]
pub struct StatusQuery<S: OperationStore> {
    store: S,
}

impl<S: OperationStore> StatusQuery<S> {
    /// Creates a new status query over `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns the current status of an operation.
    #[tracing::instrument(skip(self))]
    pub async fn get_status(&self, operation_id: &OperationId) -> Result<OperationStatusView> {
        match self.store.get(operation_id).await {
            Ok(operation) => Ok(OperationStatusView::from(&operation)),
            Err(StoreError::NotFound(id)) => Err(SagaError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}
