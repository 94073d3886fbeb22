//! Operation status endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use operation_store::{OperationId, OperationStore};
use saga::{OperationStatusView, StatusQuery};

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S: OperationStore> {
    pub status_query: StatusQuery<S>,
}

impl<S: OperationStore> AppState<S> {
    pub fn new(store: S) -> Self {
        Self {
            status_query: StatusQuery::new(store),
        }
    }
}

/// GET /operations/{operation_id}/status
#[tracing::instrument(skip(state))]
pub async fn status<S: OperationStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(operation_id): Path<String>,
) -> Result<Json<OperationStatusView>, ApiError> {
    let id = OperationId::new(operation_id.as_str())
        .map_err(|_| ApiError::NotFound(format!("Operation not found: {operation_id}")))?;

    let view = state.status_query.get_status(&id).await?;
    Ok(Json(view))
}
