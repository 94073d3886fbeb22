use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    FilePaths, Metadata, Operation, OperationId, OperationStatus, PendingCommand, Result,
    StepResults, StoreError, Version,
    store::{Mutation, OperationStore},
};

const SELECT_COLUMNS: &str = "operation_id, status, metadata, file_paths, results, error_message, pending_command, version, created_at, updated_at";

/// PostgreSQL-backed operation store implementation.
#[derive(Clone)]
pub struct PostgresOperationStore {
    pool: PgPool,
}

impl PostgresOperationStore {
    /// Creates a new PostgreSQL operation store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_operation(row: PgRow) -> Result<Operation> {
        let operation_id: String = row.try_get("operation_id")?;
        let operation_id = OperationId::new(operation_id).map_err(|e| {
            StoreError::Serialization(serde_json::Error::io(std::io::Error::other(e)))
        })?;

        let status: String = row.try_get("status")?;
        let status: OperationStatus = status.parse().map_err(|e| {
            StoreError::Serialization(serde_json::Error::io(std::io::Error::other(e)))
        })?;

        let metadata: Metadata = serde_json::from_value(row.try_get("metadata")?)?;
        let file_paths: FilePaths = serde_json::from_value(row.try_get("file_paths")?)?;
        let results: StepResults = serde_json::from_value(row.try_get("results")?)?;
        let pending_command: Option<serde_json::Value> = row.try_get("pending_command")?;
        let pending_command: Option<PendingCommand> =
            pending_command.map(serde_json::from_value).transpose()?;

        Ok(Operation::from_parts(
            operation_id,
            status,
            metadata,
            file_paths,
            results,
            row.try_get("error_message")?,
            pending_command,
            Version::new(row.try_get("version")?),
            row.try_get("created_at")?,
            row.try_get("updated_at")?,
        ))
    }
}

#[async_trait]
impl OperationStore for PostgresOperationStore {
    #[tracing::instrument(skip(self, metadata, file_paths))]
    async fn create(
        &self,
        operation_id: OperationId,
        metadata: Metadata,
        file_paths: FilePaths,
    ) -> Result<Operation> {
        let operation = Operation::new(operation_id.clone(), metadata, file_paths);

        sqlx::query(
            r#"
            INSERT INTO operations (operation_id, status, metadata, file_paths, results, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(operation.id().as_str())
        .bind(operation.status().as_str())
        .bind(serde_json::to_value(operation.metadata())?)
        .bind(serde_json::to_value(operation.file_paths())?)
        .bind(serde_json::to_value(operation.results())?)
        .bind(operation.version().as_i64())
        .bind(operation.created_at())
        .bind(operation.updated_at())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StoreError::AlreadyExists(operation_id.clone());
            }
            StoreError::Database(e)
        })?;

        metrics::counter!("operation_store_created_total").increment(1);
        Ok(operation)
    }

    async fn get(&self, operation_id: &OperationId) -> Result<Operation> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM operations WHERE operation_id = $1"
        ))
        .bind(operation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_operation(row),
            None => Err(StoreError::NotFound(operation_id.clone())),
        }
    }

    #[tracing::instrument(skip(self, mutation))]
    async fn compare_and_update(
        &self,
        operation_id: &OperationId,
        expected_version: Version,
        mutation: Mutation,
    ) -> Result<Operation> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM operations WHERE operation_id = $1 FOR UPDATE"
        ))
        .bind(operation_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(operation_id.clone()))?;

        let mut operation = Self::row_to_operation(row)?;
        if operation.version() != expected_version {
            return Err(StoreError::VersionConflict {
                operation_id: operation_id.clone(),
                expected: expected_version,
                actual: operation.version(),
            });
        }

        mutation(&mut operation)?;
        operation.touch();

        let pending_command = operation
            .pending_command()
            .map(serde_json::to_value)
            .transpose()?;

        let updated = sqlx::query(
            r#"
            UPDATE operations
            SET status = $3, results = $4, error_message = $5, pending_command = $6,
                version = $7, updated_at = $8
            WHERE operation_id = $1 AND version = $2
            "#,
        )
        .bind(operation_id.as_str())
        .bind(expected_version.as_i64())
        .bind(operation.status().as_str())
        .bind(serde_json::to_value(operation.results())?)
        .bind(operation.error_message())
        .bind(pending_command)
        .bind(operation.version().as_i64())
        .bind(operation.updated_at())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::VersionConflict {
                operation_id: operation_id.clone(),
                expected: expected_version,
                actual: expected_version.next(),
            });
        }

        tx.commit().await?;
        Ok(operation)
    }

    #[tracing::instrument(skip(self, payload))]
    async fn record_step_result(
        &self,
        operation_id: &OperationId,
        step: &str,
        payload: serde_json::Value,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE operations
            SET results = results || jsonb_build_object($2::text, $3::jsonb),
                version = version + 1,
                updated_at = $4
            WHERE operation_id = $1
              AND NOT (results ? $2)
              AND status NOT IN ('COMPLETED', 'FAILED')
            "#,
        )
        .bind(operation_id.as_str())
        .bind(step)
        .bind(&payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }

        // Nothing written: tell apart unknown, terminal and already-recorded
        let operation = self.get(operation_id).await?;
        if operation.status().is_terminal() {
            return Err(StoreError::Immutable {
                status: operation.status(),
            });
        }
        Ok(false)
    }
}
