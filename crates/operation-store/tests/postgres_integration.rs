//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p operation-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use operation_store::{
    FilePaths, Metadata, OperationId, OperationStatus, OperationStore, OperationStoreExt,
    PendingCommand, PostgresOperationStore, StoreError, Version,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_operations_table.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and an empty table
async fn get_test_store() -> PostgresOperationStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE operations")
        .execute(&pool)
        .await
        .unwrap();

    PostgresOperationStore::new(pool)
}

fn sample_inputs() -> (Metadata, FilePaths) {
    let mut metadata = Metadata::new();
    metadata.insert("user_email".into(), serde_json::json!("ops@example.com"));
    metadata.insert("tasa".into(), serde_json::json!(1.5));

    let mut files = FilePaths::new();
    files.insert("invoice.xml".into(), "gs://bucket/OP-1/invoice.xml".into());
    files.insert("invoice.pdf".into(), "gs://bucket/OP-1/invoice.pdf".into());
    (metadata, files)
}

#[tokio::test]
async fn create_and_get_operation() {
    let store = get_test_store().await;
    let id = OperationId::generate();
    let (metadata, files) = sample_inputs();

    let created = store.create(id.clone(), metadata, files).await.unwrap();
    assert_eq!(created.status(), OperationStatus::Received);
    assert_eq!(created.version(), Version::first());

    let loaded = store.get(&id).await.unwrap();
    assert_eq!(loaded.id(), &id);
    assert_eq!(loaded.status(), OperationStatus::Received);
    assert_eq!(loaded.file_paths().len(), 2);
    assert_eq!(
        loaded.metadata().get("user_email"),
        Some(&serde_json::json!("ops@example.com"))
    );
    assert!(loaded.results().is_empty());
    assert!(loaded.pending_command().is_none());
}

#[tokio::test]
async fn schema_has_only_lookup_indexes() {
    let info = get_container_info().await;
    let pool = PgPool::connect(&info.connection_string).await.unwrap();

    let indexes: Vec<String> = sqlx::query_scalar(
        "SELECT indexname::TEXT FROM pg_indexes WHERE tablename = 'operations' ORDER BY indexname",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    pool.close().await;

    // The outbox column is only read through the primary key.
    assert_eq!(indexes, vec!["idx_operations_status", "operations_pkey"]);
}

#[tokio::test]
async fn create_duplicate_is_rejected() {
    let store = get_test_store().await;
    let id = OperationId::generate();
    let (metadata, files) = sample_inputs();

    store
        .create(id.clone(), metadata.clone(), files.clone())
        .await
        .unwrap();
    let result = store.create(id.clone(), metadata, files).await;
    assert!(matches!(result, Err(StoreError::AlreadyExists(_))));

    let (existing, created) = store
        .create_or_get(id, Metadata::new(), FilePaths::new())
        .await
        .unwrap();
    assert!(!created);
    assert_eq!(existing.file_paths().len(), 2);
}

#[tokio::test]
async fn get_unknown_operation() {
    let store = get_test_store().await;
    let id = OperationId::new("OP-MISSING").unwrap();

    assert!(matches!(
        store.get(&id).await,
        Err(StoreError::NotFound(_))
    ));
    assert!(store.find(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn compare_and_update_persists_all_fields() {
    let store = get_test_store().await;
    let id = OperationId::generate();
    let (metadata, files) = sample_inputs();
    store.create(id.clone(), metadata, files).await.unwrap();

    let updated = store
        .compare_and_update(
            &id,
            Version::first(),
            Box::new(|op| {
                op.record_result("received", serde_json::json!({"file_roles": ["invoice.xml"]}))?;
                op.advance_to(OperationStatus::Parsing)?;
                op.set_pending_command(PendingCommand {
                    step: "received".into(),
                    command: serde_json::json!({"command": "parse"}),
                });
                Ok(())
            }),
        )
        .await
        .unwrap();
    assert_eq!(updated.version(), Version::new(2));

    let loaded = store.get(&id).await.unwrap();
    assert_eq!(loaded.status(), OperationStatus::Parsing);
    assert_eq!(loaded.version(), Version::new(2));
    assert!(loaded.has_result("received"));
    assert_eq!(
        loaded.pending_command().map(|p| p.step.as_str()),
        Some("received")
    );
}

#[tokio::test]
async fn compare_and_update_conflict() {
    let store = get_test_store().await;
    let id = OperationId::generate();
    let (metadata, files) = sample_inputs();
    store.create(id.clone(), metadata, files).await.unwrap();

    store
        .compare_and_update(
            &id,
            Version::first(),
            Box::new(|op| op.advance_to(OperationStatus::Parsing)),
        )
        .await
        .unwrap();

    let result = store
        .compare_and_update(&id, Version::first(), Box::new(|op| op.fail("stale")))
        .await;

    assert!(matches!(
        result,
        Err(StoreError::VersionConflict { actual, .. }) if actual == Version::new(2)
    ));
    let loaded = store.get(&id).await.unwrap();
    assert_eq!(loaded.status(), OperationStatus::Parsing);
    assert!(loaded.error_message().is_none());
}

#[tokio::test]
async fn failed_mutation_does_not_write() {
    let store = get_test_store().await;
    let id = OperationId::generate();
    let (metadata, files) = sample_inputs();
    store.create(id.clone(), metadata, files).await.unwrap();

    let result = store
        .compare_and_update(
            &id,
            Version::first(),
            Box::new(|op| op.advance_to(OperationStatus::Completed)),
        )
        .await;
    assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));

    let loaded = store.get(&id).await.unwrap();
    assert_eq!(loaded.version(), Version::first());
    assert_eq!(loaded.status(), OperationStatus::Received);
}

#[tokio::test]
async fn record_step_result_writes_once() {
    let store = get_test_store().await;
    let id = OperationId::generate();
    let (metadata, files) = sample_inputs();
    store.create(id.clone(), metadata, files).await.unwrap();

    assert!(
        store
            .record_step_result(&id, "parsing", serde_json::json!({"count": 1}))
            .await
            .unwrap()
    );
    assert!(
        !store
            .record_step_result(&id, "parsing", serde_json::json!({"count": 2}))
            .await
            .unwrap()
    );

    let loaded = store.get(&id).await.unwrap();
    assert_eq!(loaded.result("parsing"), Some(&serde_json::json!({"count": 1})));
    assert_eq!(loaded.version(), Version::new(2));
}

#[tokio::test]
async fn terminal_operation_rejects_results() {
    let store = get_test_store().await;
    let id = OperationId::generate();
    let (metadata, files) = sample_inputs();
    store.create(id.clone(), metadata, files).await.unwrap();

    store
        .compare_and_update(&id, Version::first(), Box::new(|op| op.fail("bad xml")))
        .await
        .unwrap();

    let result = store
        .record_step_result(&id, "parsing", serde_json::json!({}))
        .await;
    assert!(matches!(result, Err(StoreError::Immutable { .. })));

    let loaded = store.get(&id).await.unwrap();
    assert_eq!(loaded.status(), OperationStatus::Failed);
    assert_eq!(loaded.error_message(), Some("bad xml"));
    assert!(loaded.results().is_empty());
}

#[tokio::test]
async fn record_step_result_unknown_operation() {
    let store = get_test_store().await;
    let id = OperationId::new("OP-GHOST").unwrap();

    let result = store
        .record_step_result(&id, "parsing", serde_json::json!({}))
        .await;
    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn concurrent_cas_has_single_winner() {
    let store = get_test_store().await;
    let id = OperationId::generate();
    let (metadata, files) = sample_inputs();
    store.create(id.clone(), metadata, files).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        let store = store.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            store
                .compare_and_update(
                    &id,
                    Version::first(),
                    Box::new(move |op| {
                        op.record_result(&format!("writer-{i}"), serde_json::Value::Null)
                            .map(|_| ())
                    }),
                )
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) => assert!(e.is_conflict(), "unexpected error: {e}"),
        }
    }

    assert_eq!(successes, 1);
    let loaded = store.get(&id).await.unwrap();
    assert_eq!(loaded.results().len(), 1);
    assert_eq!(loaded.version(), Version::new(2));
}
