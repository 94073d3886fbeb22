//! Coordinator entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use api::error::StartupError;
use api::routes::operations::AppState;
use broker::{AmqpCommandPublisher, ConnectionManager, EventSubscriber};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use operation_store::{InMemoryOperationStore, OperationStore, PostgresOperationStore};
use saga::EventDispatcher;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    // 1. Configuration and tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| StartupError::Metrics(e.to_string()))?;

    // 3. Pick the operation store
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(&url)
                .await?;
            let store = PostgresOperationStore::new(pool);
            store.run_migrations().await?;
            info!("using PostgreSQL operation store");
            run(config, store, metrics_handle).await
        }
        None => {
            warn!("DATABASE_URL not set, operations are kept in memory and lost on restart");
            run(config, InMemoryOperationStore::new(), metrics_handle).await
        }
    }
}

async fn run<S>(
    config: Config,
    store: S,
    metrics_handle: PrometheusHandle,
) -> Result<(), StartupError>
where
    S: OperationStore + Clone + 'static,
{
    // 4. Broker connection, dispatcher and one consumer per event queue
    let manager = ConnectionManager::connect(config.broker.url.as_str()).await?;
    let publisher = AmqpCommandPublisher::new(manager.clone(), config.broker.queues.clone());
    let dispatcher = Arc::new(EventDispatcher::new(
        store.clone(),
        publisher,
        config.dispatcher.clone(),
    ));
    let subscribers =
        EventSubscriber::new(manager.clone(), dispatcher, config.broker.clone()).spawn();
    info!(consumers = subscribers.len(), "event consumers started");

    // 5. HTTP status API
    let app = api::create_app(Arc::new(AppState::new(store)), metrics_handle);
    let addr = config.addr();
    info!(%addr, "starting coordinator");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. Let in-flight messages finish, then drop the broker connection
    subscribers.shutdown().await;
    if let Err(e) = manager.close().await {
        warn!(error = %e, "failed to close broker connection");
    }

    info!("coordinator shut down gracefully");
    Ok(())
}
