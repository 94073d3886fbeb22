//! AMQP connection manager.
//!
//! One connection is shared by every publisher and subscriber. When it drops,
//! the next caller asking for a channel reconnects it with exponential
//! backoff and jitter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use lapin::{
    Channel, Connection, ConnectionProperties,
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable},
};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{BrokerConfig, dead_letter_queue};
use crate::error::{BrokerError, Result};

/// Backoff between reconnect attempts.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Unbounded attempts
/// - Jitter enabled
pub fn reconnect_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(usize::MAX)
        .with_jitter()
}

/// Owns the broker connection: connect, reconnect with backoff, close.
pub struct ConnectionManager {
    url: String,
    connection: Mutex<Option<Arc<Connection>>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Creates a manager without connecting.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a manager and waits until the first connection succeeds.
    pub async fn connect(url: impl Into<String>) -> Result<Arc<Self>> {
        let manager = Arc::new(Self::new(url));
        manager.connection().await?;
        Ok(manager)
    }

    /// Returns true once [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the live connection, reconnecting if it dropped.
    pub async fn connection(&self) -> Result<Arc<Connection>> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref()
            && connection.status().connected()
        {
            return Ok(connection.clone());
        }

        let connection = Arc::new(self.reconnect().await?);
        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Opens a new channel on the live connection.
    pub async fn channel(&self) -> Result<Channel> {
        let connection = self.connection().await?;
        connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// Connects, retrying with backoff until it succeeds or the manager is
    /// closed.
    async fn reconnect(&self) -> Result<Connection> {
        let mut backoff = reconnect_backoff().build();

        loop {
            if self.is_closed() {
                return Err(BrokerError::Closed);
            }

            match Connection::connect(&self.url, ConnectionProperties::default()).await {
                Ok(connection) => {
                    metrics::counter!("broker_connections_total").increment(1);
                    info!("Connected to AMQP broker");
                    return Ok(connection);
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                    warn!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to connect to AMQP broker, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Closes the connection. Later calls fail with [`BrokerError::Closed`].
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);

        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection
            && connection.status().connected()
        {
            connection
                .close(200, "coordinator shutting down")
                .await
                .map_err(|e| BrokerError::Connection(format!("Failed to close: {}", e)))?;
            info!("AMQP connection closed");
        }
        Ok(())
    }
}

/// Declares a command queue: durable, classic.
pub async fn declare_command_queue(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Subscribe(format!("Failed to declare queue {}: {}", queue, e)))?;
    Ok(())
}

/// Declares an event queue and its dead-letter queue.
///
/// Event queues are quorum queues: the broker counts redeliveries and moves
/// a message to `<queue>.dlq` once it exceeds `delivery_limit`.
pub async fn declare_event_queue(channel: &Channel, queue: &str, config: &BrokerConfig) -> Result<()> {
    let dlq = dead_letter_queue(queue);
    declare_command_queue(channel, &dlq).await?;

    let mut args = FieldTable::default();
    args.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
    args.insert(
        "x-delivery-limit".into(),
        AMQPValue::LongInt(config.delivery_limit.min(i32::MAX as u32) as i32),
    );
    args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(dlq.as_str().into()),
    );

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await
        .map_err(|e| {
            error!(queue, error = %e, "Failed to declare event queue");
            BrokerError::Subscribe(format!("Failed to declare queue {}: {}", queue, e))
        })?;
    Ok(())
}
