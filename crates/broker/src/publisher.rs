//! Command publisher backed by AMQP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use lapin::{
    BasicProperties, Channel,
    options::{BasicPublishOptions, ConfirmSelectOptions},
};
use saga::{CommandPublisher, OutboundCommand, SagaError};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::config::QueueTopology;
use crate::connection::{ConnectionManager, declare_command_queue};
use crate::error::{BrokerError, Result};

const MAX_RETRIES: usize = 5;

/// Publishes commands as persistent JSON messages on the default exchange,
/// routed by queue name.
///
/// Uses a single confirm-mode channel, reopened when it drops. A publish only
/// succeeds once the broker has acknowledged the message.
pub struct AmqpCommandPublisher {
    manager: Arc<ConnectionManager>,
    queues: QueueTopology,
    channel: Mutex<Option<Channel>>,
}

impl AmqpCommandPublisher {
    /// Creates a publisher. The channel is opened on first use.
    pub fn new(manager: Arc<ConnectionManager>, queues: QueueTopology) -> Self {
        Self {
            manager,
            queues,
            channel: Mutex::new(None),
        }
    }

    /// Returns the queue topology commands are routed with.
    pub fn queues(&self) -> &QueueTopology {
        &self.queues
    }

    async fn channel(&self) -> Result<Channel> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref()
            && channel.status().connected()
        {
            return Ok(channel.clone());
        }

        let channel = self.manager.channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to enable confirms: {}", e)))?;

        for (_, queue) in self.queues.command_queues() {
            declare_command_queue(&channel, queue).await?;
        }

        *guard = Some(channel.clone());
        Ok(channel)
    }

    async fn discard_channel(&self) {
        self.channel.lock().await.take();
    }

    async fn try_publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let channel = self.channel().await?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        let confirmation = channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;

        if confirmation.is_nack() {
            return Err(BrokerError::Publish(format!(
                "Broker rejected message for {}",
                queue
            )));
        }
        Ok(())
    }

    /// Publishes `body` to `queue`, retrying with backoff.
    #[tracing::instrument(skip(self, body), fields(bytes = body.len()))]
    pub async fn publish_bytes(&self, queue: &str, body: &[u8]) -> Result<()> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_RETRIES)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self.try_publish(queue, body).await {
                Ok(()) => {
                    debug!(queue, "Published command");
                    return Ok(());
                }
                Err(BrokerError::Closed) => return Err(BrokerError::Closed),
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                    self.discard_channel().await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BrokerError::Publish("Max retries exceeded".to_string())))
    }
}

#[async_trait]
impl CommandPublisher for AmqpCommandPublisher {
    async fn publish(&self, command: &OutboundCommand) -> std::result::Result<(), SagaError> {
        let queue = self.queues.command_queue(command.kind());
        let body = command.to_bytes()?;

        self.publish_bytes(queue, &body)
            .await
            .map_err(|e| SagaError::Publish {
                queue: queue.to_string(),
                reason: e.to_string(),
            })
    }
}
