//! Event consumers.
//!
//! One task per event type consumes its queue and hands every delivery to the
//! [`EventDispatcher`]. Messages of one queue are processed one at a time;
//! queues are independent of each other.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures_util::StreamExt;
use lapin::{
    Consumer,
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
};
use operation_store::OperationStore;
use saga::{CommandPublisher, DeliveryOutcome, EventDispatcher, EventKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::connection::{ConnectionManager, declare_event_queue, reconnect_backoff};
use crate::error::{BrokerError, Result};

/// Delays between in-place retries of one message while the store or the
/// broker is down.
///
/// Starts over for every message. Retries in place are not redeliveries, so
/// they never count toward the queue's delivery limit.
pub struct OutageBackoff {
    delays: ExponentialBackoff,
    max_delay: Duration,
}

impl OutageBackoff {
    pub fn new(builder: ExponentialBuilder, max_delay: Duration) -> Self {
        Self {
            delays: builder.build(),
            max_delay,
        }
    }

    /// Returns the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.delays.next().unwrap_or(self.max_delay)
    }
}

impl Default for OutageBackoff {
    fn default() -> Self {
        Self::new(reconnect_backoff(), Duration::from_secs(30))
    }
}

/// Consumes every event queue and feeds the dispatcher.
pub struct EventSubscriber<S, P>
where
    S: OperationStore,
    P: CommandPublisher,
{
    manager: Arc<ConnectionManager>,
    dispatcher: Arc<EventDispatcher<S, P>>,
    config: BrokerConfig,
}

/// Running consumer tasks.
pub struct SubscriberHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriberHandle {
    /// Number of running consumer tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stops consuming and waits for in-flight messages to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Consumer task panicked");
            }
        }
        info!("Event consumers stopped");
    }
}

impl<S, P> EventSubscriber<S, P>
where
    S: OperationStore + 'static,
    P: CommandPublisher + 'static,
{
    /// Creates a subscriber.
    pub fn new(
        manager: Arc<ConnectionManager>,
        dispatcher: Arc<EventDispatcher<S, P>>,
        config: BrokerConfig,
    ) -> Self {
        Self {
            manager,
            dispatcher,
            config,
        }
    }

    /// Spawns one consumer task per event type.
    pub fn spawn(self) -> SubscriberHandle {
        let (shutdown, receiver) = watch::channel(false);
        let subscriber = Arc::new(self);

        let tasks = EventKind::ALL
            .iter()
            .map(|kind| {
                let subscriber = subscriber.clone();
                let receiver = receiver.clone();
                let kind = *kind;
                tokio::spawn(async move { subscriber.consume(kind, receiver).await })
            })
            .collect();

        SubscriberHandle { shutdown, tasks }
    }

    /// Consumer loop for one queue, reconnecting with backoff until shutdown.
    async fn consume(&self, kind: EventKind, mut shutdown: watch::Receiver<bool>) {
        let queue = self.config.queues.event_queue(kind).to_string();
        let backoff_builder = reconnect_backoff();
        let mut backoff_iter = backoff_builder.build();

        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.setup_consumer(kind, &queue).await {
                Ok(mut consumer) => {
                    info!(queue = %queue, event = %kind, "Consumer connected, processing messages");
                    backoff_iter = backoff_builder.build();

                    loop {
                        if *shutdown.borrow() {
                            info!(queue = %queue, "Consumer stopping");
                            return;
                        }

                        let next = tokio::select! {
                            _ = shutdown.changed() => {
                                info!(queue = %queue, "Consumer stopping");
                                return;
                            }
                            next = consumer.next() => next,
                        };

                        match next {
                            Some(Ok(delivery)) => {
                                self.process_delivery(kind, delivery, &mut shutdown).await
                            }
                            Some(Err(e)) => {
                                error!(queue = %queue, error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                            None => {
                                info!(queue = %queue, "Consumer stream ended, reconnecting...");
                                break;
                            }
                        }
                    }
                }
                Err(BrokerError::Closed) => return,
                Err(e) => {
                    error!(queue = %queue, error = %e, "Failed to set up consumer");
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            warn!(queue = %queue, backoff_ms = %delay.as_millis(), "Retrying consumer after backoff");
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn setup_consumer(&self, kind: EventKind, queue: &str) -> Result<Consumer> {
        let channel = self.manager.channel().await?;

        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        declare_event_queue(&channel, queue, &self.config).await?;

        let tag = format!("coordinator-{}-{}", kind.as_str(), Uuid::new_v4().simple());
        channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to start consumer: {}", e)))
    }

    async fn process_delivery(
        &self,
        kind: EventKind,
        delivery: Delivery,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut backoff = OutageBackoff::default();

        loop {
            match self.dispatcher.handle_delivery(kind, &delivery.data).await {
                DeliveryOutcome::Ack => {
                    if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                        error!(error = %e, "Failed to ack message");
                    }
                    return;
                }
                DeliveryOutcome::Requeue { delay } => {
                    debug!(event = %kind, delay_ms = %delay.as_millis(), "Requeueing message");
                    let acker = delivery.acker.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if let Err(e) = acker.nack(requeue()).await {
                            error!(error = %e, "Failed to requeue message");
                        }
                    });
                    return;
                }
                DeliveryOutcome::Retry => {
                    let delay = backoff.next_delay();
                    warn!(event = %kind, backoff_ms = %delay.as_millis(), "Dependency unavailable, retrying message");
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if let Err(e) = delivery.acker.nack(requeue()).await {
                                error!(error = %e, "Failed to requeue message");
                            }
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

fn requeue() -> BasicNackOptions {
    BasicNackOptions {
        multiple: false,
        requeue: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outage_backoff_grows_across_failures() {
        let builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_max_times(usize::MAX);
        let mut backoff = OutageBackoff::new(builder, Duration::from_secs(30));

        let delays: Vec<Duration> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert!(delays.windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[test]
    fn test_outage_backoff_is_capped() {
        let mut backoff = OutageBackoff::default();

        let delays: Vec<Duration> = (0..30).map(|_| backoff.next_delay()).collect();
        assert!(delays[10] > delays[0]);
        // Jitter adds at most one more base delay.
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
    }

    #[test]
    fn test_outage_backoff_falls_back_to_max_delay() {
        let builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_times(1);
        let mut backoff = OutageBackoff::new(builder, Duration::from_secs(30));

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }
}
