//! Event dispatcher: validates inbound events, runs the engine, commits the
//! result and publishes the follow-up command.
//!
//! Per message the order is fixed: parse, decide, compare-and-swap commit,
//! publish, then tell the broker to acknowledge. A message is only
//! acknowledged once its effects are durable.

use std::time::{Duration, Instant};

use operation_store::{Operation, OperationStatus, OperationStore, OperationStoreExt};

use crate::commands::OutboundCommand;
use crate::engine::{Decision, DropReason, decide};
use crate::error::{Result, SagaError};
use crate::events::{EventPayload, IncomingEvent};
use crate::publisher::CommandPublisher;
use crate::workflow::{CommandKind, EventKind};

/// Tuning for the dispatcher's retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Compare-and-swap attempts per message before giving up.
    pub max_cas_retries: u32,
    /// How long an out-of-order event waits before redelivery.
    pub hold_delay: Duration,
    /// How long a message waits before redelivery after a failure that is
    /// not an outage, such as exhausted compare-and-swap retries.
    pub retry_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: 5,
            hold_delay: Duration::from_millis(5000),
            retry_delay: Duration::from_millis(1000),
        }
    }
}

/// What processing an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// The transition was committed; `published` is the command sent, if any.
    Applied {
        status: OperationStatus,
        published: Option<CommandKind>,
    },
    /// The event changed nothing.
    Dropped(DropReason),
    /// The event arrived early and must be redelivered.
    Held {
        expected: OperationStatus,
        actual: OperationStatus,
    },
}

/// What the broker should do with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Acknowledge and remove from the queue.
    Ack,
    /// Return to the queue after `delay`.
    Requeue { delay: Duration },
    /// The store or the broker is unavailable. Keep the message and handle
    /// it again after backing off; this does not count as a redelivery.
    Retry,
}

/// Drives operations forward from inbound events.
pub struct EventDispatcher<S, P>
where
    S: OperationStore,
    P: CommandPublisher,
{
    store: S,
    publisher: P,
    config: DispatcherConfig,
}

impl<S, P> EventDispatcher<S, P>
where
    S: OperationStore,
    P: CommandPublisher,
{
    /// Creates a new dispatcher.
    pub fn new(store: S, publisher: P, config: DispatcherConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Returns the operation store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the dispatcher configuration.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Handles one raw message consumed from the queue of `kind`.
    ///
    /// Never fails: malformed messages are acknowledged and discarded,
    /// outages of the store or the broker ask for an in-place retry, and
    /// other processing errors are turned into a delayed requeue.
    #[tracing::instrument(skip(self, body), fields(event = %kind))]
    pub async fn handle_delivery(&self, kind: EventKind, body: &[u8]) -> DeliveryOutcome {
        let start = Instant::now();

        let event = match IncomingEvent::parse(kind, body) {
            Ok(event) => event,
            Err(e) => {
                metrics::counter!("coordinator_malformed_messages_total", "event" => kind.as_str())
                    .increment(1);
                tracing::warn!(error = %e, "discarding malformed message");
                return DeliveryOutcome::Ack;
            }
        };

        let operation_id = event.operation_id.clone();
        let (outcome, label) = match self.process(event).await {
            Ok(Processed::Applied { .. }) => (DeliveryOutcome::Ack, "applied"),
            Ok(Processed::Dropped(reason)) => (DeliveryOutcome::Ack, reason.as_str()),
            Ok(Processed::Held { .. }) => (
                DeliveryOutcome::Requeue {
                    delay: self.config.hold_delay,
                },
                "held",
            ),
            Err(e) if e.is_transient() => {
                tracing::warn!(%operation_id, error = %e, "dependency unavailable, will retry");
                (DeliveryOutcome::Retry, "unavailable")
            }
            Err(e) => {
                tracing::error!(%operation_id, error = %e, "event processing failed, will retry");
                (
                    DeliveryOutcome::Requeue {
                        delay: self.config.retry_delay,
                    },
                    "error",
                )
            }
        };

        metrics::counter!("coordinator_events_total", "event" => kind.as_str(), "outcome" => label)
            .increment(1);
        metrics::histogram!("coordinator_event_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        outcome
    }

    /// Processes one validated event.
    ///
    /// Conflicting writes are retried with a fresh read up to
    /// `max_cas_retries` times.
    #[tracing::instrument(
        skip(self, event),
        fields(operation_id = %event.operation_id, step = %event.step())
    )]
    pub async fn process(&self, event: IncomingEvent) -> Result<Processed> {
        if let EventPayload::OperationReceived(received) = &event.payload {
            let (_, created) = self
                .store
                .create_or_get(
                    event.operation_id.clone(),
                    received.metadata.clone(),
                    received.file_paths.clone(),
                )
                .await?;
            if created {
                tracing::info!(files = received.file_paths.len(), "operation created");
            }
        }

        for attempt in 1..=self.config.max_cas_retries {
            let operation = self.store.find(&event.operation_id).await?;
            let decision = decide(operation.as_ref(), &event);

            let (current, transition) = match (operation, decision) {
                (Some(current), Decision::Apply(transition)) => (current, transition),
                (current, Decision::Drop(reason)) => {
                    return self.dropped(current, &event, reason).await;
                }
                (_, Decision::Hold { expected, actual }) => {
                    tracing::info!(%expected, %actual, "event arrived out of order, holding");
                    return Ok(Processed::Held { expected, actual });
                }
                (None, Decision::Apply(_)) => {
                    return Ok(Processed::Dropped(DropReason::UnknownOperation));
                }
            };

            let next_status = transition.next_status;
            match self
                .store
                .compare_and_update(
                    &event.operation_id,
                    current.version(),
                    transition.into_mutation(),
                )
                .await
            {
                Ok(updated) => {
                    metrics::counter!("coordinator_transitions_total", "status" => next_status.as_str())
                        .increment(1);
                    tracing::info!(
                        from = %current.status(),
                        to = %next_status,
                        version = %updated.version(),
                        "transition committed"
                    );
                    let published = self.flush_outbox(updated).await?;
                    return Ok(Processed::Applied {
                        status: next_status,
                        published,
                    });
                }
                Err(e) if e.is_conflict() => {
                    metrics::counter!("coordinator_cas_conflicts_total").increment(1);
                    tracing::debug!(attempt, "version conflict, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!(
            attempts = self.config.max_cas_retries,
            "compare-and-swap retries exhausted"
        );
        Err(SagaError::RetriesExhausted {
            operation_id: event.operation_id.clone(),
            attempts: self.config.max_cas_retries,
        })
    }

    async fn dropped(
        &self,
        operation: Option<Operation>,
        event: &IncomingEvent,
        reason: DropReason,
    ) -> Result<Processed> {
        match reason {
            DropReason::UnknownOperation => {
                tracing::warn!("event for unknown operation, dropping");
            }
            DropReason::Terminal => {
                tracing::info!("operation already finished, dropping event");
            }
            DropReason::Duplicate => {
                tracing::info!("duplicate event, dropping");
                // The first delivery committed but never confirmed its publish.
                if let Some(operation) = operation
                    && operation
                        .pending_command()
                        .is_some_and(|p| p.step == event.step().as_str())
                {
                    tracing::warn!("re-publishing unconfirmed command from outbox");
                    self.flush_outbox(operation).await?;
                }
            }
        }
        Ok(Processed::Dropped(reason))
    }

    /// Publishes the operation's outbox entry, if any, then clears it.
    async fn flush_outbox(&self, operation: Operation) -> Result<Option<CommandKind>> {
        let Some(pending) = operation.pending_command().cloned() else {
            return Ok(None);
        };

        let command: OutboundCommand = serde_json::from_value(pending.command)?;
        self.publisher.publish(&command).await?;
        metrics::counter!("coordinator_commands_published_total", "command" => command.kind().as_str())
            .increment(1);
        tracing::info!(command = %command.kind(), "command published");

        self.clear_outbox(operation, pending.step).await;
        Ok(Some(command.kind()))
    }

    /// Best effort: a leftover entry only causes a re-publish if the event
    /// is delivered again.
    async fn clear_outbox(&self, mut operation: Operation, step: String) {
        for _ in 0..self.config.max_cas_retries {
            if !operation
                .pending_command()
                .is_some_and(|pending| pending.step == step)
            {
                return;
            }

            let owned_step = step.clone();
            let result = self
                .store
                .compare_and_update(
                    operation.id(),
                    operation.version(),
                    Box::new(move |op| {
                        op.clear_pending_command(&owned_step);
                        Ok(())
                    }),
                )
                .await;

            match result {
                Ok(_) => return,
                Err(e) if e.is_conflict() => match self.store.get(operation.id()).await {
                    Ok(fresh) => operation = fresh,
                    Err(e) => {
                        tracing::warn!(error = %e, "could not re-read operation to clear outbox");
                        return;
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "could not clear outbox");
                    return;
                }
            }
        }
        tracing::warn!("outbox left populated after repeated conflicts");
    }
}
