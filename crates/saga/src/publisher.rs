//! Command publisher trait and in-memory implementation.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::OperationId;

use crate::commands::OutboundCommand;
use crate::error::SagaError;

/// Delivers commands to their worker queues.
///
/// `publish` returns only once the broker has confirmed the message; an
/// error means the command may not have been delivered.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Publishes a command to the queue for its kind.
    async fn publish(&self, command: &OutboundCommand) -> Result<(), SagaError>;
}

#[derive(Debug, Default)]
struct InMemoryPublisherState {
    published: Vec<OutboundCommand>,
    fail_on_publish: bool,
}

/// In-memory command publisher for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCommandPublisher {
    state: Arc<RwLock<InMemoryPublisherState>>,
}

impl InMemoryCommandPublisher {
    /// Creates a new in-memory publisher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the publisher to reject every publish call.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_on_publish = fail;
    }

    /// Returns every published command, in order.
    pub fn published(&self) -> Vec<OutboundCommand> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .published
            .clone()
    }

    /// Returns the commands published for one operation.
    pub fn published_for(&self, operation_id: &OperationId) -> Vec<OutboundCommand> {
        self.published()
            .into_iter()
            .filter(|command| &command.operation_id == operation_id)
            .collect()
    }

    /// Returns the number of published commands.
    pub fn published_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .published
            .len()
    }
}

#[async_trait]
impl CommandPublisher for InMemoryCommandPublisher {
    async fn publish(&self, command: &OutboundCommand) -> Result<(), SagaError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        if state.fail_on_publish {
            return Err(SagaError::Publish {
                queue: command.kind().default_queue().to_string(),
                reason: "broker unavailable".to_string(),
            });
        }

        state.published.push(command.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandPayload;
    use crate::workflow::CommandKind;

    fn archive_command(id: &str) -> OutboundCommand {
        OutboundCommand {
            operation_id: OperationId::new(id).unwrap(),
            payload: CommandPayload::Archive { file_paths: vec![] },
        }
    }

    #[tokio::test]
    async fn test_publish_records_command() {
        let publisher = InMemoryCommandPublisher::new();
        publisher.publish(&archive_command("OP-1")).await.unwrap();
        publisher.publish(&archive_command("OP-2")).await.unwrap();

        assert_eq!(publisher.published_count(), 2);
        let for_op1 = publisher.published_for(&OperationId::new("OP-1").unwrap());
        assert_eq!(for_op1.len(), 1);
        assert_eq!(for_op1[0].kind(), CommandKind::Archive);
    }

    #[tokio::test]
    async fn test_fail_on_publish() {
        let publisher = InMemoryCommandPublisher::new();
        publisher.set_fail_on_publish(true);

        let result = publisher.publish(&archive_command("OP-1")).await;
        assert!(matches!(
            result,
            Err(SagaError::Publish { queue, .. }) if queue == "q.commands.archive.drive"
        ));
        assert_eq!(publisher.published_count(), 0);
    }
}
