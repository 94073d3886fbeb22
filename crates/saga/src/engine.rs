//! The transition engine.
//!
//! [`decide`] is a pure function of the stored operation and an incoming
//! event. It performs no I/O; the dispatcher commits the returned
//! [`Transition`] through the store's compare-and-swap write.

use operation_store::{Mutation, Operation, OperationStatus, PendingCommand};
use serde_json::Value;

use crate::commands::OutboundCommand;
use crate::events::{IncomingEvent, Resolution};
use crate::workflow::Step;

/// Why an event is acknowledged without changing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// No operation with the event's id exists.
    UnknownOperation,
    /// The operation already reached `COMPLETED` or `FAILED`.
    Terminal,
    /// The step already has a recorded result.
    Duplicate,
}

impl DropReason {
    /// Returns a short label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::UnknownOperation => "unknown_operation",
            DropReason::Terminal => "terminal",
            DropReason::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The state change an event causes.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// The step being completed.
    pub step: Step,
    /// The status after the transition.
    pub next_status: OperationStatus,
    /// The payload recorded under `step`, absent on failure.
    pub result: Option<Value>,
    /// The failure message, present only when moving to `FAILED`.
    pub error_message: Option<String>,
    /// The command starting the next stage.
    pub command: Option<OutboundCommand>,
}

impl Transition {
    /// Converts the transition into a store mutation.
    ///
    /// The mutation re-checks the record invariants against the stored
    /// operation, and writes the command to the outbox in the same write.
    pub fn into_mutation(self) -> Mutation {
        Box::new(move |operation: &mut Operation| {
            if let Some(message) = self.error_message {
                return operation.fail(message);
            }

            if let Some(result) = self.result {
                operation.record_result(self.step.as_str(), result)?;
            }
            operation.advance_to(self.next_status)?;

            if let Some(command) = self.command {
                operation.set_pending_command(PendingCommand {
                    step: self.step.as_str().to_string(),
                    command: serde_json::to_value(&command)?,
                });
            }
            Ok(())
        })
    }
}

/// The engine's verdict on an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Acknowledge and do nothing.
    Drop(DropReason),
    /// The event arrived before its precondition; leave it for redelivery.
    Hold {
        expected: OperationStatus,
        actual: OperationStatus,
    },
    /// Commit the transition.
    Apply(Transition),
}

/// Decides what `event` does to `operation`.
///
/// Total over every combination of stored status and event: the rules are
/// checked in order (unknown, terminal, duplicate, out of order) before the
/// event's disposition is applied.
pub fn decide(operation: Option<&Operation>, event: &IncomingEvent) -> Decision {
    let Some(operation) = operation else {
        return Decision::Drop(DropReason::UnknownOperation);
    };

    if operation.status().is_terminal() {
        return Decision::Drop(DropReason::Terminal);
    }

    let stage = event.stage();
    if operation.has_result(stage.step.as_str()) {
        return Decision::Drop(DropReason::Duplicate);
    }

    if operation.status() != stage.expected {
        return Decision::Hold {
            expected: stage.expected,
            actual: operation.status(),
        };
    }

    let transition = match event.resolution() {
        Resolution::Fail(message) => Transition {
            step: stage.step,
            next_status: OperationStatus::Failed,
            result: None,
            error_message: Some(message),
            command: None,
        },
        Resolution::Record(result) => {
            let command = stage.command.map(|kind| {
                let mut results = operation.results().clone();
                results.insert(stage.step.as_str().to_string(), result.clone());
                OutboundCommand::build(kind, operation, &results)
            });
            Transition {
                step: stage.step,
                next_status: stage.next,
                result: Some(result),
                error_message: None,
                command,
            }
        }
    };

    Decision::Apply(transition)
}
