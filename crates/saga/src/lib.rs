//! Saga coordination for invoice operations.
//!
//! Integration workers report step outcomes as events on durable queues.
//! This crate turns each event into at most one committed transition of the
//! operation record and at most one command for the next worker:
//!
//! 1. [`IncomingEvent::parse`] validates the message at ingress
//! 2. [`engine::decide`] picks drop, hold or apply from the stored record
//! 3. the transition is committed through a compare-and-swap write, with the
//!    follow-up command stored in the same write
//! 4. the command is published and the message acknowledged
//!
//! Events are delivered at least once and possibly out of order; duplicates
//! and early arrivals are handled by the engine rather than by the broker.

pub mod commands;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod publisher;
pub mod status;
pub mod workflow;

pub use commands::{CardDetails, CommandPayload, OutboundCommand};
pub use dispatcher::{DeliveryOutcome, DispatcherConfig, EventDispatcher, Processed};
pub use engine::{Decision, DropReason, Transition, decide};
pub use error::{MalformedMessage, Result, SagaError};
pub use events::{
    CardCreated, Disposition, EmailSent, EventPayload, FilesArchived, IncomingEvent, Invoice,
    InvoicesParsed, InvoicesValidated, OperationReceived, Resolution, StepOutcome,
};
pub use publisher::{CommandPublisher, InMemoryCommandPublisher};
pub use status::{OperationStatusView, StatusQuery};
pub use workflow::{CommandKind, EventKind, STAGES, Stage, Step};
