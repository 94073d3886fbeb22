//! The invoice operation workflow table.
//!
//! Every stage of the workflow is one row of [`STAGES`]: the step whose
//! result it records, the event that reports it, the status the operation
//! must be in, the status it moves to, and the command that starts the next
//! stage.
//!
//! ```text
//! OperationReceived  RECEIVED      ──► PARSING        Parse
//! InvoicesParsed     PARSING       ──► VALIDATING     Validate
//! InvoicesValidated  VALIDATING    ──► ARCHIVING      Archive
//! FilesArchived      ARCHIVING     ──► NOTIFYING      Notify
//! EmailSent          NOTIFYING     ──► CARD_CREATING  CreateCard
//! CardCreated        CARD_CREATING ──► COMPLETED      -
//! ```

use operation_store::OperationStatus;
use serde::{Deserialize, Serialize};

/// A workflow step, used as the key of the operation's `results` map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Received,
    Parsing,
    Validating,
    Archiving,
    Notifying,
    CardCreating,
}

impl Step {
    /// Returns the results key for this step.
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Received => "received",
            Step::Parsing => "parsing",
            Step::Validating => "validating",
            Step::Archiving => "archiving",
            Step::Notifying => "notifying",
            Step::CardCreating => "card_creating",
        }
    }

    /// Returns the workflow row for this step.
    pub fn stage(&self) -> &'static Stage {
        &STAGES[*self as usize]
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inbound event types, one durable queue each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    OperationReceived,
    InvoicesParsed,
    InvoicesValidated,
    FilesArchived,
    EmailSent,
    CardCreated,
}

impl EventKind {
    /// Every event type, in workflow order.
    pub const ALL: [EventKind; 6] = [
        EventKind::OperationReceived,
        EventKind::InvoicesParsed,
        EventKind::InvoicesValidated,
        EventKind::FilesArchived,
        EventKind::EmailSent,
        EventKind::CardCreated,
    ];

    /// Returns the event type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OperationReceived => "OperationReceived",
            EventKind::InvoicesParsed => "InvoicesParsed",
            EventKind::InvoicesValidated => "InvoicesValidated",
            EventKind::FilesArchived => "FilesArchived",
            EventKind::EmailSent => "EmailSent",
            EventKind::CardCreated => "CardCreated",
        }
    }

    /// Returns the queue this event is consumed from unless overridden.
    pub fn default_queue(&self) -> &'static str {
        match self {
            EventKind::OperationReceived => "q.operations.received",
            EventKind::InvoicesParsed => "q.events.invoices.parsed",
            EventKind::InvoicesValidated => "q.events.cavali.validated",
            EventKind::FilesArchived => "q.events.drive.archived",
            EventKind::EmailSent => "q.events.gmail.sent",
            EventKind::CardCreated => "q.events.trello.created",
        }
    }

    /// Returns the step this event reports on.
    pub fn step(&self) -> Step {
        match self {
            EventKind::OperationReceived => Step::Received,
            EventKind::InvoicesParsed => Step::Parsing,
            EventKind::InvoicesValidated => Step::Validating,
            EventKind::FilesArchived => Step::Archiving,
            EventKind::EmailSent => Step::Notifying,
            EventKind::CardCreated => Step::CardCreating,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outbound command types, one durable queue each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Parse,
    Validate,
    Archive,
    Notify,
    CreateCard,
}

impl CommandKind {
    /// Every command type, in workflow order.
    pub const ALL: [CommandKind; 5] = [
        CommandKind::Parse,
        CommandKind::Validate,
        CommandKind::Archive,
        CommandKind::Notify,
        CommandKind::CreateCard,
    ];

    /// Returns the command type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Parse => "Parse",
            CommandKind::Validate => "Validate",
            CommandKind::Archive => "Archive",
            CommandKind::Notify => "Notify",
            CommandKind::CreateCard => "CreateCard",
        }
    }

    /// Returns the queue this command is published to unless overridden.
    pub fn default_queue(&self) -> &'static str {
        match self {
            CommandKind::Parse => "q.commands.parse.xml",
            CommandKind::Validate => "q.commands.validate.cavali",
            CommandKind::Archive => "q.commands.archive.drive",
            CommandKind::Notify => "q.commands.notify.gmail",
            CommandKind::CreateCard => "q.commands.card.trello",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the workflow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    /// The step whose result this stage records.
    pub step: Step,
    /// The event reporting the step's outcome.
    pub event: EventKind,
    /// The status the operation must be in for the event to apply.
    pub expected: OperationStatus,
    /// The status after a successful or skipped step.
    pub next: OperationStatus,
    /// The command that starts the next stage, if any.
    pub command: Option<CommandKind>,
}

/// The workflow table, indexed by [`Step`].
pub static STAGES: [Stage; 6] = [
    Stage {
        step: Step::Received,
        event: EventKind::OperationReceived,
        expected: OperationStatus::Received,
        next: OperationStatus::Parsing,
        command: Some(CommandKind::Parse),
    },
    Stage {
        step: Step::Parsing,
        event: EventKind::InvoicesParsed,
        expected: OperationStatus::Parsing,
        next: OperationStatus::Validating,
        command: Some(CommandKind::Validate),
    },
    Stage {
        step: Step::Validating,
        event: EventKind::InvoicesValidated,
        expected: OperationStatus::Validating,
        next: OperationStatus::Archiving,
        command: Some(CommandKind::Archive),
    },
    Stage {
        step: Step::Archiving,
        event: EventKind::FilesArchived,
        expected: OperationStatus::Archiving,
        next: OperationStatus::Notifying,
        command: Some(CommandKind::Notify),
    },
    Stage {
        step: Step::Notifying,
        event: EventKind::EmailSent,
        expected: OperationStatus::Notifying,
        next: OperationStatus::CardCreating,
        command: Some(CommandKind::CreateCard),
    },
    Stage {
        step: Step::CardCreating,
        event: EventKind::CardCreated,
        expected: OperationStatus::CardCreating,
        next: OperationStatus::Completed,
        command: None,
    },
];
