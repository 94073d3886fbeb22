//! Inbound events reported by the integration workers.
//!
//! Each event type is a closed, typed variant. Messages are validated once,
//! at ingress: anything that does not parse into an [`IncomingEvent`] is a
//! [`MalformedMessage`].

use std::str::FromStr;

use common::OperationId;
use operation_store::{FilePaths, Metadata};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

use crate::error::MalformedMessage;
use crate::workflow::{EventKind, Stage, Step};

/// How a worker reports the outcome of its step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    Success,
    Error,
    Skipped,
}

impl Disposition {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Success => "SUCCESS",
            Disposition::Error => "ERROR",
            Disposition::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Disposition {
    type Err = MalformedMessage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(Disposition::Success),
            "ERROR" => Ok(Disposition::Error),
            "SKIPPED" => Ok(Disposition::Skipped),
            _ => Err(MalformedMessage::UnknownStatus(s.to_string())),
        }
    }
}

/// The outcome of a worker step, with the step's result on success.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<T> {
    Success(T),
    Skipped { reason: Option<String> },
    Error { message: String },
}

impl<T> StepOutcome<T> {
    /// Returns the disposition of this outcome.
    pub fn disposition(&self) -> Disposition {
        match self {
            StepOutcome::Success(_) => Disposition::Success,
            StepOutcome::Skipped { .. } => Disposition::Skipped,
            StepOutcome::Error { .. } => Disposition::Error,
        }
    }
}

/// One invoice extracted from an XML file.
///
/// Every field is optional; fields the coordinator does not know about are
/// kept in `extra` and passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ruc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debtor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debtor_ruc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_amount",
        skip_serializing_if = "Option::is_none"
    )]
    pub total_amount: Option<f64>,
    #[serde(
        default,
        deserialize_with = "lenient_amount",
        skip_serializing_if = "Option::is_none"
    )]
    pub net_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Accepts amounts as JSON numbers or numeric strings ("1,500.00").
///
/// Anything else, including empty or unreadable strings, reads as no amount.
/// Amounts are informational, so a bad one never rejects the invoice.
fn lenient_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Amount {
        Number(f64),
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Option::<Amount>::deserialize(deserializer)? {
        Some(Amount::Number(value)) => Some(value),
        Some(Amount::Text(text)) => text.trim().replace(',', "").parse().ok(),
        Some(Amount::Other(_)) | None => None,
    })
}

/// A new operation accepted by the ingress layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationReceived {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(alias = "temp_file_paths")]
    pub file_paths: FilePaths,
}

/// Invoices extracted by the parser worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "InvoicesParsedWire")]
pub struct InvoicesParsed {
    pub parsed_invoices: Vec<Invoice>,
}

#[derive(Deserialize)]
struct InvoicesParsedWire {
    parsed_invoices: Option<Vec<Invoice>>,
    parsed_invoice_data: Option<Invoice>,
}

impl TryFrom<InvoicesParsedWire> for InvoicesParsed {
    type Error = String;

    fn try_from(wire: InvoicesParsedWire) -> Result<Self, Self::Error> {
        match (wire.parsed_invoices, wire.parsed_invoice_data) {
            (Some(parsed_invoices), _) => Ok(Self { parsed_invoices }),
            (None, Some(single)) => Ok(Self {
                parsed_invoices: vec![single],
            }),
            (None, None) => Err("missing field `parsed_invoices`".to_string()),
        }
    }
}

/// Registry validation results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoicesValidated {
    pub cavali_results: Value,
}

/// Files copied to the archive folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesArchived {
    pub drive_folder_url: String,
}

/// Confirmation email delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSent {
    pub sent_to: String,
}

/// Tracking card created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardCreated {
    pub trello_card_url: String,
}

/// The typed body of an inbound event, one variant per event type.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    OperationReceived(OperationReceived),
    InvoicesParsed(StepOutcome<InvoicesParsed>),
    InvoicesValidated(StepOutcome<InvoicesValidated>),
    FilesArchived(StepOutcome<FilesArchived>),
    EmailSent(StepOutcome<EmailSent>),
    CardCreated(StepOutcome<CardCreated>),
}

/// What applying an event does to the operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Record the payload under the step and advance.
    Record(Value),
    /// Move to `FAILED` with the message.
    Fail(String),
}

/// A validated inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEvent {
    pub operation_id: OperationId,
    pub payload: EventPayload,
}

impl IncomingEvent {
    /// Creates an event from an already typed payload.
    pub fn new(operation_id: OperationId, payload: EventPayload) -> Self {
        Self {
            operation_id,
            payload,
        }
    }

    /// Parses and validates a message body consumed from the queue of `kind`.
    pub fn parse(kind: EventKind, body: &[u8]) -> Result<Self, MalformedMessage> {
        let value: Value = serde_json::from_slice(body).map_err(MalformedMessage::InvalidJson)?;
        let Value::Object(fields) = value else {
            return Err(MalformedMessage::NotAnObject);
        };

        let operation_id = fields
            .get("operation_id")
            .and_then(Value::as_str)
            .and_then(|id| OperationId::new(id).ok())
            .ok_or(MalformedMessage::MissingOperationId)?;

        let payload = match kind {
            EventKind::OperationReceived => {
                EventPayload::OperationReceived(decode(kind, fields)?)
            }
            EventKind::InvoicesParsed => EventPayload::InvoicesParsed(outcome(kind, fields)?),
            EventKind::InvoicesValidated => {
                EventPayload::InvoicesValidated(outcome(kind, fields)?)
            }
            EventKind::FilesArchived => EventPayload::FilesArchived(outcome(kind, fields)?),
            EventKind::EmailSent => EventPayload::EmailSent(outcome(kind, fields)?),
            EventKind::CardCreated => EventPayload::CardCreated(outcome(kind, fields)?),
        };

        Ok(Self {
            operation_id,
            payload,
        })
    }

    /// Returns the event type.
    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::OperationReceived(_) => EventKind::OperationReceived,
            EventPayload::InvoicesParsed(_) => EventKind::InvoicesParsed,
            EventPayload::InvoicesValidated(_) => EventKind::InvoicesValidated,
            EventPayload::FilesArchived(_) => EventKind::FilesArchived,
            EventPayload::EmailSent(_) => EventKind::EmailSent,
            EventPayload::CardCreated(_) => EventKind::CardCreated,
        }
    }

    /// Returns the step this event reports on.
    pub fn step(&self) -> Step {
        self.kind().step()
    }

    /// Returns the workflow row for this event.
    pub fn stage(&self) -> &'static Stage {
        self.step().stage()
    }

    /// Returns the reported disposition. Ingress events always succeed.
    pub fn disposition(&self) -> Disposition {
        match &self.payload {
            EventPayload::OperationReceived(_) => Disposition::Success,
            EventPayload::InvoicesParsed(o) => o.disposition(),
            EventPayload::InvoicesValidated(o) => o.disposition(),
            EventPayload::FilesArchived(o) => o.disposition(),
            EventPayload::EmailSent(o) => o.disposition(),
            EventPayload::CardCreated(o) => o.disposition(),
        }
    }

    /// Returns what applying this event records.
    pub fn resolution(&self) -> Resolution {
        match &self.payload {
            EventPayload::OperationReceived(received) => {
                let roles: Vec<&String> = received.file_paths.keys().collect();
                Resolution::Record(json!({ "file_roles": roles }))
            }
            EventPayload::InvoicesParsed(o) => resolve(o, |p| {
                json!({ "parsed_invoices": p.parsed_invoices })
            }),
            EventPayload::InvoicesValidated(o) => {
                resolve(o, |p| json!({ "cavali_results": p.cavali_results }))
            }
            EventPayload::FilesArchived(o) => {
                resolve(o, |p| json!({ "drive_folder_url": p.drive_folder_url }))
            }
            EventPayload::EmailSent(o) => resolve(o, |p| json!({ "sent_to": p.sent_to })),
            EventPayload::CardCreated(o) => {
                resolve(o, |p| json!({ "trello_card_url": p.trello_card_url }))
            }
        }
    }
}

fn resolve<T>(outcome: &StepOutcome<T>, record: impl FnOnce(&T) -> Value) -> Resolution {
    match outcome {
        StepOutcome::Success(payload) => Resolution::Record(record(payload)),
        StepOutcome::Skipped { reason } => {
            Resolution::Record(json!({ "skipped": true, "reason": reason }))
        }
        StepOutcome::Error { message } => Resolution::Fail(message.clone()),
    }
}

fn decode<T: DeserializeOwned>(
    kind: EventKind,
    fields: Map<String, Value>,
) -> Result<T, MalformedMessage> {
    serde_json::from_value(Value::Object(fields))
        .map_err(|source| MalformedMessage::InvalidPayload { event: kind, source })
}

fn outcome<T: DeserializeOwned>(
    kind: EventKind,
    fields: Map<String, Value>,
) -> Result<StepOutcome<T>, MalformedMessage> {
    let status = fields.get("status").ok_or(MalformedMessage::MissingStatus)?;
    let disposition: Disposition = status
        .as_str()
        .ok_or_else(|| MalformedMessage::UnknownStatus(status.to_string()))?
        .parse()?;

    match disposition {
        Disposition::Success => decode(kind, fields).map(StepOutcome::Success),
        // The validator reports a disabled registry in its results field.
        Disposition::Skipped => Ok(StepOutcome::Skipped {
            reason: text_field(&fields, "message")
                .or_else(|| text_field(&fields, "cavali_results")),
        }),
        Disposition::Error => {
            let message = text_field(&fields, "error_message")
                .unwrap_or_else(|| format!("{} step failed", kind.step()));
            let message = match text_field(&fields, "source_service") {
                Some(source) => format!("{source}: {message}"),
                None => message,
            };
            Ok(StepOutcome::Error { message })
        }
    }
}

fn text_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(kind: EventKind, value: Value) -> Result<IncomingEvent, MalformedMessage> {
        IncomingEvent::parse(kind, value.to_string().as_bytes())
    }

    #[test]
    fn test_parse_operation_received() {
        let event = parse(
            EventKind::OperationReceived,
            json!({
                "operation_id": "OP-1",
                "metadata": {"user_email": "a@b.pe"},
                "temp_file_paths": {"invoice.xml": "/tmp/a.xml", "invoice.pdf": "/tmp/a.pdf"}
            }),
        )
        .unwrap();

        assert_eq!(event.operation_id.as_str(), "OP-1");
        assert_eq!(event.kind(), EventKind::OperationReceived);
        assert_eq!(event.disposition(), Disposition::Success);
        let EventPayload::OperationReceived(received) = &event.payload else {
            panic!("wrong payload");
        };
        assert_eq!(received.file_paths.len(), 2);
        assert_eq!(
            event.resolution(),
            Resolution::Record(json!({"file_roles": ["invoice.pdf", "invoice.xml"]}))
        );
    }

    #[test]
    fn test_parse_invoices_parsed_with_lenient_amounts() {
        let event = parse(
            EventKind::InvoicesParsed,
            json!({
                "operation_id": "OP-1",
                "status": "SUCCESS",
                "parsed_invoices": [
                    {"document_id": "F001-1", "currency": "PEN", "total_amount": "1,500.50", "series": "F001"},
                    {"document_id": "F001-2", "currency": "USD", "total_amount": 200}
                ]
            }),
        )
        .unwrap();

        let EventPayload::InvoicesParsed(StepOutcome::Success(parsed)) = &event.payload else {
            panic!("wrong payload");
        };
        assert_eq!(parsed.parsed_invoices.len(), 2);
        assert_eq!(parsed.parsed_invoices[0].total_amount, Some(1500.5));
        assert_eq!(parsed.parsed_invoices[1].total_amount, Some(200.0));
        assert_eq!(
            parsed.parsed_invoices[0].extra.get("series"),
            Some(&json!("F001"))
        );
    }

    #[test]
    fn test_unreadable_amounts_are_dropped() {
        let event = parse(
            EventKind::InvoicesParsed,
            json!({
                "operation_id": "OP-1",
                "status": "SUCCESS",
                "parsed_invoices": [
                    {"document_id": "F001-1", "total_amount": "", "net_amount": "N/A"},
                    {"document_id": "F001-2", "total_amount": true, "net_amount": null}
                ]
            }),
        )
        .unwrap();

        let EventPayload::InvoicesParsed(StepOutcome::Success(parsed)) = &event.payload else {
            panic!("wrong payload");
        };
        assert_eq!(parsed.parsed_invoices.len(), 2);
        assert!(
            parsed
                .parsed_invoices
                .iter()
                .all(|invoice| invoice.total_amount.is_none() && invoice.net_amount.is_none())
        );
        assert_eq!(parsed.parsed_invoices[0].document_id.as_deref(), Some("F001-1"));
    }

    #[test]
    fn test_parse_single_invoice_alias() {
        let event = parse(
            EventKind::InvoicesParsed,
            json!({
                "operation_id": "OP-1",
                "status": "SUCCESS",
                "parsed_invoice_data": {"document_id": "F001-9"}
            }),
        )
        .unwrap();

        let EventPayload::InvoicesParsed(StepOutcome::Success(parsed)) = &event.payload else {
            panic!("wrong payload");
        };
        assert_eq!(parsed.parsed_invoices.len(), 1);
        assert_eq!(parsed.parsed_invoices[0].document_id.as_deref(), Some("F001-9"));
    }

    #[test]
    fn test_error_message_with_source_service() {
        let event = parse(
            EventKind::InvoicesParsed,
            json!({
                "operation_id": "OP-1",
                "status": "ERROR",
                "error_message": "bad xml",
                "source_service": "parser"
            }),
        )
        .unwrap();

        assert_eq!(event.disposition(), Disposition::Error);
        assert_eq!(event.resolution(), Resolution::Fail("parser: bad xml".into()));
    }

    #[test]
    fn test_error_without_message_names_step() {
        let event = parse(
            EventKind::FilesArchived,
            json!({"operation_id": "OP-1", "status": "ERROR"}),
        )
        .unwrap();
        assert_eq!(
            event.resolution(),
            Resolution::Fail("archiving step failed".into())
        );
    }

    #[test]
    fn test_skipped_records_reason() {
        let event = parse(
            EventKind::InvoicesValidated,
            json!({"operation_id": "OP-1", "status": "skipped", "message": "registry offline"}),
        )
        .unwrap();

        assert_eq!(event.disposition(), Disposition::Skipped);
        assert_eq!(
            event.resolution(),
            Resolution::Record(json!({"skipped": true, "reason": "registry offline"}))
        );
    }

    #[test]
    fn test_skipped_reason_falls_back_to_results_text() {
        let event = parse(
            EventKind::InvoicesValidated,
            json!({"operation_id": "OP-1", "status": "SKIPPED", "cavali_results": "Service disabled"}),
        )
        .unwrap();
        assert_eq!(
            event.resolution(),
            Resolution::Record(json!({"skipped": true, "reason": "Service disabled"}))
        );

        let event = parse(
            EventKind::InvoicesValidated,
            json!({"operation_id": "OP-1", "status": "SKIPPED", "cavali_results": {"checked": 0}}),
        )
        .unwrap();
        assert_eq!(
            event.resolution(),
            Resolution::Record(json!({"skipped": true, "reason": null}))
        );
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(
            IncomingEvent::parse(EventKind::EmailSent, b"{not json"),
            Err(MalformedMessage::InvalidJson(_))
        ));
        assert!(matches!(
            parse(EventKind::EmailSent, json!(["OP-1"])),
            Err(MalformedMessage::NotAnObject)
        ));
        assert!(matches!(
            parse(EventKind::EmailSent, json!({"status": "SUCCESS", "sent_to": "x"})),
            Err(MalformedMessage::MissingOperationId)
        ));
        assert!(matches!(
            parse(EventKind::EmailSent, json!({"operation_id": "  ", "status": "SUCCESS"})),
            Err(MalformedMessage::MissingOperationId)
        ));
        assert!(matches!(
            parse(EventKind::EmailSent, json!({"operation_id": "OP-1", "sent_to": "x"})),
            Err(MalformedMessage::MissingStatus)
        ));
        assert!(matches!(
            parse(EventKind::EmailSent, json!({"operation_id": "OP-1", "status": "DONE"})),
            Err(MalformedMessage::UnknownStatus(_))
        ));
        assert!(matches!(
            parse(EventKind::EmailSent, json!({"operation_id": "OP-1", "status": "SUCCESS"})),
            Err(MalformedMessage::InvalidPayload { event: EventKind::EmailSent, .. })
        ));
        assert!(matches!(
            parse(EventKind::OperationReceived, json!({"operation_id": "OP-1"})),
            Err(MalformedMessage::InvalidPayload { .. })
        ));
        assert!(matches!(
            parse(EventKind::InvoicesParsed, json!({"operation_id": "OP-1", "status": "SUCCESS"})),
            Err(MalformedMessage::InvalidPayload { .. })
        ));
    }
}
