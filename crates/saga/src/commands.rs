//! Outbound commands sent to the integration workers.
//!
//! Command construction is pure: it reads the operation's metadata, file
//! paths and step results and nothing else.

use std::collections::BTreeMap;

use common::OperationId;
use operation_store::{FilePaths, Metadata, Operation, StepResults};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::Invoice;
use crate::workflow::{CommandKind, STAGES, Step};

/// Details the card worker needs to build the tracking card.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardDetails {
    pub operation_id: String,
    pub client_name: Option<String>,
    /// Debtor tax id mapped to debtor name.
    pub debtors_info: BTreeMap<String, String>,
    /// Currency mapped to the summed invoice totals.
    pub operation_amounts: BTreeMap<String, f64>,
    pub tasa: Value,
    pub comision: Value,
    pub initials: String,
    pub drive_folder_url: Option<String>,
    /// Reasons of every skipped step.
    pub errors: Vec<String>,
}

/// The per-command fields, tagged with the command name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum CommandPayload {
    Parse {
        xml_file_paths: Vec<String>,
    },
    Validate {
        xml_file_paths: Vec<String>,
    },
    Archive {
        file_paths: Vec<String>,
    },
    Notify {
        recipient_email: String,
        email_subject: String,
        invoices_data: Vec<Invoice>,
        attachment_paths: Vec<String>,
    },
    CreateCard {
        card_details: CardDetails,
    },
}

/// A command addressed to one worker queue.
///
/// Serializes as `{"operation_id": .., "command": .., <fields>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundCommand {
    pub operation_id: OperationId,
    #[serde(flatten)]
    pub payload: CommandPayload,
}

impl OutboundCommand {
    /// Returns the command type.
    pub fn kind(&self) -> CommandKind {
        match &self.payload {
            CommandPayload::Parse { .. } => CommandKind::Parse,
            CommandPayload::Validate { .. } => CommandKind::Validate,
            CommandPayload::Archive { .. } => CommandKind::Archive,
            CommandPayload::Notify { .. } => CommandKind::Notify,
            CommandPayload::CreateCard { .. } => CommandKind::CreateCard,
        }
    }

    /// Serializes the command into a message body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Builds the `kind` command for `operation`, reading step results from
    /// `results` (which may already include the step being applied).
    pub fn build(kind: CommandKind, operation: &Operation, results: &StepResults) -> Self {
        let file_paths = operation.file_paths();
        let payload = match kind {
            CommandKind::Parse => CommandPayload::Parse {
                xml_file_paths: xml_paths(file_paths),
            },
            CommandKind::Validate => CommandPayload::Validate {
                xml_file_paths: xml_paths(file_paths),
            },
            CommandKind::Archive => CommandPayload::Archive {
                file_paths: file_paths.values().cloned().collect(),
            },
            CommandKind::Notify => CommandPayload::Notify {
                recipient_email: recipients(operation.metadata()),
                email_subject: format!("Invoice confirmation - operation {}", operation.id()),
                invoices_data: parsed_invoices(results),
                attachment_paths: file_paths.values().cloned().collect(),
            },
            CommandKind::CreateCard => CommandPayload::CreateCard {
                card_details: card_details(operation, results),
            },
        };

        Self {
            operation_id: operation.id().clone(),
            payload,
        }
    }
}

fn xml_paths(file_paths: &FilePaths) -> Vec<String> {
    file_paths
        .iter()
        .filter(|(role, path)| {
            role.to_ascii_lowercase().ends_with(".xml")
                || path.to_ascii_lowercase().ends_with(".xml")
        })
        .map(|(_, path)| path.clone())
        .collect()
}

fn metadata_str<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// `correos` is a comma or semicolon separated list; `user_email` is the
/// fallback.
fn recipients(metadata: &Metadata) -> String {
    let listed: Vec<&str> = metadata_str(metadata, "correos")
        .map(|list| {
            list.split([',', ';'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if listed.is_empty() {
        metadata_str(metadata, "user_email")
            .unwrap_or_default()
            .to_string()
    } else {
        listed.join(", ")
    }
}

fn parsed_invoices(results: &StepResults) -> Vec<Invoice> {
    results
        .get(Step::Parsing.as_str())
        .and_then(|result| result.get("parsed_invoices"))
        .and_then(|invoices| serde_json::from_value(invoices.clone()).ok())
        .unwrap_or_default()
}

fn card_details(operation: &Operation, results: &StepResults) -> CardDetails {
    let invoices = parsed_invoices(results);
    let metadata = operation.metadata();

    let client_name = invoices.iter().find_map(|i| i.client_name.clone());

    let mut debtors_info = BTreeMap::new();
    for invoice in &invoices {
        if let Some(ruc) = &invoice.debtor_ruc {
            debtors_info
                .entry(ruc.clone())
                .or_insert_with(|| invoice.debtor_name.clone().unwrap_or_default());
        }
    }

    let mut operation_amounts = BTreeMap::new();
    for invoice in &invoices {
        if let Some(amount) = invoice.total_amount {
            let currency = invoice
                .currency
                .clone()
                .unwrap_or_else(|| "UNSPECIFIED".to_string());
            *operation_amounts.entry(currency).or_insert(0.0) += amount;
        }
    }

    let drive_folder_url = results
        .get(Step::Archiving.as_str())
        .and_then(|result| result.get("drive_folder_url"))
        .and_then(Value::as_str)
        .map(String::from);

    let errors = STAGES
        .iter()
        .filter_map(|stage| {
            let result = results.get(stage.step.as_str())?;
            if result.get("skipped").and_then(Value::as_bool) != Some(true) {
                return None;
            }
            let reason = result
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("skipped");
            Some(format!("{}: {}", stage.step, reason))
        })
        .collect();

    CardDetails {
        operation_id: operation.id().to_string(),
        client_name,
        debtors_info,
        operation_amounts,
        tasa: metadata.get("tasa").cloned().unwrap_or(Value::Null),
        comision: metadata.get("comision").cloned().unwrap_or(Value::Null),
        initials: metadata_str(metadata, "initials")
            .unwrap_or_default()
            .to_string(),
        drive_folder_url,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_operation(metadata: Value) -> Operation {
        let mut files = FilePaths::new();
        files.insert("invoice.xml".into(), "gs://b/OP-7/xml/F001.XML".into());
        files.insert("invoice.pdf".into(), "gs://b/OP-7/pdf/F001.pdf".into());
        files.insert("support_1".into(), "gs://b/OP-7/respaldos/guia.xml".into());
        let Value::Object(metadata) = metadata else {
            panic!("metadata must be an object");
        };
        Operation::new(OperationId::new("OP-7").unwrap(), metadata, files)
    }

    #[test]
    fn test_parse_selects_xml_files() {
        let op = make_operation(json!({}));
        let cmd = OutboundCommand::build(CommandKind::Parse, &op, op.results());

        assert_eq!(cmd.kind(), CommandKind::Parse);
        assert_eq!(
            cmd.payload,
            CommandPayload::Parse {
                xml_file_paths: vec![
                    "gs://b/OP-7/xml/F001.XML".into(),
                    "gs://b/OP-7/respaldos/guia.xml".into()
                ]
            }
        );
    }

    #[test]
    fn test_wire_format() {
        let op = make_operation(json!({}));
        let cmd = OutboundCommand::build(CommandKind::Archive, &op, op.results());
        let body: Value = serde_json::from_slice(&cmd.to_bytes().unwrap()).unwrap();

        assert_eq!(body["operation_id"], "OP-7");
        assert_eq!(body["command"], "Archive");
        assert_eq!(body["file_paths"].as_array().unwrap().len(), 3);

        let decoded: OutboundCommand = serde_json::from_value(body).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_notify_recipients_and_invoices() {
        let op = make_operation(json!({
            "correos": "a@x.pe; b@x.pe,, c@x.pe ",
            "user_email": "ops@x.pe"
        }));
        let mut results = StepResults::new();
        results.insert(
            "parsing".into(),
            json!({"parsed_invoices": [{"document_id": "F001-1"}]}),
        );

        let cmd = OutboundCommand::build(CommandKind::Notify, &op, &results);
        let CommandPayload::Notify {
            recipient_email,
            email_subject,
            invoices_data,
            attachment_paths,
        } = cmd.payload
        else {
            panic!("wrong payload");
        };
        assert_eq!(recipient_email, "a@x.pe, b@x.pe, c@x.pe");
        assert_eq!(email_subject, "Invoice confirmation - operation OP-7");
        assert_eq!(invoices_data.len(), 1);
        assert_eq!(attachment_paths.len(), 3);
    }

    #[test]
    fn test_notify_falls_back_to_user_email() {
        let op = make_operation(json!({"correos": " ", "user_email": "ops@x.pe"}));
        let mut results = StepResults::new();
        results.insert("parsing".into(), json!({"skipped": true, "reason": null}));

        let cmd = OutboundCommand::build(CommandKind::Notify, &op, &results);
        let CommandPayload::Notify {
            recipient_email,
            invoices_data,
            ..
        } = cmd.payload
        else {
            panic!("wrong payload");
        };
        assert_eq!(recipient_email, "ops@x.pe");
        assert!(invoices_data.is_empty());
    }

    #[test]
    fn test_card_details_aggregates_invoices() {
        let op = make_operation(json!({"tasa": 1.8, "comision": 50, "initials": "MM"}));
        let mut results = StepResults::new();
        results.insert(
            "parsing".into(),
            json!({"parsed_invoices": [
                {"client_name": "ACME SAC", "debtor_ruc": "20100", "debtor_name": "Deudor Uno",
                 "currency": "PEN", "total_amount": 1000.0},
                {"debtor_ruc": "20200", "debtor_name": "Deudor Dos",
                 "currency": "PEN", "total_amount": 500.0},
                {"debtor_ruc": "20100", "currency": "USD", "total_amount": 20.0}
            ]}),
        );
        results.insert(
            "validating".into(),
            json!({"skipped": true, "reason": "registry offline"}),
        );
        results.insert(
            "archiving".into(),
            json!({"drive_folder_url": "https://drive/folder/OP-7"}),
        );

        let cmd = OutboundCommand::build(CommandKind::CreateCard, &op, &results);
        let CommandPayload::CreateCard { card_details } = cmd.payload else {
            panic!("wrong payload");
        };

        assert_eq!(card_details.client_name.as_deref(), Some("ACME SAC"));
        assert_eq!(card_details.debtors_info.len(), 2);
        assert_eq!(card_details.debtors_info["20100"], "Deudor Uno");
        assert_eq!(card_details.operation_amounts["PEN"], 1500.0);
        assert_eq!(card_details.operation_amounts["USD"], 20.0);
        assert_eq!(card_details.tasa, json!(1.8));
        assert_eq!(card_details.initials, "MM");
        assert_eq!(
            card_details.drive_folder_url.as_deref(),
            Some("https://drive/folder/OP-7")
        );
        assert_eq!(card_details.errors, vec!["validating: registry offline"]);
    }
}
