//! Operation workflow status.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The position of an operation in the workflow.
///
/// State transitions:
/// ```text
/// Received ──► Parsing ──► Validating ──► Archiving ──► Notifying ──► CardCreating ──► Completed
///     │           │            │              │             │              │
///     └───────────┴────────────┴──────────────┴─────────────┴──────────────┴──► Failed
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// Operation was accepted from the ingress layer.
    #[default]
    Received,

    /// Invoice XML files are being parsed.
    Parsing,

    /// Invoices are being validated with the external registry.
    Validating,

    /// Operation files are being archived.
    Archiving,

    /// Confirmation email is being sent.
    Notifying,

    /// Tracking card is being created.
    CardCreating,

    /// Every stage finished (terminal state).
    Completed,

    /// A stage reported an error (terminal state).
    Failed,
}

impl OperationStatus {
    /// Every status, in workflow order.
    pub const ALL: [OperationStatus; 8] = [
        OperationStatus::Received,
        OperationStatus::Parsing,
        OperationStatus::Validating,
        OperationStatus::Archiving,
        OperationStatus::Notifying,
        OperationStatus::CardCreating,
        OperationStatus::Completed,
        OperationStatus::Failed,
    ];

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }

    /// Returns the forward successor of this status, if any.
    pub fn successor(&self) -> Option<OperationStatus> {
        match self {
            OperationStatus::Received => Some(OperationStatus::Parsing),
            OperationStatus::Parsing => Some(OperationStatus::Validating),
            OperationStatus::Validating => Some(OperationStatus::Archiving),
            OperationStatus::Archiving => Some(OperationStatus::Notifying),
            OperationStatus::Notifying => Some(OperationStatus::CardCreating),
            OperationStatus::CardCreating => Some(OperationStatus::Completed),
            OperationStatus::Completed | OperationStatus::Failed => None,
        }
    }

    /// Returns true if `target` is an edge of the workflow graph from here.
    pub fn can_transition_to(&self, target: OperationStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        target == OperationStatus::Failed || self.successor() == Some(target)
    }

    /// Returns the status name as stored and exposed externally.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Received => "RECEIVED",
            OperationStatus::Parsing => "PARSING",
            OperationStatus::Validating => "VALIDATING",
            OperationStatus::Archiving => "ARCHIVING",
            OperationStatus::Notifying => "NOTIFYING",
            OperationStatus::CardCreating => "CARD_CREATING",
            OperationStatus::Completed => "COMPLETED",
            OperationStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing a status name that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown operation status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for OperationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_received() {
        assert_eq!(OperationStatus::default(), OperationStatus::Received);
    }

    #[test]
    fn test_terminal_states() {
        for status in OperationStatus::ALL {
            let expected = matches!(status, OperationStatus::Completed | OperationStatus::Failed);
            assert_eq!(status.is_terminal(), expected, "{status}");
        }
    }

    #[test]
    fn test_forward_chain_reaches_completed() {
        let mut status = OperationStatus::Received;
        let mut hops = 0;
        while let Some(next) = status.successor() {
            assert!(status.can_transition_to(next));
            status = next;
            hops += 1;
        }
        assert_eq!(status, OperationStatus::Completed);
        assert_eq!(hops, 6);
    }

    #[test]
    fn test_failed_reachable_from_every_non_terminal_state() {
        for status in OperationStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(status.can_transition_to(OperationStatus::Failed), "{status}");
        }
    }

    #[test]
    fn test_no_backward_or_skipping_edges() {
        assert!(!OperationStatus::Validating.can_transition_to(OperationStatus::Parsing));
        assert!(!OperationStatus::Parsing.can_transition_to(OperationStatus::Archiving));
        assert!(!OperationStatus::Parsing.can_transition_to(OperationStatus::Parsing));
        assert!(!OperationStatus::Completed.can_transition_to(OperationStatus::Failed));
        assert!(!OperationStatus::Failed.can_transition_to(OperationStatus::Completed));
    }

    #[test]
    fn test_string_round_trip() {
        for status in OperationStatus::ALL {
            assert_eq!(status.as_str().parse::<OperationStatus>(), Ok(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("DONE".parse::<OperationStatus>().is_err());
    }
}
