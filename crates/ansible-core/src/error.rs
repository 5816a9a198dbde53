//! The flat error-kind taxonomy.
//!
//! Every crate defines its own `thiserror` enum; each of those maps onto one
//! of these kinds via a `kind()` accessor. The tool surface serializes the
//! kind's stable wire string into its `{error}` envelope, so the strings
//! here are part of the external contract and must not change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Enumerated error kinds surfaced across the tool and admission contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Core has no document or node id yet.
    NotInitialized,
    /// Admission predicate failed.
    NotAuthorized,
    /// Shape/size/range violation.
    InvalidParams,
    /// Invite token does not exist (or was already consumed).
    InvalidToken,
    /// Invite token exists but its TTL elapsed.
    ExpiredToken,
    /// Invite is bound to a different node id.
    NodeMismatch,
    /// Invite was already consumed.
    InviteUsed,
    /// Websocket ticket does not exist.
    InvalidTicket,
    /// Websocket ticket TTL elapsed.
    ExpiredTicket,
    /// Websocket ticket was already consumed.
    TicketAlreadyUsed,
    /// Websocket ticket is bound to a different node id.
    TicketNodeMismatch,
    /// Id resolution found nothing.
    NotFound,
    /// Id-prefix resolution matched more than one record.
    Ambiguous,
    /// Lifecycle violation (claim of non-pending task, non-claimer update).
    InvalidState,
    /// No runtime delivery capability is available.
    TransportUnavailable,
    /// Transient host-runtime delivery failure; surfaced as retry scheduling.
    Retryable,
    /// SLA sweep message budget exhausted (a reason, not a failure).
    QuotaExceeded,
    /// Snapshot path escapes the state directory.
    PathTraversal,
}

impl ErrorKind {
    /// Stable wire string for error envelopes.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::NotAuthorized => "not_authorized",
            Self::InvalidParams => "invalid_params",
            Self::InvalidToken => "invalid_token",
            Self::ExpiredToken => "expired_token",
            Self::NodeMismatch => "node_mismatch",
            Self::InviteUsed => "invite_used",
            Self::InvalidTicket => "invalid_ticket",
            Self::ExpiredTicket => "expired_ticket",
            Self::TicketAlreadyUsed => "ticket_already_used",
            Self::TicketNodeMismatch => "ticket_node_mismatch",
            Self::NotFound => "not_found",
            Self::Ambiguous => "ambiguous",
            Self::InvalidState => "invalid_state",
            Self::TransportUnavailable => "transport_unavailable",
            Self::Retryable => "retryable",
            Self::QuotaExceeded => "quota_exceeded",
            Self::PathTraversal => "path_traversal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_strings_are_snake_case_kinds() {
        assert_eq!(ErrorKind::TicketAlreadyUsed.as_str(), "ticket_already_used");
        assert_eq!(ErrorKind::PathTraversal.as_str(), "path_traversal");
        assert_eq!(ErrorKind::InvalidParams.to_string(), "invalid_params");
    }

    #[test]
    fn serde_matches_wire_string() {
        let json = serde_json::to_string(&ErrorKind::ExpiredTicket).unwrap();
        assert_eq!(json, "\"expired_ticket\"");
    }
}
