//! Tool-surface errors.
//!
//! Every tool operation returns either its typed result or a single
//! `{error}` envelope. The envelope value is the stable error kind except
//! where the caller needs more (a coordinator rejection names the current
//! coordinator), in which case it is the message.

use ansible_admission::AdmissionError;
use ansible_core::limits::LimitError;
use ansible_core::ErrorKind;
use thiserror::Error;

/// Errors surfaced by tool operations.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("core is not initialized yet")]
    NotInitialized,

    #[error("node is not admitted")]
    NotAuthorized,

    #[error(transparent)]
    Limit(#[from] LimitError),

    #[error("invalid parameter: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("prefix {prefix} matches {count} records")]
    Ambiguous { prefix: String, count: usize },

    #[error("{0}")]
    InvalidState(String),

    #[error("operation restricted to the coordinator (currently {current})")]
    NotCoordinator { current: String },
}

impl ToolError {
    /// Wire error kind.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotInitialized => ErrorKind::NotInitialized,
            Self::NotAuthorized => ErrorKind::NotAuthorized,
            Self::Limit(e) => e.kind(),
            Self::InvalidParams(_) => ErrorKind::InvalidParams,
            Self::Admission(e) => e.kind(),
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Ambiguous { .. } => ErrorKind::Ambiguous,
            Self::InvalidState(_) | Self::NotCoordinator { .. } => ErrorKind::InvalidState,
        }
    }

    /// The single-field `{error}` envelope.
    #[must_use]
    pub fn envelope(&self) -> serde_json::Value {
        let value = match self {
            // Callers need the current coordinator to recover.
            Self::NotCoordinator { .. } => self.to_string(),
            other => other.kind().as_str().to_string(),
        };
        serde_json::json!({ "error": value })
    }
}

/// Result alias for tool operations.
pub type ToolResult<T> = Result<T, ToolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_kind_for_typed_errors() {
        let err = ToolError::NotFound {
            what: "task".to_string(),
        };
        assert_eq!(err.envelope(), serde_json::json!({"error": "not_found"}));
    }

    #[test]
    fn coordinator_rejection_names_the_coordinator() {
        let err = ToolError::NotCoordinator {
            current: "bb1".to_string(),
        };
        let envelope = err.envelope();
        assert!(envelope["error"].as_str().unwrap().contains("bb1"));
    }

    #[test]
    fn admission_errors_pass_their_kind_through() {
        let err: ToolError = AdmissionError::TicketAlreadyUsed.into();
        assert_eq!(err.kind(), ErrorKind::TicketAlreadyUsed);
    }
}
