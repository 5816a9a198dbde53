//! Admission errors.

use ansible_core::ErrorKind;
use thiserror::Error;

/// Errors from bootstrap, invite, ticket and revocation operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("nodes map is not empty; bootstrap refused")]
    AlreadyBootstrapped,

    #[error("node {node} is not authorized for this operation")]
    NotAuthorized { node: String },

    #[error("invite token not found")]
    InvalidToken,

    #[error("invite token expired")]
    ExpiredToken,

    #[error("invite is bound to node {expected}")]
    NodeMismatch { expected: String },

    #[error("invite was already consumed")]
    InviteUsed,

    #[error("ticket not found")]
    InvalidTicket,

    #[error("ticket expired")]
    ExpiredTicket,

    #[error("ticket was already consumed")]
    TicketAlreadyUsed,

    #[error("ticket is bound to node {expected}")]
    TicketNodeMismatch { expected: String },

    #[error("invalid parameter: {0}")]
    InvalidParams(String),
}

impl AdmissionError {
    /// Wire error kind for envelopes and gate rejections.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyBootstrapped | Self::NotAuthorized { .. } => ErrorKind::NotAuthorized,
            Self::InvalidToken => ErrorKind::InvalidToken,
            Self::ExpiredToken => ErrorKind::ExpiredToken,
            Self::NodeMismatch { .. } => ErrorKind::NodeMismatch,
            Self::InviteUsed => ErrorKind::InviteUsed,
            Self::InvalidTicket => ErrorKind::InvalidTicket,
            Self::ExpiredTicket => ErrorKind::ExpiredTicket,
            Self::TicketAlreadyUsed => ErrorKind::TicketAlreadyUsed,
            Self::TicketNodeMismatch { .. } => ErrorKind::TicketNodeMismatch,
            Self::InvalidParams(_) => ErrorKind::InvalidParams,
        }
    }
}

/// Result alias for admission operations.
pub type AdmissionResult<T> = Result<T, AdmissionError>;
