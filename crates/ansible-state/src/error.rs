//! State-layer errors.

use ansible_core::ErrorKind;
use thiserror::Error;

/// Errors from the document and snapshot layer.
#[derive(Debug, Error)]
pub enum StateError {
    /// Snapshot or state encoding failed.
    #[error("state encode failed: {0}")]
    Encode(#[source] rmp_serde::encode::Error),

    /// A remote update or snapshot payload was corrupt.
    #[error("state decode failed: {0}")]
    Decode(#[source] rmp_serde::decode::Error),

    /// Snapshot file I/O failed.
    #[error("snapshot io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot path escapes the configured state directory.
    #[error("snapshot path escapes state directory: {path}")]
    PathTraversal { path: String },

    /// Compacted snapshot exceeds the size cap.
    #[error("snapshot too large: {size} bytes (cap {cap})")]
    SnapshotTooLarge { size: usize, cap: usize },
}

impl StateError {
    /// Wire error kind for tool envelopes.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PathTraversal { .. } => ErrorKind::PathTraversal,
            Self::SnapshotTooLarge { .. } => ErrorKind::InvalidParams,
            Self::Encode(_) | Self::Decode(_) | Self::Io { .. } => ErrorKind::InvalidParams,
        }
    }
}

/// Result alias for state operations.
pub type StateResult<T> = Result<T, StateError>;
