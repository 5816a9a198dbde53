//! Transport errors.

use thiserror::Error;

/// Errors from the sync transport.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Websocket-level failure.
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    /// Frame encoding failed.
    #[error("frame encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Peer sent a corrupt frame.
    #[error("frame decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Underlying document/state operation failed.
    #[error("state error: {0}")]
    State(#[from] ansible_state::error::StateError),

    /// The hub rejected this connection.
    #[error("connection denied: {reason}")]
    Denied { reason: String },

    /// The peer violated the sync protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Listener could not bind.
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Shutdown was signalled.
    #[error("shutdown")]
    Shutdown,
}

/// Result alias for transport operations.
pub type SyncResult<T> = Result<T, SyncError>;
