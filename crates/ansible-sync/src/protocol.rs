//! Sync wire frames.
//!
//! Frames travel as binary websocket messages in MessagePack encoding.
//! The handshake is `Hello → (Welcome | Denied)`, followed by a full
//! [`Frame::State`] exchange in both directions, after which both sides
//! stream [`Frame::Update`] batches.

use serde::{Deserialize, Serialize};

#[cfg(test)]
use crate::error::SyncError;
use crate::error::SyncResult;

/// One sync protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Client → hub greeting. `ticket` is present only on a first join.
    Hello {
        room: String,
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ticket: Option<String>,
    },
    /// Hub → client: admitted; carries the hub's node id.
    Welcome { node_id: String },
    /// Hub → client: rejected; the connection closes after this frame.
    Denied { reason: String },
    /// Full encoded document state.
    State { bytes: Vec<u8> },
    /// Incremental encoded op batch.
    Update { bytes: Vec<u8> },
}

impl Frame {
    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Encode`] if serialization fails.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode from the wire.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Decode`] for a corrupt frame.
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
