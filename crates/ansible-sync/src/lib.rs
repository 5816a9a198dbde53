//! Websocket sync transport for the ansible coordination plane.
//!
//! Two roles share one wire protocol:
//!
//! - **Backbone hub** ([`hub`]): binds a listener, admits peers (via a
//!   [`ConnectionGate`]), brokers document updates for the room, and — as a
//!   client — connects out to any configured peer that is not itself.
//! - **Edge client** ([`client`]): maintains a resumable connection to each
//!   configured peer with reconnect backoff, and surfaces a sync boundary
//!   event after every successful state exchange.
//!
//! Sync is state-based: on connect the two sides exchange their full
//! encoded documents, then stream incremental update batches. Because the
//! document merge is idempotent, a reconnect simply re-exchanges state —
//! that is the whole resume story.

pub mod backoff;
pub mod client;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod self_url;

pub use client::{spawn_peer_client, PeerClientConfig};
pub use error::{SyncError, SyncResult};
pub use hub::{Hub, HubConfig};
pub use self_url::is_self_url;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Connection ids tag update batches so relays skip the source connection.
/// Id 0 is reserved for local mutations.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// A transport-reported sync boundary: the local replica caught up with
/// `peer`.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub ok: bool,
    /// Peer URL, or `"local"` for the backbone's own startup boundary.
    pub peer: String,
}

/// Pre-sync admission check run by the hub for every inbound connection.
///
/// The admission layer implements this; the transport only knows that a
/// peer presents a node id and, on first join, a single-use ticket.
pub trait ConnectionGate: Send + Sync {
    /// Admit or reject a peer. The returned string is the rejection reason
    /// sent back on the wire.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason when the peer is not admitted.
    fn admit(&self, node_id: &str, ticket: Option<&str>) -> Result<(), String>;
}

/// A gate that admits everyone (tests and single-node setups).
#[derive(Debug, Default)]
pub struct OpenGate;

impl ConnectionGate for OpenGate {
    fn admit(&self, _node_id: &str, _ticket: Option<&str>) -> Result<(), String> {
        Ok(())
    }
}

/// Shared transport-side handles: sync events and the one-shot doc-ready
/// signal.
#[derive(Clone)]
pub struct TransportEvents {
    sync_tx: broadcast::Sender<SyncEvent>,
    doc_ready: Arc<AtomicBool>,
    doc_ready_tx: broadcast::Sender<()>,
}

impl TransportEvents {
    #[must_use]
    pub fn new() -> Self {
        let (sync_tx, _) = broadcast::channel(64);
        let (doc_ready_tx, _) = broadcast::channel(1);
        Self {
            sync_tx,
            doc_ready: Arc::new(AtomicBool::new(false)),
            doc_ready_tx,
        }
    }

    /// Subscribe to sync boundary events.
    #[must_use]
    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync_tx.subscribe()
    }

    /// Whether the document has become usable.
    #[must_use]
    pub fn is_doc_ready(&self) -> bool {
        self.doc_ready.load(Ordering::Acquire)
    }

    /// Wait until the document is usable. Returns immediately if it
    /// already is.
    pub async fn doc_ready(&self) {
        if self.is_doc_ready() {
            return;
        }
        let mut rx = self.doc_ready_tx.subscribe();
        if self.is_doc_ready() {
            return;
        }
        let _ = rx.recv().await;
    }

    pub(crate) fn emit_sync(&self, ok: bool, peer: &str) {
        let _ = self.sync_tx.send(SyncEvent {
            ok,
            peer: peer.to_string(),
        });
    }

    /// Fires at most once; later calls are no-ops.
    pub(crate) fn mark_doc_ready(&self) {
        if !self.doc_ready.swap(true, Ordering::AcqRel) {
            let _ = self.doc_ready_tx.send(());
        }
    }
}

impl Default for TransportEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn doc_ready_fires_once_and_sticks() {
        let events = TransportEvents::new();
        assert!(!events.is_doc_ready());

        events.mark_doc_ready();
        events.mark_doc_ready();
        assert!(events.is_doc_ready());

        // A waiter arriving after the fact returns immediately.
        events.doc_ready().await;
    }

    #[tokio::test]
    async fn sync_events_reach_subscribers() {
        let events = TransportEvents::new();
        let mut rx = events.subscribe_sync();
        events.emit_sync(true, "ws://peer:1235");
        let event = rx.recv().await.unwrap();
        assert!(event.ok);
        assert_eq!(event.peer, "ws://peer:1235");
    }
}
