//! Edge-side peer client.
//!
//! One task per configured peer URL: connect, greet, exchange full state,
//! then stream updates until the connection drops, and reconnect with
//! full-jitter backoff. A sync boundary event fires after every successful
//! state exchange — including re-exchanges after reconnect, so consumers
//! must be idempotent.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use ansible_state::Document;

use crate::backoff::Backoff;
use crate::error::{SyncError, SyncResult};
use crate::hub::{read_frame, send_frame, spawn_update_forwarder, spawn_writer};
use crate::protocol::Frame;
use crate::{next_conn_id, TransportEvents};

/// Grace period for the hub's Welcome and State after connecting.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Base reconnect delay (milliseconds).
const BACKOFF_BASE_MS: u64 = 1_000;

/// Reconnect delay cap (milliseconds).
const BACKOFF_MAX_MS: u64 = 60_000;

/// Outbound frame queue depth.
const OUTBOUND_QUEUE: usize = 64;

/// Configuration for one peer connection.
#[derive(Debug, Clone)]
pub struct PeerClientConfig {
    /// Peer URL (`ws://host:port`).
    pub url: String,
    /// Local node id, presented in the Hello.
    pub node_id: String,
    /// Room name; must match the hub's.
    pub room: String,
    /// Single-use join ticket, presented once on the first successful
    /// handshake. `None` for already-admitted nodes.
    pub ticket: Option<String>,
}

/// Spawn the reconnecting client task for one peer.
pub fn spawn_peer_client(
    doc: Document,
    config: PeerClientConfig,
    events: TransportEvents,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(BACKOFF_BASE_MS, BACKOFF_MAX_MS);
        let mut ticket = config.ticket.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        loop {
            match connect_and_run(&doc, &config, &mut ticket, &events, &mut shutdown_rx).await {
                Ok(()) => {
                    debug!(peer = %config.url, "peer client shutting down");
                    return;
                },
                Err(SyncError::Shutdown) => return,
                Err(e) => {
                    warn!(peer = %config.url, error = %e, "peer connection lost");
                    events.emit_sync(false, &config.url);
                },
            }

            let delay = backoff.next_delay();
            debug!(peer = %config.url, delay_ms = delay.as_millis(), "reconnecting after backoff");
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                () = tokio::time::sleep(delay) => {},
            }
        }
    })
}

/// One connection attempt: handshake, state exchange, update streaming.
///
/// Returns `Ok(())` only on shutdown; any connection end is an error so
/// the outer loop reconnects.
async fn connect_and_run(
    doc: &Document,
    config: &PeerClientConfig,
    ticket: &mut Option<String>,
    events: &TransportEvents,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> SyncResult<()> {
    let (ws, _response) = tokio_tungstenite::connect_async(config.url.as_str()).await?;
    let (mut writer, mut reader) = ws.split();

    send_frame(&mut writer, &Frame::Hello {
        room: config.room.clone(),
        node_id: config.node_id.clone(),
        ticket: ticket.clone(),
    })
    .await?;

    // Welcome (or Denied), then the hub's full state.
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| SyncError::Protocol("no Welcome before timeout".to_string()))??;
    match frame {
        Some(Frame::Welcome { node_id }) => {
            info!(peer = %config.url, hub = %node_id, "connected to sync hub");
            // The ticket was consumed server-side; never present it again.
            *ticket = None;
        },
        Some(Frame::Denied { reason }) => return Err(SyncError::Denied { reason }),
        _ => return Err(SyncError::Protocol("expected Welcome".to_string())),
    }

    // Subscribe before encoding our state so no local write can fall
    // between the snapshot and the update stream.
    let updates_rx = doc.subscribe_updates();
    send_frame(&mut writer, &Frame::State {
        bytes: doc.encode_state()?,
    })
    .await?;

    let conn_id = next_conn_id();
    let frame = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| SyncError::Protocol("no State before timeout".to_string()))??;
    match frame {
        Some(Frame::State { bytes }) => {
            doc.apply_encoded_update(&bytes, conn_id)?;
        },
        _ => return Err(SyncError::Protocol("expected State".to_string())),
    }

    // Sync boundary: this replica has caught up with the peer.
    events.emit_sync(true, &config.url);
    events.mark_doc_ready();

    let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    let forwarder = spawn_update_forwarder(updates_rx, conn_id, outbound_tx.clone());
    let mut writer_task = spawn_writer(writer, outbound_rx);

    let result = loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break Ok(()),
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Some(Frame::Update { bytes })) | Ok(Some(Frame::State { bytes })) => {
                        if let Err(e) = doc.apply_encoded_update(&bytes, conn_id) {
                            warn!(peer = %config.url, error = %e, "dropping corrupt update");
                        }
                    },
                    Ok(Some(other)) => {
                        debug!(peer = %config.url, ?other, "unexpected frame mid-session");
                    },
                    Ok(None) => break Err(SyncError::Protocol("connection closed".to_string())),
                    Err(e) => break Err(e),
                }
            }
        }
    };

    forwarder.abort();
    drop(outbound_tx);
    tokio::select! {
        _ = &mut writer_task => {},
        () = tokio::time::sleep(Duration::from_secs(2)) => writer_task.abort(),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_is_cleared_only_after_welcome() {
        // The clearing happens inside connect_and_run on Welcome; here we
        // pin the config contract: a clone keeps the original ticket so a
        // failed dial can retry with it.
        let config = PeerClientConfig {
            url: "ws://example:1235".to_string(),
            node_id: "e1".to_string(),
            room: ansible_core::ROOM.to_string(),
            ticket: Some("t-1".to_string()),
        };
        let working = config.ticket.clone();
        assert_eq!(working.as_deref(), Some("t-1"));
        assert_eq!(config.ticket.as_deref(), Some("t-1"));
    }
}
