//! Backbone sync hub.
//!
//! Binds the room listener, admits peers through the [`ConnectionGate`],
//! exchanges full state with each newcomer, and brokers update batches:
//! every batch a connection delivers is merged into the local document and
//! re-published to every *other* connection (the document layer tags
//! batches with the source connection id, and drops no-op merges, which is
//! what keeps relay cycles finite).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use ansible_state::Document;

use crate::error::{SyncError, SyncResult};
use crate::protocol::Frame;
use crate::{next_conn_id, ConnectionGate, TransportEvents};

/// Grace period for the peer's Hello after the socket opens.
const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound frame queue depth per connection.
const OUTBOUND_QUEUE: usize = 64;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub node_id: String,
    pub room: String,
}

/// A running backbone hub.
pub struct Hub {
    local_addr: SocketAddr,
}

impl Hub {
    /// Bind the listener and start accepting peers.
    ///
    /// The hub is authoritative for its own replica, so the startup sync
    /// boundary (`peer = "local"`) and the doc-ready signal fire as soon as
    /// the listener is up.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Bind`] if the listen address is unavailable.
    pub async fn spawn(
        doc: Document,
        config: HubConfig,
        gate: Arc<dyn ConnectionGate>,
        events: TransportEvents,
        shutdown_tx: broadcast::Sender<()>,
    ) -> SyncResult<Self> {
        let addr = format!("{}:{}", config.listen_host, config.listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| SyncError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(|source| SyncError::Bind {
            addr: "local_addr".to_string(),
            source,
        })?;
        info!(addr = %local_addr, room = %config.room, "sync hub listening");

        events.emit_sync(true, "local");
        events.mark_doc_ready();

        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        debug!("sync hub shutting down");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                let doc = doc.clone();
                                let gate = Arc::clone(&gate);
                                let config = config.clone();
                                let conn_shutdown = shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        serve_peer(stream, doc, gate, config, conn_shutdown).await
                                    {
                                        match e {
                                            SyncError::Shutdown => {},
                                            e => warn!(peer = %peer_addr, error = %e, "peer connection ended"),
                                        }
                                    }
                                });
                            },
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                            },
                        }
                    }
                }
            }
        });

        Ok(Self { local_addr })
    }

    /// The bound listen address (useful when the port was 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Serve one inbound peer: handshake, state exchange, update streaming.
async fn serve_peer(
    stream: TcpStream,
    doc: Document,
    gate: Arc<dyn ConnectionGate>,
    config: HubConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> SyncResult<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut writer, mut reader) = ws.split();

    // Handshake: Hello, gate check, Welcome, full state.
    let hello = tokio::time::timeout(HELLO_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| SyncError::Protocol("no Hello before timeout".to_string()))??;
    let Some(Frame::Hello {
        room,
        node_id,
        ticket,
    }) = hello
    else {
        return Err(SyncError::Protocol("expected Hello".to_string()));
    };

    if room != config.room {
        send_frame(&mut writer, &Frame::Denied {
            reason: format!("unknown room {room}"),
        })
        .await?;
        return Err(SyncError::Protocol(format!("room mismatch: {room}")));
    }

    if let Err(reason) = gate.admit(&node_id, ticket.as_deref()) {
        send_frame(&mut writer, &Frame::Denied {
            reason: reason.clone(),
        })
        .await?;
        return Err(SyncError::Denied { reason });
    }

    debug!(peer = %node_id, "peer admitted");
    // Subscribe to updates before encoding the state so nothing written
    // between the snapshot and the stream can be missed.
    let updates_rx = doc.subscribe_updates();
    send_frame(&mut writer, &Frame::Welcome {
        node_id: config.node_id.clone(),
    })
    .await?;
    send_frame(&mut writer, &Frame::State {
        bytes: doc.encode_state()?,
    })
    .await?;

    let conn_id = next_conn_id();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    let forwarder = spawn_update_forwarder(updates_rx, conn_id, outbound_tx.clone());
    let mut writer_task = spawn_writer(writer, outbound_rx);

    // Read loop: merge whatever the peer sends.
    let result = loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break Err(SyncError::Shutdown),
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Some(Frame::State { bytes })) | Ok(Some(Frame::Update { bytes })) => {
                        if let Err(e) = doc.apply_encoded_update(&bytes, conn_id) {
                            warn!(peer = %node_id, error = %e, "dropping corrupt update");
                        }
                    },
                    Ok(Some(other)) => {
                        debug!(peer = %node_id, ?other, "unexpected frame mid-session");
                    },
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        }
    };

    forwarder.abort();
    drop(outbound_tx);
    // Give the writer a moment to flush, then stop it.
    tokio::select! {
        _ = &mut writer_task => {},
        () = tokio::time::sleep(Duration::from_secs(2)) => writer_task.abort(),
    }
    result
}

/// Forward document update batches (except those from `conn_id`) to one
/// connection's outbound queue.
pub(crate) fn spawn_update_forwarder(
    mut updates: broadcast::Receiver<ansible_state::UpdateBatch>,
    conn_id: u64,
    outbound_tx: mpsc::Sender<Frame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(batch) => {
                    if batch.origin == conn_id {
                        continue;
                    }
                    let bytes = match rmp_serde::to_vec_named(batch.ops.as_ref()) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(error = %e, "failed to encode update batch");
                            continue;
                        },
                    };
                    if outbound_tx.send(Frame::Update { bytes }).await.is_err() {
                        break;
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed batches are covered by the next full state
                    // exchange on reconnect.
                    warn!(skipped, "update forwarder lagged");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Drain an outbound queue into the websocket writer.
pub(crate) fn spawn_writer<S>(
    mut writer: futures::stream::SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<Frame>,
) -> tokio::task::JoinHandle<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let bytes = match frame.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to encode frame");
                    continue;
                },
            };
            if let Err(e) = writer.send(Message::Binary(bytes)).await {
                debug!(error = %e, "writer task: send failed");
                break;
            }
        }
        let _ = writer.close().await;
    })
}

/// Read the next protocol frame, skipping transport chatter.
///
/// Returns `Ok(None)` on clean close.
pub(crate) async fn read_frame<S>(
    reader: &mut futures::stream::SplitStream<WebSocketStream<S>>,
) -> SyncResult<Option<Frame>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        match reader.next().await {
            Some(Ok(Message::Binary(bytes))) => return Ok(Some(Frame::decode(&bytes)?)),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {},
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Send a single frame immediately (handshake path, before the writer task
/// takes over).
pub(crate) async fn send_frame<S>(
    writer: &mut futures::stream::SplitSink<WebSocketStream<S>, Message>,
    frame: &Frame,
) -> SyncResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    writer.send(Message::Binary(frame.encode()?)).await?;
    Ok(())
}
