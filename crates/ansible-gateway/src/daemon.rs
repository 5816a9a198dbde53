//! Daemon assembly.
//!
//! Wires the document, snapshot persistence, sync transport, admission,
//! presence, dispatcher and sweepers together, and tears them down on a
//! shutdown signal: background tasks stop scheduling, the pulse goes
//! offline, and a final snapshot flush runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ansible_admission::{Admission, AdmissionGate};
use ansible_core::{NodeId, NodeTier, ROOM};
use ansible_state::{snapshot, Document, SnapshotStore, StateError};
use ansible_sync::{
    is_self_url, spawn_peer_client, Hub, HubConfig, PeerClientConfig, SyncError, TransportEvents,
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{ConfigError, GatewayConfig};
use crate::dispatch::Dispatcher;
use crate::presence;
use crate::runtime::HostRuntime;
use crate::sweep::{locks, retention, sla};
use crate::tools::Tools;

/// Daemon startup errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

/// A running gateway.
pub struct Daemon {
    node_id: NodeId,
    shutdown_tx: broadcast::Sender<()>,
    tools: Tools,
    events: TransportEvents,
    hub_addr: Option<std::net::SocketAddr>,
}

impl Daemon {
    /// Assemble and start every component.
    ///
    /// # Errors
    ///
    /// Returns a [`DaemonError`] when the state directory or the listener
    /// is unusable; snapshot read problems are warnings, not errors.
    pub async fn start(
        config: GatewayConfig,
        runtime: Arc<dyn HostRuntime>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        let node_id = NodeId::new(resolve_node_id(&config));
        info!(node = %node_id, tier = ?config.tier, "gateway starting");

        let doc = Document::new(node_id.as_str());
        let (shutdown_tx, _) = broadcast::channel(8);

        // Hydrate from the local snapshot; a corrupt or missing file just
        // means an empty replica until sync catches up.
        let state_dir = config
            .state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("state"));
        let store = SnapshotStore::new(state_dir)?;
        if let Err(e) = store.load(&doc, &store.default_path()).await {
            warn!(error = %e, "snapshot load failed, starting empty");
        }
        tokio::spawn(snapshot::run_persister(
            doc.clone(),
            store.clone(),
            shutdown_tx.subscribe(),
        ));

        let admission = Admission::new(doc.clone(), node_id.clone());
        let events = TransportEvents::new();

        // Transport: backbone binds the hub and dials out to non-self
        // peers; edge dials every configured peer.
        let mut hub_addr = None;
        if config.tier == NodeTier::Backbone {
            let listen_host = config
                .listen_host
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string());
            let hub = Hub::spawn(
                doc.clone(),
                HubConfig {
                    listen_host: listen_host.clone(),
                    listen_port: config.listen_port,
                    node_id: node_id.to_string(),
                    room: ROOM.to_string(),
                },
                Arc::new(AdmissionGate::new(admission.clone())),
                events.clone(),
                shutdown_tx.clone(),
            )
            .await?;
            hub_addr = Some(hub.local_addr());

            for peer in &config.backbone_peers {
                if is_self_url(peer, &listen_host, config.listen_port, node_id.as_str()) {
                    info!(peer = %peer, "skipping self peer url");
                    continue;
                }
                spawn_client(&doc, &config, &node_id, peer, &events, &shutdown_tx);
            }
        } else {
            for peer in &config.backbone_peers {
                spawn_client(&doc, &config, &node_id, peer, &events, &shutdown_tx);
            }
        }

        // Presence and cleanup.
        tokio::spawn(presence::run_heartbeat(
            doc.clone(),
            node_id.clone(),
            env!("CARGO_PKG_VERSION").to_string(),
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(presence::run_cleanup(
            doc.clone(),
            node_id.clone(),
            shutdown_tx.subscribe(),
        ));

        // Dispatcher (unless incoming dispatch is disabled — items then
        // accumulate durably and polling still works).
        let mut tools = Tools::new(doc.clone(), node_id.clone(), admission.clone())
            .with_events(events.clone());
        if config.dispatch_incoming {
            let dispatcher = Dispatcher::spawn(
                doc.clone(),
                node_id.clone(),
                runtime,
                &shutdown_tx,
            );
            dispatcher.forward_sync_events(&events, &shutdown_tx);
            tools = tools.with_dispatcher(dispatcher.handle());
        } else {
            info!("incoming dispatch disabled by configuration");
        }

        // Sweepers: retention and SLA gate themselves on the coordinator
        // role every tick; the lock reaper is per-host.
        tokio::spawn(retention::run_retention(
            doc.clone(),
            node_id.clone(),
            shutdown_tx.subscribe(),
        ));
        tokio::spawn(sla::run_sla(
            doc.clone(),
            node_id.clone(),
            config.sla_sweep.clone(),
            shutdown_tx.subscribe(),
        ));
        if config.lock_sweep.enabled {
            if let Some(sessions_dir) = config.sessions_dir.clone() {
                tokio::spawn(locks::run_lock_reaper(
                    sessions_dir,
                    Duration::from_secs(config.lock_sweep.every_seconds),
                    Duration::from_secs(config.lock_sweep.stale_seconds),
                    shutdown_tx.subscribe(),
                ));
            }
        }

        Ok(Self {
            node_id,
            shutdown_tx,
            tools,
            events,
            hub_addr,
        })
    }

    /// The tool surface bound to this gateway.
    #[must_use]
    pub fn tools(&self) -> Tools {
        self.tools.clone()
    }

    /// This gateway's node id.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The hub's bound address (backbone only).
    #[must_use]
    pub fn hub_addr(&self) -> Option<std::net::SocketAddr> {
        self.hub_addr
    }

    /// Transport events (sync boundaries, doc-ready).
    #[must_use]
    pub fn events(&self) -> &TransportEvents {
        &self.events
    }

    /// Block until the interrupt signal, then shut down.
    pub async fn run(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "signal handler failed, shutting down");
        }
        self.shutdown().await;
    }

    /// Signal every task to stop and give them a moment to flush (pulse
    /// offline, final snapshot).
    pub async fn shutdown(self) {
        info!(node = %self.node_id, "gateway shutting down");
        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn resolve_node_id(config: &GatewayConfig) -> String {
    if let Some(id) = &config.node_id_override {
        return id.clone();
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "ansible-node".to_string())
}

fn spawn_client(
    doc: &Document,
    config: &GatewayConfig,
    node_id: &NodeId,
    peer: &str,
    events: &TransportEvents,
    shutdown_tx: &broadcast::Sender<()>,
) {
    spawn_peer_client(
        doc.clone(),
        PeerClientConfig {
            url: peer.to_string(),
            node_id: node_id.to_string(),
            room: ROOM.to_string(),
            ticket: config.join_ticket.clone(),
        },
        events.clone(),
        shutdown_tx.clone(),
    );
}
