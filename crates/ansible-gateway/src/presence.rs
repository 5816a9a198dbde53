//! Presence: pulse heartbeat, staleness, and per-host message cleanup.
//!
//! The heartbeat writes `pulse[self]` as field-level mutations so repeated
//! beats touch one register instead of replacing the record (which would
//! grow tombstones on every beat). Readers must tolerate both the sub-map
//! shape and the plain-record shape older writers produced; after
//! materialization both are JSON objects, so the helpers here only ever
//! access fields.

use std::time::Duration;

use ansible_core::{maps, now_ms, AgentId, Message, NodeId, PulseStatus};
use ansible_state::Document;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// Heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Message cleanup cadence.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// A node whose last beat is older than this is reported offline.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 300;

/// Messages older than this are cleanup candidates.
pub const MESSAGE_TTL_MS: i64 = 24 * 60 * 60 * 1_000;

/// The newest N messages are kept regardless of age.
pub const MESSAGE_KEEP_NEWEST: usize = 50;

// ── Pulse writes ─────────────────────────────────────────────

/// Startup: mark this node online with its version.
pub fn write_online(doc: &Document, node: &NodeId, version: &str) {
    doc.set_field(maps::PULSE, node.as_str(), "status", "online".into());
    doc.set_field(maps::PULSE, node.as_str(), "version", version.into());
    doc.set_field(maps::PULSE, node.as_str(), "lastSeen", now_ms().into());
}

/// One heartbeat: bump `lastSeen` in place.
pub fn beat(doc: &Document, node: &NodeId) {
    doc.set_field(maps::PULSE, node.as_str(), "lastSeen", now_ms().into());
}

/// Graceful shutdown: mark offline.
pub fn write_offline(doc: &Document, node: &NodeId) {
    doc.set_field(maps::PULSE, node.as_str(), "status", "offline".into());
    doc.set_field(maps::PULSE, node.as_str(), "lastSeen", now_ms().into());
}

// ── Pulse reads ──────────────────────────────────────────────

/// `lastSeen` from a materialized pulse record of either shape.
#[must_use]
pub fn last_seen(pulse: &Value) -> Option<i64> {
    pulse.get("lastSeen").and_then(Value::as_i64)
}

/// The status a consumer must report for a pulse record: the stored field,
/// downgraded to offline when the heartbeat is stale — regardless of what
/// the record claims.
#[must_use]
pub fn effective_status(pulse: &Value, now: i64, stale_after_secs: i64) -> PulseStatus {
    let stored = match pulse.get("status").and_then(Value::as_str) {
        Some("online") => PulseStatus::Online,
        Some("busy") => PulseStatus::Busy,
        _ => PulseStatus::Offline,
    };
    match last_seen(pulse) {
        Some(seen) if now.saturating_sub(seen) <= stale_after_secs.saturating_mul(1_000) => stored,
        _ => PulseStatus::Offline,
    }
}

/// Run the heartbeat until shutdown, then write offline.
pub async fn run_heartbeat(
    doc: Document,
    node: NodeId,
    version: String,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    write_online(&doc, &node, &version);
    debug!(node = %node, "heartbeat started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            () = tokio::time::sleep(HEARTBEAT_INTERVAL) => beat(&doc, &node),
        }
    }
    write_offline(&doc, &node);
    debug!(node = %node, "heartbeat stopped, pulse offline");
}

// ── Message cleanup ──────────────────────────────────────────

/// Delete messages that are old or beyond the count cap, preserving those
/// still unread *by this host*. Returns the number deleted.
///
/// Preservation is deliberately host-local: holding messages for another
/// node's unread state would accumulate without bound whenever any peer
/// goes quiet.
#[must_use]
pub fn cleanup_messages(doc: &Document, node: &NodeId, now: i64) -> usize {
    let self_agent: AgentId = node.as_agent();
    let mut messages: Vec<(String, Message)> = doc.entries_as(maps::MESSAGES);
    // Newest first; position beyond the cap marks a candidate.
    messages.sort_by(|a, b| b.1.timestamp.cmp(&a.1.timestamp).then(b.0.cmp(&a.0)));

    let mut deleted = 0;
    for (index, (key, message)) in messages.iter().enumerate() {
        let unread_here = message.addressed_to(&self_agent)
            && !message.read_by_agents.contains(&self_agent);
        if unread_here {
            continue;
        }
        let too_old = now.saturating_sub(message.timestamp) > MESSAGE_TTL_MS;
        let beyond_cap = index >= MESSAGE_KEEP_NEWEST;
        if too_old || beyond_cap {
            doc.remove(maps::MESSAGES, key);
            deleted += 1;
        }
    }
    if deleted > 0 {
        debug!(deleted, "message cleanup");
    }
    deleted
}

/// Run message cleanup on its cadence until shutdown.
pub async fn run_cleanup(doc: Document, node: NodeId, mut shutdown_rx: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            () = tokio::time::sleep(CLEANUP_INTERVAL) => {
                let _ = cleanup_messages(&doc, &node, now_ms());
            }
        }
    }
}
