//! Self-connection detection for backbone peer lists.
//!
//! A backbone's `backbonePeers` list often includes its own advertised URL.
//! Connecting to it would produce a pointless self-loop, so peer URLs are
//! normalized and compared by exact hostname and port equality against the
//! loopback set, the configured listen host, and the local node id. No
//! substring matching: `node-1` must not match `node-10.example`.

use url::Url;

/// Hostnames that always refer to the local machine.
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]"];

/// Whether `peer_url` points at this node's own listener.
#[must_use]
pub fn is_self_url(peer_url: &str, listen_host: &str, listen_port: u16, node_id: &str) -> bool {
    let Ok(parsed) = Url::parse(peer_url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let port = parsed
        .port()
        .unwrap_or(ansible_core::DEFAULT_LISTEN_PORT);

    if port != listen_port {
        return false;
    }

    let host = host.to_ascii_lowercase();
    LOOPBACK_HOSTS.contains(&host.as_str())
        || host == listen_host.to_ascii_lowercase()
        || host == node_id.to_ascii_lowercase()
}
