//! Coordination-map keys and typed readers.
//!
//! `coordination` is a flat map of scalar knobs. Everything here reads the
//! live value with a default, because any peer may change a knob at any
//! time and the sweepers re-read them on every tick.

use ansible_state::Document;
use serde_json::Value;

use ansible_core::maps;

pub const COORDINATOR: &str = "coordinator";
pub const SWEEP_EVERY_SECONDS: &str = "sweepEverySeconds";

pub const RETENTION_CLOSED_TASK_SECONDS: &str = "retentionClosedTaskSeconds";
pub const RETENTION_PRUNE_EVERY_SECONDS: &str = "retentionPruneEverySeconds";
pub const RETENTION_LAST_PRUNE_AT: &str = "retentionLastPruneAt";

pub const DELEGATION_POLICY_VERSION: &str = "delegationPolicyVersion";
pub const DELEGATION_POLICY_CHECKSUM: &str = "delegationPolicyChecksum";
pub const DELEGATION_POLICY_MARKDOWN: &str = "delegationPolicyMarkdown";
pub const DELEGATION_POLICY_UPDATED_AT: &str = "delegationPolicyUpdatedAt";
pub const DELEGATION_POLICY_UPDATED_BY: &str = "delegationPolicyUpdatedBy";

pub const SLA_SWEEP_ENABLED: &str = "slaSweepEnabled";
pub const SLA_SWEEP_EVERY_SECONDS: &str = "slaSweepEverySeconds";
pub const SLA_SWEEP_LAST_AT: &str = "slaSweepLastAt";
pub const SLA_SWEEP_RECORD_ONLY: &str = "slaSweepRecordOnly";
pub const SLA_SWEEP_MAX_MESSAGES: &str = "slaSweepMaxMessagesPerSweep";
pub const SLA_SWEEP_FYI_AGENTS: &str = "slaSweepFyiAgents";

/// Per-node preference key.
#[must_use]
pub fn pref_key(node: &str) -> String {
    format!("pref:{node}")
}

/// Per-agent delegation-policy acknowledgement key.
#[must_use]
pub fn delegation_ack_key(agent: &str, field: &str) -> String {
    format!("delegationAck:{agent}:{field}")
}

/// The node currently holding the coordinator role, if any.
#[must_use]
pub fn coordinator(doc: &Document) -> Option<String> {
    match doc.get(maps::COORDINATION, COORDINATOR)? {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

/// Whether `node` holds the coordinator role right now. Re-checked on
/// every sweeper tick so role handoffs take effect without restarts.
#[must_use]
pub fn is_coordinator(doc: &Document, node: &str) -> bool {
    coordinator(doc).as_deref() == Some(node)
}

#[must_use]
pub fn get_i64(doc: &Document, key: &str, default: i64) -> i64 {
    doc.get(maps::COORDINATION, key)
        .and_then(|v| v.as_i64())
        .unwrap_or(default)
}

#[must_use]
pub fn get_bool(doc: &Document, key: &str, default: bool) -> bool {
    doc.get(maps::COORDINATION, key)
        .and_then(|v| v.as_bool())
        .unwrap_or(default)
}

#[must_use]
pub fn get_string(doc: &Document, key: &str) -> Option<String> {
    doc.get(maps::COORDINATION, key)
        .and_then(|v| v.as_str().map(ToString::to_string))
}

#[must_use]
pub fn get_string_list(doc: &Document, key: &str) -> Vec<String> {
    doc.get(maps::COORDINATION, key)
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}
