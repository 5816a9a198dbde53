//! Replicated record types.
//!
//! One struct per value shape in the shared document. Field names are the
//! exact wire names used by every gateway on the mesh (a mix of camelCase
//! and `snake_case` suffixed with the entity they refer to, e.g.
//! `createdBy_agent`), so serde renames are explicit rather than blanket
//! `rename_all` rules.

use crate::ids::{AgentId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Membership ───────────────────────────────────────────────

/// Tier of a node: backbone hosts a sync listener, edge is client-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeTier {
    Backbone,
    Edge,
}

/// Membership record for an admitted node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub tier: NodeTier,
    /// Advertised capability strings (e.g. `"always-on"`, `"admin"`).
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(rename = "addedBy")]
    pub added_by: NodeId,
    /// Admission time, milliseconds since epoch.
    #[serde(rename = "addedAt")]
    pub added_at: i64,
}

/// A pending invite token authorizing one node registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invite {
    pub tier: NodeTier,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
    #[serde(rename = "createdBy")]
    pub created_by: NodeId,
    /// When set, only this node id may consume the invite.
    #[serde(rename = "expectedNodeId", skip_serializing_if = "Option::is_none")]
    pub expected_node_id: Option<String>,
    #[serde(rename = "usedByNode", skip_serializing_if = "Option::is_none")]
    pub used_by_node: Option<NodeId>,
    #[serde(rename = "usedAt", skip_serializing_if = "Option::is_none")]
    pub used_at: Option<i64>,
}

/// A single-use websocket ticket derived from an invite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(rename = "inviteToken")]
    pub invite_token: String,
    #[serde(rename = "expectedNodeId")]
    pub expected_node_id: String,
    #[serde(rename = "createdBy")]
    pub created_by: NodeId,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
    #[serde(rename = "usedAt", skip_serializing_if = "Option::is_none")]
    pub used_at: Option<i64>,
}

// ── Delivery tracking ────────────────────────────────────────

/// Per-recipient dispatch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Attempted,
    Delivered,
}

/// Per-recipient delivery record for a message or task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub state: DeliveryState,
    /// Milliseconds since epoch of the last transition.
    pub at: i64,
    /// Node that performed the dispatch.
    pub by: NodeId,
    pub attempts: u32,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// ── Tasks ────────────────────────────────────────────────────

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Whether the task still has work ahead of it.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Claimed | Self::InProgress)
    }

    /// Whether the task reached a terminal state.
    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A progress note appended by `update_task`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub at: i64,
    #[serde(rename = "by_agent")]
    pub by_agent: AgentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A delegated unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(rename = "createdBy_agent")]
    pub created_by_agent: AgentId,
    #[serde(rename = "createdBy_node")]
    pub created_by_node: NodeId,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
    #[serde(rename = "assignedTo_agent", skip_serializing_if = "Option::is_none")]
    pub assigned_to_agent: Option<AgentId>,
    #[serde(
        rename = "assignedTo_agents",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub assigned_to_agents: Vec<AgentId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(rename = "skillRequired", skip_serializing_if = "Option::is_none")]
    pub skill_required: Option<String>,
    #[serde(rename = "claimedBy_agent", skip_serializing_if = "Option::is_none")]
    pub claimed_by_agent: Option<AgentId>,
    #[serde(rename = "claimedBy_node", skip_serializing_if = "Option::is_none")]
    pub claimed_by_node: Option<NodeId>,
    #[serde(rename = "claimedAt", skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<i64>,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<TaskUpdate>,
    /// Per-recipient delivery records, keyed by agent id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub delivery: BTreeMap<String, DeliveryRecord>,
}

impl Task {
    /// All explicit assignees, primary first, deduplicated.
    #[must_use]
    pub fn assignees(&self) -> Vec<AgentId> {
        let mut out: Vec<AgentId> = Vec::new();
        if let Some(primary) = &self.assigned_to_agent {
            out.push(primary.clone());
        }
        for agent in &self.assigned_to_agents {
            if !out.contains(agent) {
                out.push(agent.clone());
            }
        }
        out
    }

    /// The timestamp a closed task is aged by for retention purposes.
    #[must_use]
    pub fn closed_at(&self) -> i64 {
        self.completed_at.unwrap_or(self.updated_at.max(self.created_at))
    }

    /// Already-delivered check for one recipient.
    #[must_use]
    pub fn delivered_to(&self, agent: &AgentId) -> bool {
        self.delivery
            .get(agent.as_str())
            .is_some_and(|d| d.state == DeliveryState::Delivered)
    }

    /// Recorded dispatch attempts toward one recipient.
    #[must_use]
    pub fn attempts_for(&self, agent: &AgentId) -> u32 {
        self.delivery.get(agent.as_str()).map_or(0, |d| d.attempts)
    }

    /// Parsed SLA block from `metadata.ansible.sla`, if present.
    #[must_use]
    pub fn sla(&self) -> Option<SlaSpec> {
        let sla = self.metadata.as_ref()?.get("ansible")?.get("sla")?;
        serde_json::from_value(sla.clone()).ok()
    }

    /// Write an SLA block back into `metadata.ansible.sla`.
    pub fn set_sla(&mut self, sla: &SlaSpec) {
        let value = serde_json::to_value(sla).unwrap_or_default();
        let metadata = self
            .metadata
            .get_or_insert_with(|| serde_json::json!({}));
        if !metadata.is_object() {
            *metadata = serde_json::json!({});
        }
        let ansible = metadata
            .as_object_mut()
            .expect("metadata forced to object above")
            .entry("ansible")
            .or_insert_with(|| serde_json::json!({}));
        if !ansible.is_object() {
            *ansible = serde_json::json!({});
        }
        ansible
            .as_object_mut()
            .expect("ansible forced to object above")
            .insert("sla".to_string(), value);
    }
}

// ── SLA metadata ─────────────────────────────────────────────

/// Escalation timestamps, set once per breach type (anti-storm).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlaEscalations {
    #[serde(rename = "acceptAt", skip_serializing_if = "Option::is_none")]
    pub accept_at: Option<i64>,
    #[serde(rename = "progressAt", skip_serializing_if = "Option::is_none")]
    pub progress_at: Option<i64>,
    #[serde(rename = "completeAt", skip_serializing_if = "Option::is_none")]
    pub complete_at: Option<i64>,
}

/// Recorded outcome of one escalation decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaOutcome {
    pub at: i64,
    /// `notified`, `record_only`, `no_targets`, or `message_budget_exhausted`.
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<AgentId>,
}

/// The `metadata.ansible.sla` block of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlaSpec {
    #[serde(rename = "acceptByAt", skip_serializing_if = "Option::is_none")]
    pub accept_by_at: Option<i64>,
    #[serde(rename = "progressByAt", skip_serializing_if = "Option::is_none")]
    pub progress_by_at: Option<i64>,
    #[serde(rename = "completeByAt", skip_serializing_if = "Option::is_none")]
    pub complete_by_at: Option<i64>,
    #[serde(default)]
    pub escalations: SlaEscalations,
    #[serde(
        rename = "escalationOutcomes",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub escalation_outcomes: BTreeMap<String, SlaOutcome>,
}

// ── Messages ─────────────────────────────────────────────────

/// A routed (or broadcast) message between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "from_agent")]
    pub from_agent: AgentId,
    #[serde(rename = "from_node")]
    pub from_node: NodeId,
    /// Unset or empty means broadcast.
    #[serde(rename = "to_agents", default, skip_serializing_if = "Vec::is_empty")]
    pub to_agents: Vec<AgentId>,
    pub content: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at: i64,
    #[serde(rename = "readBy_agents", default)]
    pub read_by_agents: Vec<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub delivery: BTreeMap<String, DeliveryRecord>,
}

impl Message {
    /// Whether this message goes to every agent.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.to_agents.is_empty()
    }

    /// Whether `agent` is an addressee (explicitly or via broadcast).
    #[must_use]
    pub fn addressed_to(&self, agent: &AgentId) -> bool {
        self.is_broadcast() || self.to_agents.contains(agent)
    }

    /// Already-delivered check: structured record OR legacy read marker.
    #[must_use]
    pub fn delivered_to(&self, agent: &AgentId) -> bool {
        self.delivery
            .get(agent.as_str())
            .is_some_and(|d| d.state == DeliveryState::Delivered)
            || self.read_by_agents.contains(agent)
    }

    /// Recorded dispatch attempts toward one recipient.
    #[must_use]
    pub fn attempts_for(&self, agent: &AgentId) -> u32 {
        self.delivery.get(agent.as_str()).map_or(0, |d| d.attempts)
    }
}

// ── Presence & registry ──────────────────────────────────────

/// Reported liveness of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PulseStatus {
    Online,
    Busy,
    Offline,
}

/// Type of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Hosted by one gateway and auto-dispatched.
    Internal,
    /// Identity only; polls via tools, never dispatched.
    External,
}

/// Registry record for a logical agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    /// Hosting node; required when internal, null for external.
    pub gateway: Option<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "registeredAt")]
    pub registered_at: i64,
    #[serde(rename = "registeredBy")]
    pub registered_by: NodeId,
}

/// Working-state record an agent publishes about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeContext {
    #[serde(rename = "currentFocus", skip_serializing_if = "Option::is_none")]
    pub current_focus: Option<String>,
    #[serde(rename = "activeThreads", default, skip_serializing_if = "Vec::is_empty")]
    pub active_threads: Vec<String>,
    #[serde(
        rename = "recentDecisions",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub recent_decisions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
}

/// Cap on `activeThreads` and `recentDecisions` entries.
pub const CONTEXT_LIST_CAP: usize = 10;
