//! Pending-work enumeration.
//!
//! Pure functions over the current state: given everything in a map and a
//! target agent, which items still need delivery, in which order. The
//! reconcile loop calls these on every pass — the dispatcher is driven by
//! state, not by edge-triggered events, which is what makes it backlog-
//! and crash-safe.

use ansible_core::{maps, AgentId, AgentRecord, AgentType, Message, NodeContext, NodeId, Task};
use ansible_state::Document;
use tracing::warn;

use crate::runtime::WorkKind;

/// Delivery attempts cap; items at the cap are dead-lettered.
pub const MAX_ATTEMPTS: u32 = 15;

/// The dispatch/retry key for one `(kind, item, target)`.
#[must_use]
pub fn dispatch_key(kind: WorkKind, item_id: &str, target: &AgentId) -> String {
    format!("{kind}:{item_id}:{target}")
}

/// The set of agents this node dispatches for: the built-in per-host agent
/// plus every internal agent whose gateway is this node. Sorted for
/// deterministic iteration.
#[must_use]
pub fn local_agents(doc: &Document, node: &NodeId) -> Vec<AgentId> {
    let mut agents = vec![node.as_agent()];
    for (id, record) in doc.entries_as::<AgentRecord>(maps::AGENTS) {
        if record.agent_type == AgentType::Internal
            && record.gateway.as_ref() == Some(node)
        {
            let agent = AgentId::new(id);
            if !agents.contains(&agent) {
                agents.push(agent);
            }
        }
    }
    agents.sort();
    agents
}

/// Messages pending delivery to `target`, oldest first.
#[must_use]
pub fn pending_messages(
    messages: &[(String, Message)],
    target: &AgentId,
    has_retry: &dyn Fn(&str) -> bool,
) -> Vec<Message> {
    let mut pending: Vec<Message> = messages
        .iter()
        .filter(|(_, m)| {
            if m.from_agent == *target || !m.addressed_to(target) || m.delivered_to(target) {
                return false;
            }
            if m.attempts_for(target) >= MAX_ATTEMPTS {
                warn!(message = %m.id, target = %target, "delivery attempts exhausted; dead-lettered");
                return false;
            }
            !has_retry(&dispatch_key(WorkKind::Msg, &m.id, target))
        })
        .map(|(_, m)| m.clone())
        .collect();
    pending.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    pending
}

/// Tasks pending delivery to `target`, oldest first.
///
/// Only explicitly assigned, still-open tasks dispatch; a claimed task
/// goes only to its claimer, and a skill requirement must be satisfied by
/// the target's published context.
#[must_use]
pub fn pending_tasks(
    tasks: &[(String, Task)],
    target: &AgentId,
    target_context: Option<&NodeContext>,
    has_retry: &dyn Fn(&str) -> bool,
) -> Vec<Task> {
    let mut pending: Vec<Task> = tasks
        .iter()
        .filter(|(_, t)| {
            if !t.status.is_open() {
                return false;
            }
            let assignees = t.assignees();
            if assignees.is_empty() || !assignees.contains(target) {
                return false;
            }
            if t.created_by_agent == *target {
                return false;
            }
            if let Some(claimer) = &t.claimed_by_agent {
                if claimer != target {
                    return false;
                }
            }
            if let Some(skill) = &t.skill_required {
                let has_skill = target_context
                    .is_some_and(|c| c.skills.iter().any(|s| s == skill));
                if !has_skill {
                    return false;
                }
            }
            if t.delivered_to(target) {
                return false;
            }
            if t.attempts_for(target) >= MAX_ATTEMPTS {
                warn!(task = %t.id, target = %target, "delivery attempts exhausted; dead-lettered");
                return false;
            }
            !has_retry(&dispatch_key(WorkKind::Task, &t.id, target))
        })
        .map(|(_, t)| t.clone())
        .collect();
    pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    pending
}
