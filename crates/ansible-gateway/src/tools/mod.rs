//! The tool surface.
//!
//! Named operations over the shared state, callable by the host runtime
//! or an operator. Inputs and outputs are JSON-shaped (typed structs with
//! camelCase wire names); every operation authorizes the calling node
//! through the admission predicate and returns either its typed result or
//! a `{error}` envelope built from [`ToolError`].

mod coordination;
mod messages;
mod registry;
mod tasks;

pub use coordination::DelegationPolicy;
pub use messages::{DeleteMessagesParams, DeleteMessagesResult, MessageView};
pub use registry::AgentListEntry;
pub use tasks::{DelegateTaskResult, TaskView};

use ansible_admission::Admission;
use ansible_core::{maps, now_ms, AgentId, Message, NodeId, NodeInfo, Task, TaskStatus};
use ansible_state::Document;
use ansible_sync::TransportEvents;
use serde::{Deserialize, Serialize};

use crate::dispatch::DispatcherHandle;
use crate::error::{ToolError, ToolResult};
use crate::presence::{self, DEFAULT_STALE_AFTER_SECS};

/// Capability string required by destructive operations.
pub const ADMIN_CAPABILITY: &str = "admin";

/// Tool operations bound to one node.
#[derive(Clone)]
pub struct Tools {
    doc: Document,
    node: NodeId,
    admission: Admission,
    events: Option<TransportEvents>,
    dispatcher: Option<DispatcherHandle>,
    stale_after_secs: i64,
}

impl Tools {
    #[must_use]
    pub fn new(doc: Document, node: NodeId, admission: Admission) -> Self {
        Self {
            doc,
            node,
            admission,
            events: None,
            dispatcher: None,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
        }
    }

    /// Gate operations on the transport's doc-ready signal.
    #[must_use]
    pub fn with_events(mut self, events: TransportEvents) -> Self {
        self.events = Some(events);
        self
    }

    /// Nudge the dispatcher after tool writes.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: DispatcherHandle) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Document handle (tests and the daemon share it).
    #[must_use]
    pub fn doc(&self) -> &Document {
        &self.doc
    }

    // ── Shared guards ────────────────────────────────────────

    pub(crate) fn ensure_ready(&self) -> ToolResult<()> {
        match &self.events {
            Some(events) if !events.is_doc_ready() => Err(ToolError::NotInitialized),
            _ => Ok(()),
        }
    }

    pub(crate) fn ensure_authorized(&self) -> ToolResult<()> {
        self.ensure_ready()?;
        if self.admission.is_node_authorized(&self.node) {
            Ok(())
        } else {
            Err(ToolError::NotAuthorized)
        }
    }

    pub(crate) fn self_agent(&self) -> AgentId {
        self.node.as_agent()
    }

    pub(crate) fn node(&self) -> &NodeId {
        &self.node
    }

    pub(crate) fn request_reconcile(&self, reason: &str) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.request_reconcile(reason);
        }
    }

    pub(crate) fn has_capability(&self, capability: &str) -> bool {
        self.doc
            .get_as::<NodeInfo>(maps::NODES, self.node.as_str())
            .is_some_and(|info| info.capabilities.iter().any(|c| c == capability))
    }

    /// Resolve a task by exact id, then by unique id prefix.
    pub(crate) fn resolve_task(&self, id_or_prefix: &str) -> ToolResult<(String, Task)> {
        if let Some(task) = self.doc.get_as::<Task>(maps::TASKS, id_or_prefix) {
            return Ok((id_or_prefix.to_string(), task));
        }
        let matches: Vec<(String, Task)> = self
            .doc
            .entries_as::<Task>(maps::TASKS)
            .into_iter()
            .filter(|(key, _)| key.starts_with(id_or_prefix))
            .collect();
        match matches.len() {
            0 => Err(ToolError::NotFound {
                what: format!("task {id_or_prefix}"),
            }),
            1 => Ok(matches.into_iter().next().expect("len checked")),
            count => Err(ToolError::Ambiguous {
                prefix: id_or_prefix.to_string(),
                count,
            }),
        }
    }

    /// Messages unread by this node's agent, addressed to it or broadcast.
    pub(crate) fn unread_for_self(&self) -> Vec<(String, Message)> {
        let agent = self.self_agent();
        self.doc
            .entries_as::<Message>(maps::MESSAGES)
            .into_iter()
            .filter(|(_, m)| {
                m.from_agent != agent
                    && m.addressed_to(&agent)
                    && !m.read_by_agents.contains(&agent)
            })
            .collect()
    }

    // ── status ───────────────────────────────────────────────

    /// Mesh overview: membership with live-ness, pending tasks, unread
    /// count. Stale nodes are always reported offline, whatever their
    /// stored pulse status says.
    pub fn status(&self) -> ToolResult<StatusReport> {
        self.ensure_authorized()?;
        let now = now_ms();

        let nodes = self
            .doc
            .entries_as::<NodeInfo>(maps::NODES)
            .into_iter()
            .map(|(node_id, info)| {
                let pulse = self.doc.get(maps::PULSE, &node_id);
                let status = pulse
                    .as_ref()
                    .map_or(ansible_core::PulseStatus::Offline, |p| {
                        presence::effective_status(p, now, self.stale_after_secs)
                    });
                NodeStatusEntry {
                    node_id,
                    tier: info.tier,
                    status,
                    last_seen: pulse.as_ref().and_then(presence::last_seen),
                    capabilities: info.capabilities,
                }
            })
            .collect();

        let pending_tasks = self
            .doc
            .entries_as::<Task>(maps::TASKS)
            .into_iter()
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .map(|(_, t)| t)
            .collect();

        Ok(StatusReport {
            my_id: self.node.to_string(),
            nodes,
            pending_tasks,
            unread_messages: self.unread_for_self().len(),
            stale_after_seconds: self.stale_after_secs,
        })
    }
}

/// One node's row in [`StatusReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusEntry {
    pub node_id: String,
    pub tier: ansible_core::NodeTier,
    pub status: ansible_core::PulseStatus,
    pub last_seen: Option<i64>,
    pub capabilities: Vec<String>,
}

/// Return shape of `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub my_id: String,
    pub nodes: Vec<NodeStatusEntry>,
    pub pending_tasks: Vec<Task>,
    pub unread_messages: usize,
    pub stale_after_seconds: i64,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use ansible_core::NodeTier;

    /// A bootstrapped single-node plane with tools bound to it.
    pub fn tools(node: &str) -> Tools {
        let doc = Document::new(node);
        let node_id = NodeId::new(node);
        let admission = Admission::new(doc.clone(), node_id.clone());
        admission
            .bootstrap(NodeTier::Backbone, vec!["always-on".to_string()])
            .expect("bootstrap");
        Tools::new(doc, node_id, admission)
    }

    /// Same, with the admin capability.
    pub fn admin_tools(node: &str) -> Tools {
        let doc = Document::new(node);
        let node_id = NodeId::new(node);
        let admission = Admission::new(doc.clone(), node_id.clone());
        admission
            .bootstrap(NodeTier::Backbone, vec!["admin".to_string()])
            .expect("bootstrap");
        Tools::new(doc, node_id, admission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::tools;

    #[test]
    fn status_reports_membership_and_downgrades_stale_pulses() {
        let t = tools("bb1");
        let now = now_ms();

        // Fresh heartbeat for ourselves.
        t.doc().insert_value(
            maps::PULSE,
            "bb1",
            serde_json::json!({"status": "online", "lastSeen": now}),
        );
        // A peer with a stored "online" but a stale beat.
        t.doc().insert(
            maps::NODES,
            "e1",
            &NodeInfo {
                tier: ansible_core::NodeTier::Edge,
                capabilities: Vec::new(),
                added_by: NodeId::new("bb1"),
                added_at: now,
            },
        );
        t.doc().insert_value(
            maps::PULSE,
            "e1",
            serde_json::json!({"status": "online", "lastSeen": now - 600_000}),
        );

        let report = t.status().unwrap();
        assert_eq!(report.my_id, "bb1");
        assert_eq!(report.stale_after_seconds, 300);

        let bb1 = report.nodes.iter().find(|n| n.node_id == "bb1").unwrap();
        assert_eq!(bb1.status, ansible_core::PulseStatus::Online);
        let e1 = report.nodes.iter().find(|n| n.node_id == "e1").unwrap();
        assert_eq!(e1.status, ansible_core::PulseStatus::Offline);
    }

    #[test]
    fn status_serializes_with_wire_names() {
        let t = tools("bb1");
        let report = t.status().unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["myId"], "bb1");
        assert!(json["pendingTasks"].is_array());
        assert_eq!(json["unreadMessages"], 0);
        assert_eq!(json["staleAfterSeconds"], 300);
    }

    #[test]
    fn task_prefix_resolution_handles_ambiguity() {
        let t = tools("bb1");
        for id in ["abc-1", "abc-2", "xyz-1"] {
            let task = Task {
                id: id.to_string(),
                title: "t".to_string(),
                description: "d".to_string(),
                status: TaskStatus::Pending,
                created_by_agent: AgentId::new("bb1"),
                created_by_node: NodeId::new("bb1"),
                created_at: 1,
                updated_at: 1,
                assigned_to_agent: None,
                assigned_to_agents: Vec::new(),
                requires: Vec::new(),
                skill_required: None,
                claimed_by_agent: None,
                claimed_by_node: None,
                claimed_at: None,
                completed_at: None,
                result: None,
                context: None,
                intent: None,
                metadata: None,
                updates: Vec::new(),
                delivery: Default::default(),
            };
            t.doc().insert(maps::TASKS, id, &task);
        }

        assert_eq!(t.resolve_task("xyz").unwrap().0, "xyz-1");
        assert_eq!(t.resolve_task("abc-1").unwrap().0, "abc-1");
        let err = t.resolve_task("abc").unwrap_err();
        assert!(matches!(err, ToolError::Ambiguous { count: 2, .. }));
        let err = t.resolve_task("zzz").unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }
}
