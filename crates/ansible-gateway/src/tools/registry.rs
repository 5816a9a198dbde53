//! Agent registry and context tool operations.

use ansible_core::limits::{self, MAX_CONTEXT};
use ansible_core::records::CONTEXT_LIST_CAP;
use ansible_core::{maps, now_ms, AgentId, AgentRecord, AgentType, NodeContext, NodeId};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ToolError, ToolResult};

use super::Tools;

/// One row of `list_agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentListEntry {
    pub agent_id: String,
    #[serde(flatten)]
    pub record: AgentRecord,
}

impl Tools {
    /// Register a logical agent. Internal agents bind to a gateway
    /// (default: this node) and are auto-dispatched; external agents have
    /// no gateway and poll via tools.
    pub fn register_agent(
        &self,
        agent_id: &str,
        name: Option<&str>,
        agent_type: AgentType,
        gateway: Option<NodeId>,
    ) -> ToolResult<()> {
        self.ensure_authorized()?;
        if agent_id.is_empty() {
            return Err(ToolError::InvalidParams("agent_id must not be empty".to_string()));
        }

        let gateway = match agent_type {
            AgentType::Internal => Some(gateway.unwrap_or_else(|| self.node().clone())),
            AgentType::External => None,
        };
        let record = AgentRecord {
            agent_type,
            gateway,
            name: name.map(ToString::to_string),
            registered_at: now_ms(),
            registered_by: self.node().clone(),
        };
        self.doc().insert(maps::AGENTS, agent_id, &record);
        info!(agent = agent_id, ?agent_type, "agent registered");
        Ok(())
    }

    /// All registered agents, id-sorted.
    pub fn list_agents(&self) -> ToolResult<Vec<AgentListEntry>> {
        self.ensure_authorized()?;
        Ok(self
            .doc()
            .entries_as::<AgentRecord>(maps::AGENTS)
            .into_iter()
            .map(|(agent_id, record)| AgentListEntry { agent_id, record })
            .collect())
    }

    /// Update an agent's published working context. List fields keep the
    /// newest entries up to the cap.
    pub fn update_context(
        &self,
        agent: Option<AgentId>,
        current_focus: Option<&str>,
        add_thread: Option<&str>,
        add_decision: Option<&str>,
        skills: Option<Vec<String>>,
    ) -> ToolResult<NodeContext> {
        self.ensure_authorized()?;
        let agent = agent.unwrap_or_else(|| self.self_agent());
        if let Some(focus) = current_focus {
            limits::ensure_max_len("currentFocus", focus, MAX_CONTEXT)?;
        }

        let mut context: NodeContext = self
            .doc()
            .get_as(maps::CONTEXT, agent.as_str())
            .unwrap_or_default();
        if let Some(focus) = current_focus {
            context.current_focus = Some(focus.to_string());
        }
        if let Some(thread) = add_thread {
            context.active_threads.push(thread.to_string());
            cap_newest(&mut context.active_threads);
        }
        if let Some(decision) = add_decision {
            context.recent_decisions.push(decision.to_string());
            cap_newest(&mut context.recent_decisions);
        }
        if let Some(skills) = skills {
            context.skills = skills;
        }
        self.doc().insert(maps::CONTEXT, agent.as_str(), &context);
        Ok(context)
    }
}

/// Keep the newest [`CONTEXT_LIST_CAP`] entries.
fn cap_newest(list: &mut Vec<String>) {
    if list.len() > CONTEXT_LIST_CAP {
        let drop = list.len() - CONTEXT_LIST_CAP;
        list.drain(..drop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::tools;

    #[test]
    fn internal_agents_default_to_this_gateway() {
        let t = tools("bb1");
        t.register_agent("helper", Some("Helper"), AgentType::Internal, None)
            .unwrap();
        let agents = t.list_agents().unwrap();
        let helper = agents.iter().find(|a| a.agent_id == "helper").unwrap();
        assert_eq!(helper.record.gateway, Some(NodeId::new("bb1")));
        assert_eq!(helper.record.name.as_deref(), Some("Helper"));
    }

    #[test]
    fn external_agents_have_no_gateway() {
        let t = tools("bb1");
        t.register_agent(
            "poller",
            None,
            AgentType::External,
            Some(NodeId::new("ignored")),
        )
        .unwrap();
        let agents = t.list_agents().unwrap();
        let poller = agents.iter().find(|a| a.agent_id == "poller").unwrap();
        assert_eq!(poller.record.gateway, None);
    }

    #[test]
    fn empty_agent_id_is_rejected() {
        let t = tools("bb1");
        let err = t
            .register_agent("", None, AgentType::Internal, None)
            .unwrap_err();
        assert_eq!(err.kind(), ansible_core::ErrorKind::InvalidParams);
    }

    #[test]
    fn context_lists_cap_at_ten_newest() {
        let t = tools("bb1");
        for i in 0..12 {
            t.update_context(None, None, Some(&format!("thread-{i}")), None, None)
                .unwrap();
        }
        let context: NodeContext = t.doc().get_as(maps::CONTEXT, "bb1").unwrap();
        assert_eq!(context.active_threads.len(), CONTEXT_LIST_CAP);
        assert_eq!(context.active_threads.first().unwrap(), "thread-2");
        assert_eq!(context.active_threads.last().unwrap(), "thread-11");
    }

    #[test]
    fn skills_feed_delegation_matching() {
        let t = tools("bb1");
        t.update_context(
            Some(AgentId::new("worker")),
            Some("shipping"),
            None,
            None,
            Some(vec!["rust".to_string()]),
        )
        .unwrap();
        let context: NodeContext = t.doc().get_as(maps::CONTEXT, "worker").unwrap();
        assert_eq!(context.skills, vec!["rust".to_string()]);
        assert_eq!(context.current_focus.as_deref(), Some("shipping"));
    }
}
