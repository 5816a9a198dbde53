//! Message tool operations.

use std::collections::BTreeMap;

use ansible_core::limits::{self, MAX_MESSAGE};
use ansible_core::{fresh_id, maps, now_ms, AgentId, Message};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ToolError, ToolResult};

use super::{Tools, ADMIN_CAPABILITY};

/// Literal confirmation string `delete_messages` requires.
pub const DELETE_CONFIRMATION: &str = "DELETE";

/// Minimum length of the audit reason for destructive deletes.
const MIN_DELETE_REASON: usize = 15;

/// Read view of a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub content: String,
    pub timestamp: i64,
    pub unread: bool,
}

/// Selectors and safeguards for `delete_messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteMessagesParams {
    pub ids: Vec<String>,
    pub all: bool,
    pub from: Option<String>,
    pub conversation_id: Option<String>,
    pub before_ts: Option<i64>,
    pub confirm: String,
    pub reason: String,
    pub dry_run: bool,
}

/// Result of `delete_messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessagesResult {
    pub dry_run: bool,
    pub matched: usize,
    pub deleted: usize,
}

impl Tools {
    /// Write a message into the shared state. Empty `to` broadcasts.
    pub fn send_message(
        &self,
        content: &str,
        to: Vec<AgentId>,
        metadata: Option<serde_json::Value>,
    ) -> ToolResult<String> {
        self.ensure_authorized()?;
        limits::ensure_len("content", content, MAX_MESSAGE)?;

        let now = now_ms();
        let message = Message {
            id: fresh_id(),
            from_agent: self.self_agent(),
            from_node: self.node().clone(),
            to_agents: to,
            content: content.to_string(),
            timestamp: now,
            updated_at: now,
            read_by_agents: vec![self.self_agent()],
            metadata,
            delivery: BTreeMap::new(),
        };
        let id = message.id.clone();
        self.doc().insert(maps::MESSAGES, &id, &message);
        self.request_reconcile("send_message");
        Ok(id)
    }

    /// List messages, newest first. By default only messages unread by
    /// this node and addressed to it (or broadcast); `all` lifts the
    /// filter and `from` narrows by sender.
    pub fn read_messages(
        &self,
        all: bool,
        from: Option<&str>,
        limit: Option<usize>,
    ) -> ToolResult<Vec<MessageView>> {
        self.ensure_authorized()?;
        let agent = self.self_agent();
        let limit = limit.unwrap_or(20);

        let mut messages: Vec<Message> = self
            .doc()
            .entries_as::<Message>(maps::MESSAGES)
            .into_iter()
            .map(|(_, m)| m)
            .filter(|m| {
                if let Some(from) = from {
                    if m.from_agent.as_str() != from {
                        return false;
                    }
                }
                if all {
                    return true;
                }
                m.from_agent != agent
                    && m.addressed_to(&agent)
                    && !m.read_by_agents.contains(&agent)
            })
            .collect();
        messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        messages.truncate(limit);

        Ok(messages
            .into_iter()
            .map(|m| MessageView {
                unread: !m.read_by_agents.contains(&agent),
                from: m.from_agent.to_string(),
                to: m.to_agents.iter().map(ToString::to_string).collect(),
                id: m.id,
                content: m.content,
                timestamp: m.timestamp,
            })
            .collect())
    }

    /// Mark messages read for this node. Defaults to everything unread.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidState`] when there is nothing to mark
    /// (the would-be no-op is surfaced, not swallowed).
    pub fn mark_read(&self, message_ids: Option<&[String]>) -> ToolResult<usize> {
        self.ensure_authorized()?;
        let agent = self.self_agent();

        let targets: Vec<String> = match message_ids {
            Some(ids) => {
                let mut found = Vec::new();
                for id in ids {
                    let message: Message = self
                        .doc()
                        .get_as(maps::MESSAGES, id)
                        .ok_or_else(|| ToolError::NotFound {
                            what: format!("message {id}"),
                        })?;
                    if !message.read_by_agents.contains(&agent) {
                        found.push(id.clone());
                    }
                }
                found
            },
            None => self.unread_for_self().into_iter().map(|(k, _)| k).collect(),
        };

        if targets.is_empty() {
            return Err(ToolError::InvalidState(
                "no unread messages to mark".to_string(),
            ));
        }

        for id in &targets {
            let mut read_by: Vec<String> = self
                .doc()
                .get(maps::MESSAGES, id)
                .and_then(|v| v.get("readBy_agents").cloned())
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            read_by.push(agent.as_str().to_string());
            self.doc().set_field(
                maps::MESSAGES,
                id,
                "readBy_agents",
                serde_json::to_value(&read_by).unwrap_or_default(),
            );
        }
        Ok(targets.len())
    }

    /// Destructive message deletion: admin capability, literal
    /// confirmation, a real reason, and at least one selector.
    pub fn delete_messages(&self, params: &DeleteMessagesParams) -> ToolResult<DeleteMessagesResult> {
        self.ensure_authorized()?;
        if !self.has_capability(ADMIN_CAPABILITY) {
            return Err(ToolError::NotAuthorized);
        }
        if params.confirm != DELETE_CONFIRMATION {
            return Err(ToolError::InvalidParams(format!(
                "confirm must be the literal string {DELETE_CONFIRMATION:?}"
            )));
        }
        if params.reason.chars().count() < MIN_DELETE_REASON {
            return Err(ToolError::InvalidParams(format!(
                "reason must be at least {MIN_DELETE_REASON} characters"
            )));
        }
        let has_selector = !params.ids.is_empty()
            || params.all
            || params.from.is_some()
            || params.conversation_id.is_some()
            || params.before_ts.is_some();
        if !has_selector {
            return Err(ToolError::InvalidParams(
                "at least one selector is required".to_string(),
            ));
        }

        let matched: Vec<String> = self
            .doc()
            .entries_as::<Message>(maps::MESSAGES)
            .into_iter()
            .filter(|(key, m)| {
                if !params.ids.is_empty() && !params.ids.contains(key) {
                    return false;
                }
                if let Some(from) = &params.from {
                    if m.from_agent.as_str() != from {
                        return false;
                    }
                }
                if let Some(conversation) = &params.conversation_id {
                    let matches = m
                        .metadata
                        .as_ref()
                        .and_then(|meta| meta.get("conversationId"))
                        .and_then(|v| v.as_str())
                        == Some(conversation.as_str());
                    if !matches {
                        return false;
                    }
                }
                if let Some(before) = params.before_ts {
                    if m.timestamp >= before {
                        return false;
                    }
                }
                true
            })
            .map(|(key, _)| key)
            .collect();

        let result = DeleteMessagesResult {
            dry_run: params.dry_run,
            matched: matched.len(),
            deleted: if params.dry_run { 0 } else { matched.len() },
        };
        if params.dry_run {
            info!(matched = result.matched, "delete_messages dry run");
            return Ok(result);
        }

        for key in &matched {
            self.doc().remove(maps::MESSAGES, key);
        }
        warn!(
            deleted = result.deleted,
            reason = %params.reason,
            "messages deleted by operator"
        );
        Ok(result)
    }
}
