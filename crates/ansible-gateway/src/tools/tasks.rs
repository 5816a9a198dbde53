//! Task tool operations.

use std::collections::BTreeMap;

use ansible_core::limits::{self, MAX_CONTEXT, MAX_DESCRIPTION, MAX_RESULT, MAX_TITLE};
use ansible_core::{
    fresh_id, maps, now_ms, AgentId, NodeContext, Task, TaskStatus, TaskUpdate,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ToolError, ToolResult};

use super::Tools;

/// Result of `delegate_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateTaskResult {
    pub task_id: String,
    pub assigned_to: Vec<String>,
}

/// Read view of a task (`get_task` / `list_tasks`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub assigned_to: Vec<String>,
    pub claimed_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            assigned_to: task.assignees().iter().map(ToString::to_string).collect(),
            claimed_by: task.claimed_by_agent.as_ref().map(ToString::to_string),
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

impl Tools {
    /// Create a pending task, resolving its assignment: an explicit
    /// assignee takes precedence; otherwise a required skill is matched
    /// against every agent's published context.
    pub fn delegate_task(
        &self,
        title: &str,
        description: &str,
        context: Option<&str>,
        assigned_to: Option<AgentId>,
        requires: Vec<String>,
        skill_required: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> ToolResult<DelegateTaskResult> {
        self.ensure_authorized()?;
        limits::ensure_len("title", title, MAX_TITLE)?;
        limits::ensure_len("description", description, MAX_DESCRIPTION)?;
        if let Some(context) = context {
            limits::ensure_max_len("context", context, MAX_CONTEXT)?;
        }

        let assignees: Vec<AgentId> = if let Some(agent) = assigned_to {
            vec![agent]
        } else if let Some(skill) = &skill_required {
            self.doc()
                .entries_as::<NodeContext>(maps::CONTEXT)
                .into_iter()
                .filter(|(_, c)| c.skills.iter().any(|s| s == skill))
                .map(|(agent, _)| AgentId::new(agent))
                .collect()
        } else {
            Vec::new()
        };

        let now = now_ms();
        let task = Task {
            id: fresh_id(),
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            created_by_agent: self.self_agent(),
            created_by_node: self.node().clone(),
            created_at: now,
            updated_at: now,
            assigned_to_agent: assignees.first().cloned(),
            assigned_to_agents: assignees.iter().skip(1).cloned().collect(),
            requires,
            skill_required,
            claimed_by_agent: None,
            claimed_by_node: None,
            claimed_at: None,
            completed_at: None,
            result: None,
            context: context.map(ToString::to_string),
            intent: None,
            metadata,
            updates: Vec::new(),
            delivery: BTreeMap::new(),
        };
        let id = task.id.clone();
        self.doc().insert(maps::TASKS, &id, &task);
        self.request_reconcile("delegate_task");
        debug!(task = %id, assignees = assignees.len(), "task delegated");
        Ok(DelegateTaskResult {
            task_id: id,
            assigned_to: assignees.iter().map(ToString::to_string).collect(),
        })
    }

    /// Transition a pending task to claimed. Accepts an id prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::InvalidState`] for any non-pending task —
    /// reclaiming is always rejected.
    pub fn claim_task(&self, task_ref: &str, agent: Option<AgentId>) -> ToolResult<TaskView> {
        self.ensure_authorized()?;
        let (key, mut task) = self.resolve_task(task_ref)?;
        if task.status != TaskStatus::Pending {
            return Err(ToolError::InvalidState(format!(
                "task {key} is {:?}, only pending tasks can be claimed",
                task.status
            )));
        }

        let claimer = agent.unwrap_or_else(|| self.self_agent());
        let now = now_ms();
        task.status = TaskStatus::Claimed;
        task.claimed_by_agent = Some(claimer.clone());
        task.claimed_by_node = Some(self.node().clone());
        task.claimed_at = Some(now);
        task.updated_at = now;
        self.doc().insert(maps::TASKS, &key, &task);
        self.request_reconcile("claim_task");
        Ok(TaskView::from(&task))
    }

    /// Progress update from the claimer: `in_progress` or `failed`, with
    /// an optional note and partial result.
    pub fn update_task(
        &self,
        task_ref: &str,
        status: TaskStatus,
        note: Option<&str>,
        result: Option<&str>,
        notify: bool,
        agent: Option<AgentId>,
    ) -> ToolResult<TaskView> {
        self.ensure_authorized()?;
        if !matches!(status, TaskStatus::InProgress | TaskStatus::Failed) {
            return Err(ToolError::InvalidParams(
                "status must be in_progress or failed".to_string(),
            ));
        }
        if let Some(result) = result {
            limits::ensure_max_len("result", result, MAX_RESULT)?;
        }

        let (key, mut task) = self.resolve_task(task_ref)?;
        let acting = agent.unwrap_or_else(|| self.self_agent());
        self.ensure_claimer(&task, &acting)?;

        let now = now_ms();
        task.status = status;
        task.updated_at = now;
        if let Some(result) = result {
            task.result = Some(result.to_string());
        }
        task.updates.push(TaskUpdate {
            at: now,
            by_agent: acting.clone(),
            status: Some(status),
            note: note.map(ToString::to_string),
        });
        self.doc().insert(maps::TASKS, &key, &task);

        if notify {
            self.notify_creator(&task, &acting, &format!("task update ({status:?})"), note);
        }
        Ok(TaskView::from(&task))
    }

    /// Complete a task. Only the claimer may; the creator is always
    /// notified (best-effort).
    pub fn complete_task(
        &self,
        task_ref: &str,
        result: Option<&str>,
        agent: Option<AgentId>,
    ) -> ToolResult<TaskView> {
        self.ensure_authorized()?;
        if let Some(result) = result {
            limits::ensure_max_len("result", result, MAX_RESULT)?;
        }

        let (key, mut task) = self.resolve_task(task_ref)?;
        let acting = agent.unwrap_or_else(|| self.self_agent());
        self.ensure_claimer(&task, &acting)?;

        let now = now_ms();
        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.updated_at = now;
        if let Some(result) = result {
            task.result = Some(result.to_string());
        }
        task.updates.push(TaskUpdate {
            at: now,
            by_agent: acting.clone(),
            status: Some(TaskStatus::Completed),
            note: None,
        });
        self.doc().insert(maps::TASKS, &key, &task);

        self.notify_creator(&task, &acting, "task completed", result);
        Ok(TaskView::from(&task))
    }

    /// Fetch one task by id or unique prefix.
    pub fn get_task(&self, task_ref: &str) -> ToolResult<Task> {
        self.ensure_authorized()?;
        Ok(self.resolve_task(task_ref)?.1)
    }

    /// List tasks, optionally filtered by status, newest first.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> ToolResult<Vec<TaskView>> {
        self.ensure_authorized()?;
        let mut tasks: Vec<Task> = self
            .doc()
            .entries_as::<Task>(maps::TASKS)
            .into_iter()
            .map(|(_, t)| t)
            .filter(|t| status.map_or(true, |s| t.status == s))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(tasks.iter().map(TaskView::from).collect())
    }

    fn ensure_claimer(&self, task: &Task, acting: &AgentId) -> ToolResult<()> {
        match &task.claimed_by_agent {
            Some(claimer) if claimer == acting => Ok(()),
            Some(claimer) => Err(ToolError::InvalidState(format!(
                "task {} is claimed by {claimer}",
                task.id
            ))),
            None => Err(ToolError::InvalidState(format!(
                "task {} is not claimed",
                task.id
            ))),
        }
    }

    /// Best-effort notification to the task creator; a failure is logged
    /// and never fails the parent operation.
    fn notify_creator(&self, task: &Task, from: &AgentId, what: &str, detail: Option<&str>) {
        if task.created_by_agent == *from {
            return;
        }
        let content = match detail {
            Some(detail) => format!("{what}: {} — {detail}", task.title),
            None => format!("{what}: {}", task.title),
        };
        if let Err(e) = self.send_message(&content, vec![task.created_by_agent.clone()], None) {
            warn!(task = %task.id, error = %e, "creator notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::tools;
    use ansible_core::Message;

    #[test]
    fn delegate_validates_limits_at_the_boundary() {
        let t = tools("bb1");
        let title = "x".repeat(MAX_TITLE);
        t.delegate_task(&title, "d", None, None, Vec::new(), None, None)
            .unwrap();

        let too_long = "x".repeat(MAX_TITLE + 1);
        let err = t
            .delegate_task(&too_long, "d", None, None, Vec::new(), None, None)
            .unwrap_err();
        assert_eq!(err.kind(), ansible_core::ErrorKind::InvalidParams);

        let description = "y".repeat(MAX_DESCRIPTION + 1);
        let err = t
            .delegate_task("t", &description, None, None, Vec::new(), None, None)
            .unwrap_err();
        assert_eq!(err.kind(), ansible_core::ErrorKind::InvalidParams);
    }

    #[test]
    fn delegation_resolves_assignment_by_skill() {
        let t = tools("bb1");
        t.doc().insert(
            maps::CONTEXT,
            "rustacean",
            &NodeContext {
                skills: vec!["rust".to_string()],
                ..NodeContext::default()
            },
        );
        t.doc().insert(
            maps::CONTEXT,
            "pythonista",
            &NodeContext {
                skills: vec!["python".to_string()],
                ..NodeContext::default()
            },
        );

        let result = t
            .delegate_task(
                "port it",
                "port the thing",
                None,
                None,
                Vec::new(),
                Some("rust".to_string()),
                None,
            )
            .unwrap();
        assert_eq!(result.assigned_to, vec!["rustacean".to_string()]);

        // Explicit assignment wins over skill matching.
        let result = t
            .delegate_task(
                "port it",
                "port the thing",
                None,
                Some(AgentId::new("chosen")),
                Vec::new(),
                Some("rust".to_string()),
                None,
            )
            .unwrap();
        assert_eq!(result.assigned_to, vec!["chosen".to_string()]);
    }

    #[test]
    fn claim_lifecycle_rejects_reclaim_and_non_claimer_updates() {
        let t = tools("bb1");
        let created = t
            .delegate_task("work", "do it", None, Some(AgentId::new("bb1")), Vec::new(), None, None)
            .unwrap();

        let view = t.claim_task(&created.task_id, None).unwrap();
        assert_eq!(view.status, TaskStatus::Claimed);
        assert_eq!(view.claimed_by.as_deref(), Some("bb1"));

        // Reclaim of a non-pending task is rejected.
        let err = t.claim_task(&created.task_id, None).unwrap_err();
        assert_eq!(err.kind(), ansible_core::ErrorKind::InvalidState);

        // A non-claimer cannot update or complete.
        let err = t
            .update_task(
                &created.task_id,
                TaskStatus::InProgress,
                None,
                None,
                false,
                Some(AgentId::new("intruder")),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ansible_core::ErrorKind::InvalidState);
        let err = t
            .complete_task(&created.task_id, None, Some(AgentId::new("intruder")))
            .unwrap_err();
        assert_eq!(err.kind(), ansible_core::ErrorKind::InvalidState);

        // The claimer can move it along.
        let view = t
            .update_task(
                &created.task_id,
                TaskStatus::InProgress,
                Some("halfway"),
                None,
                false,
                None,
            )
            .unwrap();
        assert_eq!(view.status, TaskStatus::InProgress);

        let view = t.complete_task(&created.task_id, Some("done"), None).unwrap();
        assert_eq!(view.status, TaskStatus::Completed);
        let stored: Task = t.doc().get_as(maps::TASKS, &created.task_id).unwrap();
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.result.as_deref(), Some("done"));
        assert_eq!(stored.updates.len(), 2);
    }

    #[test]
    fn update_task_accepts_only_progress_or_failed() {
        let t = tools("bb1");
        let created = t
            .delegate_task("work", "do it", None, None, Vec::new(), None, None)
            .unwrap();
        t.claim_task(&created.task_id, None).unwrap();

        let err = t
            .update_task(&created.task_id, TaskStatus::Completed, None, None, false, None)
            .unwrap_err();
        assert_eq!(err.kind(), ansible_core::ErrorKind::InvalidParams);
    }

    #[test]
    fn completion_notifies_the_creator() {
        let t = tools("bb1");
        let created = t
            .delegate_task("work", "do it", None, None, Vec::new(), None, None)
            .unwrap();
        // Claim as a different agent so the creator notification fires.
        t.claim_task(&created.task_id, Some(AgentId::new("worker")))
            .unwrap();
        t.complete_task(&created.task_id, Some("all good"), Some(AgentId::new("worker")))
            .unwrap();

        let notification = t
            .doc()
            .entries_as::<Message>(maps::MESSAGES)
            .into_iter()
            .map(|(_, m)| m)
            .find(|m| m.content.contains("task completed"))
            .expect("creator notification");
        assert_eq!(notification.to_agents, vec![AgentId::new("bb1")]);
    }

    #[test]
    fn list_tasks_filters_by_status() {
        let t = tools("bb1");
        let a = t
            .delegate_task("a", "d", None, None, Vec::new(), None, None)
            .unwrap();
        let _b = t
            .delegate_task("b", "d", None, None, Vec::new(), None, None)
            .unwrap();
        t.claim_task(&a.task_id, None).unwrap();

        assert_eq!(t.list_tasks(None).unwrap().len(), 2);
        assert_eq!(t.list_tasks(Some(TaskStatus::Pending)).unwrap().len(), 1);
        assert_eq!(t.list_tasks(Some(TaskStatus::Claimed)).unwrap().len(), 1);
        assert_eq!(t.get_task(&a.task_id).unwrap().id, a.task_id);
    }
}
