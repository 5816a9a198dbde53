//! Closed-task retention prune.
//!
//! Coordinator-only, and only on backbone nodes. The cadence and the
//! retention window live in the coordination map so operators can tune
//! them mesh-wide; the check itself runs every five minutes and compares
//! against `retentionLastPruneAt`.

use std::time::Duration;

use ansible_core::{maps, now_ms, NodeId, NodeInfo, NodeTier, Task};
use ansible_state::Document;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::coord;

/// Default retention for closed tasks (7 days).
pub const DEFAULT_RETENTION_SECS: i64 = 7 * 86_400;

/// Default prune cadence (daily).
pub const DEFAULT_PRUNE_EVERY_SECS: i64 = 86_400;

/// How often the due-time is checked.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Result of a prune that actually ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneOutcome {
    pub deleted: usize,
    pub pruned_at: i64,
}

/// One retention check. Returns `None` when this node is not the
/// coordinator, is not backbone, or the prune is not due yet.
pub fn retention_tick(doc: &Document, node: &NodeId, now: i64) -> Option<PruneOutcome> {
    if !coord::is_coordinator(doc, node.as_str()) {
        return None;
    }
    let tier = doc
        .get_as::<NodeInfo>(maps::NODES, node.as_str())
        .map(|info| info.tier)?;
    if tier != NodeTier::Backbone {
        return None;
    }

    let every = coord::get_i64(doc, coord::RETENTION_PRUNE_EVERY_SECONDS, DEFAULT_PRUNE_EVERY_SECS);
    let last = coord::get_i64(doc, coord::RETENTION_LAST_PRUNE_AT, 0);
    if now < last.saturating_add(every.saturating_mul(1_000)) {
        return None;
    }

    let retention = coord::get_i64(
        doc,
        coord::RETENTION_CLOSED_TASK_SECONDS,
        DEFAULT_RETENTION_SECS,
    );
    let cutoff = now.saturating_sub(retention.saturating_mul(1_000));

    let mut deleted = 0;
    for (key, task) in doc.entries_as::<Task>(maps::TASKS) {
        if task.status.is_closed() && task.closed_at() < cutoff {
            doc.remove(maps::TASKS, &key);
            deleted += 1;
        }
    }
    doc.insert_value(maps::COORDINATION, coord::RETENTION_LAST_PRUNE_AT, now.into());

    if deleted > 0 {
        info!(deleted, "retention prune removed closed tasks");
    } else {
        debug!("retention prune found nothing to remove");
    }
    Some(PruneOutcome {
        deleted,
        pruned_at: now,
    })
}

/// Run the retention check on its cadence until shutdown.
pub async fn run_retention(doc: Document, node: NodeId, mut shutdown_rx: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            () = tokio::time::sleep(CHECK_INTERVAL) => {
                let _ = retention_tick(&doc, &node, now_ms());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ansible_core::{AgentId, TaskStatus};
    use std::collections::BTreeMap;

    fn closed_task(id: &str, completed_at: i64) -> Task {
        Task {
            id: id.to_string(),
            title: "done".to_string(),
            description: "d".to_string(),
            status: TaskStatus::Completed,
            created_by_agent: AgentId::new("a"),
            created_by_node: NodeId::new("bb1"),
            created_at: completed_at - 1_000,
            updated_at: completed_at,
            assigned_to_agent: None,
            assigned_to_agents: Vec::new(),
            requires: Vec::new(),
            skill_required: None,
            claimed_by_agent: None,
            claimed_by_node: None,
            claimed_at: None,
            completed_at: Some(completed_at),
            result: None,
            context: None,
            intent: None,
            metadata: None,
            updates: Vec::new(),
            delivery: BTreeMap::new(),
        }
    }

    fn backbone_coordinator(doc: &Document, node: &str) {
        doc.insert(
            maps::NODES,
            node,
            &NodeInfo {
                tier: NodeTier::Backbone,
                capabilities: Vec::new(),
                added_by: NodeId::new(node),
                added_at: 1,
            },
        );
        doc.insert_value(maps::COORDINATION, coord::COORDINATOR, node.into());
    }

    #[test]
    fn prunes_old_closed_tasks_and_stamps_last_prune() {
        let doc = Document::new("bb1");
        let node = NodeId::new("bb1");
        backbone_coordinator(&doc, "bb1");

        let now = now_ms();
        // Ten days old: past the 7-day default retention.
        doc.insert(maps::TASKS, "t-old", &closed_task("t-old", now - 10 * 86_400_000));
        // One day old: kept.
        doc.insert(maps::TASKS, "t-new", &closed_task("t-new", now - 86_400_000));
        // Open task, ancient: kept (retention only touches closed).
        let mut open = closed_task("t-open", now - 30 * 86_400_000);
        open.status = TaskStatus::InProgress;
        open.completed_at = None;
        doc.insert(maps::TASKS, "t-open", &open);

        let outcome = retention_tick(&doc, &node, now).unwrap();
        assert_eq!(outcome.deleted, 1);
        assert!(!doc.contains(maps::TASKS, "t-old"));
        assert!(doc.contains(maps::TASKS, "t-new"));
        assert!(doc.contains(maps::TASKS, "t-open"));
        assert_eq!(
            coord::get_i64(&doc, coord::RETENTION_LAST_PRUNE_AT, 0),
            now
        );
    }

    #[test]
    fn respects_the_cadence() {
        let doc = Document::new("bb1");
        let node = NodeId::new("bb1");
        backbone_coordinator(&doc, "bb1");

        let now = now_ms();
        assert!(retention_tick(&doc, &node, now).is_some());
        // Immediately after a prune, the next check is not due.
        assert!(retention_tick(&doc, &node, now + 1_000).is_none());
        // A day later it is.
        assert!(retention_tick(&doc, &node, now + DEFAULT_PRUNE_EVERY_SECS * 1_000 + 1).is_some());
    }

    #[test]
    fn non_coordinator_tick_is_a_noop() {
        let doc = Document::new("bb1");
        let node = NodeId::new("bb1");
        backbone_coordinator(&doc, "bb1");
        let now = now_ms();
        doc.insert(maps::TASKS, "t-old", &closed_task("t-old", now - 10 * 86_400_000));

        // Coordinator moves away; the next tick must do nothing.
        doc.insert_value(maps::COORDINATION, coord::COORDINATOR, "e1".into());
        assert!(retention_tick(&doc, &node, now).is_none());
        assert!(doc.contains(maps::TASKS, "t-old"));
    }

    #[test]
    fn edge_tier_never_prunes() {
        let doc = Document::new("e1");
        let node = NodeId::new("e1");
        doc.insert(
            maps::NODES,
            "e1",
            &NodeInfo {
                tier: NodeTier::Edge,
                capabilities: Vec::new(),
                added_by: NodeId::new("bb1"),
                added_at: 1,
            },
        );
        doc.insert_value(maps::COORDINATION, coord::COORDINATOR, "e1".into());

        assert!(retention_tick(&doc, &node, now_ms()).is_none());
    }

    #[test]
    fn custom_retention_window_applies() {
        let doc = Document::new("bb1");
        let node = NodeId::new("bb1");
        backbone_coordinator(&doc, "bb1");
        doc.insert_value(
            maps::COORDINATION,
            coord::RETENTION_CLOSED_TASK_SECONDS,
            3_600.into(),
        );

        let now = now_ms();
        doc.insert(maps::TASKS, "t-2h", &closed_task("t-2h", now - 2 * 3_600_000));
        doc.insert(maps::TASKS, "t-30m", &closed_task("t-30m", now - 1_800_000));

        let outcome = retention_tick(&doc, &node, now).unwrap();
        assert_eq!(outcome.deleted, 1);
        assert!(doc.contains(maps::TASKS, "t-30m"));
    }
}
