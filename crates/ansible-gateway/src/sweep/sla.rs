//! SLA breach detection with anti-storm controls.
//!
//! Coordinator-only. Deadlines live in each task's `metadata.ansible.sla`
//! block; a breach is escalated exactly once (the escalation timestamp is
//! the guard), and at most `maxMessagesPerSweep` notification messages go
//! out per sweep. Breaches past the budget are still marked escalated with
//! a `message_budget_exhausted` outcome so the next sweep does not
//! re-notify them.

use std::collections::BTreeMap;
use std::time::Duration;

use ansible_core::{
    fresh_id, maps, now_ms, AgentId, Message, NodeId, SlaOutcome, SlaSpec, Task, TaskStatus,
};
use ansible_state::Document;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::coord;

/// Default sweep cadence.
pub const DEFAULT_SLA_EVERY_SECS: u64 = 300;

/// Default per-sweep notification budget.
pub const DEFAULT_MAX_MESSAGES: usize = 20;

/// One detected breach.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaBreach {
    pub task_id: String,
    /// `accept`, `progress`, or `complete`.
    pub breach: String,
    pub targets: Vec<String>,
    pub notified: bool,
    pub reason: String,
}

/// Sweep result, also the tool-surface return shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaSweepReport {
    pub dry_run: bool,
    pub scanned: usize,
    pub breaches: Vec<SlaBreach>,
    pub breach_count: usize,
    pub escalations_written: usize,
}

/// Sweep controls (resolved from the coordination map plus config
/// fallbacks before each run).
#[derive(Debug, Clone)]
pub struct SlaSweepOptions {
    pub dry_run: bool,
    pub record_only: bool,
    pub max_messages: usize,
    pub fyi_agents: Vec<AgentId>,
}

impl Default for SlaSweepOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            record_only: false,
            max_messages: DEFAULT_MAX_MESSAGES,
            fyi_agents: Vec::new(),
        }
    }
}

/// Breach types a task can hit, with their guard fields.
fn due_breaches(task: &Task, sla: &SlaSpec, now: i64) -> Vec<&'static str> {
    let mut due = Vec::new();
    if task.status == TaskStatus::Pending
        && sla.accept_by_at.is_some_and(|t| now > t)
        && sla.escalations.accept_at.is_none()
    {
        due.push("accept");
    }
    let active = matches!(task.status, TaskStatus::Claimed | TaskStatus::InProgress);
    if active
        && sla.progress_by_at.is_some_and(|t| now > t)
        && sla.escalations.progress_at.is_none()
    {
        due.push("progress");
    }
    if active
        && sla.complete_by_at.is_some_and(|t| now > t)
        && sla.escalations.complete_at.is_none()
    {
        due.push("complete");
    }
    due
}

fn mark_escalated(sla: &mut SlaSpec, breach: &'static str, now: i64) {
    match breach {
        "accept" => sla.escalations.accept_at = Some(now),
        "progress" => sla.escalations.progress_at = Some(now),
        _ => sla.escalations.complete_at = Some(now),
    }
}

/// Run one sweep over all tasks.
#[must_use]
pub fn sla_sweep(
    doc: &Document,
    node: &NodeId,
    opts: &SlaSweepOptions,
    now: i64,
) -> SlaSweepReport {
    let tasks: Vec<(String, Task)> = doc.entries_as(maps::TASKS);
    let scanned = tasks.len();
    let mut breaches = Vec::new();
    let mut messages_sent = 0usize;

    for (key, task) in tasks {
        let Some(mut sla) = task.sla() else { continue };
        let due = due_breaches(&task, &sla, now);
        if due.is_empty() {
            continue;
        }

        if opts.dry_run {
            for breach in due {
                breaches.push(SlaBreach {
                    task_id: task.id.clone(),
                    breach: breach.to_string(),
                    targets: Vec::new(),
                    notified: false,
                    reason: "dry_run".to_string(),
                });
            }
            continue;
        }

        let mut task = task;
        for breach in due {
            mark_escalated(&mut sla, breach, now);

            let mut targets: Vec<AgentId> = Vec::new();
            targets.push(task.created_by_agent.clone());
            if let Some(claimer) = &task.claimed_by_agent {
                if !targets.contains(claimer) {
                    targets.push(claimer.clone());
                }
            }
            targets.retain(|t| !t.as_str().is_empty());
            if targets.is_empty() {
                targets = opts.fyi_agents.clone();
            }

            let (notified, reason) = if opts.record_only {
                (false, "record_only")
            } else if targets.is_empty() {
                (false, "no_targets")
            } else if messages_sent < opts.max_messages {
                notify(doc, node, &task, breach, &targets, now);
                messages_sent += 1;
                (true, "notified")
            } else {
                (false, "message_budget_exhausted")
            };

            sla.escalation_outcomes.insert(
                breach.to_string(),
                SlaOutcome {
                    at: now,
                    reason: reason.to_string(),
                    targets: if notified { targets.clone() } else { Vec::new() },
                },
            );
            breaches.push(SlaBreach {
                task_id: task.id.clone(),
                breach: breach.to_string(),
                targets: targets.iter().map(ToString::to_string).collect(),
                notified,
                reason: reason.to_string(),
            });
        }

        task.set_sla(&sla);
        doc.set_field(
            maps::TASKS,
            &key,
            "metadata",
            task.metadata.clone().unwrap_or_default(),
        );
    }

    let breach_count = breaches.len();
    if breach_count > 0 {
        info!(
            scanned,
            breach_count, messages_sent, dry_run = opts.dry_run, "sla sweep"
        );
    } else {
        debug!(scanned, "sla sweep found no breaches");
    }
    SlaSweepReport {
        dry_run: opts.dry_run,
        scanned,
        breaches,
        breach_count,
        escalations_written: messages_sent,
    }
}

fn notify(
    doc: &Document,
    node: &NodeId,
    task: &Task,
    breach: &str,
    targets: &[AgentId],
    now: i64,
) {
    let message = Message {
        id: fresh_id(),
        from_agent: node.as_agent(),
        from_node: node.clone(),
        to_agents: targets.to_vec(),
        content: format!(
            "SLA breach ({breach}) on task {}: {} (status {:?})",
            task.id, task.title, task.status
        ),
        timestamp: now,
        updated_at: now,
        read_by_agents: vec![node.as_agent()],
        metadata: None,
        delivery: BTreeMap::new(),
    };
    doc.insert(maps::MESSAGES, &message.id.clone(), &message);
}

/// Run the SLA sweep on its cadence until shutdown, re-reading the
/// coordinator role and the coordination-map knobs on every tick.
pub async fn run_sla(
    doc: Document,
    node: NodeId,
    config: crate::config::SlaSweepConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let every = u64::try_from(coord::get_i64(
            &doc,
            coord::SLA_SWEEP_EVERY_SECONDS,
            i64::try_from(config.every_seconds).unwrap_or(300),
        ))
        .unwrap_or(DEFAULT_SLA_EVERY_SECS)
        .max(30);

        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            () = tokio::time::sleep(Duration::from_secs(every)) => {
                if !coord::get_bool(&doc, coord::SLA_SWEEP_ENABLED, config.enabled) {
                    continue;
                }
                if !coord::is_coordinator(&doc, node.as_str()) {
                    continue;
                }
                let opts = SlaSweepOptions {
                    dry_run: false,
                    record_only: coord::get_bool(&doc, coord::SLA_SWEEP_RECORD_ONLY, config.record_only),
                    max_messages: usize::try_from(coord::get_i64(
                        &doc,
                        coord::SLA_SWEEP_MAX_MESSAGES,
                        i64::try_from(config.max_messages_per_sweep).unwrap_or(20),
                    ))
                    .unwrap_or(DEFAULT_MAX_MESSAGES),
                    fyi_agents: {
                        let from_doc = coord::get_string_list(&doc, coord::SLA_SWEEP_FYI_AGENTS);
                        let raw = if from_doc.is_empty() { config.fyi_agents.clone() } else { from_doc };
                        raw.into_iter().map(AgentId::new).collect()
                    },
                };
                let now = now_ms();
                let _ = sla_sweep(&doc, &node, &opts, now);
                doc.insert_value(maps::COORDINATION, coord::SLA_SWEEP_LAST_AT, now.into());
            }
        }
    }
}
