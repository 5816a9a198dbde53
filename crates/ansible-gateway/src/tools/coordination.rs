//! Coordination and delegation-policy tool operations.

use ansible_core::{maps, now_ms, AgentId, NodeId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::coord;
use crate::error::{ToolError, ToolResult};
use crate::sweep::sla::{sla_sweep, SlaSweepOptions, SlaSweepReport};

use super::Tools;

/// The versioned delegation policy blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationPolicy {
    pub version: String,
    pub checksum: String,
    pub markdown: String,
    pub updated_at: i64,
    pub updated_by: String,
}

impl Tools {
    /// The whole coordination map, materialized.
    pub fn get_coordination(&self) -> ToolResult<serde_json::Value> {
        self.ensure_authorized()?;
        let entries: serde_json::Map<String, serde_json::Value> = self
            .doc()
            .entries(maps::COORDINATION)
            .into_iter()
            .collect();
        Ok(serde_json::Value::Object(entries))
    }

    /// Record this node's preference under `pref:<nodeId>`.
    pub fn set_coordination_preference(&self, preference: &str) -> ToolResult<()> {
        self.ensure_authorized()?;
        self.doc().insert_value(
            maps::COORDINATION,
            &coord::pref_key(self.node().as_str()),
            preference.into(),
        );
        Ok(())
    }

    /// Set the coordinator (and optionally the sweep cadence). Moving the
    /// role away from an existing holder requires the explicit
    /// last-resort confirmation.
    pub fn set_coordination(
        &self,
        coordinator: &NodeId,
        sweep_every_seconds: Option<i64>,
        confirm_last_resort: bool,
    ) -> ToolResult<()> {
        self.ensure_authorized()?;
        if let Some(current) = coord::coordinator(self.doc()) {
            if current != coordinator.as_str() && !confirm_last_resort {
                return Err(ToolError::InvalidState(format!(
                    "coordinator is already {current}; pass confirmLastResort to move the role"
                )));
            }
        }
        self.doc().insert_value(
            maps::COORDINATION,
            coord::COORDINATOR,
            coordinator.as_str().into(),
        );
        if let Some(every) = sweep_every_seconds {
            if every < 30 {
                return Err(ToolError::InvalidParams(
                    "sweepEverySeconds must be >= 30".to_string(),
                ));
            }
            self.doc()
                .insert_value(maps::COORDINATION, coord::SWEEP_EVERY_SECONDS, every.into());
        }
        info!(coordinator = %coordinator, "coordinator set");
        Ok(())
    }

    /// Configure closed-task retention: days in [1, 90], cadence hours in
    /// [1, 168].
    pub fn set_retention(
        &self,
        closed_task_retention_days: i64,
        prune_every_hours: i64,
    ) -> ToolResult<()> {
        self.ensure_authorized()?;
        if !(1..=90).contains(&closed_task_retention_days) {
            return Err(ToolError::InvalidParams(
                "closedTaskRetentionDays must be in [1, 90]".to_string(),
            ));
        }
        if !(1..=168).contains(&prune_every_hours) {
            return Err(ToolError::InvalidParams(
                "pruneEveryHours must be in [1, 168]".to_string(),
            ));
        }
        self.doc().insert_value(
            maps::COORDINATION,
            coord::RETENTION_CLOSED_TASK_SECONDS,
            (closed_task_retention_days * 86_400).into(),
        );
        self.doc().insert_value(
            maps::COORDINATION,
            coord::RETENTION_PRUNE_EVERY_SECONDS,
            (prune_every_hours * 3_600).into(),
        );
        Ok(())
    }

    /// Read the current delegation policy.
    pub fn get_delegation_policy(&self) -> ToolResult<DelegationPolicy> {
        self.ensure_authorized()?;
        let doc = self.doc();
        let markdown = coord::get_string(doc, coord::DELEGATION_POLICY_MARKDOWN)
            .ok_or_else(|| ToolError::NotFound {
                what: "delegation policy".to_string(),
            })?;
        Ok(DelegationPolicy {
            version: coord::get_string(doc, coord::DELEGATION_POLICY_VERSION).unwrap_or_default(),
            checksum: coord::get_string(doc, coord::DELEGATION_POLICY_CHECKSUM).unwrap_or_default(),
            markdown,
            updated_at: coord::get_i64(doc, coord::DELEGATION_POLICY_UPDATED_AT, 0),
            updated_by: coord::get_string(doc, coord::DELEGATION_POLICY_UPDATED_BY)
                .unwrap_or_default(),
        })
    }

    /// Publish a new delegation policy. Coordinator-only; the checksum
    /// defaults to sha-256 over the markdown.
    pub fn set_delegation_policy(
        &self,
        policy_markdown: &str,
        version: &str,
        checksum: Option<&str>,
        notify_agents: &[AgentId],
    ) -> ToolResult<DelegationPolicy> {
        self.ensure_authorized()?;
        let current = coord::coordinator(self.doc());
        if current.as_deref() != Some(self.node().as_str()) {
            return Err(ToolError::NotCoordinator {
                current: current.unwrap_or_else(|| "<unset>".to_string()),
            });
        }
        if policy_markdown.is_empty() || version.is_empty() {
            return Err(ToolError::InvalidParams(
                "policyMarkdown and version are required".to_string(),
            ));
        }

        let checksum = match checksum {
            Some(checksum) => checksum.to_string(),
            None => sha256_hex(policy_markdown),
        };
        let now = now_ms();
        let doc = self.doc();
        doc.insert_value(maps::COORDINATION, coord::DELEGATION_POLICY_MARKDOWN, policy_markdown.into());
        doc.insert_value(maps::COORDINATION, coord::DELEGATION_POLICY_VERSION, version.into());
        doc.insert_value(maps::COORDINATION, coord::DELEGATION_POLICY_CHECKSUM, checksum.clone().into());
        doc.insert_value(maps::COORDINATION, coord::DELEGATION_POLICY_UPDATED_AT, now.into());
        doc.insert_value(
            maps::COORDINATION,
            coord::DELEGATION_POLICY_UPDATED_BY,
            self.node().as_str().into(),
        );

        for agent in notify_agents {
            let note = format!("delegation policy updated to version {version}");
            if let Err(e) = self.send_message(&note, vec![agent.clone()], None) {
                warn!(agent = %agent, error = %e, "policy notification failed");
            }
        }
        info!(version, "delegation policy published");
        Ok(DelegationPolicy {
            version: version.to_string(),
            checksum,
            markdown: policy_markdown.to_string(),
            updated_at: now,
            updated_by: self.node().to_string(),
        })
    }

    /// Acknowledge the current (or a specific) policy version for this
    /// node's agent.
    pub fn ack_delegation_policy(
        &self,
        version: Option<&str>,
        checksum: Option<&str>,
    ) -> ToolResult<()> {
        self.ensure_authorized()?;
        let doc = self.doc();
        let version = match version {
            Some(v) => v.to_string(),
            None => coord::get_string(doc, coord::DELEGATION_POLICY_VERSION).ok_or_else(|| {
                ToolError::NotFound {
                    what: "delegation policy".to_string(),
                }
            })?,
        };
        let checksum = match checksum {
            Some(c) => c.to_string(),
            None => coord::get_string(doc, coord::DELEGATION_POLICY_CHECKSUM).unwrap_or_default(),
        };

        let agent = self.self_agent();
        doc.insert_value(
            maps::COORDINATION,
            &coord::delegation_ack_key(agent.as_str(), "version"),
            version.into(),
        );
        doc.insert_value(
            maps::COORDINATION,
            &coord::delegation_ack_key(agent.as_str(), "checksum"),
            checksum.into(),
        );
        doc.insert_value(
            maps::COORDINATION,
            &coord::delegation_ack_key(agent.as_str(), "at"),
            now_ms().into(),
        );
        Ok(())
    }

    /// Run an SLA sweep on demand. Coordinator-only (the periodic sweeper
    /// applies the same gate).
    pub fn run_sla_sweep(&self, opts: &SlaSweepOptions) -> ToolResult<SlaSweepReport> {
        self.ensure_authorized()?;
        let current = coord::coordinator(self.doc());
        if current.as_deref() != Some(self.node().as_str()) {
            return Err(ToolError::NotCoordinator {
                current: current.unwrap_or_else(|| "<unset>".to_string()),
            });
        }
        let now = now_ms();
        let report = sla_sweep(self.doc(), self.node(), opts, now);
        if !opts.dry_run {
            self.doc()
                .insert_value(maps::COORDINATION, coord::SLA_SWEEP_LAST_AT, now.into());
        }
        Ok(report)
    }
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::tools;

    #[test]
    fn coordinator_moves_require_confirmation() {
        let t = tools("bb1");
        t.set_coordination(&NodeId::new("bb1"), Some(300), false)
            .unwrap();
        assert_eq!(
            coord::coordinator(t.doc()).as_deref(),
            Some("bb1")
        );

        // Re-setting the same holder needs no confirmation.
        t.set_coordination(&NodeId::new("bb1"), None, false).unwrap();

        // Moving it does.
        let err = t
            .set_coordination(&NodeId::new("e1"), None, false)
            .unwrap_err();
        assert_eq!(err.kind(), ansible_core::ErrorKind::InvalidState);
        assert!(err.envelope()["error"].as_str().unwrap().contains("bb1"));

        t.set_coordination(&NodeId::new("e1"), None, true).unwrap();
        assert_eq!(coord::coordinator(t.doc()).as_deref(), Some("e1"));
    }

    #[test]
    fn retention_ranges_are_enforced() {
        let t = tools("bb1");
        for (days, hours) in [(0, 24), (91, 24), (7, 0), (7, 169)] {
            let err = t.set_retention(days, hours).unwrap_err();
            assert_eq!(err.kind(), ansible_core::ErrorKind::InvalidParams);
        }
        t.set_retention(7, 24).unwrap();
        assert_eq!(
            coord::get_i64(t.doc(), coord::RETENTION_CLOSED_TASK_SECONDS, 0),
            7 * 86_400
        );
        assert_eq!(
            coord::get_i64(t.doc(), coord::RETENTION_PRUNE_EVERY_SECONDS, 0),
            24 * 3_600
        );
    }

    #[test]
    fn delegation_policy_is_coordinator_only_with_default_checksum() {
        let t = tools("bb1");

        // Nobody is coordinator yet.
        let err = t
            .set_delegation_policy("# policy", "v1", None, &[])
            .unwrap_err();
        assert!(matches!(err, ToolError::NotCoordinator { .. }));

        t.set_coordination(&NodeId::new("bb1"), None, false).unwrap();
        let policy = t
            .set_delegation_policy("# policy", "v1", None, &[])
            .unwrap();
        assert_eq!(policy.version, "v1");
        assert_eq!(policy.checksum.len(), 64);
        assert_eq!(policy.checksum, sha256_hex("# policy"));

        let read = t.get_delegation_policy().unwrap();
        assert_eq!(read.markdown, "# policy");
        assert_eq!(read.updated_by, "bb1");
    }

    #[test]
    fn policy_ack_records_version_checksum_and_time() {
        let t = tools("bb1");
        t.set_coordination(&NodeId::new("bb1"), None, false).unwrap();
        t.set_delegation_policy("# policy", "v2", None, &[]).unwrap();

        t.ack_delegation_policy(None, None).unwrap();
        let acks = t.get_coordination().unwrap();
        assert_eq!(acks["delegationAck:bb1:version"], "v2");
        assert_eq!(acks["delegationAck:bb1:checksum"], sha256_hex("# policy"));
        assert!(acks["delegationAck:bb1:at"].as_i64().unwrap() > 0);
    }

    #[test]
    fn ack_without_policy_is_not_found() {
        let t = tools("bb1");
        let err = t.ack_delegation_policy(None, None).unwrap_err();
        assert_eq!(err.kind(), ansible_core::ErrorKind::NotFound);
    }

    #[test]
    fn preference_lands_under_the_node_key() {
        let t = tools("bb1");
        t.set_coordination_preference("prefer-backbone").unwrap();
        let all = t.get_coordination().unwrap();
        assert_eq!(all["pref:bb1"], "prefer-backbone");
    }
}
