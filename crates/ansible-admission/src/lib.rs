//! Admission: who may write to the replicated state.
//!
//! Four operations govern membership — bootstrap the first node, issue an
//! invite, join with an invite, revoke a node — plus a short-lived
//! single-use websocket ticket that gates the transport itself before the
//! CRDT layer is willing to sync (see [`gate`]).
//!
//! Authorization is deliberately an OR of three signals (membership,
//! heartbeat, agent hosting): while a new node's `nodes` entry is still
//! propagating, peers may already have learned of it via `pulse` or
//! `agents`, and rejecting it would partition a healthy mesh.

pub mod error;
pub mod gate;

pub use error::{AdmissionError, AdmissionResult};
pub use gate::AdmissionGate;

use std::time::Duration;

use tracing::{debug, info};

use ansible_core::maps;
use ansible_core::{
    fresh_id, now_ms, AgentRecord, AgentType, Invite, NodeId, NodeInfo, NodeTier, Ticket,
};
use ansible_state::Document;

/// Default invite lifetime.
pub const DEFAULT_INVITE_TTL: Duration = Duration::from_secs(15 * 60);

/// Default websocket ticket lifetime.
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(60);

/// Minimum accepted ticket lifetime.
pub const MIN_TICKET_TTL: Duration = Duration::from_secs(5);

/// Maximum accepted ticket lifetime.
pub const MAX_TICKET_TTL: Duration = Duration::from_secs(10 * 60);

/// A freshly issued invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedInvite {
    pub token: String,
    pub expires_at: i64,
}

/// A freshly minted websocket ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedTicket {
    pub ticket: String,
    pub expires_at: i64,
}

/// Admission operations bound to one node's view of the document.
#[derive(Clone)]
pub struct Admission {
    doc: Document,
    node_id: NodeId,
}

impl Admission {
    #[must_use]
    pub fn new(doc: Document, node_id: NodeId) -> Self {
        Self { doc, node_id }
    }

    /// The local node this admission handle acts as.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    // ── Bootstrap ────────────────────────────────────────────

    /// Register the very first node of the mesh.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::AlreadyBootstrapped`] when `nodes` is not
    /// empty.
    pub fn bootstrap(&self, tier: NodeTier, capabilities: Vec<String>) -> AdmissionResult<()> {
        if !self.doc.is_empty(maps::NODES) {
            return Err(AdmissionError::AlreadyBootstrapped);
        }
        let info = NodeInfo {
            tier,
            capabilities,
            added_by: self.node_id.clone(),
            added_at: now_ms(),
        };
        self.doc
            .insert(maps::NODES, self.node_id.as_str(), &info);
        info!(node = %self.node_id, ?tier, "bootstrapped first node");
        Ok(())
    }

    // ── Invites ──────────────────────────────────────────────

    /// Issue a fresh single-use invite.
    ///
    /// Permitted when `nodes` is empty (first-node case) or when this
    /// node's recorded tier is backbone.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotAuthorized`] otherwise.
    pub fn generate_invite(
        &self,
        tier: NodeTier,
        expected_node_id: Option<String>,
        ttl: Option<Duration>,
    ) -> AdmissionResult<IssuedInvite> {
        self.prune_expired();
        if !self.doc.is_empty(maps::NODES) && !self.is_backbone(&self.node_id) {
            return Err(AdmissionError::NotAuthorized {
                node: self.node_id.to_string(),
            });
        }

        let token = fresh_id();
        let ttl = ttl.unwrap_or(DEFAULT_INVITE_TTL);
        let expires_at = now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));
        let invite = Invite {
            tier,
            expires_at,
            created_by: self.node_id.clone(),
            expected_node_id,
            used_by_node: None,
            used_at: None,
        };
        self.doc.insert(maps::PENDING_INVITES, &token, &invite);
        debug!(?tier, expires_at, "invite issued");
        Ok(IssuedInvite { token, expires_at })
    }

    /// Consume an invite and register this node.
    ///
    /// # Errors
    ///
    /// Returns the invite-validation error when the token is unknown,
    /// expired, already used, or bound to a different node.
    pub fn join_with_token(
        &self,
        token: &str,
        capabilities: Vec<String>,
    ) -> AdmissionResult<()> {
        self.consume_invite(token, &self.node_id.clone(), capabilities)
    }

    /// Validate and consume `token`, registering `node` with the invite's
    /// tier.
    fn consume_invite(
        &self,
        token: &str,
        node: &NodeId,
        capabilities: Vec<String>,
    ) -> AdmissionResult<()> {
        let invite: Invite = self
            .doc
            .get_as(maps::PENDING_INVITES, token)
            .ok_or(AdmissionError::InvalidToken)?;
        validate_invite(&invite, node, now_ms())?;

        let info = NodeInfo {
            tier: invite.tier,
            capabilities,
            added_by: invite.created_by.clone(),
            added_at: now_ms(),
        };
        self.doc.insert(maps::NODES, node.as_str(), &info);

        // Mark used, then delete: if the delete op races ahead of a peer's
        // view, the used marker still closes the single-use window there.
        self.doc
            .set_field(maps::PENDING_INVITES, token, "usedByNode", node.as_str().into());
        self.doc
            .set_field(maps::PENDING_INVITES, token, "usedAt", now_ms().into());
        self.doc.remove(maps::PENDING_INVITES, token);
        info!(node = %node, tier = ?invite.tier, "node joined via invite");
        Ok(())
    }

    // ── Websocket tickets ────────────────────────────────────

    /// Mint a single-use, node-bound, TTL-clamped websocket ticket from an
    /// invite.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::InvalidParams`] for a TTL outside
    /// [5 s, 10 min], or the invite-validation error.
    pub fn mint_ws_ticket_from_invite(
        &self,
        invite_token: &str,
        expected_node_id: &str,
        ttl: Option<Duration>,
    ) -> AdmissionResult<IssuedTicket> {
        self.prune_expired();
        let ttl = ttl.unwrap_or(DEFAULT_TICKET_TTL);
        if ttl < MIN_TICKET_TTL || ttl > MAX_TICKET_TTL {
            return Err(AdmissionError::InvalidParams(format!(
                "ticket ttl {}s outside [{}s, {}s]",
                ttl.as_secs(),
                MIN_TICKET_TTL.as_secs(),
                MAX_TICKET_TTL.as_secs()
            )));
        }

        let invite: Invite = self
            .doc
            .get_as(maps::PENDING_INVITES, invite_token)
            .ok_or(AdmissionError::InvalidToken)?;
        validate_invite(&invite, &NodeId::new(expected_node_id), now_ms())?;

        let now = now_ms();
        let ticket_id = fresh_id();
        let ticket = Ticket {
            invite_token: invite_token.to_string(),
            expected_node_id: expected_node_id.to_string(),
            created_by: self.node_id.clone(),
            created_at: now,
            expires_at: now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)),
            used_at: None,
        };
        self.doc.insert(maps::AUTH_TICKETS, &ticket_id, &ticket);
        debug!(expected = expected_node_id, expires_at = ticket.expires_at, "ws ticket minted");
        Ok(IssuedTicket {
            ticket: ticket_id,
            expires_at: ticket.expires_at,
        })
    }

    /// Atomically consume a ticket, then its underlying invite, registering
    /// the presenting node.
    ///
    /// The used marker is written on first consumption; any later attempt
    /// fails with [`AdmissionError::TicketAlreadyUsed`].
    ///
    /// # Errors
    ///
    /// Returns the ticket-validation error, or the invite-validation error
    /// from the nested consumption.
    pub fn consume_ws_ticket(
        &self,
        ticket_id: &str,
        presented_node_id: &str,
    ) -> AdmissionResult<()> {
        let ticket: Ticket = self
            .doc
            .get_as(maps::AUTH_TICKETS, ticket_id)
            .ok_or(AdmissionError::InvalidTicket)?;
        if ticket.used_at.is_some() {
            return Err(AdmissionError::TicketAlreadyUsed);
        }
        if now_ms() > ticket.expires_at {
            return Err(AdmissionError::ExpiredTicket);
        }
        if ticket.expected_node_id != presented_node_id {
            return Err(AdmissionError::TicketNodeMismatch {
                expected: ticket.expected_node_id,
            });
        }

        self.doc
            .set_field(maps::AUTH_TICKETS, ticket_id, "usedAt", now_ms().into());
        self.consume_invite(
            &ticket.invite_token,
            &NodeId::new(presented_node_id),
            Vec::new(),
        )
    }

    // ── Revocation ───────────────────────────────────────────

    /// Remove a node from the mesh.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotAuthorized`] when this node is not
    /// backbone, or [`AdmissionError::InvalidParams`] for self-revocation.
    pub fn revoke_node(&self, target: &NodeId) -> AdmissionResult<()> {
        if !self.is_backbone(&self.node_id) {
            return Err(AdmissionError::NotAuthorized {
                node: self.node_id.to_string(),
            });
        }
        if target == &self.node_id {
            return Err(AdmissionError::InvalidParams(
                "refusing to revoke self".to_string(),
            ));
        }
        self.doc.remove(maps::NODES, target.as_str());
        self.doc.remove(maps::CONTEXT, target.as_str());
        self.doc.remove(maps::PULSE, target.as_str());
        info!(node = %target, "node revoked");
        Ok(())
    }

    // ── Authorization ────────────────────────────────────────

    /// The admission predicate: membership, heartbeat, or agent hosting.
    #[must_use]
    pub fn is_node_authorized(&self, node: &NodeId) -> bool {
        if self.doc.is_empty(maps::NODES) {
            return true;
        }
        if self.doc.contains(maps::NODES, node.as_str()) {
            return true;
        }
        if self.doc.contains(maps::PULSE, node.as_str()) {
            return true;
        }
        self.doc
            .entries_as::<AgentRecord>(maps::AGENTS)
            .iter()
            .any(|(_, record)| {
                record.agent_type == AgentType::Internal
                    && record.gateway.as_ref() == Some(node)
            })
    }

    /// Drop expired invites and tickets. Opportunistic; runs inside the
    /// issuing operations.
    pub fn prune_expired(&self) {
        let now = now_ms();
        for (token, invite) in self.doc.entries_as::<Invite>(maps::PENDING_INVITES) {
            if now > invite.expires_at {
                self.doc.remove(maps::PENDING_INVITES, &token);
            }
        }
        for (id, ticket) in self.doc.entries_as::<Ticket>(maps::AUTH_TICKETS) {
            if now > ticket.expires_at {
                self.doc.remove(maps::AUTH_TICKETS, &id);
            }
        }
    }

    fn is_backbone(&self, node: &NodeId) -> bool {
        self.doc
            .get_as::<NodeInfo>(maps::NODES, node.as_str())
            .is_some_and(|info| info.tier == NodeTier::Backbone)
    }
}

fn validate_invite(invite: &Invite, node: &NodeId, now: i64) -> AdmissionResult<()> {
    if invite.used_at.is_some() {
        return Err(AdmissionError::InviteUsed);
    }
    if now > invite.expires_at {
        return Err(AdmissionError::ExpiredToken);
    }
    if let Some(expected) = &invite.expected_node_id {
        if expected != node.as_str() {
            return Err(AdmissionError::NodeMismatch {
                expected: expected.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admission(node: &str) -> Admission {
        Admission::new(Document::new(node), NodeId::new(node))
    }

    /// Two admission handles over one shared document.
    fn mesh() -> (Admission, Admission) {
        let doc = Document::new("bb1");
        let bb1 = Admission::new(doc.clone(), NodeId::new("bb1"));
        let e1 = Admission::new(doc, NodeId::new("e1"));
        (bb1, e1)
    }

    #[test]
    fn bootstrap_only_on_empty_nodes() {
        let bb1 = admission("bb1");
        bb1.bootstrap(NodeTier::Backbone, vec!["always-on".into()])
            .unwrap();
        let info: NodeInfo = bb1.doc.get_as(maps::NODES, "bb1").unwrap();
        assert_eq!(info.tier, NodeTier::Backbone);
        assert_eq!(info.capabilities, vec!["always-on".to_string()]);

        let err = bb1.bootstrap(NodeTier::Backbone, Vec::new()).unwrap_err();
        assert_eq!(err, AdmissionError::AlreadyBootstrapped);
    }

    #[test]
    fn invite_flow_is_single_use() {
        let (bb1, e1) = mesh();
        bb1.bootstrap(NodeTier::Backbone, Vec::new()).unwrap();

        let issued = bb1
            .generate_invite(NodeTier::Edge, None, None)
            .unwrap();
        assert!(issued.expires_at > now_ms());

        e1.join_with_token(&issued.token, Vec::new()).unwrap();
        assert!(e1.doc.contains(maps::NODES, "e1"));
        assert!(!e1.doc.contains(maps::PENDING_INVITES, &issued.token));

        // Second consumption finds nothing.
        let err = e1.join_with_token(&issued.token, Vec::new()).unwrap_err();
        assert_eq!(err, AdmissionError::InvalidToken);
    }

    #[test]
    fn edge_cannot_issue_invites() {
        let (bb1, e1) = mesh();
        bb1.bootstrap(NodeTier::Backbone, Vec::new()).unwrap();
        let issued = bb1.generate_invite(NodeTier::Edge, None, None).unwrap();
        e1.join_with_token(&issued.token, Vec::new()).unwrap();

        let err = e1.generate_invite(NodeTier::Edge, None, None).unwrap_err();
        assert_eq!(err.kind(), ansible_core::ErrorKind::NotAuthorized);
    }

    #[test]
    fn node_bound_invite_rejects_other_nodes() {
        let (bb1, e1) = mesh();
        bb1.bootstrap(NodeTier::Backbone, Vec::new()).unwrap();
        let issued = bb1
            .generate_invite(NodeTier::Edge, Some("e2".to_string()), None)
            .unwrap();

        let err = e1.join_with_token(&issued.token, Vec::new()).unwrap_err();
        assert_eq!(
            err,
            AdmissionError::NodeMismatch {
                expected: "e2".to_string()
            }
        );
    }

    #[test]
    fn expired_invite_is_rejected() {
        let (bb1, e1) = mesh();
        bb1.bootstrap(NodeTier::Backbone, Vec::new()).unwrap();
        let issued = bb1
            .generate_invite(NodeTier::Edge, None, Some(Duration::ZERO))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let err = e1.join_with_token(&issued.token, Vec::new()).unwrap_err();
        assert_eq!(err, AdmissionError::ExpiredToken);
    }

    #[test]
    fn ticket_ttl_clamp_rejects_out_of_range() {
        let (bb1, _) = mesh();
        bb1.bootstrap(NodeTier::Backbone, Vec::new()).unwrap();
        let issued = bb1.generate_invite(NodeTier::Edge, None, None).unwrap();

        for ttl in [Duration::from_secs(4), Duration::from_secs(601)] {
            let err = bb1
                .mint_ws_ticket_from_invite(&issued.token, "e1", Some(ttl))
                .unwrap_err();
            assert_eq!(err.kind(), ansible_core::ErrorKind::InvalidParams);
        }
        // Boundaries are accepted.
        bb1.mint_ws_ticket_from_invite(&issued.token, "e1", Some(Duration::from_secs(5)))
            .unwrap();
        bb1.mint_ws_ticket_from_invite(&issued.token, "e1", Some(Duration::from_secs(600)))
            .unwrap();
    }

    #[test]
    fn ticket_consumption_registers_and_is_single_use() {
        let (bb1, e1) = mesh();
        bb1.bootstrap(NodeTier::Backbone, Vec::new()).unwrap();
        let invite = bb1.generate_invite(NodeTier::Edge, None, None).unwrap();
        let ticket = bb1
            .mint_ws_ticket_from_invite(&invite.token, "e1", None)
            .unwrap();

        e1.consume_ws_ticket(&ticket.ticket, "e1").unwrap();
        assert!(e1.doc.contains(maps::NODES, "e1"));
        assert!(!e1.doc.contains(maps::PENDING_INVITES, &invite.token));

        let err = e1.consume_ws_ticket(&ticket.ticket, "e1").unwrap_err();
        assert_eq!(err, AdmissionError::TicketAlreadyUsed);
    }

    #[test]
    fn ticket_bound_to_other_node_is_rejected() {
        let (bb1, e1) = mesh();
        bb1.bootstrap(NodeTier::Backbone, Vec::new()).unwrap();
        let invite = bb1.generate_invite(NodeTier::Edge, None, None).unwrap();
        let ticket = bb1
            .mint_ws_ticket_from_invite(&invite.token, "e2", None)
            .unwrap();

        let err = e1.consume_ws_ticket(&ticket.ticket, "e1").unwrap_err();
        assert_eq!(
            err,
            AdmissionError::TicketNodeMismatch {
                expected: "e2".to_string()
            }
        );
    }

    #[test]
    fn revoke_requires_backbone_and_refuses_self() {
        let (bb1, e1) = mesh();
        bb1.bootstrap(NodeTier::Backbone, Vec::new()).unwrap();
        let invite = bb1.generate_invite(NodeTier::Edge, None, None).unwrap();
        e1.join_with_token(&invite.token, Vec::new()).unwrap();

        let err = e1.revoke_node(&NodeId::new("bb1")).unwrap_err();
        assert_eq!(err.kind(), ansible_core::ErrorKind::NotAuthorized);

        let err = bb1.revoke_node(&NodeId::new("bb1")).unwrap_err();
        assert_eq!(err.kind(), ansible_core::ErrorKind::InvalidParams);

        bb1.doc
            .insert_value(maps::PULSE, "e1", serde_json::json!({"status": "online"}));
        bb1.revoke_node(&NodeId::new("e1")).unwrap();
        assert!(!bb1.doc.contains(maps::NODES, "e1"));
        assert!(!bb1.doc.contains(maps::PULSE, "e1"));
    }

    #[test]
    fn authorization_predicate_ors_three_signals() {
        let bb1 = admission("bb1");
        // Bootstrap mode: everyone is authorized.
        assert!(bb1.is_node_authorized(&NodeId::new("anyone")));

        bb1.bootstrap(NodeTier::Backbone, Vec::new()).unwrap();
        assert!(bb1.is_node_authorized(&NodeId::new("bb1")));
        assert!(!bb1.is_node_authorized(&NodeId::new("ghost")));

        // A live heartbeat authorizes.
        bb1.doc
            .insert_value(maps::PULSE, "warm", serde_json::json!({"status": "online"}));
        assert!(bb1.is_node_authorized(&NodeId::new("warm")));

        // Hosting an internal agent authorizes.
        bb1.doc.insert(
            maps::AGENTS,
            "helper",
            &AgentRecord {
                agent_type: AgentType::Internal,
                gateway: Some(NodeId::new("host-3")),
                name: None,
                registered_at: 1,
                registered_by: NodeId::new("host-3"),
            },
        );
        assert!(bb1.is_node_authorized(&NodeId::new("host-3")));
    }

    #[test]
    fn prune_removes_expired_entries() {
        let (bb1, _) = mesh();
        bb1.bootstrap(NodeTier::Backbone, Vec::new()).unwrap();
        let expired = bb1
            .generate_invite(NodeTier::Edge, None, Some(Duration::ZERO))
            .unwrap();
        let fresh = bb1.generate_invite(NodeTier::Edge, None, None).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        bb1.prune_expired();
        assert!(!bb1.doc.contains(maps::PENDING_INVITES, &expired.token));
        assert!(bb1.doc.contains(maps::PENDING_INVITES, &fresh.token));
    }
}
