//! Transport-side admission gate.
//!
//! The sync hub calls this before it is willing to sync with a peer. A
//! presented ticket is consumed (which also registers the node); without a
//! ticket the peer must already satisfy the authorization predicate.

use ansible_core::NodeId;
use ansible_sync::ConnectionGate;
use tracing::debug;

use crate::Admission;

/// [`ConnectionGate`] backed by the admission layer.
pub struct AdmissionGate {
    admission: Admission,
}

impl AdmissionGate {
    #[must_use]
    pub fn new(admission: Admission) -> Self {
        Self { admission }
    }
}

impl ConnectionGate for AdmissionGate {
    fn admit(&self, node_id: &str, ticket: Option<&str>) -> Result<(), String> {
        match ticket {
            Some(ticket) => self
                .admission
                .consume_ws_ticket(ticket, node_id)
                .map_err(|e| e.kind().as_str().to_string()),
            None => {
                let node = NodeId::new(node_id);
                if self.admission.is_node_authorized(&node) {
                    Ok(())
                } else {
                    debug!(node = %node, "unadmitted peer rejected at the gate");
                    Err(ansible_core::ErrorKind::NotAuthorized.as_str().to_string())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ansible_core::NodeTier;
    use ansible_state::Document;

    #[test]
    fn ticket_path_admits_and_registers() {
        let doc = Document::new("bb1");
        let admission = Admission::new(doc.clone(), NodeId::new("bb1"));
        admission.bootstrap(NodeTier::Backbone, Vec::new()).unwrap();
        let invite = admission
            .generate_invite(NodeTier::Edge, None, None)
            .unwrap();
        let ticket = admission
            .mint_ws_ticket_from_invite(&invite.token, "e1", None)
            .unwrap();

        let gate = AdmissionGate::new(admission);
        gate.admit("e1", Some(&ticket.ticket)).unwrap();
        assert!(doc.contains(ansible_core::maps::NODES, "e1"));

        // Replay of the same ticket is refused with the wire kind.
        let err = gate.admit("e1", Some(&ticket.ticket)).unwrap_err();
        assert_eq!(err, "ticket_already_used");
    }

    #[test]
    fn ticketless_path_requires_authorization() {
        let doc = Document::new("bb1");
        let admission = Admission::new(doc, NodeId::new("bb1"));
        admission.bootstrap(NodeTier::Backbone, Vec::new()).unwrap();

        let gate = AdmissionGate::new(admission);
        gate.admit("bb1", None).unwrap();
        let err = gate.admit("stranger", None).unwrap_err();
        assert_eq!(err, "not_authorized");
    }
}
