//! End-to-end scenarios over the assembled components.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ansible_admission::{Admission, AdmissionError};
use ansible_core::{maps, AgentId, Message, NodeId, NodeTier};
use ansible_gateway::dispatch::Dispatcher;
use ansible_gateway::testing::FakeRuntime;
use ansible_gateway::{Daemon, GatewayConfig};
use ansible_state::Document;
use tokio::sync::broadcast;

fn message(id: &str, from: &str, to: &str, timestamp: i64) -> Message {
    Message {
        id: id.to_string(),
        from_agent: AgentId::new(from),
        from_node: NodeId::new(from),
        to_agents: vec![AgentId::new(to)],
        content: format!("content of {id}"),
        timestamp,
        updated_at: timestamp,
        read_by_agents: Vec::new(),
        metadata: None,
        delivery: BTreeMap::new(),
    }
}

/// Replicate everything `from` knows into `to` (one sync direction).
fn replicate(from: &Document, to: &Document) {
    to.apply_ops(&from.export_ops(), 99);
}

async fn wait_for<F: Fn() -> bool>(what: &str, pred: F) {
    for _ in 0..400 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

// ── S1: bootstrap and invite across two replicas ─────────────

#[test]
fn s1_bootstrap_and_invite() {
    let bb_doc = Document::new("bb1");
    let e_doc = Document::new("e1");
    let bb = Admission::new(bb_doc.clone(), NodeId::new("bb1"));
    let e1 = Admission::new(e_doc.clone(), NodeId::new("e1"));

    bb.bootstrap(NodeTier::Backbone, vec!["always-on".to_string()])
        .unwrap();
    let invite = bb.generate_invite(NodeTier::Edge, None, None).unwrap();

    // The invite replicates to the edge, which consumes it locally.
    replicate(&bb_doc, &e_doc);
    e1.join_with_token(&invite.token, Vec::new()).unwrap();

    // The join replicates back.
    replicate(&e_doc, &bb_doc);
    assert!(bb_doc.contains(maps::NODES, "bb1"));
    assert!(bb_doc.contains(maps::NODES, "e1"));
    assert!(!bb_doc.contains(maps::PENDING_INVITES, &invite.token));

    // A second consumption anywhere fails: the token is gone.
    let err = bb.join_with_token(&invite.token, Vec::new()).unwrap_err();
    assert_eq!(err, AdmissionError::InvalidToken);
}

// ── S2: full mesh round trip over real websockets ────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn s2_message_round_trip_over_the_wire() {
    // Backbone daemon.
    let bb_dir = tempfile::tempdir().unwrap();
    let mut bb_config = GatewayConfig::for_tier(NodeTier::Backbone);
    bb_config.listen_port = 0;
    bb_config.node_id_override = Some("bb1".to_string());
    bb_config.state_dir = Some(bb_dir.path().to_path_buf());
    let bb = Daemon::start(bb_config, FakeRuntime::silent())
        .await
        .unwrap();
    let bb_tools = bb.tools();

    // Bootstrap and mint a join ticket for the edge.
    let bb_admission = Admission::new(bb_tools.doc().clone(), NodeId::new("bb1"));
    bb_admission
        .bootstrap(NodeTier::Backbone, vec!["always-on".to_string()])
        .unwrap();
    let invite = bb_admission
        .generate_invite(NodeTier::Edge, Some("e1".to_string()), None)
        .unwrap();
    let ticket = bb_admission
        .mint_ws_ticket_from_invite(&invite.token, "e1", None)
        .unwrap();

    // Edge daemon with a scripted runtime that answers "pong".
    let edge_dir = tempfile::tempdir().unwrap();
    let mut edge_config = GatewayConfig::for_tier(NodeTier::Edge);
    edge_config.node_id_override = Some("e1".to_string());
    edge_config.state_dir = Some(edge_dir.path().to_path_buf());
    edge_config.backbone_peers = vec![format!("ws://{}", bb.hub_addr().unwrap())];
    edge_config.join_ticket = Some(ticket.ticket.clone());
    let runtime = FakeRuntime::replying("pong");
    let edge = Daemon::start(edge_config, runtime.clone()).await.unwrap();

    // The ticket admits and registers the edge; membership replicates.
    edge.events().doc_ready().await;
    let edge_doc = edge.tools().doc().clone();
    let bb_doc = bb_tools.doc().clone();
    wait_for("edge registration to reach the backbone", || {
        bb_doc.contains(maps::NODES, "e1")
    })
    .await;

    // Backbone sends; the edge dispatcher answers.
    bb_tools
        .send_message("ping", vec![AgentId::new("e1")], None)
        .unwrap();

    wait_for("edge to deliver the ping", || {
        runtime.invocations_for(
            &bb_doc
                .entries_as::<Message>(maps::MESSAGES)
                .iter()
                .find(|(_, m)| m.content == "ping")
                .map(|(k, _)| k.clone())
                .unwrap_or_default(),
        ) >= 1
    })
    .await;
    let invocation = &runtime.invocations()[0];
    assert_eq!(invocation.from, "ansible:bb1");
    assert_eq!(invocation.to, "ansible:e1");

    // The reply replicates back to the backbone.
    wait_for("pong to reach the backbone", || {
        bb_doc
            .entries_as::<Message>(maps::MESSAGES)
            .iter()
            .any(|(_, m)| {
                m.content == "pong"
                    && m.from_agent == AgentId::new("e1")
                    && m.to_agents == vec![AgentId::new("bb1")]
            })
    })
    .await;

    // The original message is marked delivered to e1 on both replicas.
    wait_for("delivery record to replicate", || {
        bb_doc
            .entries_as::<Message>(maps::MESSAGES)
            .iter()
            .any(|(_, m)| m.content == "ping" && m.delivered_to(&AgentId::new("e1")))
    })
    .await;
    assert!(edge_doc
        .entries_as::<Message>(maps::MESSAGES)
        .iter()
        .any(|(_, m)| m.content == "ping" && m.delivered_to(&AgentId::new("e1"))));

    edge.shutdown().await;
    bb.shutdown().await;
}

// ── S3: backlog drained in order after reconnect ─────────────

#[tokio::test(start_paused = true)]
async fn s3_backlog_on_reconnect() {
    let bb_doc = Document::new("bb1");
    // While the edge is offline, the backbone writes five messages.
    for ts in 1..=5 {
        let m = message(&format!("m-{ts}"), "bb1", "e1", ts);
        bb_doc.insert(maps::MESSAGES, &m.id.clone(), &m);
    }

    // The edge reconnects: its replica catches up in one state exchange,
    // and the sync-triggered reconcile enumerates the whole backlog.
    let edge_doc = Document::new("e1");
    replicate(&bb_doc, &edge_doc);

    let (shutdown_tx, _) = broadcast::channel(1);
    let runtime = FakeRuntime::replying("ack");
    let dispatcher = Dispatcher::spawn(
        edge_doc.clone(),
        NodeId::new("e1"),
        runtime.clone(),
        &shutdown_tx,
    );
    dispatcher.reconcile_once().await;

    let order: Vec<String> = runtime
        .invocations()
        .iter()
        .map(|i| i.item_id.clone())
        .collect();
    assert_eq!(order, vec!["m-1", "m-2", "m-3", "m-4", "m-5"]);

    let replies = edge_doc
        .entries_as::<Message>(maps::MESSAGES)
        .into_iter()
        .filter(|(_, m)| m.content == "ack")
        .count();
    assert_eq!(replies, 5);

    // A duplicate sync event (reconnect flap) must not re-dispatch.
    dispatcher.reconcile_once().await;
    assert_eq!(runtime.invocations().len(), 5);
}

// ── S4: transient failure retries, single reply ──────────────

#[tokio::test(start_paused = true)]
async fn s4_retry_on_transient_failure() {
    let doc = Document::new("e1");
    let m = message("m-1", "bb1", "e1", 1);
    doc.insert(maps::MESSAGES, "m-1", &m);

    let (shutdown_tx, _) = broadcast::channel(1);
    let runtime = FakeRuntime::replying("pong").failing_first(3);
    let _dispatcher = Dispatcher::spawn(
        doc.clone(),
        NodeId::new("e1"),
        runtime.clone(),
        &shutdown_tx,
    );

    for _ in 0..300 {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let delivered = doc
            .get_as::<Message>(maps::MESSAGES, "m-1")
            .and_then(|m| m.delivery.get("e1").cloned())
            .is_some_and(|d| d.state == ansible_core::DeliveryState::Delivered);
        if delivered {
            break;
        }
    }

    let stored: Message = doc.get_as(maps::MESSAGES, "m-1").unwrap();
    let record = stored.delivery.get("e1").unwrap();
    assert_eq!(record.state, ansible_core::DeliveryState::Delivered);
    assert_eq!(record.attempts, 4);
    assert_eq!(runtime.invocations_for("m-1"), 4);

    let replies = doc
        .entries_as::<Message>(maps::MESSAGES)
        .into_iter()
        .filter(|(_, m)| m.content == "pong")
        .count();
    assert_eq!(replies, 1);
}

// ── Crash safety: state survives a snapshot round trip ───────

#[tokio::test]
async fn delivered_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = ansible_state::SnapshotStore::new(dir.path()).unwrap();

    // First life: deliver a message, persist.
    {
        let doc = Document::new("e1");
        doc.insert(maps::MESSAGES, "m-1", &message("m-1", "bb1", "e1", 1));
        let (shutdown_tx, _) = broadcast::channel(1);
        let runtime = FakeRuntime::replying("pong");
        let dispatcher =
            Dispatcher::spawn(doc.clone(), NodeId::new("e1"), runtime, &shutdown_tx);
        dispatcher.reconcile_once().await;
        store.persist(&doc, &store.default_path()).await.unwrap();
    }

    // Second life: hydrate, reconcile — nothing re-dispatches.
    let doc = Document::new("e1");
    store.load(&doc, &store.default_path()).await.unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let runtime = FakeRuntime::replying("pong");
    let dispatcher = Dispatcher::spawn(
        doc.clone(),
        NodeId::new("e1"),
        runtime.clone(),
        &shutdown_tx,
    );
    dispatcher.reconcile_once().await;

    assert!(runtime.invocations().is_empty());
    // Exactly one reply exists, from the first life.
    let replies = doc
        .entries_as::<Message>(maps::MESSAGES)
        .into_iter()
        .filter(|(_, m)| m.content == "pong")
        .count();
    assert_eq!(replies, 1);
}
