//! The dispatcher: reconcile-driven delivery into the host runtime.
//!
//! Observe-events and sync-events do not carry work; they only schedule a
//! debounced reconcile. The reconcile enumerates *all* pending work for
//! all locally-hosted agents from the current state, dispatches serially
//! in deterministic order, records per-recipient delivery state before
//! and after each runtime call, and schedules jittered retries on
//! failure. One reconcile runs at a time per host.

pub mod backoff;
pub mod work;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ansible_core::{
    fresh_id, maps, now_ms, AgentId, DeliveryRecord, DeliveryState, Message, NodeContext, NodeId,
    Task,
};
use ansible_state::Document;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::runtime::{Envelope, HostRuntime, ReplyChunk, ReplySink, WorkKind};
use work::{dispatch_key, local_agents, pending_messages, pending_tasks};

/// Collapse window for bursts of triggers.
const DEBOUNCE: Duration = Duration::from_millis(50);

/// Why a reconcile was scheduled.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// A watched map changed.
    Observe { map: String },
    /// A sync boundary was reached.
    Sync { peer: String },
    /// A retry timer fired.
    Retry { key: String },
    /// A tool-write path asked for a reconcile.
    Request { reason: String },
    /// First pass at startup.
    Startup,
}

/// Cloneable handle for scheduling reconciles.
#[derive(Clone)]
pub struct DispatcherHandle {
    trigger_tx: mpsc::UnboundedSender<Trigger>,
}

impl DispatcherHandle {
    /// Ask for a reconcile (collapses with any already pending).
    pub fn request_reconcile(&self, reason: impl Into<String>) {
        let _ = self.trigger_tx.send(Trigger::Request {
            reason: reason.into(),
        });
    }
}

struct Inner {
    doc: Document,
    node: NodeId,
    runtime: Arc<dyn HostRuntime>,
    trigger_tx: mpsc::UnboundedSender<Trigger>,
    /// Keys with a scheduled retry timer; enumeration skips them.
    retry_keys: Mutex<HashSet<String>>,
    /// Live retry timer tasks, aborted on shutdown.
    retry_handles: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    /// Keys currently being dispatched.
    in_flight: Mutex<HashSet<String>>,
}

/// The per-host dispatcher.
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Create a dispatcher and start its trigger sources: the reconcile
    /// loop, the map observer, and the startup trigger.
    #[must_use]
    pub fn spawn(
        doc: Document,
        node: NodeId,
        runtime: Arc<dyn HostRuntime>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            doc: doc.clone(),
            node,
            runtime,
            trigger_tx: trigger_tx.clone(),
            retry_keys: Mutex::new(HashSet::new()),
            retry_handles: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        });

        // Observer: watched maps schedule a reconcile.
        {
            let trigger_tx = trigger_tx.clone();
            let mut changes = doc.subscribe_changes();
            let mut shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => break,
                        event = changes.recv() => {
                            match event {
                                Ok(event) => {
                                    // Local and remote writes both schedule; the
                                    // reconcile is cheap when nothing is pending
                                    // and this keeps the loop purely state-driven.
                                    if event.map == maps::MESSAGES || event.map == maps::TASKS {
                                        let _ = trigger_tx.send(Trigger::Observe {
                                            map: event.map,
                                        });
                                    }
                                },
                                Err(broadcast::error::RecvError::Lagged(_)) => {
                                    let _ = trigger_tx.send(Trigger::Request {
                                        reason: "observer-lagged".to_string(),
                                    });
                                },
                                Err(broadcast::error::RecvError::Closed) => break,
                            }
                        }
                    }
                }
            });
        }

        // Reconcile loop.
        {
            let inner = Arc::clone(&inner);
            let shutdown_rx = shutdown_tx.subscribe();
            tokio::spawn(run_loop(inner, trigger_rx, shutdown_rx));
        }

        let _ = trigger_tx.send(Trigger::Startup);
        Self { inner }
    }

    /// Cloneable trigger handle.
    #[must_use]
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            trigger_tx: self.inner.trigger_tx.clone(),
        }
    }

    /// Forward transport sync boundaries into the trigger queue.
    pub fn forward_sync_events(
        &self,
        events: &ansible_sync::TransportEvents,
        shutdown_tx: &broadcast::Sender<()>,
    ) {
        let trigger_tx = self.inner.trigger_tx.clone();
        let mut sync_rx = events.subscribe_sync();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    event = sync_rx.recv() => {
                        match event {
                            Ok(event) if event.ok => {
                                let _ = trigger_tx.send(Trigger::Sync { peer: event.peer });
                            },
                            Ok(_) => {},
                            Err(broadcast::error::RecvError::Lagged(_)) => {},
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });
    }

    /// Run one full reconcile immediately (test seam; production goes
    /// through the trigger queue).
    pub async fn reconcile_once(&self) {
        reconcile(&self.inner).await;
    }
}

/// The serialized reconcile loop: every burst of triggers collapses into
/// one pass.
async fn run_loop(
    inner: Arc<Inner>,
    mut trigger_rx: mpsc::UnboundedReceiver<Trigger>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            trigger = trigger_rx.recv() => {
                let Some(trigger) = trigger else { break };
                trace!(?trigger, "reconcile scheduled");
                tokio::time::sleep(DEBOUNCE).await;
                let mut collapsed = 0usize;
                while trigger_rx.try_recv().is_ok() {
                    collapsed += 1;
                }
                if collapsed > 0 {
                    trace!(collapsed, "triggers collapsed");
                }
                reconcile(&inner).await;
            }
        }
    }

    // Cancel outstanding retry timers; in-flight dispatches already ran to
    // completion because this loop is the only dispatcher.
    for (_, handle) in inner.retry_handles.lock().expect("lock poisoned").drain() {
        handle.abort();
    }
    debug!("dispatcher stopped");
}

/// Enumerate and dispatch everything pending for the local agents.
async fn reconcile(inner: &Arc<Inner>) {
    let agents = local_agents(&inner.doc, &inner.node);
    let messages: Vec<(String, Message)> = inner.doc.entries_as(maps::MESSAGES);
    let tasks: Vec<(String, Task)> = inner.doc.entries_as(maps::TASKS);

    for agent in &agents {
        let has_retry = |key: &str| {
            inner
                .retry_keys
                .lock()
                .expect("lock poisoned")
                .contains(key)
        };

        for message in pending_messages(&messages, agent, &has_retry) {
            dispatch_item(
                inner,
                WorkKind::Msg,
                &message.id,
                message.timestamp,
                &message.content,
                message.from_agent.clone(),
                agent.clone(),
            )
            .await;
        }

        let context: Option<NodeContext> = inner.doc.get_as(maps::CONTEXT, agent.as_str());
        for task in pending_tasks(&tasks, agent, context.as_ref(), &has_retry) {
            let body = format!("{}\n\n{}", task.title, task.description);
            dispatch_item(
                inner,
                WorkKind::Task,
                &task.id,
                task.created_at,
                &body,
                task.created_by_agent.clone(),
                agent.clone(),
            )
            .await;
        }
    }
}

/// Deliver one item to one local agent, recording the attempt before the
/// runtime suspension and the outcome after it.
async fn dispatch_item(
    inner: &Arc<Inner>,
    kind: WorkKind,
    item_id: &str,
    timestamp: i64,
    content: &str,
    originator: AgentId,
    target: AgentId,
) {
    let key = dispatch_key(kind, item_id, &target);
    {
        let mut in_flight = inner.in_flight.lock().expect("lock poisoned");
        if !in_flight.insert(key.clone()) {
            return;
        }
    }

    let map = match kind {
        WorkKind::Msg => maps::MESSAGES,
        WorkKind::Task => maps::TASKS,
    };
    let attempts = read_attempts(&inner.doc, map, item_id, &target).saturating_add(1);

    // Attempted is recorded before the suspension so a crash mid-dispatch
    // still counts the try.
    write_delivery(
        &inner.doc,
        map,
        item_id,
        &target,
        DeliveryRecord {
            state: DeliveryState::Attempted,
            at: now_ms(),
            by: inner.node.clone(),
            attempts,
            last_error: None,
        },
    );

    let mut envelope = Envelope::new(
        kind,
        item_id,
        timestamp,
        content,
        originator.clone(),
        target.clone(),
    );
    envelope.body = inner.runtime.format(&envelope, content);
    let context = inner.runtime.build_inbound_context(envelope);
    let session_key = context.session_key.clone();

    if let Err(e) = inner
        .runtime
        .record_inbound_session(&session_key, &context)
        .await
    {
        warn!(session = %session_key, error = %e, "session bookkeeping failed (continuing)");
    }

    let final_reply: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let sink: ReplySink = {
        let final_reply = Arc::clone(&final_reply);
        Arc::new(move |chunk: ReplyChunk| {
            if chunk.is_final && !chunk.text.is_empty() {
                *final_reply.lock().expect("lock poisoned") = Some(chunk.text);
            }
        })
    };

    let result = inner.runtime.dispatch_reply(context, sink).await;

    match result {
        Ok(()) => {
            write_delivery(
                &inner.doc,
                map,
                item_id,
                &target,
                DeliveryRecord {
                    state: DeliveryState::Delivered,
                    at: now_ms(),
                    by: inner.node.clone(),
                    attempts,
                    last_error: None,
                },
            );
            if kind == WorkKind::Msg {
                mark_read(&inner.doc, item_id, &target);
            }
            let reply = final_reply.lock().expect("lock poisoned").take();
            if let Some(text) = reply {
                emit_reply(&inner.doc, &inner.node, &target, &originator, &text);
            }
            debug!(key = %key, attempts, "delivered");
        },
        Err(e) => {
            write_delivery(
                &inner.doc,
                map,
                item_id,
                &target,
                DeliveryRecord {
                    state: DeliveryState::Attempted,
                    at: now_ms(),
                    by: inner.node.clone(),
                    attempts,
                    last_error: Some(e.to_string()),
                },
            );
            warn!(key = %key, attempts, error = %e, "delivery failed, scheduling retry");
            schedule_retry(inner, &key, attempts);
        },
    }

    inner
        .in_flight
        .lock()
        .expect("lock poisoned")
        .remove(&key);
}

fn read_attempts(doc: &Document, map: &str, item_id: &str, target: &AgentId) -> u32 {
    delivery_map(doc, map, item_id)
        .get(target.as_str())
        .map_or(0, |d| d.attempts)
}

fn delivery_map(doc: &Document, map: &str, item_id: &str) -> BTreeMap<String, DeliveryRecord> {
    doc.get(map, item_id)
        .and_then(|v| v.get("delivery").cloned())
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Read-modify-write of the delivery field. Safe despite concurrency
/// because the field is last-writer-wins and the per-(item, target, node)
/// state machine is monotonic.
fn write_delivery(
    doc: &Document,
    map: &str,
    item_id: &str,
    target: &AgentId,
    record: DeliveryRecord,
) {
    let mut delivery = delivery_map(doc, map, item_id);
    delivery.insert(target.as_str().to_string(), record);
    let value = serde_json::to_value(&delivery).unwrap_or_default();
    doc.set_field(map, item_id, "delivery", value);
}

/// Union the target into `readBy_agents` (back-compat delivered signal).
fn mark_read(doc: &Document, message_id: &str, target: &AgentId) {
    let mut read_by: Vec<String> = doc
        .get(maps::MESSAGES, message_id)
        .and_then(|v| v.get("readBy_agents").cloned())
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    if !read_by.iter().any(|a| a == target.as_str()) {
        read_by.push(target.as_str().to_string());
    }
    doc.set_field(
        maps::MESSAGES,
        message_id,
        "readBy_agents",
        serde_json::to_value(&read_by).unwrap_or_default(),
    );
}

/// Write the reply produced by the runtime back into the shared state.
fn emit_reply(doc: &Document, node: &NodeId, from: &AgentId, to: &AgentId, text: &str) {
    let now = now_ms();
    let reply = Message {
        id: fresh_id(),
        from_agent: from.clone(),
        from_node: node.clone(),
        to_agents: vec![to.clone()],
        content: text.to_string(),
        timestamp: now,
        updated_at: now,
        read_by_agents: vec![from.clone()],
        metadata: None,
        delivery: BTreeMap::new(),
    };
    doc.insert(maps::MESSAGES, &reply.id.clone(), &reply);
    debug!(from = %from, to = %to, "reply emitted");
}

/// Schedule a one-shot retry timer for `key`. Idempotent: a second
/// schedule while one is pending is a no-op.
fn schedule_retry(inner: &Arc<Inner>, key: &str, attempts: u32) {
    {
        let mut keys = inner.retry_keys.lock().expect("lock poisoned");
        if !keys.insert(key.to_string()) {
            return;
        }
    }
    let delay = backoff::retry_delay(attempts);
    trace!(key = %key, delay_ms = delay.as_millis(), "retry scheduled");

    let inner_weak = Arc::downgrade(inner);
    let key_owned = key.to_string();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(inner) = inner_weak.upgrade() {
            inner
                .retry_keys
                .lock()
                .expect("lock poisoned")
                .remove(&key_owned);
            inner
                .retry_handles
                .lock()
                .expect("lock poisoned")
                .remove(&key_owned);
            let _ = inner.trigger_tx.send(Trigger::Retry { key: key_owned });
        }
    });
    inner
        .retry_handles
        .lock()
        .expect("lock poisoned")
        .insert(key.to_string(), handle);
}
