//! The host-runtime delivery contract.
//!
//! The agent runtime that actually consumes inbound work is an external
//! collaborator; this module is the whole surface the dispatcher uses. The
//! runtime formats an envelope into whatever its agent consumes, runs the
//! agent turn, and hands replies back through a [`ReplySink`] — only the
//! final chunk is written back to the shared state.

use std::sync::Arc;

use ansible_core::{AgentId, ErrorKind, NodeId, SURFACE};
use async_trait::async_trait;
use thiserror::Error;

/// Kind of work item being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Msg,
    Task,
}

impl WorkKind {
    /// Stable short name used in dispatch keys and session keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Msg => "msg",
            Self::Task => "task",
        }
    }
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The inbound record handed to the runtime.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Surface label (`ansible`).
    pub surface: String,
    /// Sender, as `ansible:<agent>`.
    pub from: String,
    /// Recipient, as `ansible:<agent>`.
    pub to: String,
    pub kind: WorkKind,
    /// Id of the message or task being delivered.
    pub item_id: String,
    /// Origin timestamp (milliseconds since epoch).
    pub timestamp: i64,
    /// Body text; raw at construction, formatted after
    /// [`HostRuntime::format`].
    pub body: String,
    /// Agent that should receive the eventual reply.
    pub originator: AgentId,
    /// Locally-hosted agent this item is being delivered to.
    pub target: AgentId,
}

impl Envelope {
    /// Build an envelope with surface-prefixed addresses.
    #[must_use]
    pub fn new(
        kind: WorkKind,
        item_id: impl Into<String>,
        timestamp: i64,
        body: impl Into<String>,
        originator: AgentId,
        target: AgentId,
    ) -> Self {
        Self {
            surface: SURFACE.to_string(),
            from: format!("{SURFACE}:{originator}"),
            to: format!("{SURFACE}:{target}"),
            kind,
            item_id: item_id.into(),
            timestamp,
            body: body.into(),
            originator,
            target,
        }
    }
}

/// Normalized inbound context the runtime consumes.
#[derive(Debug, Clone)]
pub struct InboundContext {
    pub session_key: String,
    pub envelope: Envelope,
}

/// One reply emission from the runtime; only the final one counts.
#[derive(Debug, Clone)]
pub struct ReplyChunk {
    pub text: String,
    pub is_final: bool,
}

/// Callback the runtime invokes with reply chunks.
pub type ReplySink = Arc<dyn Fn(ReplyChunk) + Send + Sync>;

/// Runtime delivery failures.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Transient failure; the dispatcher schedules a retry.
    #[error("runtime delivery failed: {0}")]
    Delivery(String),

    /// No delivery capability is wired at all.
    #[error("no runtime transport available")]
    Unavailable,
}

impl RuntimeError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Delivery(_) => ErrorKind::Retryable,
            Self::Unavailable => ErrorKind::TransportUnavailable,
        }
    }
}

/// The capability the dispatcher drives.
#[async_trait]
pub trait HostRuntime: Send + Sync {
    /// Add the channel/sender/timestamp envelope to a body.
    fn format(&self, envelope: &Envelope, body: &str) -> String;

    /// Normalize an inbound record into runtime context.
    fn build_inbound_context(&self, envelope: Envelope) -> InboundContext;

    /// Best-effort session bookkeeping hook; a failure here is a warning
    /// and never aborts the dispatch.
    ///
    /// # Errors
    ///
    /// Implementations may fail; the dispatcher only logs it.
    async fn record_inbound_session(
        &self,
        _session_key: &str,
        _context: &InboundContext,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Run the agent turn, delivering reply chunks through `deliver`.
    ///
    /// # Errors
    ///
    /// Any error is treated as retryable by the dispatcher.
    async fn dispatch_reply(
        &self,
        context: InboundContext,
        deliver: ReplySink,
    ) -> Result<(), RuntimeError>;
}

/// Stable per-item session key.
#[must_use]
pub fn session_key(target: &AgentId, kind: WorkKind, item_id: &str) -> String {
    format!("agent:{target}:{SURFACE}:{kind}:{item_id}")
}

/// A runtime that formats and logs inbound work without producing replies.
///
/// This is what the standalone binary runs with: items are delivered (and
/// marked so), but no agent turn happens and nothing is written back.
#[derive(Debug, Default)]
pub struct LoggingRuntime;

#[async_trait]
impl HostRuntime for LoggingRuntime {
    fn format(&self, envelope: &Envelope, body: &str) -> String {
        format!(
            "[{}] {} -> {}: {}",
            envelope.timestamp, envelope.from, envelope.to, body
        )
    }

    fn build_inbound_context(&self, envelope: Envelope) -> InboundContext {
        InboundContext {
            session_key: session_key(&envelope.target, envelope.kind, &envelope.item_id),
            envelope,
        }
    }

    async fn dispatch_reply(
        &self,
        context: InboundContext,
        _deliver: ReplySink,
    ) -> Result<(), RuntimeError> {
        tracing::info!(
            session = %context.session_key,
            body = %context.envelope.body,
            "inbound item (no runtime attached)"
        );
        Ok(())
    }
}

/// Convenience for binding the built-in per-host agent id.
#[must_use]
pub fn node_agent(node: &NodeId) -> AgentId {
    node.as_agent()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_formula() {
        let key = session_key(&AgentId::new("e1"), WorkKind::Msg, "m-42");
        assert_eq!(key, "agent:e1:ansible:msg:m-42");
        let key = session_key(&AgentId::new("e1"), WorkKind::Task, "t-1");
        assert_eq!(key, "agent:e1:ansible:task:t-1");
    }

    #[test]
    fn envelope_addresses_carry_the_surface_prefix() {
        let envelope = Envelope::new(
            WorkKind::Msg,
            "m-1",
            7,
            "ping",
            AgentId::new("bb1"),
            AgentId::new("e1"),
        );
        assert_eq!(envelope.from, "ansible:bb1");
        assert_eq!(envelope.to, "ansible:e1");
        assert_eq!(envelope.surface, "ansible");
    }
}
