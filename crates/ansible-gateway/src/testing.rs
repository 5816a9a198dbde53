//! Test doubles for the host-runtime contract.
//!
//! Lives in the library (not behind `cfg(test)`) so the integration tests
//! can script runtime behavior: canned replies, transient failures, and a
//! record of every invocation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use ansible_core::AgentId;
use async_trait::async_trait;

use crate::runtime::{
    session_key, Envelope, HostRuntime, InboundContext, ReplyChunk, ReplySink, RuntimeError,
};

/// One recorded runtime invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub item_id: String,
    pub target: AgentId,
    pub from: String,
    pub to: String,
}

/// A scriptable [`HostRuntime`].
///
/// Replies with `reply_text` (final) on success; fails the first
/// `fail_first` dispatches with a retryable error.
pub struct FakeRuntime {
    reply_text: Option<String>,
    fail_first: AtomicU32,
    invocations: Mutex<Vec<Invocation>>,
}

impl FakeRuntime {
    /// A runtime that always succeeds and replies with `reply`.
    #[must_use]
    pub fn replying(reply: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            reply_text: Some(reply.into()),
            fail_first: AtomicU32::new(0),
            invocations: Mutex::new(Vec::new()),
        })
    }

    /// A runtime that succeeds silently (no reply payload).
    #[must_use]
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            reply_text: None,
            fail_first: AtomicU32::new(0),
            invocations: Mutex::new(Vec::new()),
        })
    }

    /// Fail the first `n` dispatches before succeeding.
    #[must_use]
    pub fn failing_first(self: Arc<Self>, n: u32) -> Arc<Self> {
        self.fail_first.store(n, Ordering::SeqCst);
        self
    }

    /// Every invocation seen so far, in dispatch order.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().expect("lock poisoned").clone()
    }

    /// Invocations for one item id.
    #[must_use]
    pub fn invocations_for(&self, item_id: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|i| i.item_id == item_id)
            .count()
    }
}

#[async_trait]
impl HostRuntime for FakeRuntime {
    fn format(&self, envelope: &Envelope, body: &str) -> String {
        format!("From={} To={} | {}", envelope.from, envelope.to, body)
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
        deliver: ReplySink,
    ) -> Result<(), RuntimeError> {
        self.invocations.lock().expect("lock poisoned").push(Invocation {
            item_id: context.envelope.item_id.clone(),
            target: context.envelope.target.clone(),
            from: context.envelope.from.clone(),
            to: context.envelope.to.clone(),
        });

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(RuntimeError::Delivery(format!(
                "scripted failure ({remaining} left)"
            )));
        }

        if let Some(reply) = &self.reply_text {
            // A non-final chunk first, mirroring streaming runtimes; the
            // dispatcher must only write back the final one.
            deliver(ReplyChunk {
                text: format!("{reply} (partial)"),
                is_final: false,
            });
            deliver(ReplyChunk {
                text: reply.clone(),
                is_final: true,
            });
        }
        Ok(())
    }
}
