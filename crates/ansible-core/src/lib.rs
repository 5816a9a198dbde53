//! Core types for the ansible coordination plane.
//!
//! This crate defines the vocabulary shared by every other crate: the
//! identifier newtypes, the replicated record types (with their exact wire
//! field names), the flat error-kind taxonomy used in tool-surface error
//! envelopes, and the input-size limits.
//!
//! Nothing here is async and nothing here touches the network; the types
//! are plain data so they can cross the CRDT layer, the sync wire, and the
//! tool surface unchanged.

pub mod error;
pub mod ids;
pub mod limits;
pub mod records;
pub mod time;

pub use error::ErrorKind;
pub use ids::{AgentId, NodeId};
pub use records::{
    AgentRecord, AgentType, DeliveryRecord, DeliveryState, Invite, Message, NodeContext, NodeInfo,
    NodeTier, PulseStatus, SlaEscalations, SlaOutcome, SlaSpec, Task, TaskStatus, TaskUpdate,
    Ticket,
};
pub use time::now_ms;

/// Logical room all peers synchronize on.
pub const ROOM: &str = "ansible-plane";

/// Default backbone listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 1235;

/// File name of the persisted snapshot inside the state directory.
pub const SNAPSHOT_FILE_NAME: &str = "ansible-state.yjs";

/// Surface prefix used in runtime envelopes (`ansible:<agent>`).
pub const SURFACE: &str = "ansible";

/// Generate a fresh opaque id (UUID v4), token-safe.
#[must_use]
pub fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Names of the replicated maps.
pub mod maps {
    pub const NODES: &str = "nodes";
    pub const PENDING_INVITES: &str = "pendingInvites";
    pub const AUTH_TICKETS: &str = "authTickets";
    pub const TASKS: &str = "tasks";
    pub const MESSAGES: &str = "messages";
    pub const CONTEXT: &str = "context";
    pub const PULSE: &str = "pulse";
    pub const AGENTS: &str = "agents";
    pub const COORDINATION: &str = "coordination";
}
