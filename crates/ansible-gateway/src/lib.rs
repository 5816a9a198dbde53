//! Gateway daemon for the ansible coordination plane.
//!
//! One gateway process per host. It assembles the core components around
//! the shared document: the sync transport (backbone hub or edge client),
//! admission, presence, the dispatcher that feeds locally-hosted agents,
//! the coordinator sweepers, and the tool surface operators and agents
//! call into.

pub mod config;
pub mod coord;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod presence;
pub mod runtime;
pub mod sweep;
pub mod testing;
pub mod tools;

pub use config::{GatewayConfig, LockSweepConfig, SlaSweepConfig};
pub use daemon::Daemon;
pub use dispatch::Dispatcher;
pub use error::{ToolError, ToolResult};
pub use runtime::{Envelope, HostRuntime, InboundContext, ReplyChunk, ReplySink, WorkKind};
pub use tools::Tools;
