//! Gateway configuration.
//!
//! A single TOML file with camelCase keys, deserialized over defaults and
//! validated. No layering — the whole surface is small enough that one
//! file per host is the deployment unit.

use std::path::{Path, PathBuf};

use ansible_core::NodeTier;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Stale-lock reaper settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockSweepConfig {
    pub enabled: bool,
    pub every_seconds: u64,
    pub stale_seconds: u64,
}

impl Default for LockSweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_seconds: 60,
            stale_seconds: 300,
        }
    }
}

/// SLA sweep settings (config-level defaults; coordination-map knobs win
/// at runtime).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlaSweepConfig {
    pub enabled: bool,
    pub every_seconds: u64,
    pub record_only: bool,
    pub max_messages_per_sweep: usize,
    pub fyi_agents: Vec<String>,
}

impl Default for SlaSweepConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            every_seconds: 300,
            record_only: false,
            max_messages_per_sweep: 20,
            fyi_agents: Vec::new(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Node tier; the only key without a default.
    pub tier: NodeTier,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Backbone listen host; `None` means loopback.
    #[serde(default)]
    pub listen_host: Option<String>,

    /// Peer URLs (`ws://host:port`). Edge nodes connect to all of them;
    /// backbone nodes connect to all that are not themselves.
    #[serde(default)]
    pub backbone_peers: Vec<String>,

    /// Override the node id (defaults to the host name).
    #[serde(default)]
    pub node_id_override: Option<String>,

    /// Single-use websocket ticket presented on the first connect to a
    /// peer (obtained out-of-band from an invite exchange).
    #[serde(default)]
    pub join_ticket: Option<String>,

    /// Advertised capability strings.
    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default = "default_true")]
    pub inject_context: bool,

    /// When non-empty, restricts context injection to these agents.
    #[serde(default)]
    pub inject_context_agents: Vec<String>,

    #[serde(default = "default_true")]
    pub dispatch_incoming: bool,

    /// State directory for the snapshot (defaults to `./state`).
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Host-runtime session directory the lock reaper walks.
    #[serde(default)]
    pub sessions_dir: Option<PathBuf>,

    #[serde(default)]
    pub lock_sweep: LockSweepConfig,

    #[serde(default)]
    pub sla_sweep: SlaSweepConfig,
}

fn default_listen_port() -> u16 {
    ansible_core::DEFAULT_LISTEN_PORT
}

fn default_true() -> bool {
    true
}

impl GatewayConfig {
    /// Minimal config for a tier, everything else defaulted.
    #[must_use]
    pub fn for_tier(tier: NodeTier) -> Self {
        Self {
            tier,
            listen_port: default_listen_port(),
            listen_host: None,
            backbone_peers: Vec::new(),
            node_id_override: None,
            join_ticket: None,
            capabilities: Vec::new(),
            inject_context: true,
            inject_context_agents: Vec::new(),
            dispatch_incoming: true,
            state_dir: None,
            sessions_dir: None,
            lock_sweep: LockSweepConfig::default(),
            sla_sweep: SlaSweepConfig::default(),
        }
    }

    /// Load and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unreadable or malformed files, or
    /// when validation fails.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks over the sweep intervals.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_sweep.every_seconds < 30 {
            return Err(ConfigError::Invalid(
                "lockSweep.everySeconds must be >= 30".to_string(),
            ));
        }
        if self.lock_sweep.stale_seconds < 30 {
            return Err(ConfigError::Invalid(
                "lockSweep.staleSeconds must be >= 30".to_string(),
            ));
        }
        if self.sla_sweep.every_seconds < 30 {
            return Err(ConfigError::Invalid(
                "slaSweep.everySeconds must be >= 30".to_string(),
            ));
        }
        for peer in &self.backbone_peers {
            if !peer.starts_with("ws://") && !peer.starts_with("wss://") {
                return Err(ConfigError::Invalid(format!(
                    "backbonePeers entry is not a ws:// url: {peer}"
                )));
            }
        }
        Ok(())
    }
}
