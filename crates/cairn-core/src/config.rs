//! Configuration for a cairn node.
//!
//! Resolution order: `$CAIRN_CONFIG` (explicit override) → `./cairn.toml`.
//! A default file is written on first start so operators have something to
//! edit rather than a format to memorize.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub identity: IdentityConfig,
    pub cluster: ClusterConfig,
    pub timing: TimingConfig,
    pub chunk: ChunkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Unique id of this node within the cluster.
    pub unique_id: String,
    /// Addresses this node listens on.
    pub listeners: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Shared key every member presents during authorization.
    pub cluster_key: String,
    /// All other members of the cluster.
    pub nodes: Vec<ClusterNodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNodeEntry {
    pub unique_id: String,
    pub listeners: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Local snapshot push interval.
    pub heartbeat_interval_ms: u64,
    /// Disconnect tracker tick interval.
    pub tracker_interval_ms: u64,
    /// Idle time after which a READY peer is soft-disconnected.
    pub soft_disconnect_ms: u64,
    /// Time a DISCONNECTED peer may linger before permanent removal.
    /// 0 = removed on the next tracker tick.
    pub hard_disconnect_ms: u64,
    /// Bound on one reconnect attempt.
    pub connect_timeout_ms: u64,
    /// Pending query lifetime before a Timeout failure.
    pub query_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Payload bytes per chunk packet.
    pub chunk_size: u32,
    /// In-flight chunk budget per transfer session.
    pub budget: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for CairnConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            cluster: ClusterConfig::default(),
            timing: TimingConfig::default(),
            chunk: ChunkConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            unique_id: "node-1".to_string(),
            listeners: vec!["127.0.0.1:4710".parse().expect("valid default listener")],
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_key: String::new(),
            nodes: Vec::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            tracker_interval_ms: 5_000,
            soft_disconnect_ms: 30_000,
            hard_disconnect_ms: 0,
            connect_timeout_ms: 5_000,
            query_ttl_secs: 8 * 60 * 60,
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            budget: 32,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Errors raised while loading or persisting configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Path of the active config file.
pub fn config_path() -> PathBuf {
    std::env::var("CAIRN_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("cairn.toml"))
}

impl CairnConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path();
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn write_default_if_missing() -> Result<(), ConfigError> {
        let path = config_path();
        if path.exists() {
            return Ok(());
        }
        let rendered =
            toml::to_string_pretty(&CairnConfig::default()).expect("default config serializes");
        std::fs::write(&path, rendered).map_err(|source| ConfigError::Write { path, source })
    }
}
