//! Node identity and runtime snapshot value objects.
//!
//! Snapshots are what heartbeats carry: a node's stable identity plus the
//! timestamps the cluster uses for liveness tracking and reconnect
//! arbitration. They travel as JSON bodies and are never interpreted by the
//! transport layer.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Protocol revision carried in every snapshot.
pub const PROTOCOL_VERSION: u32 = 1;

/// Stable identity of a cluster node: unique id plus the addresses it
/// accepts connections on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub unique_id: String,
    pub listeners: Vec<SocketAddr>,
}

impl NodeIdentity {
    pub fn new(unique_id: impl Into<String>, listeners: Vec<SocketAddr>) -> Self {
        Self {
            unique_id: unique_id.into(),
            listeners,
        }
    }
}

/// A point-in-time view of one node.
///
/// `startup_millis` is fixed for the node's whole process lifetime and breaks
/// reconnect symmetry: the side that started later dials. `creation_millis`
/// is refreshed on every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node: NodeIdentity,
    pub startup_millis: u64,
    pub creation_millis: u64,
    pub version: u32,
}

impl NodeSnapshot {
    pub fn new(node: NodeIdentity, startup_millis: u64) -> Self {
        Self {
            node,
            startup_millis,
            creation_millis: current_millis(),
            version: PROTOCOL_VERSION,
        }
    }

    /// A fresh snapshot of the same node, stamped now.
    pub fn refreshed(&self) -> Self {
        Self {
            node: self.node.clone(),
            startup_millis: self.startup_millis,
            creation_millis: current_millis(),
            version: self.version,
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
