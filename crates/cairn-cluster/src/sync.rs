//! Cluster state synchronization.
//!
//! Every piece of replicated state registers a sync handler; the registry
//! bundles their exports into one JSON document that rides on the
//! authorization handshake, so both sides of a healed partition apply each
//! other's pending mutations before normal traffic resumes.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use cairn_core::snapshot::{NodeIdentity, NodeSnapshot};
use cairn_core::Packet;
use cairn_net::{Channel, PacketListener};

use crate::provider::NodeServerProvider;

/// One replicated piece of cluster state.
pub trait DataSyncHandler: Send + Sync {
    /// Stable tag identifying this handler's data in the sync document.
    fn key(&self) -> &str;

    /// Export the current state.
    fn export(&self) -> anyhow::Result<Value>;

    /// Apply a peer's exported state. `force` is set during reconnect
    /// handling, where the peer's view wins over local defaults.
    fn import(&self, data: Value, force: bool) -> anyhow::Result<()>;
}

/// Registry of sync handlers, keyed by tag, last writer wins.
#[derive(Default)]
pub struct DataSyncRegistry {
    handlers: DashMap<String, Arc<dyn DataSyncHandler>>,
}

impl DataSyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn DataSyncHandler>) {
        if self
            .handlers
            .insert(handler.key().to_string(), handler.clone())
            .is_some()
        {
            tracing::debug!(key = handler.key(), "data sync handler replaced");
        }
    }

    /// Bundle every handler's export into one document.
    pub fn prepare_cluster_data(&self) -> Value {
        let mut document = Map::new();
        for entry in self.handlers.iter() {
            match entry.value().export() {
                Ok(data) => {
                    document.insert(entry.key().clone(), data);
                }
                Err(error) => {
                    tracing::warn!(key = %entry.key(), error = %error, "sync export failed");
                }
            }
        }
        Value::Object(document)
    }

    /// Apply a peer's sync document. Unknown keys are logged and skipped.
    pub fn handle(&self, document: &Value, force: bool) {
        let entries = match document.as_object() {
            Some(entries) => entries,
            None => {
                tracing::warn!("sync document is not an object, ignoring");
                return;
            }
        };
        for (key, data) in entries {
            match self.handlers.get(key) {
                Some(handler) => {
                    if let Err(error) = handler.import(data.clone(), force) {
                        tracing::warn!(key = %key, error = %error, "sync import failed");
                    }
                }
                None => tracing::debug!(key = %key, "no sync handler for key"),
            }
        }
    }
}

/// Syncs the set of known node identities, so members configured on one node
/// propagate to the rest of the cluster.
pub struct KnownNodesSyncHandler {
    provider: Arc<NodeServerProvider>,
}

impl KnownNodesSyncHandler {
    pub fn new(provider: Arc<NodeServerProvider>) -> Self {
        Self { provider }
    }
}

impl DataSyncHandler for KnownNodesSyncHandler {
    fn key(&self) -> &str {
        "known_nodes"
    }

    fn export(&self) -> anyhow::Result<Value> {
        let identities: Vec<NodeIdentity> = self
            .provider
            .node_servers()
            .iter()
            .map(|server| server.info().clone())
            .collect();
        Ok(serde_json::to_value(identities)?)
    }

    fn import(&self, data: Value, _force: bool) -> anyhow::Result<()> {
        let identities: Vec<NodeIdentity> = serde_json::from_value(data)?;
        for identity in identities {
            self.provider.register_node(identity);
        }
        Ok(())
    }
}

// ── Authorization payloads ────────────────────────────────────────────────────

/// What kind of process is authorizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthScope {
    /// A fellow cluster node; gets a NodeServer and participates in
    /// membership.
    Node,
    /// A supervised satellite worker; gets an authorized channel, nothing
    /// more.
    Worker,
}

/// Sent by the dialing side as a query on the auth channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub cluster_key: String,
    pub scope: AuthScope,
    pub identity: NodeIdentity,
    pub snapshot: Option<NodeSnapshot>,
    /// True when this connection replaces one lost to a partition.
    pub reconnect: bool,
    /// Pending cluster state, present on reconnects.
    pub sync_data: Option<Value>,
}

/// The acknowledgement. Auth itself is bare success/failure; an accepted
/// node additionally receives the acceptor's snapshot and sync state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub accepted: bool,
    pub snapshot: Option<NodeSnapshot>,
    pub sync_data: Option<Value>,
}

impl AuthResponse {
    pub fn rejected() -> Self {
        Self {
            accepted: false,
            snapshot: None,
            sync_data: None,
        }
    }
}

// ── Snapshot listener ─────────────────────────────────────────────────────────

/// Applies heartbeat snapshot pushes to the membership table.
pub struct NodeSnapshotListener {
    provider: Arc<NodeServerProvider>,
}

impl NodeSnapshotListener {
    pub fn new(provider: Arc<NodeServerProvider>) -> Self {
        Self { provider }
    }
}

impl PacketListener for NodeSnapshotListener {
    fn handle(&self, _channel: &Arc<Channel>, packet: Packet) -> anyhow::Result<()> {
        let snapshot: NodeSnapshot = serde_json::from_slice(&packet.body)?;
        match self.provider.node(&snapshot.node.unique_id) {
            Some(server) => server.update_snapshot(snapshot),
            None => tracing::debug!(
                node = %snapshot.node.unique_id,
                "snapshot push from unknown node ignored"
            ),
        }
        Ok(())
    }
}
