//! The node server provider — the cluster's membership table.

use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use cairn_core::snapshot::{NodeIdentity, NodeSnapshot};

use crate::node::{NodeServer, NodeServerState};

/// Tracks every known cluster peer plus the local node, and keeps exactly
/// one `Ready` node elected as head at any time.
pub struct NodeServerProvider {
    local: Arc<NodeServer>,
    nodes: DashMap<String, Arc<NodeServer>>,
    head: RwLock<Option<String>>,
}

impl NodeServerProvider {
    pub fn new(local_identity: NodeIdentity, startup_millis: u64) -> Self {
        let local = Arc::new(NodeServer::new(local_identity.clone(), true));
        local.update_snapshot(NodeSnapshot::new(local_identity, startup_millis));
        local.set_state(NodeServerState::Ready);

        let provider = Self {
            local,
            nodes: DashMap::new(),
            head: RwLock::new(None),
        };
        provider.select_head_node();
        provider
    }

    pub fn local_node(&self) -> &Arc<NodeServer> {
        &self.local
    }

    /// Register a peer. Registering an already-known id returns the existing
    /// server untouched.
    pub fn register_node(&self, identity: NodeIdentity) -> Arc<NodeServer> {
        if identity.unique_id == self.local.info().unique_id {
            return self.local.clone();
        }
        self.nodes
            .entry(identity.unique_id.clone())
            .or_insert_with(|| {
                tracing::info!(node = %identity.unique_id, "cluster node registered");
                Arc::new(NodeServer::new(identity, false))
            })
            .value()
            .clone()
    }

    /// Permanently remove a peer. Triggers head re-election when the removed
    /// peer held the title.
    pub fn unregister_node(&self, unique_id: &str) -> Option<Arc<NodeServer>> {
        let removed = self.nodes.remove(unique_id).map(|(_, server)| server);
        if removed.is_some() {
            tracing::info!(node = %unique_id, "cluster node unregistered");
            let was_head = self
                .head
                .read()
                .expect("head lock poisoned")
                .as_deref()
                .map(|head| head == unique_id)
                .unwrap_or(false);
            if was_head {
                self.select_head_node();
            }
        }
        removed
    }

    pub fn node(&self, unique_id: &str) -> Option<Arc<NodeServer>> {
        if unique_id == self.local.info().unique_id {
            return Some(self.local.clone());
        }
        self.nodes.get(unique_id).map(|entry| entry.value().clone())
    }

    /// All known nodes, local node included.
    pub fn node_servers(&self) -> Vec<Arc<NodeServer>> {
        let mut servers = vec![self.local.clone()];
        servers.extend(self.nodes.iter().map(|entry| entry.value().clone()));
        servers
    }

    /// Latest snapshots of every node that has exchanged one.
    pub fn node_snapshots(&self) -> Vec<NodeSnapshot> {
        self.node_servers()
            .iter()
            .filter_map(|server| server.snapshot())
            .collect()
    }

    pub fn head_node(&self) -> Option<Arc<NodeServer>> {
        let head = self.head.read().expect("head lock poisoned").clone()?;
        self.node(&head)
    }

    /// Re-stamp the local snapshot so the next heartbeat carries fresh data.
    pub fn refresh_local_snapshot(&self) {
        if let Some(snapshot) = self.local.snapshot() {
            self.local.update_snapshot(snapshot.refreshed());
        }
    }

    /// Elect the head: earliest startup among `Ready` nodes, ties broken by
    /// smallest unique id. Deterministic — the same peer set always yields
    /// the same head.
    pub fn select_head_node(&self) -> Option<Arc<NodeServer>> {
        let chosen = self
            .node_servers()
            .into_iter()
            .filter(|server| server.state() == NodeServerState::Ready)
            .filter_map(|server| {
                server
                    .startup_millis()
                    .map(|startup| (startup, server.info().unique_id.clone(), server))
            })
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut head = self.head.write().expect("head lock poisoned");
        let new_head = chosen.as_ref().map(|(_, id, _)| id.clone());
        if *head != new_head {
            tracing::info!(
                head = new_head.as_deref().unwrap_or("<none>"),
                "head node selected"
            );
            *head = new_head;
        }
        chosen.map(|(_, _, server)| server)
    }
}
