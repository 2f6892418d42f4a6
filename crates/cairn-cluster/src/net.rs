//! Network wiring for a cluster node.
//!
//! Bundles the membership provider with the protocol registries and the
//! authorization state. Freshly accepted connections carry only the auth
//! listener; the default listener set (RPC, chunk, snapshot sync) is
//! installed per channel once it authorizes.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;

use cairn_core::snapshot::NodeIdentity;
use cairn_core::Packet;
use cairn_net::chunk::receiver::{ChunkHandlerRegistry, ChunkedPacketListener};
use cairn_net::rpc::handler::{RpcFailure, RpcHandler, RpcHandlerRegistry, RpcRequestListener};
use cairn_net::rpc::RpcFactory;
use cairn_net::{channels, Channel, ChannelHandler, JsonObjectMapper, ObjectMapper};

use crate::auth::AuthListener;
use crate::node::NodeServerState;
use crate::provider::NodeServerProvider;
use crate::sync::{DataSyncRegistry, KnownNodesSyncHandler, NodeSnapshotListener};

/// Everything one node needs to speak the cluster protocol.
pub struct ClusterNetwork {
    provider: Arc<NodeServerProvider>,
    sync: Arc<DataSyncRegistry>,
    rpc_handlers: Arc<RpcHandlerRegistry>,
    chunk_handlers: Arc<ChunkHandlerRegistry>,
    mapper: Arc<dyn ObjectMapper>,
    cluster_key: String,
    query_ttl: Duration,
}

impl ClusterNetwork {
    pub fn new(
        provider: Arc<NodeServerProvider>,
        cluster_key: String,
        query_ttl: Duration,
    ) -> Arc<Self> {
        let sync = Arc::new(DataSyncRegistry::new());
        sync.register(Arc::new(KnownNodesSyncHandler::new(provider.clone())));

        let rpc_handlers = Arc::new(RpcHandlerRegistry::new());
        register_provider_rpc(&rpc_handlers, &provider);

        Arc::new(Self {
            provider,
            sync,
            rpc_handlers,
            chunk_handlers: Arc::new(ChunkHandlerRegistry::new()),
            mapper: Arc::new(JsonObjectMapper),
            cluster_key,
            query_ttl,
        })
    }

    pub fn provider(&self) -> &Arc<NodeServerProvider> {
        &self.provider
    }

    pub fn sync(&self) -> &Arc<DataSyncRegistry> {
        &self.sync
    }

    pub fn rpc_handlers(&self) -> &Arc<RpcHandlerRegistry> {
        &self.rpc_handlers
    }

    pub fn chunk_handlers(&self) -> &Arc<ChunkHandlerRegistry> {
        &self.chunk_handlers
    }

    pub fn mapper(&self) -> &Arc<dyn ObjectMapper> {
        &self.mapper
    }

    pub fn rpc_factory(&self) -> RpcFactory {
        RpcFactory::new(self.mapper.clone())
    }

    pub fn cluster_key(&self) -> &str {
        &self.cluster_key
    }

    pub fn query_ttl(&self) -> Duration {
        self.query_ttl
    }

    /// The channel handler every server and client connection of this node
    /// uses.
    pub fn channel_handler(self: &Arc<Self>) -> Arc<dyn ChannelHandler> {
        Arc::new(ClusterChannelHandler {
            network: self.clone(),
        })
    }

    /// Install the post-authorization listener set on a channel and retire
    /// the auth listener.
    pub fn install_default_listeners(&self, channel: &Arc<Channel>) {
        let listeners = channel.listeners();
        listeners.unregister(channels::AUTH);
        listeners.register(
            channels::RPC,
            Arc::new(RpcRequestListener::new(
                self.rpc_handlers.clone(),
                self.mapper.clone(),
            )),
        );
        listeners.register(
            channels::CHUNK,
            Arc::new(ChunkedPacketListener::new(self.chunk_handlers.clone())),
        );
        listeners.register(
            channels::NODE_SYNC,
            Arc::new(NodeSnapshotListener::new(self.provider.clone())),
        );
    }
}

struct ClusterChannelHandler {
    network: Arc<ClusterNetwork>,
}

impl ChannelHandler for ClusterChannelHandler {
    fn handle_init(&self, channel: &Arc<Channel>) -> anyhow::Result<()> {
        // until the peer authorizes, the auth channel is all it may use
        channel
            .listeners()
            .register(channels::AUTH, Arc::new(AuthListener::new(self.network.clone())));
        tracing::debug!(
            channel_id = channel.id(),
            remote = %channel.remote_addr(),
            "channel initialized, awaiting authorization"
        );
        Ok(())
    }

    fn handle_packet(&self, _channel: &Arc<Channel>, _packet: &Packet) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn handle_close(&self, channel: &Arc<Channel>) {
        // when the closed channel was a node's live link, flip the node to
        // disconnected so further traffic queues instead of hitting a dead
        // socket; the tracker decides reconnect vs. removal from there
        let provider = self.network.provider();
        for server in provider.node_servers() {
            if server.is_local() || server.state() != NodeServerState::Ready {
                continue;
            }
            let holds_channel = server
                .channel()
                .map(|live| live.id() == channel.id())
                .unwrap_or(false);
            if holds_channel {
                server.set_state(NodeServerState::Disconnected);
                server.wrap_channel_queued();
                let was_head = provider
                    .head_node()
                    .map(|head| Arc::ptr_eq(&head, &server))
                    .unwrap_or(false);
                if was_head {
                    provider.select_head_node();
                }
                tracing::warn!(
                    node = %server.info().unique_id,
                    "node channel closed, queueing outbound traffic"
                );
            }
        }
        tracing::debug!(
            channel_id = channel.id(),
            remote = %channel.remote_addr(),
            "channel closed"
        );
    }
}

/// Expose the membership table over RPC, the surface collaborators use to
/// inspect the cluster.
fn register_provider_rpc(registry: &RpcHandlerRegistry, provider: &Arc<NodeServerProvider>) {
    let nodes_provider = provider.clone();
    let node_provider = provider.clone();
    let head_provider = provider.clone();
    let snapshots_provider = provider.clone();

    let handler = RpcHandler::builder("NodeServerProvider")
        .method("nodes", "()", move |_args| {
            let provider = nodes_provider.clone();
            async move {
                let infos: Vec<NodeIdentity> = provider
                    .node_servers()
                    .iter()
                    .map(|server| server.info().clone())
                    .collect();
                serde_json::to_value(infos).map_err(RpcFailure::execution)
            }
            .boxed()
        })
        .method("node", "(str)", move |args| {
            let provider = node_provider.clone();
            async move {
                let unique_id = string_arg(&args, 0)?;
                let info = provider.node(&unique_id).map(|server| server.info().clone());
                serde_json::to_value(info).map_err(RpcFailure::execution)
            }
            .boxed()
        })
        .method("head_node", "()", move |_args| {
            let provider = head_provider.clone();
            async move {
                let info = provider.head_node().map(|server| server.info().clone());
                serde_json::to_value(info).map_err(RpcFailure::execution)
            }
            .boxed()
        })
        .method("node_snapshots", "()", move |_args| {
            let provider = snapshots_provider.clone();
            async move {
                serde_json::to_value(provider.node_snapshots()).map_err(RpcFailure::execution)
            }
            .boxed()
        })
        .build();

    registry.register(handler);
}

/// Arguments already decoded as JSON values by the dispatch layer; keep the
/// helper close to where handlers are written.
fn string_arg(args: &[Value], position: usize) -> Result<String, RpcFailure> {
    args.get(position)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RpcFailure::bad_request(format!("argument {position} must be a string")))
}
