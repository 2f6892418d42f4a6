//! The authorization and reconnection handshake.
//!
//! A freshly connected channel may only speak on the auth packet channel. The
//! dialing side sends one query carrying the shared cluster key, its identity
//! and snapshot, a reconnect flag and, when reconnecting, its pending cluster
//! sync state. The accepting side verifies the key, applies the sync data,
//! drains anything buffered for the peer during the partition onto the live
//! channel, and acknowledges with its own snapshot and sync state. Only then
//! does the channel get the full listener set.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use cairn_core::snapshot::NodeIdentity;
use cairn_core::Packet;
use cairn_net::{channels, Channel, NetError, NetworkClient, PacketListener};

use crate::net::ClusterNetwork;
use crate::node::{NodeChannel, NodeServer, NodeServerState};
use crate::sync::{AuthRequest, AuthResponse, AuthScope};

/// Server side of the handshake. Registered on the auth channel of every
/// connection until that connection authorizes.
pub struct AuthListener {
    network: Arc<ClusterNetwork>,
}

impl AuthListener {
    pub fn new(network: Arc<ClusterNetwork>) -> Self {
        Self { network }
    }

    fn authorize(&self, channel: &Arc<Channel>, request: AuthRequest) -> AuthResponse {
        if request.cluster_key != self.network.cluster_key() {
            tracing::warn!(
                remote = %channel.remote_addr(),
                "authorization rejected, cluster key mismatch"
            );
            return AuthResponse::rejected();
        }

        match request.scope {
            AuthScope::Worker => {
                // a satellite worker gets an authorized channel and nothing
                // else: no NodeServer, no membership participation
                self.network.install_default_listeners(channel);
                tracing::info!(
                    worker = %request.identity.unique_id,
                    remote = %channel.remote_addr(),
                    "worker authorized"
                );
                AuthResponse {
                    accepted: true,
                    snapshot: None,
                    sync_data: None,
                }
            }
            AuthScope::Node => {
                let provider = self.network.provider();
                let server = provider.register_node(request.identity.clone());

                if request.reconnect {
                    if let Some(sync_data) = &request.sync_data {
                        // the peer's pending mutations land before any new
                        // traffic flows
                        self.network.sync().handle(sync_data, true);
                    }
                }
                if let Some(snapshot) = request.snapshot {
                    server.update_snapshot(snapshot);
                }
                attach_channel(&self.network, &server, channel);
                provider.refresh_local_snapshot();

                tracing::info!(
                    node = %request.identity.unique_id,
                    remote = %channel.remote_addr(),
                    reconnect = request.reconnect,
                    "cluster node authorized"
                );
                AuthResponse {
                    accepted: true,
                    snapshot: provider.local_node().snapshot(),
                    sync_data: Some(self.network.sync().prepare_cluster_data()),
                }
            }
        }
    }
}

impl PacketListener for AuthListener {
    fn handle(&self, channel: &Arc<Channel>, packet: Packet) -> anyhow::Result<()> {
        let unique_id = match packet.unique_id {
            Some(id) => id,
            None => {
                // the handshake is a query by contract; anything else on the
                // auth channel is a peer not speaking the protocol
                channel.close();
                anyhow::bail!("authorization packet was not a query");
            }
        };

        let request: AuthRequest =
            serde_json::from_slice(&packet.body).context("undecodable authorization request")?;
        let response = self.authorize(channel, request);
        let accepted = response.accepted;

        let body = serde_json::to_vec(&response).context("authorization response encoding")?;
        channel.send(Packet::response(unique_id, body))?;
        if !accepted {
            channel.close();
        }
        Ok(())
    }
}

/// Make `channel` the live link of `server`: install the post-auth listener
/// set, swap the channel slot, drain anything queued during the partition in
/// original submission order, and mark the node ready.
pub(crate) fn attach_channel(
    network: &Arc<ClusterNetwork>,
    server: &Arc<NodeServer>,
    channel: &Arc<Channel>,
) {
    network.install_default_listeners(channel);

    match server.replace_channel(channel.clone()) {
        Some(NodeChannel::Queued(queued)) => {
            match queued.drain_to(channel) {
                Ok(drained) if drained > 0 => {
                    tracing::info!(
                        node = %server.info().unique_id,
                        drained,
                        "drained packets buffered during partition"
                    );
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(
                        node = %server.info().unique_id,
                        error = %error,
                        "partition queue drain failed"
                    );
                }
            }
            // stale queries on the dead link fail out with the teardown
            queued.inner().close();
        }
        Some(NodeChannel::Direct(previous)) => {
            if previous.id() != channel.id() {
                previous.close();
            }
        }
        None => {}
    }

    server.set_state(NodeServerState::Ready);
    network.provider().select_head_node();
}

/// Client side of the handshake: dials a peer and authorizes against it.
pub struct ClusterConnector {
    network: Arc<ClusterNetwork>,
    client: NetworkClient,
    connect_timeout: Duration,
}

impl ClusterConnector {
    pub fn new(network: Arc<ClusterNetwork>, connect_timeout: Duration) -> Self {
        let client = NetworkClient::new(network.channel_handler(), network.query_ttl());
        Self {
            network,
            client,
            connect_timeout,
        }
    }

    /// Dial the peer's listeners in order until one accepts and authorizes.
    /// Each attempt is bounded by the connect timeout.
    pub async fn connect_node(
        &self,
        server: &Arc<NodeServer>,
        reconnect: bool,
    ) -> anyhow::Result<()> {
        let listeners = server.info().listeners.clone();
        anyhow::ensure!(
            !listeners.is_empty(),
            "node {} has no listeners to dial",
            server.info().unique_id
        );

        let mut last_error = None;
        for addr in listeners {
            match self.try_connect(server, addr, reconnect).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::debug!(
                        node = %server.info().unique_id,
                        %addr,
                        error = %error,
                        "connect attempt failed"
                    );
                    last_error = Some(error);
                }
            }
        }
        Err(last_error.expect("at least one listener was attempted"))
    }

    async fn try_connect(
        &self,
        server: &Arc<NodeServer>,
        addr: SocketAddr,
        reconnect: bool,
    ) -> anyhow::Result<()> {
        let channel = tokio::time::timeout(self.connect_timeout, self.client.connect(addr))
            .await
            .map_err(|_| NetError::Timeout)??;

        let provider = self.network.provider();
        provider.refresh_local_snapshot();
        let request = AuthRequest {
            cluster_key: self.network.cluster_key().to_string(),
            scope: AuthScope::Node,
            identity: provider.local_node().info().clone(),
            snapshot: provider.local_node().snapshot(),
            reconnect,
            sync_data: reconnect.then(|| self.network.sync().prepare_cluster_data()),
        };

        let reply = match self.authorize(&channel, &request).await {
            Ok(reply) => reply,
            Err(error) => {
                channel.close();
                return Err(error);
            }
        };

        if let Some(sync_data) = &reply.sync_data {
            self.network.sync().handle(sync_data, true);
        }
        if let Some(snapshot) = reply.snapshot {
            server.update_snapshot(snapshot);
        }
        attach_channel(&self.network, server, &channel);

        tracing::info!(
            node = %server.info().unique_id,
            remote = %channel.remote_addr(),
            reconnect,
            "authorized against cluster node"
        );
        Ok(())
    }

    /// Authorize as a satellite worker. Workers get a plain authorized
    /// channel back and take no part in cluster membership.
    pub async fn connect_worker(
        &self,
        addr: SocketAddr,
        identity: NodeIdentity,
    ) -> anyhow::Result<Arc<Channel>> {
        let channel = tokio::time::timeout(self.connect_timeout, self.client.connect(addr))
            .await
            .map_err(|_| NetError::Timeout)??;

        let request = AuthRequest {
            cluster_key: self.network.cluster_key().to_string(),
            scope: AuthScope::Worker,
            identity,
            snapshot: None,
            reconnect: false,
            sync_data: None,
        };

        match self.authorize(&channel, &request).await {
            Ok(_) => {
                self.network.install_default_listeners(&channel);
                Ok(channel)
            }
            Err(error) => {
                channel.close();
                Err(error)
            }
        }
    }

    async fn authorize(
        &self,
        channel: &Arc<Channel>,
        request: &AuthRequest,
    ) -> anyhow::Result<AuthResponse> {
        let body = serde_json::to_vec(request).context("authorization request encoding")?;
        let response = channel.send_query(Packet::new(channels::AUTH, body))?;
        let reply = tokio::time::timeout(self.connect_timeout, response.wait())
            .await
            .map_err(|_| NetError::Timeout)??;

        let response: AuthResponse =
            serde_json::from_slice(&reply.body).context("undecodable authorization response")?;
        if !response.accepted {
            return Err(NetError::Unauthorized.into());
        }
        Ok(response)
    }
}
