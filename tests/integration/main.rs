//! Cairn integration test harness.
//!
//! Every test spins up real nodes in process: a full network server, a
//! membership provider and the protocol registries per node, all talking over
//! loopback TCP. Nothing is mocked below the listener registries — packets
//! travel through the real frame codec and channel machinery.
//!
//! Nodes are created with fixed startup timestamps so reconnect arbitration
//! and head election are deterministic per test.

mod chunks;
mod cluster;
mod rpc;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use cairn_cluster::{ClusterConnector, ClusterNetwork, NodeServerProvider, NodeServerState};
use cairn_core::snapshot::NodeIdentity;
use cairn_net::{Channel, NetworkServer};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const CLUSTER_KEY: &str = "integration-key";

/// One in-process cluster node.
pub struct TestNode {
    pub provider: Arc<NodeServerProvider>,
    pub network: Arc<ClusterNetwork>,
    pub server: NetworkServer,
    pub connector: ClusterConnector,
    pub addr: SocketAddr,
}

impl TestNode {
    pub fn identity(&self) -> NodeIdentity {
        self.provider.local_node().info().clone()
    }

    /// Register the peer and authorize against it.
    pub async fn join(&self, peer: &TestNode) -> Result<()> {
        let server = self.provider.register_node(peer.identity());
        self.connector.connect_node(&server, false).await
    }

    /// The live channel to a peer, when one is attached.
    pub fn channel_to(&self, peer_id: &str) -> Option<Arc<Channel>> {
        self.provider.node(peer_id).and_then(|server| server.channel())
    }
}

pub async fn spawn_node(id: &str, startup_millis: u64) -> Result<TestNode> {
    spawn_node_with(id, startup_millis, CLUSTER_KEY, Duration::from_secs(8 * 60 * 60)).await
}

pub async fn spawn_node_with(
    id: &str,
    startup_millis: u64,
    cluster_key: &str,
    query_ttl: Duration,
) -> Result<TestNode> {
    // reserve a loopback port so the node's identity can carry its real
    // listen address before the server binds it
    let addr = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0")?;
        probe.local_addr()?
    };

    let identity = NodeIdentity::new(id, vec![addr]);
    let provider = Arc::new(NodeServerProvider::new(identity, startup_millis));
    let network = ClusterNetwork::new(provider.clone(), cluster_key.to_string(), query_ttl);
    let server = NetworkServer::new(network.channel_handler(), query_ttl);
    let bound = server
        .listen(addr)
        .await
        .with_context(|| format!("failed to bind test node {id} on {addr}"))?;
    let connector = ClusterConnector::new(network.clone(), Duration::from_secs(2));

    Ok(TestNode {
        provider,
        network,
        server,
        connector,
        addr: bound,
    })
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn wait_for(what: &str, timeout: Duration, condition: impl Fn() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("timed out waiting for {what}")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// The fundamental handshake: two nodes authorize, attach channels, exchange
/// snapshots, and agree on the head.
#[tokio::test]
async fn two_nodes_authorize_over_loopback() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;
    a.join(&b).await?;

    let a_view = a.provider.node("node-b").expect("b registered on a");
    assert_eq!(a_view.state(), NodeServerState::Ready);
    assert!(a_view.channel().is_some());
    assert!(a_view.snapshot().is_some());

    let b_view = b.provider.node("node-a").expect("a registered on b");
    assert_eq!(b_view.state(), NodeServerState::Ready);
    assert!(b_view.snapshot().is_some());

    // both sides elect the earlier-started node
    assert_eq!(a.provider.head_node().unwrap().info().unique_id, "node-a");
    assert_eq!(b.provider.head_node().unwrap().info().unique_id, "node-a");
    Ok(())
}
