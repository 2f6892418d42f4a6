//! Membership behavior across real connections: authorization, heartbeats,
//! the disconnect state machine, queue draining on reconnect, and head
//! election as seen over RPC.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::{broadcast, OwnedSemaphorePermit};

use cairn_cluster::{ClusterTasks, NodeServer, NodeServerState};
use cairn_core::config::TimingConfig;
use cairn_core::snapshot::NodeIdentity;
use cairn_core::Packet;
use cairn_net::chunk::receiver::{ChunkedPacketHandler, HandlerFactory};
use cairn_net::chunk::sender::ChunkedPacketSender;
use cairn_net::chunk::{ChunkSessionInfo, PacketSink, TransferStatus};
use cairn_net::NetError;

use crate::{spawn_node, spawn_node_with, wait_for};

fn tight_timing() -> TimingConfig {
    TimingConfig {
        heartbeat_interval_ms: 50,
        tracker_interval_ms: 100,
        soft_disconnect_ms: 60_000,
        hard_disconnect_ms: 60_000,
        connect_timeout_ms: 500,
        query_ttl_secs: 60,
    }
}

#[tokio::test]
async fn wrong_cluster_key_is_rejected() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node_with("node-b", 200, "a-different-key", Duration::from_secs(60)).await?;

    let outcome = a.join(&b).await;
    let error = outcome.expect_err("authorization must fail on key mismatch");
    assert!(matches!(
        error.downcast_ref::<NetError>(),
        Some(NetError::Unauthorized)
    ));

    // the rejected node never enters the acceptor's membership table
    assert!(b.provider.node("node-a").is_none());
    Ok(())
}

#[tokio::test]
async fn heartbeats_refresh_peer_liveness() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;
    a.join(&b).await?;

    let (shutdown_tx, _keep) = broadcast::channel(1);
    let tasks = ClusterTasks::new(a.network.clone(), tight_timing(), shutdown_tx.subscribe());
    let task_handle = tokio::spawn(tasks.run());

    let b_view = b.provider.node("node-a").expect("a registered on b");
    let initial = b_view.last_update();
    wait_for("a snapshot push to land", Duration::from_secs(2), {
        let b_view = b_view.clone();
        move || b_view.last_update() > initial
    })
    .await?;
    assert_eq!(b_view.snapshot().unwrap().startup_millis, 100);

    let _ = shutdown_tx.send(());
    task_handle.await??;
    Ok(())
}

#[tokio::test]
async fn head_election_is_queryable_over_rpc() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;
    a.join(&b).await?;

    let channel = a.channel_to("node-b").expect("live channel to b");
    let factory = a.network.rpc_factory();

    let head: Option<NodeIdentity> = factory
        .call("NodeServerProvider", "head_node", "()")
        .fire(&channel)
        .await?;
    assert_eq!(head.expect("a head must exist").unique_id, "node-a");

    let nodes: Vec<NodeIdentity> = factory
        .call("NodeServerProvider", "nodes", "()")
        .fire(&channel)
        .await?;
    assert_eq!(nodes.len(), 2);

    let by_id: Option<NodeIdentity> = factory
        .call("NodeServerProvider", "node", "(str)")
        .arg(&"node-a")?
        .fire(&channel)
        .await?;
    assert_eq!(by_id.expect("node-a is known").unique_id, "node-a");
    Ok(())
}

#[tokio::test]
async fn hard_disconnect_removes_the_peer_permanently() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;
    b.join(&a).await?;

    // a node that never pushes snapshots exceeds the soft threshold, and a
    // zero hard threshold removes it on the same tracker pass
    let timing = TimingConfig {
        soft_disconnect_ms: 200,
        hard_disconnect_ms: 0,
        ..tight_timing()
    };
    let (shutdown_tx, _keep) = broadcast::channel(1);
    let tasks = ClusterTasks::new(b.network.clone(), timing, shutdown_tx.subscribe());
    let task_handle = tokio::spawn(tasks.run());

    wait_for("hard removal", Duration::from_secs(3), {
        let provider = b.provider.clone();
        move || provider.node("node-a").is_none()
    })
    .await?;

    // removal is permanent: the node does not come back on its own
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(b.provider.node("node-a").is_none());
    assert_eq!(b.provider.head_node().unwrap().info().unique_id, "node-b");

    let _ = shutdown_tx.send(());
    task_handle.await??;
    Ok(())
}

#[tokio::test]
async fn worker_scope_gets_a_plain_authorized_channel() -> Result<()> {
    let b = spawn_node("node-b", 200).await?;
    let worker = spawn_node("worker-1", 500).await?;

    let channel = worker
        .connector
        .connect_worker(b.addr, worker.identity())
        .await?;

    // the worker can make calls but takes no part in membership
    let nodes: Vec<NodeIdentity> = worker
        .network
        .rpc_factory()
        .call("NodeServerProvider", "nodes", "()")
        .fire(&channel)
        .await?;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].unique_id, "node-b");
    assert!(b.provider.node("worker-1").is_none());
    Ok(())
}

// ── Partition scenario ────────────────────────────────────────────────────────

/// Forwards chunk packets into a node's channel slot, so they queue while the
/// peer is suspected dead.
struct NodeSink(Arc<NodeServer>);

impl PacketSink for NodeSink {
    fn accept(
        &self,
        packet: Packet,
        _guard: Option<Arc<OwnedSemaphorePermit>>,
    ) -> Result<(), NetError> {
        self.0.send(packet)
    }
}

/// Chunk handler that records arrival order alongside the reassembly, so the
/// drain-order guarantee is observable.
struct RecordingHandler {
    parts: BTreeMap<u32, Bytes>,
    final_index: Option<u32>,
    order: Arc<Mutex<Vec<u32>>>,
    done: Arc<Mutex<Option<Vec<u8>>>>,
}

impl ChunkedPacketHandler for RecordingHandler {
    fn handle_part(&mut self, index: u32, is_final: bool, data: Bytes) -> anyhow::Result<bool> {
        self.order.lock().unwrap().push(index);
        if is_final {
            self.final_index = Some(index);
        }
        self.parts.insert(index, data);

        let complete = self
            .final_index
            .map(|last| self.parts.len() as u64 == last as u64 + 1)
            .unwrap_or(false);
        if complete {
            let mut assembled = Vec::new();
            for part in self.parts.values() {
                assembled.extend_from_slice(part);
            }
            *self.done.lock().unwrap() = Some(assembled);
        }
        Ok(complete)
    }
}

fn recording_factory(
    order: Arc<Mutex<Vec<u32>>>,
    done: Arc<Mutex<Option<Vec<u8>>>>,
) -> HandlerFactory {
    Arc::new(move |_info| {
        Box::new(RecordingHandler {
            parts: BTreeMap::new(),
            final_index: None,
            order: order.clone(),
            done: done.clone(),
        })
    })
}

/// The full partition round trip: the link to A drops, B queues traffic for
/// it, B (the later-started side) keeps redialing, and once A is back the
/// handshake drains the queue in original order and re-exchanges snapshots.
#[tokio::test]
async fn partition_queues_traffic_and_drains_in_order_on_reconnect() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;

    let order = Arc::new(Mutex::new(Vec::new()));
    let delivered = Arc::new(Mutex::new(None));
    a.network
        .chunk_handlers()
        .register("partition-proof", recording_factory(order.clone(), delivered.clone()));

    // B dials A so the connection terminates at A's listener
    b.join(&a).await?;
    let b_view = b.provider.node("node-a").expect("a registered on b");
    assert_eq!(b_view.state(), NodeServerState::Ready);

    let (shutdown_tx, _keep) = broadcast::channel(1);
    let tasks = ClusterTasks::new(b.network.clone(), tight_timing(), shutdown_tx.subscribe());
    let task_handle = tokio::spawn(tasks.run());

    // the partition: A's listener goes away and the live link drops
    a.server.shutdown();
    wait_for("b to suspect a dead", Duration::from_secs(2), {
        let b_view = b_view.clone();
        move || b_view.state() == NodeServerState::Disconnected
    })
    .await?;

    // everything sent towards A during the partition is buffered, not lost
    let payload: Vec<u8> = (0..40).map(|i| i as u8).collect();
    let session = ChunkSessionInfo::new("partition-proof", 16, json!(null));
    let sender = ChunkedPacketSender::new(
        session,
        Cursor::new(payload.clone()),
        Arc::new(NodeSink(b_view.clone())),
        8,
    );
    assert_eq!(sender.transfer().await?, TransferStatus::Success);
    assert_eq!(b_view.queued_packets(), 3);

    // A reappears on the same address; B's tracker redials and re-authorizes
    a.server.listen(a.addr).await?;
    wait_for("reconnect and drain", Duration::from_secs(5), {
        let b_view = b_view.clone();
        move || b_view.state() == NodeServerState::Ready && b_view.queued_packets() == 0
    })
    .await?;

    wait_for("queued chunks to arrive at a", Duration::from_secs(2), {
        let delivered = delivered.clone();
        move || delivered.lock().unwrap().is_some()
    })
    .await?;

    // drained in original submission order, payload intact
    assert_eq!(order.lock().unwrap().as_slice(), &[0, 1, 2]);
    assert_eq!(delivered.lock().unwrap().as_deref(), Some(payload.as_slice()));

    // both sides hold fresh state about each other again
    assert!(b_view.snapshot().is_some());
    let a_view = a.provider.node("node-b").expect("b registered on a");
    assert_eq!(a_view.state(), NodeServerState::Ready);
    assert!(a_view.snapshot().is_some());

    let _ = shutdown_tx.send(());
    task_handle.await??;
    Ok(())
}
