//! The cluster scheduler loop.
//!
//! One loop services both periodic duties — the ~1s local snapshot push and
//! the ~5s disconnect tracker — so the two can never interleave. Everything
//! here is send-and-bookkeeping work; reconnect attempts are bounded by the
//! configured connect timeout and run inline, serialized with the ticks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use cairn_core::config::TimingConfig;
use cairn_core::Packet;
use cairn_net::channels;

use crate::auth::ClusterConnector;
use crate::net::ClusterNetwork;
use crate::node::{NodeServer, NodeServerState};

pub struct ClusterTasks {
    network: Arc<ClusterNetwork>,
    connector: ClusterConnector,
    timing: TimingConfig,
    shutdown: broadcast::Receiver<()>,
}

impl ClusterTasks {
    pub fn new(
        network: Arc<ClusterNetwork>,
        timing: TimingConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let connector = ClusterConnector::new(
            network.clone(),
            Duration::from_millis(timing.connect_timeout_ms.max(1)),
        );
        Self {
            network,
            connector,
            timing,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.timing.heartbeat_interval_ms.max(1)));
        let mut tracker =
            tokio::time::interval(Duration::from_millis(self.timing.tracker_interval_ms.max(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("cluster tasks shutting down");
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    tick += 1;
                    self.push_local_snapshot(tick);
                }
                _ = tracker.tick() => {
                    self.track_disconnects().await;
                }
            }
        }
    }

    /// Refresh the local snapshot and push it to every ready peer, one send
    /// at a time. Every tenth push is prioritized so no single update can
    /// trail the queue for long.
    fn push_local_snapshot(&self, tick: u64) {
        let provider = self.network.provider();
        let local = provider.local_node();
        if local.state() != NodeServerState::Ready {
            return;
        }

        provider.refresh_local_snapshot();
        let snapshot = match local.snapshot() {
            Some(snapshot) => snapshot,
            None => return,
        };
        let body = match serde_json::to_vec(&snapshot) {
            Ok(body) => body,
            Err(error) => {
                tracing::error!(error = %error, "local snapshot encoding failed");
                return;
            }
        };

        let prioritized = tick % 10 == 0;
        for server in provider.node_servers() {
            // state alone gates the push: a peer that has not exchanged a
            // snapshot yet still receives ours, which is what starts the
            // initial exchange
            if server.is_local() || server.state() != NodeServerState::Ready {
                continue;
            }
            let packet = if prioritized {
                Packet::prioritized(channels::NODE_SYNC, body.clone())
            } else {
                Packet::new(channels::NODE_SYNC, body.clone())
            };
            if let Err(error) = server.send(packet) {
                tracing::debug!(
                    node = %server.info().unique_id,
                    error = %error,
                    "snapshot push failed"
                );
            }
        }
    }

    /// Two passes over the membership table: soft-disconnect peers idle past
    /// the soft threshold, then hard-remove or reconnect peers already
    /// marked disconnected.
    async fn track_disconnects(&self) {
        let provider = self.network.provider();
        let local = provider.local_node();
        let soft = Duration::from_millis(self.timing.soft_disconnect_ms);
        let hard = Duration::from_millis(self.timing.hard_disconnect_ms);

        for server in provider.node_servers() {
            if server.is_local() || !server.available() {
                continue;
            }
            let idle = server.last_update().elapsed();
            if idle >= soft {
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
                    idle_ms = idle.as_millis() as u64,
                    threshold_ms = self.timing.soft_disconnect_ms,
                    "node soft-disconnected, queueing outbound traffic"
                );
            }
        }

        for server in provider.node_servers() {
            if server.is_local() || server.state() != NodeServerState::Disconnected {
                continue;
            }

            // a peer we never reached has no disconnect timestamps worth
            // honoring; keep dialing it instead of evicting it
            if !server.has_channel() && server.snapshot().is_none() {
                self.attempt_connect(&server, false).await;
                continue;
            }

            let disconnected_for = server.last_state_change().elapsed();
            if disconnected_for >= hard {
                server.close();
                provider.unregister_node(&server.info().unique_id);
                tracing::warn!(
                    node = %server.info().unique_id,
                    disconnected_ms = disconnected_for.as_millis() as u64,
                    threshold_ms = self.timing.hard_disconnect_ms,
                    "node hard-disconnected, removed permanently"
                );
            } else if let (Some(local_startup), Some(peer_startup)) =
                (local.startup_millis(), server.startup_millis())
            {
                // symmetry breaking: the later-started side dials, the
                // earlier one waits to be dialed
                if local_startup > peer_startup {
                    self.attempt_connect(&server, true).await;
                }
            }
        }
    }

    async fn attempt_connect(&self, server: &Arc<NodeServer>, reconnect: bool) {
        if let Err(error) = self.connector.connect_node(server, reconnect).await {
            tracing::debug!(
                node = %server.info().unique_id,
                reconnect,
                error = %error,
                "connect attempt failed"
            );
        }
    }
}
