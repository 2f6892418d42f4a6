//! Per-peer lifecycle state.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use cairn_core::snapshot::{NodeIdentity, NodeSnapshot};
use cairn_core::Packet;
use cairn_net::{Channel, NetError};

use crate::queued::QueuedChannel;

/// Lifecycle state of one cluster peer. Hard-disconnected peers are removed
/// from the provider, not modeled as a third state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeServerState {
    Ready,
    Disconnected,
}

/// The channel slot of a node: either the raw connection or the queueing
/// decorator installed on soft disconnect.
#[derive(Clone)]
pub enum NodeChannel {
    Direct(Arc<Channel>),
    Queued(QueuedChannel),
}

struct Lifecycle {
    state: NodeServerState,
    channel: Option<NodeChannel>,
    snapshot: Option<NodeSnapshot>,
    last_update: Instant,
    last_state_change: Instant,
}

/// One cluster peer, including the local node itself.
///
/// All mutable state sits behind one short-scope mutex; state transitions
/// take the lock, hooks and elections run after it is released.
pub struct NodeServer {
    info: NodeIdentity,
    local: bool,
    lifecycle: Mutex<Lifecycle>,
}

impl NodeServer {
    pub fn new(info: NodeIdentity, local: bool) -> Self {
        let now = Instant::now();
        Self {
            info,
            local,
            lifecycle: Mutex::new(Lifecycle {
                state: NodeServerState::Disconnected,
                channel: None,
                snapshot: None,
                last_update: now,
                last_state_change: now,
            }),
        }
    }

    pub fn info(&self) -> &NodeIdentity {
        &self.info
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().expect("node lifecycle lock poisoned")
    }

    pub fn state(&self) -> NodeServerState {
        self.lock().state
    }

    /// Ready and actually connected (the local node is available without a
    /// channel).
    pub fn available(&self) -> bool {
        let lifecycle = self.lock();
        lifecycle.state == NodeServerState::Ready && (self.local || lifecycle.channel.is_some())
    }

    pub fn has_channel(&self) -> bool {
        self.lock().channel.is_some()
    }

    pub fn snapshot(&self) -> Option<NodeSnapshot> {
        self.lock().snapshot.clone()
    }

    pub fn startup_millis(&self) -> Option<u64> {
        self.lock().snapshot.as_ref().map(|s| s.startup_millis)
    }

    pub fn last_update(&self) -> Instant {
        self.lock().last_update
    }

    pub fn last_state_change(&self) -> Instant {
        self.lock().last_state_change
    }

    /// Record a fresh snapshot from (or for) this node. Every arriving
    /// snapshot refreshes the liveness timestamp.
    pub fn update_snapshot(&self, snapshot: NodeSnapshot) {
        let mut lifecycle = self.lock();
        lifecycle.snapshot = Some(snapshot);
        lifecycle.last_update = Instant::now();
    }

    pub fn set_state(&self, state: NodeServerState) {
        let mut lifecycle = self.lock();
        if lifecycle.state != state {
            lifecycle.state = state;
            lifecycle.last_state_change = Instant::now();
            drop(lifecycle);
            tracing::info!(
                node = %self.info.unique_id,
                state = ?state,
                "node state changed"
            );
        }
    }

    /// Install a live channel, returning whatever occupied the slot before
    /// so the caller can drain and tear it down.
    pub fn replace_channel(&self, channel: Arc<Channel>) -> Option<NodeChannel> {
        self.lock().channel.replace(NodeChannel::Direct(channel))
    }

    /// Swap the raw channel for the queueing decorator. Returns false when
    /// there was nothing to wrap (no channel, or already queued).
    pub fn wrap_channel_queued(&self) -> bool {
        let mut lifecycle = self.lock();
        match lifecycle.channel.take() {
            Some(NodeChannel::Direct(channel)) => {
                lifecycle.channel = Some(NodeChannel::Queued(QueuedChannel::new(channel)));
                true
            }
            other => {
                lifecycle.channel = other;
                false
            }
        }
    }

    /// Number of packets currently buffered by the queueing decorator.
    pub fn queued_packets(&self) -> usize {
        match &self.lock().channel {
            Some(NodeChannel::Queued(queued)) => queued.pending(),
            _ => 0,
        }
    }

    /// Send through the current channel slot: directly when live, buffered
    /// when the peer is suspected dead.
    pub fn send(&self, packet: Packet) -> Result<(), NetError> {
        let channel = {
            let lifecycle = self.lock();
            lifecycle.channel.clone()
        };
        match channel {
            Some(NodeChannel::Direct(channel)) => channel.send(packet),
            Some(NodeChannel::Queued(queued)) => {
                queued.send(packet);
                Ok(())
            }
            None => Err(NetError::ChannelClosed),
        }
    }

    /// The live channel, when one is attached and not queue-wrapped.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        match &self.lock().channel {
            Some(NodeChannel::Direct(channel)) => Some(channel.clone()),
            _ => None,
        }
    }

    /// Tear down the connection and mark the node disconnected. Buffered
    /// packets on a queued channel are dropped.
    pub fn close(&self) {
        let channel = {
            let mut lifecycle = self.lock();
            lifecycle.channel.take()
        };
        match channel {
            Some(NodeChannel::Direct(channel)) => channel.close(),
            Some(NodeChannel::Queued(queued)) => {
                let pending = queued.pending();
                if pending > 0 {
                    tracing::warn!(
                        node = %self.info.unique_id,
                        pending,
                        "dropping packets queued for removed node"
                    );
                }
                queued.inner().close();
            }
            None => {}
        }
        self.set_state(NodeServerState::Disconnected);
    }
}
