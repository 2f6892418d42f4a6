//! Per-channel packet listener registry.

use std::sync::Arc;

use dashmap::DashMap;

use cairn_core::Packet;

use crate::channel::Channel;

/// Handles packets arriving on one packet channel id.
///
/// Listeners run on the connection's read task and must not block: anything
/// touching disk or waiting on other peers spawns its own task and reports
/// through an async handle.
pub trait PacketListener: Send + Sync {
    fn handle(&self, channel: &Arc<Channel>, packet: Packet) -> anyhow::Result<()>;
}

/// Registry mapping packet channel ids to listeners.
///
/// One listener per id, last writer wins: registration order is the single
/// deterministic resolution rule, there is no listener chain.
#[derive(Default)]
pub struct PacketListenerRegistry {
    listeners: DashMap<i32, Arc<dyn PacketListener>>,
}

impl PacketListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel_id: i32, listener: Arc<dyn PacketListener>) {
        if self.listeners.insert(channel_id, listener).is_some() {
            tracing::debug!(channel_id, "packet listener replaced");
        }
    }

    pub fn unregister(&self, channel_id: i32) -> bool {
        self.listeners.remove(&channel_id).is_some()
    }

    pub fn has_listener(&self, channel_id: i32) -> bool {
        self.listeners.contains_key(&channel_id)
    }

    /// Dispatch a packet to the listener for its channel id.
    /// Returns false when no listener is registered.
    pub fn dispatch(&self, channel: &Arc<Channel>, packet: Packet) -> bool {
        let listener = match self.listeners.get(&packet.channel) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };
        if let Err(error) = listener.handle(channel, packet) {
            tracing::warn!(
                channel_id = channel.id(),
                error = %error,
                "packet listener failed"
            );
        }
        true
    }
}
