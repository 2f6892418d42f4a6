//! Fan-out of one chunk stream to several destination channels.

use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;

use cairn_core::Packet;

use crate::channel::Channel;
use crate::error::NetError;

use super::PacketSink;

/// Sends every chunk packet to each destination channel.
///
/// Each destination gets its own reference-counted view of the payload, so a
/// slow or failing send to one channel can neither corrupt nor prematurely
/// free the bytes another destination still needs. A failed destination is
/// logged and skipped; the remaining destinations are unaffected. The
/// original payload handle drops once, after all destinations are served.
pub struct ChannelsPacketSplitter {
    channels: Vec<Arc<Channel>>,
}

impl ChannelsPacketSplitter {
    pub fn new(channels: Vec<Arc<Channel>>) -> Self {
        Self { channels }
    }
}

impl PacketSink for ChannelsPacketSplitter {
    fn accept(
        &self,
        packet: Packet,
        guard: Option<Arc<OwnedSemaphorePermit>>,
    ) -> Result<(), NetError> {
        for channel in &self.channels {
            // a fresh view per destination; the budget guard is shared and
            // releases only once every destination's write has completed
            let view = packet.clone();
            if let Err(error) = channel.send_guarded(view, guard.clone()) {
                tracing::warn!(
                    channel_id = channel.id(),
                    remote = %channel.remote_addr(),
                    error = %error,
                    "chunk fan-out skipped dead destination"
                );
            }
        }
        Ok(())
    }
}

/// Sends chunk packets to a single destination channel.
pub struct ChannelPacketSplitter {
    channel: Arc<Channel>,
}

impl ChannelPacketSplitter {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }
}

impl PacketSink for ChannelPacketSplitter {
    fn accept(
        &self,
        packet: Packet,
        guard: Option<Arc<OwnedSemaphorePermit>>,
    ) -> Result<(), NetError> {
        self.channel.send_guarded(packet, guard)
    }
}
