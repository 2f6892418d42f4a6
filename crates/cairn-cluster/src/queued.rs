//! Queueing decorator for channels to suspected-dead peers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cairn_core::Packet;
use cairn_net::{Channel, NetError};

/// Buffers outbound packets instead of writing to a channel presumed dead.
///
/// Wrapped around a peer's channel on soft disconnect; when the peer
/// re-authorizes, the buffer is drained onto the fresh channel in original
/// submission order, so nothing sent during the partition is lost.
#[derive(Clone)]
pub struct QueuedChannel {
    inner: Arc<Channel>,
    queue: Arc<Mutex<VecDeque<Packet>>>,
}

impl QueuedChannel {
    pub fn new(inner: Arc<Channel>) -> Self {
        Self {
            inner,
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// The wrapped (presumed dead) channel.
    pub fn inner(&self) -> &Arc<Channel> {
        &self.inner
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }

    /// Buffer a packet for later delivery. Never fails: the whole point of
    /// the decorator is to absorb traffic while the peer is unreachable.
    pub fn send(&self, packet: Packet) {
        self.queue.lock().expect("queue lock poisoned").push_back(packet);
    }

    /// Flush all buffered packets onto a live channel, preserving submission
    /// order. On a send failure the unsent remainder stays buffered.
    pub fn drain_to(&self, target: &Arc<Channel>) -> Result<usize, NetError> {
        let mut drained = 0;
        loop {
            let packet = {
                let mut queue = self.queue.lock().expect("queue lock poisoned");
                match queue.pop_front() {
                    Some(packet) => packet,
                    None => return Ok(drained),
                }
            };
            if let Err(error) = target.send(packet.clone()) {
                self.queue
                    .lock()
                    .expect("queue lock poisoned")
                    .push_front(packet);
                return Err(error);
            }
            drained += 1;
        }
    }
}
