//! Query correlation — one sent packet, exactly one completion.
//!
//! Every channel owns one manager. A pending entry is removed exactly once:
//! either explicitly by a correlated response, or by the TTL sweep, which
//! fails the waiting handle with a timeout. That single mechanism covers
//! "the peer never replied" without a timer per call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;

use cairn_core::Packet;

use crate::channel::Channel;
use crate::error::NetError;

struct PendingQuery {
    tx: oneshot::Sender<Result<Packet, NetError>>,
    registered_at: Instant,
}

/// Handle to an in-flight query.
pub struct QueryResponse {
    rx: oneshot::Receiver<Result<Packet, NetError>>,
}

impl QueryResponse {
    /// Wait for the correlated response.
    pub async fn wait(self) -> Result<Packet, NetError> {
        // a dropped sender means the channel tore down underneath the query
        self.rx.await.map_err(|_| NetError::ChannelClosed)?
    }
}

/// Correlates sent query packets with their eventual responses.
pub struct QueryManager {
    pending: DashMap<u128, PendingQuery>,
    ttl: Duration,
}

impl QueryManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn waiting_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_waiting(&self, unique_id: u128) -> bool {
        self.pending.contains_key(&unique_id)
    }

    /// Register the handle, then transmit: registration happens first so an
    /// immediate reply can never race past its waiter.
    pub(crate) fn send_query(
        &self,
        channel: &Arc<Channel>,
        mut packet: Packet,
    ) -> Result<QueryResponse, NetError> {
        let unique_id = packet.unique_id.unwrap_or_else(rand::random);
        packet.unique_id = Some(unique_id);

        let (tx, rx) = oneshot::channel();
        // replacing an entry drops the previous sender, cancelling its waiter
        self.pending.insert(
            unique_id,
            PendingQuery {
                tx,
                registered_at: Instant::now(),
            },
        );

        if let Err(error) = channel.send(packet) {
            self.pending.remove(&unique_id);
            return Err(error);
        }
        Ok(QueryResponse { rx })
    }

    /// Complete the pending query matching this packet's unique id.
    /// Returns false when nothing was waiting (the packet belongs to the
    /// listener path instead).
    pub(crate) fn complete(&self, packet: Packet) -> bool {
        let unique_id = match packet.unique_id {
            Some(id) => id,
            None => return false,
        };
        match self.pending.remove(&unique_id) {
            Some((_, waiting)) => {
                let _ = waiting.tx.send(Ok(packet));
                true
            }
            None => false,
        }
    }

    /// Cancel one pending query, used by reconnection logic to discard
    /// queries stranded on a replaced channel.
    pub fn cancel_waiting(&self, unique_id: u128) -> bool {
        self.pending.remove(&unique_id).is_some()
    }

    /// Fail every pending query with `ChannelClosed`. Called on teardown so
    /// callers do not sit out the full TTL against a dead connection.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<u128> = self.pending.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, waiting)) = self.pending.remove(&id) {
                let _ = waiting.tx.send(Err(NetError::ChannelClosed));
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Evict entries older than the TTL, failing their handles with Timeout.
    pub fn sweep(&self) -> usize {
        let cutoff = match Instant::now().checked_sub(self.ttl) {
            Some(cutoff) => cutoff,
            None => return 0,
        };
        let expired: Vec<u128> = self
            .pending
            .iter()
            .filter(|entry| entry.value().registered_at <= cutoff)
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for id in expired {
            if let Some((_, waiting)) = self.pending.remove(&id) {
                let _ = waiting.tx.send(Err(NetError::Timeout));
                evicted += 1;
            }
        }
        evicted
    }
}
