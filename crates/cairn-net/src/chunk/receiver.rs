//! The receiving half of a chunked transfer.
//!
//! Which handler services a freshly opened session is resolved dynamically
//! from a registry keyed by the session's transfer channel tag. A session
//! nothing claims fails fast — rejected sessions are remembered so their
//! remaining chunks are dropped with a trace instead of re-resolving per
//! packet.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};

use cairn_core::Packet;

use crate::channel::Channel;
use crate::error::NetError;
use crate::listener::PacketListener;

use super::{decode_chunk, ChunkSessionInfo};

/// Receives the reassembled payload once a session completes. The returned
/// bool reports whether the data was consumed.
pub type SessionCallback =
    Arc<dyn Fn(&ChunkSessionInfo, Vec<u8>) -> anyhow::Result<bool> + Send + Sync>;

/// Accumulates the parts of one session.
pub trait ChunkedPacketHandler: Send + Sync {
    /// Feed one chunk. Returns true when the session is finished and its
    /// state can be dropped.
    fn handle_part(&mut self, index: u32, is_final: bool, data: Bytes) -> anyhow::Result<bool>;
}

/// Creates a handler for a newly opened session.
pub type HandlerFactory = Arc<dyn Fn(&ChunkSessionInfo) -> Box<dyn ChunkedPacketHandler> + Send + Sync>;

/// Registry resolving transfer channel tags to handler factories.
/// Populated at startup; last writer wins per tag.
#[derive(Default)]
pub struct ChunkHandlerRegistry {
    factories: DashMap<String, HandlerFactory>,
}

impl ChunkHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transfer_channel: &str, factory: HandlerFactory) {
        if self
            .factories
            .insert(transfer_channel.to_string(), factory)
            .is_some()
        {
            tracing::debug!(transfer_channel, "chunk handler factory replaced");
        }
    }

    /// Convenience registration: reassemble in memory, then hand the bytes
    /// to the callback.
    pub fn register_in_memory(&self, transfer_channel: &str, callback: SessionCallback) {
        self.register(
            transfer_channel,
            Arc::new(move |info| {
                Box::new(InMemoryChunkHandler::new(info.clone(), callback.clone()))
            }),
        );
    }

    fn resolve(&self, transfer_channel: &str) -> Option<HandlerFactory> {
        self.factories
            .get(transfer_channel)
            .map(|entry| entry.value().clone())
    }
}

/// Default handler: collect chunks by index, reassemble on the final chunk,
/// hand the bytes to the session callback.
pub struct InMemoryChunkHandler {
    info: ChunkSessionInfo,
    parts: BTreeMap<u32, Bytes>,
    final_index: Option<u32>,
    callback: SessionCallback,
}

impl InMemoryChunkHandler {
    pub fn new(info: ChunkSessionInfo, callback: SessionCallback) -> Self {
        Self {
            info,
            parts: BTreeMap::new(),
            final_index: None,
            callback,
        }
    }

    fn complete(&self) -> bool {
        match self.final_index {
            Some(final_index) => self.parts.len() as u64 == final_index as u64 + 1,
            None => false,
        }
    }
}

impl ChunkedPacketHandler for InMemoryChunkHandler {
    fn handle_part(&mut self, index: u32, is_final: bool, data: Bytes) -> anyhow::Result<bool> {
        if is_final {
            self.final_index = Some(index);
        }
        if self.parts.insert(index, data).is_some() {
            tracing::debug!(index, "duplicate chunk overwritten");
        }
        if !self.complete() {
            return Ok(false);
        }

        let mut assembled = Vec::with_capacity(self.parts.len() * self.info.chunk_size as usize);
        for part in self.parts.values() {
            assembled.extend_from_slice(part);
        }
        let consumed = (self.callback)(&self.info, assembled)
            .context("chunk session completion callback failed")?;
        if !consumed {
            tracing::warn!(
                transfer_channel = %self.info.transfer_channel,
                "completed chunk session was not consumed, discarding payload"
            );
        }
        Ok(true)
    }
}

/// Listens on the chunk packet channel and routes parts to their sessions.
pub struct ChunkedPacketListener {
    registry: Arc<ChunkHandlerRegistry>,
    sessions: DashMap<u128, Box<dyn ChunkedPacketHandler>>,
    rejected: DashSet<u128>,
}

impl ChunkedPacketListener {
    pub fn new(registry: Arc<ChunkHandlerRegistry>) -> Self {
        Self {
            registry,
            sessions: DashMap::new(),
            rejected: DashSet::new(),
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }
}

impl PacketListener for ChunkedPacketListener {
    fn handle(&self, _channel: &Arc<Channel>, packet: Packet) -> anyhow::Result<()> {
        let part = decode_chunk(packet.body)?;
        let session_id = part.info.session_id;

        if self.rejected.contains(&session_id) {
            tracing::debug!(
                transfer_channel = %part.info.transfer_channel,
                "dropping chunk of rejected session"
            );
            return Ok(());
        }

        if !self.sessions.contains_key(&session_id) {
            let factory = match self.registry.resolve(&part.info.transfer_channel) {
                Some(factory) => factory,
                None => {
                    // fail fast: nothing claimed the session, refuse it
                    // outright rather than buffering data nobody will read
                    self.rejected.insert(session_id);
                    return Err(
                        NetError::SessionRejected(part.info.transfer_channel.clone()).into()
                    );
                }
            };
            self.sessions.insert(session_id, factory(&part.info));
        }

        let finished = {
            let mut handler = match self.sessions.get_mut(&session_id) {
                Some(handler) => handler,
                None => return Ok(()), // completed concurrently
            };
            match handler.handle_part(part.index, part.is_final, part.data) {
                Ok(finished) => finished,
                Err(error) => {
                    drop(handler);
                    self.sessions.remove(&session_id);
                    self.rejected.insert(session_id);
                    return Err(error);
                }
            }
        };

        if finished {
            self.sessions.remove(&session_id);
        }
        Ok(())
    }
}
