//! The channel abstraction — one live TCP connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::sync::OwnedSemaphorePermit;

use cairn_core::Packet;

use crate::error::NetError;
use crate::listener::PacketListenerRegistry;
use crate::query::{QueryManager, QueryResponse};

static CHANNEL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One event on a channel's outbound writer queue. A chunk-transfer budget
/// permit can ride along; the writer drops it once the bytes hit the socket,
/// which is what turns the budget into backpressure.
pub(crate) enum WriteEvent {
    Packet {
        packet: Packet,
        guard: Option<Arc<OwnedSemaphorePermit>>,
    },
    Shutdown,
}

/// Application hooks for channel lifecycle events.
///
/// All hooks run on the connection's read task: keep them non-blocking and
/// hand long work to a spawned task.
pub trait ChannelHandler: Send + Sync {
    /// Called once when the connection is established. An error closes the
    /// connection before any packet is processed.
    fn handle_init(&self, channel: &Arc<Channel>) -> anyhow::Result<()>;

    /// Called for every inbound packet before listener dispatch.
    /// Returning `Ok(false)` drops the packet.
    fn handle_packet(&self, _channel: &Arc<Channel>, _packet: &Packet) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Called exactly once when the connection tears down.
    fn handle_close(&self, channel: &Arc<Channel>);
}

/// A bidirectional packet connection.
///
/// Sends are FIFO per channel and enqueue onto the connection's writer task;
/// different channels are fully independent. Closing is idempotent and the
/// close hook fires exactly once, when the connection actually tears down.
pub struct Channel {
    id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    client_provided: bool,
    outbound: mpsc::UnboundedSender<WriteEvent>,
    queries: QueryManager,
    listeners: PacketListenerRegistry,
    handler: Arc<dyn ChannelHandler>,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
}

impl Channel {
    pub(crate) fn new(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        client_provided: bool,
        outbound: mpsc::UnboundedSender<WriteEvent>,
        query_ttl: Duration,
        handler: Arc<dyn ChannelHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: CHANNEL_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1,
            local_addr,
            remote_addr,
            client_provided,
            outbound,
            queries: QueryManager::new(query_ttl),
            listeners: PacketListenerRegistry::new(),
            handler,
            closed: AtomicBool::new(false),
            close_signal: watch::channel(false).0,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// True when this side of the connection dialed.
    pub fn client_provided(&self) -> bool {
        self.client_provided
    }

    pub fn listeners(&self) -> &PacketListenerRegistry {
        &self.listeners
    }

    pub fn queries(&self) -> &QueryManager {
        &self.queries
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ChannelHandler> {
        &self.handler
    }

    /// Enqueue a packet for transmission.
    pub fn send(&self, packet: Packet) -> Result<(), NetError> {
        self.send_guarded(packet, None)
    }

    pub(crate) fn send_guarded(
        &self,
        packet: Packet,
        guard: Option<Arc<OwnedSemaphorePermit>>,
    ) -> Result<(), NetError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetError::ChannelClosed);
        }
        self.outbound
            .send(WriteEvent::Packet { packet, guard })
            .map_err(|_| NetError::ChannelClosed)
    }

    /// Send a packet expecting exactly one correlated response.
    pub fn send_query(self: &Arc<Self>, packet: Packet) -> Result<QueryResponse, NetError> {
        self.queries.send_query(self, packet)
    }

    /// Stop the connection. Safe to call any number of times; the writer
    /// shuts down once and the close hook fires when the read loop exits.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outbound.send(WriteEvent::Shutdown);
            let _ = self.close_signal.send(true);
        }
    }

    /// Receiver that observes the close transition; used by the read task to
    /// exit promptly when the local side initiates the close.
    pub(crate) fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_signal.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("client_provided", &self.client_provided)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
