//! TCP transport — accept/dial, and the per-connection read/write tasks.
//!
//! Every connection runs two tasks: a writer draining the channel's outbound
//! queue (packet encode + frame prepend), and a reader feeding the frame
//! decoder and dispatching packets. Dispatch order on the read task: query
//! completion first, then the channel handler's receive hook, then the
//! listener registry. The close hook fires exactly once, when the read task
//! exits.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use cairn_core::packet::{decode_packet, encode_packet};
use cairn_core::wire::{write_frame, FrameDecoder, FrameProgress};
use cairn_core::Packet;

use crate::channel::{Channel, ChannelHandler, WriteEvent};
use crate::error::NetError;

/// Pending-query sweeps never wait longer than this, even with an 8h TTL,
/// so short TTLs used in tests still expire promptly.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

type TeardownHook = Box<dyn FnOnce(&Arc<Channel>) + Send>;

/// Accepts inbound connections and tracks their channels.
pub struct NetworkServer {
    handler: Arc<dyn ChannelHandler>,
    query_ttl: Duration,
    channels: Arc<DashMap<u64, Arc<Channel>>>,
    shutdown: broadcast::Sender<()>,
}

impl NetworkServer {
    pub fn new(handler: Arc<dyn ChannelHandler>, query_ttl: Duration) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            handler,
            query_ttl,
            channels: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Bind a listener and start accepting. Returns the bound address, so
    /// port 0 can be used to let the OS choose.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, NetError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let handler = self.handler.clone();
        let query_ttl = self.query_ttl;
        let channels = self.channels.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        tracing::info!(addr = %local, "listener shutting down");
                        return;
                    }
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(accepted) => accepted,
                            Err(error) => {
                                tracing::warn!(addr = %local, error = %error, "accept failed");
                                continue;
                            }
                        };
                        tracing::debug!(addr = %local, %peer, "inbound connection");
                        let table = channels.clone();
                        let teardown: TeardownHook = Box::new(move |channel: &Arc<Channel>| {
                            table.remove(&channel.id());
                        });
                        match spawn_connection(stream, false, handler.clone(), query_ttl, Some(teardown)) {
                            Ok(channel) => {
                                channels.insert(channel.id(), channel);
                            }
                            Err(error) => {
                                tracing::warn!(%peer, error = %error, "inbound connection rejected");
                            }
                        }
                    }
                }
            }
        });

        Ok(local)
    }

    /// Channels currently alive on this server.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().map(|e| e.value().clone()).collect()
    }

    /// Stop accepting and close every live channel.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        for entry in self.channels.iter() {
            entry.value().close();
        }
    }
}

/// Dials outbound connections.
pub struct NetworkClient {
    handler: Arc<dyn ChannelHandler>,
    query_ttl: Duration,
}

impl NetworkClient {
    pub fn new(handler: Arc<dyn ChannelHandler>, query_ttl: Duration) -> Self {
        Self { handler, query_ttl }
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<Arc<Channel>, NetError> {
        let stream = TcpStream::connect(addr).await?;
        spawn_connection(stream, true, self.handler.clone(), self.query_ttl, None)
    }
}

fn spawn_connection(
    stream: TcpStream,
    client_provided: bool,
    handler: Arc<dyn ChannelHandler>,
    query_ttl: Duration,
    on_teardown: Option<TeardownHook>,
) -> Result<Arc<Channel>, NetError> {
    stream.set_nodelay(true)?;
    let local_addr = stream.local_addr()?;
    let remote_addr = stream.peer_addr()?;

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let channel = Channel::new(
        local_addr,
        remote_addr,
        client_provided,
        event_tx,
        query_ttl,
        handler.clone(),
    );

    if let Err(error) = handler.handle_init(&channel) {
        tracing::warn!(
            channel_id = channel.id(),
            error = %error,
            "channel init hook failed, dropping connection"
        );
        channel.close();
        return Err(NetError::ChannelClosed);
    }

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(write_loop(write_half, event_rx, channel.clone()));
    tokio::spawn(read_loop(read_half, channel.clone(), on_teardown));
    Ok(channel)
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut events: mpsc::UnboundedReceiver<WriteEvent>,
    channel: Arc<Channel>,
) {
    let mut packet_buf = BytesMut::new();
    let mut frame_buf = BytesMut::new();

    while let Some(event) = events.recv().await {
        let (packet, guard) = match event {
            WriteEvent::Shutdown => break,
            WriteEvent::Packet { packet, guard } => (packet, guard),
        };

        packet_buf.clear();
        encode_packet(&mut packet_buf, &packet);
        frame_buf.clear();
        if let Err(error) = write_frame(&mut frame_buf, &packet_buf) {
            tracing::error!(
                channel_id = channel.id(),
                error = %error,
                "refusing to write degenerate frame"
            );
            continue;
        }

        let written = writer.write_all(&frame_buf).await;
        // the budget permit is held until the bytes actually hit the socket
        drop(guard);
        if let Err(error) = written {
            tracing::debug!(
                channel_id = channel.id(),
                error = %error,
                "write failed, closing channel"
            );
            channel.close();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: OwnedReadHalf, channel: Arc<Channel>, on_teardown: Option<TeardownHook>) {
    let mut sweep = tokio::time::interval(channel.queries().ttl().min(MAX_SWEEP_INTERVAL));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut closed = channel.close_signal();
    let mut decoder = FrameDecoder::new();
    let mut buf = BytesMut::with_capacity(16 * 1024);

    if !channel.is_closed() {
        loop {
            tokio::select! {
                _ = closed.changed() => break,
                _ = sweep.tick() => {
                    let evicted = channel.queries().sweep();
                    if evicted > 0 {
                        tracing::debug!(channel_id = channel.id(), evicted, "evicted expired queries");
                    }
                }
                read = reader.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(_) => {
                            if !drain_frames(&mut decoder, &mut buf, &channel) {
                                break;
                            }
                        }
                        Err(error) => {
                            tracing::debug!(
                                channel_id = channel.id(),
                                error = %error,
                                "read failed"
                            );
                            break;
                        }
                    }
                }
            }
        }
    }

    let cancelled = channel.queries().cancel_all();
    if cancelled > 0 {
        tracing::debug!(
            channel_id = channel.id(),
            cancelled,
            "cancelled pending queries on teardown"
        );
    }
    channel.close();
    channel.handler().handle_close(&channel);
    if let Some(hook) = on_teardown {
        hook(&channel);
    }
    tracing::debug!(
        channel_id = channel.id(),
        remote = %channel.remote_addr(),
        "channel closed"
    );
}

/// Decode and dispatch every complete frame in the buffer.
/// Returns false when the channel closed underneath us.
fn drain_frames(decoder: &mut FrameDecoder, buf: &mut BytesMut, channel: &Arc<Channel>) -> bool {
    loop {
        match decoder.decode(buf) {
            FrameProgress::Incomplete => return !channel.is_closed(),
            FrameProgress::EmptyFrame => {
                tracing::error!(channel_id = channel.id(), "skipped inbound frame with length 0");
            }
            FrameProgress::Resync { announced } => {
                tracing::error!(
                    channel_id = channel.id(),
                    announced,
                    "inbound frame had invalid length, skipping one byte to resynchronize"
                );
            }
            FrameProgress::Frame(frame) => {
                match decode_packet(frame) {
                    Ok(packet) => dispatch_packet(channel, packet),
                    Err(error) => {
                        tracing::error!(
                            channel_id = channel.id(),
                            error = %error,
                            "dropping malformed packet"
                        );
                    }
                }
            }
        }
    }
}

fn dispatch_packet(channel: &Arc<Channel>, packet: Packet) {
    // a response to one of our queries never reaches listeners
    if packet.unique_id.is_some() && channel.queries().complete(packet.clone()) {
        return;
    }

    match channel.handler().handle_packet(channel, &packet) {
        Ok(true) => {}
        Ok(false) => return,
        Err(error) => {
            tracing::warn!(
                channel_id = channel.id(),
                error = %error,
                "receive hook failed, dropping packet"
            );
            return;
        }
    }

    let packet_channel = packet.channel;
    if !channel.listeners().dispatch(channel, packet) {
        tracing::debug!(
            channel_id = channel.id(),
            packet_channel,
            "no listener registered for packet channel"
        );
    }
}
