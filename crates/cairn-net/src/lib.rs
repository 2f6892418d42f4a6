//! cairn-net — channels, queries, RPC and chunked transfer over TCP.
//!
//! Layering, leaves first: the frame codec (cairn-core) underlies every
//! channel; the query manager correlates request/response pairs; RPC and
//! chunked transfer both build on channel + query and are independent of one
//! another. Cluster semantics sit on top, in cairn-cluster.

pub mod channel;
pub mod chunk;
pub mod error;
pub mod listener;
pub mod object;
pub mod query;
pub mod rpc;
pub mod transport;

/// Well-known packet channel ids.
///
/// Responses to queries travel on `cairn_core::RESPONSE_CHANNEL` and never
/// reach listeners.
pub mod channels {
    /// Authorization handshake; the only channel open before a connection
    /// authorizes.
    pub const AUTH: i32 = 1;
    /// RPC requests.
    pub const RPC: i32 = 2;
    /// Chunked transfer parts.
    pub const CHUNK: i32 = 3;
    /// Cluster node snapshot pushes.
    pub const NODE_SYNC: i32 = 4;
}

pub use channel::{Channel, ChannelHandler};
pub use error::NetError;
pub use listener::{PacketListener, PacketListenerRegistry};
pub use object::{JsonObjectMapper, ObjectMapper};
pub use query::{QueryManager, QueryResponse};
pub use transport::{NetworkClient, NetworkServer};
