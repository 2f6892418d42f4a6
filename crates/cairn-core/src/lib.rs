//! cairn-core — wire format, packet model, identities and configuration.
//!
//! Pure types, no I/O. The transport and protocol layers live in cairn-net;
//! cluster semantics live in cairn-cluster.

pub mod config;
pub mod packet;
pub mod snapshot;
pub mod wire;

pub use packet::{Packet, RESPONSE_CHANNEL};
