//! cairn-cluster — membership, liveness and state synchronization.
//!
//! The top of the stack: tracks which peers are alive via heartbeat snapshot
//! pushes and a two-stage soft/hard disconnect policy, arbitrates who
//! reconnects after a partition, resynchronizes cluster state on the
//! authorization handshake, and keeps exactly one ready node elected as head.

pub mod auth;
pub mod net;
pub mod node;
pub mod provider;
pub mod queued;
pub mod sync;
pub mod tasks;

pub use auth::{AuthListener, ClusterConnector};
pub use net::ClusterNetwork;
pub use node::{NodeServer, NodeServerState};
pub use provider::NodeServerProvider;
pub use queued::QueuedChannel;
pub use sync::{AuthRequest, AuthResponse, AuthScope, DataSyncHandler, DataSyncRegistry};
pub use tasks::ClusterTasks;
