//! Error taxonomy for the network stack.

use cairn_core::wire::WireError;

/// Every failure a caller of the network stack can observe.
///
/// `ProtocolViolation` and `Malformed` are local recoverable conditions: the
/// offending frame or packet is dropped and the connection survives.
/// `Transport` closes the channel and feeds the cluster membership state
/// machine. `Timeout` and `Execution` are surfaced to the waiting caller and
/// never silently dropped.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("query timed out")]
    Timeout,

    #[error("remote execution failed: {0}")]
    Execution(String),

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("no chunk handler claimed transfer channel {0:?}")]
    SessionRejected(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("authorization rejected by peer")]
    Unauthorized,
}

impl From<WireError> for NetError {
    fn from(err: WireError) -> Self {
        NetError::Malformed(err.to_string())
    }
}

impl From<serde_json::Error> for NetError {
    fn from(err: serde_json::Error) -> Self {
        NetError::Malformed(err.to_string())
    }
}
