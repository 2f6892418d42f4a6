//! Chunked bulk transfer — one large payload as a sequence of bounded
//! packets tied to a session.
//!
//! Every chunk packet carries the full session information followed by the
//! chunk index and a final-chunk marker, so a receiver can service a session
//! it has never seen before. The final chunk's short payload is the
//! end-of-session marker; there is no separate terminator packet.

pub mod receiver;
pub mod sender;
pub mod splitter;

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use serde_json::Value;
use tokio::sync::OwnedSemaphorePermit;

use cairn_core::{wire, Packet};

use crate::error::NetError;

/// Outcome of a chunked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failure,
}

/// Identifies one transfer and tells the receiver how to service it.
///
/// `transfer_channel` is the registry tag that selects a handler on the
/// receiving side; `transfer_info` is an opaque metadata bag riding along
/// (target path, overwrite flag, whatever the application needs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSessionInfo {
    pub session_id: u128,
    pub chunk_size: u32,
    pub transfer_channel: String,
    pub transfer_info: Value,
}

impl ChunkSessionInfo {
    pub fn new(transfer_channel: impl Into<String>, chunk_size: u32, transfer_info: Value) -> Self {
        Self {
            session_id: rand::random(),
            chunk_size,
            transfer_channel: transfer_channel.into(),
            transfer_info,
        }
    }

    fn write(&self, out: &mut BytesMut) -> Result<(), NetError> {
        wire::write_u128(out, self.session_id);
        wire::write_var_i32(out, self.chunk_size as i32);
        wire::write_str(out, &self.transfer_channel);
        let info = serde_json::to_vec(&self.transfer_info)?;
        wire::write_block(out, &info);
        Ok(())
    }

    fn read(buf: &mut Bytes) -> Result<Self, NetError> {
        let session_id = wire::read_u128(buf)?;
        let chunk_size = wire::read_var_i32(buf)?;
        if chunk_size <= 0 {
            return Err(NetError::Malformed(format!(
                "invalid chunk size {chunk_size}"
            )));
        }
        let transfer_channel = wire::read_str(buf)?;
        let info = wire::read_block(buf)?;
        Ok(Self {
            session_id,
            chunk_size: chunk_size as u32,
            transfer_channel,
            transfer_info: serde_json::from_slice(&info)?,
        })
    }
}

/// A decoded chunk packet body.
#[derive(Debug)]
pub(crate) struct ChunkPart {
    pub info: ChunkSessionInfo,
    pub index: u32,
    pub is_final: bool,
    pub data: Bytes,
}

/// Build the packet body for a full (fixed-size) chunk.
pub(crate) fn encode_full_chunk(
    info: &ChunkSessionInfo,
    index: u32,
    data: &[u8],
) -> Result<Bytes, NetError> {
    let mut out = BytesMut::new();
    info.write(&mut out)?;
    wire::write_var_i32(&mut out, index as i32);
    wire::write_bool(&mut out, false);
    out.extend_from_slice(data);
    Ok(out.freeze())
}

/// Build the packet body for the final chunk, carrying the actual byte count.
pub(crate) fn encode_final_chunk(
    info: &ChunkSessionInfo,
    index: u32,
    data: &[u8],
) -> Result<Bytes, NetError> {
    let mut out = BytesMut::new();
    info.write(&mut out)?;
    wire::write_var_i32(&mut out, index as i32);
    wire::write_bool(&mut out, true);
    wire::write_block(&mut out, data);
    Ok(out.freeze())
}

pub(crate) fn decode_chunk(mut body: Bytes) -> Result<ChunkPart, NetError> {
    let info = ChunkSessionInfo::read(&mut body)?;
    let index = wire::read_var_i32(&mut body)?;
    if index < 0 {
        return Err(NetError::Malformed(format!("invalid chunk index {index}")));
    }
    let is_final = wire::read_bool(&mut body)?;

    let data = if is_final {
        let data = wire::read_block(&mut body)?;
        if data.len() > info.chunk_size as usize {
            return Err(NetError::Malformed(format!(
                "final chunk of {} bytes exceeds chunk size {}",
                data.len(),
                info.chunk_size
            )));
        }
        data
    } else {
        if body.remaining() != info.chunk_size as usize {
            return Err(NetError::Malformed(format!(
                "full chunk of {} bytes does not match chunk size {}",
                body.remaining(),
                info.chunk_size
            )));
        }
        body.split_to(body.remaining())
    };

    Ok(ChunkPart {
        info,
        index: index as u32,
        is_final,
        data,
    })
}

/// Where a sender hands finished chunk packets.
///
/// The optional guard is the transfer's flow-budget permit; implementations
/// pass it along so it releases only once the chunk's bytes are actually
/// written out.
pub trait PacketSink: Send + Sync {
    fn accept(&self, packet: Packet, guard: Option<Arc<OwnedSemaphorePermit>>)
        -> Result<(), NetError>;
}
