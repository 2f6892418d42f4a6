//! The sending half of a chunked transfer.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Semaphore;

use cairn_core::Packet;

use crate::channels;
use crate::error::NetError;

use super::{encode_final_chunk, encode_full_chunk, ChunkSessionInfo, PacketSink, TransferStatus};

/// Streams a source into bounded chunk packets for one session.
///
/// Reads `chunk_size` bytes at a time. A full read costs one unit of the
/// session's flow budget, which is repaid only when the chunk's bytes reach a
/// socket — a slow consumer therefore stalls production here instead of
/// growing an unbounded backlog. The first short read (including zero bytes)
/// produces the single final chunk and ends the session.
pub struct ChunkedPacketSender<S> {
    session: ChunkSessionInfo,
    source: S,
    sink: Arc<dyn PacketSink>,
    budget: Arc<Semaphore>,
}

impl<S: AsyncRead + Unpin + Send> ChunkedPacketSender<S> {
    pub fn new(
        session: ChunkSessionInfo,
        source: S,
        sink: Arc<dyn PacketSink>,
        budget: u32,
    ) -> Self {
        Self {
            session,
            source,
            sink,
            budget: Arc::new(Semaphore::new(budget.max(1) as usize)),
        }
    }

    pub fn session(&self) -> &ChunkSessionInfo {
        &self.session
    }

    /// Run the transfer to completion. The source is consumed and dropped
    /// when the final chunk has been handed to the sink.
    pub async fn transfer(mut self) -> Result<TransferStatus, NetError> {
        let chunk_size = self.session.chunk_size as usize;
        let mut chunk = vec![0u8; chunk_size];
        let mut index: u32 = 0;

        loop {
            let filled = read_up_to(&mut self.source, &mut chunk).await?;
            if filled == chunk_size {
                let permit = self
                    .budget
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| NetError::ChannelClosed)?;
                let body = encode_full_chunk(&self.session, index, &chunk)?;
                self.sink
                    .accept(Packet::new(channels::CHUNK, body), Some(Arc::new(permit)))?;
                index += 1;
            } else {
                let body = encode_final_chunk(&self.session, index, &chunk[..filled])?;
                self.sink.accept(Packet::new(channels::CHUNK, body), None)?;
                tracing::debug!(
                    session_id = %hex::encode(self.session.session_id.to_be_bytes()),
                    chunks = index + 1,
                    "chunked transfer complete"
                );
                return Ok(TransferStatus::Success);
            }
        }
    }
}

/// Fill `buf` from the reader, stopping early only at end of stream.
async fn read_up_to<S: AsyncRead + Unpin>(source: &mut S, buf: &mut [u8]) -> Result<usize, NetError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
