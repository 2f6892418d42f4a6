//! Cairn wire primitives — var-int framing and checked buffer access.
//!
//! Everything on a cairn connection is a length-delimited frame: a var-int
//! length followed by that many payload bytes. The length prepender knows
//! nothing about packet semantics; the packet layout itself lives in
//! [`crate::packet`]. Var-ints are the 1-5 byte LEB128 encoding of a 32-bit
//! value; a 5-byte var-int can decode to a negative `i32`, which a conforming
//! peer never sends.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Errors raised while interpreting wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer underflow: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("length field out of range: {0}")]
    LengthOutOfRange(i32),

    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}

// ── Var-int ───────────────────────────────────────────────────────────────────

/// Number of bytes `write_var_i32` will emit for the given value.
pub fn var_i32_len(value: i32) -> usize {
    let mut v = value as u32;
    let mut len = 1;
    while v & !0x7F != 0 {
        v >>= 7;
        len += 1;
    }
    len
}

/// Append a var-int encoded 32-bit value.
pub fn write_var_i32(buf: &mut BytesMut, value: i32) {
    let mut v = value as u32;
    loop {
        if v & !0x7F == 0 {
            buf.put_u8(v as u8);
            return;
        }
        buf.put_u8((v as u8 & 0x7F) | 0x80);
        v >>= 7;
    }
}

/// Decode a var-int from the start of `buf` without consuming it.
/// Returns the value and the number of bytes it occupies, or `None` when the
/// encoding is still incomplete. At most 5 bytes are ever examined.
pub fn peek_var_i32(buf: &[u8]) -> Option<(i32, usize)> {
    let mut value: u32 = 0;
    for (i, &byte) in buf.iter().take(5).enumerate() {
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 || i == 4 {
            return Some((value as i32, i + 1));
        }
    }
    None
}

/// Consume a var-int from `buf`.
pub fn read_var_i32(buf: &mut Bytes) -> Result<i32, WireError> {
    match peek_var_i32(buf.as_ref()) {
        Some((value, consumed)) => {
            buf.advance(consumed);
            Ok(value)
        }
        None => Err(WireError::Truncated {
            needed: 1,
            available: buf.remaining(),
        }),
    }
}

// ── Checked reads / writes ────────────────────────────────────────────────────

fn ensure(buf: &Bytes, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        Err(WireError::Truncated {
            needed: needed - buf.remaining(),
            available: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

pub fn read_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_bool(buf: &mut Bytes) -> Result<bool, WireError> {
    Ok(read_u8(buf)? != 0)
}

pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

/// A 128-bit id travels as two big-endian 64-bit halves, high half first.
pub fn read_u128(buf: &mut Bytes) -> Result<u128, WireError> {
    ensure(buf, 16)?;
    let high = buf.get_u64();
    let low = buf.get_u64();
    Ok(((high as u128) << 64) | low as u128)
}

pub fn write_u128(buf: &mut BytesMut, value: u128) {
    buf.put_u64((value >> 64) as u64);
    buf.put_u64(value as u64);
}

/// Read a var-int length-prefixed byte block as a zero-copy slice.
pub fn read_block(buf: &mut Bytes) -> Result<Bytes, WireError> {
    let len = read_var_i32(buf)?;
    if len < 0 {
        return Err(WireError::LengthOutOfRange(len));
    }
    let len = len as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

pub fn write_block(buf: &mut BytesMut, data: &[u8]) {
    write_var_i32(buf, data.len() as i32);
    buf.put_slice(data);
}

pub fn read_str(buf: &mut Bytes) -> Result<String, WireError> {
    let block = read_block(buf)?;
    String::from_utf8(block.to_vec()).map_err(|_| WireError::InvalidUtf8)
}

pub fn write_str(buf: &mut BytesMut, value: &str) {
    write_block(buf, value.as_bytes());
}

// ── Frame codec ───────────────────────────────────────────────────────────────

/// Outcome of one [`FrameDecoder::decode`] step. The caller loops until
/// `Incomplete` and decides how to log the degenerate cases.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameProgress {
    /// One complete frame was consumed from the buffer.
    Frame(Bytes),
    /// Not enough buffered bytes; read more from the stream.
    Incomplete,
    /// A zero-length frame was announced; the length field was skipped.
    EmptyFrame,
    /// The announced length was invalid. Exactly one byte was skipped so the
    /// stream can eventually resynchronize instead of desyncing permanently.
    Resync { announced: i32 },
}

/// Splits a raw byte stream into length-delimited frames.
///
/// Stateless by construction: all progress lives in the caller's buffer, so a
/// partial frame simply stays buffered until more bytes arrive.
#[derive(Debug, Default)]
pub struct FrameDecoder;

impl FrameDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> FrameProgress {
        let (length, header_len) = match peek_var_i32(buf.as_ref()) {
            Some(decoded) => decoded,
            None => return FrameProgress::Incomplete,
        };

        if length == 0 {
            // an empty frame is a protocol violation, but not worth the
            // connection: drop the length field and carry on
            buf.advance(header_len);
            return FrameProgress::EmptyFrame;
        }
        if length < 0 {
            buf.advance(1);
            return FrameProgress::Resync { announced: length };
        }

        let length = length as usize;
        if buf.len() < header_len + length {
            return FrameProgress::Incomplete;
        }

        buf.advance(header_len);
        FrameProgress::Frame(buf.split_to(length).freeze())
    }
}

/// Prefix `payload` with its var-int length and append both to `out`.
/// The generic length prepender: no packet knowledge beyond byte count.
pub fn write_frame(out: &mut BytesMut, payload: &[u8]) -> Result<(), WireError> {
    if payload.is_empty() {
        // an encoder bug upstream; refuse rather than emit a zero-length frame
        return Err(WireError::LengthOutOfRange(0));
    }
    write_var_i32(out, payload.len() as i32);
    out.put_slice(payload);
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
