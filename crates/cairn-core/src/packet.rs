//! The logical packet and its on-wire encoding.
//!
//! A packet is what flows over a channel once framing is stripped:
//!
//! ```text
//! varint channel | u8 prioritized | u8 has_unique_id
//!   | [16 bytes unique id, high u64 first] | varint body_len | body
//! ```
//!
//! The body is opaque here; interpretation belongs to whoever listens on the
//! packet's channel id. Responses to queries travel on [`RESPONSE_CHANNEL`]
//! and are matched purely by unique id.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::{self, WireError};

/// Channel id carried by query responses. Never dispatched to listeners; the
/// query manager consumes these packets by unique id.
pub const RESPONSE_CHANNEL: i32 = -1;

/// One logical packet. Immutable once built, except for the lazy unique-id
/// assignment a query send performs. The body is a reference-counted handle;
/// cloning a packet never copies payload bytes.
#[derive(Debug, Clone)]
pub struct Packet {
    pub channel: i32,
    pub prioritized: bool,
    pub unique_id: Option<u128>,
    pub body: Bytes,
}

impl Packet {
    pub fn new(channel: i32, body: impl Into<Bytes>) -> Self {
        Self {
            channel,
            prioritized: false,
            unique_id: None,
            body: body.into(),
        }
    }

    pub fn prioritized(channel: i32, body: impl Into<Bytes>) -> Self {
        Self {
            prioritized: true,
            ..Self::new(channel, body)
        }
    }

    /// Build the response to a query packet, carrying the same unique id.
    pub fn response(unique_id: u128, body: impl Into<Bytes>) -> Self {
        Self {
            channel: RESPONSE_CHANNEL,
            prioritized: false,
            unique_id: Some(unique_id),
            body: body.into(),
        }
    }

    /// Serialized size of this packet, header included.
    pub fn encoded_len(&self) -> usize {
        wire::var_i32_len(self.channel)
            + 2
            + if self.unique_id.is_some() { 16 } else { 0 }
            + wire::var_i32_len(self.body.len() as i32)
            + self.body.len()
    }
}

/// Encode a packet into `out`. The body bytes are copied to the wire here;
/// the packet's own handle drops with the packet.
pub fn encode_packet(out: &mut BytesMut, packet: &Packet) {
    out.reserve(packet.encoded_len());
    wire::write_var_i32(out, packet.channel);
    wire::write_bool(out, packet.prioritized);
    wire::write_bool(out, packet.unique_id.is_some());
    if let Some(id) = packet.unique_id {
        wire::write_u128(out, id);
    }
    wire::write_var_i32(out, packet.body.len() as i32);
    out.put_slice(&packet.body);
}

/// Decode one packet from a complete frame.
pub fn decode_packet(mut frame: Bytes) -> Result<Packet, WireError> {
    let channel = wire::read_var_i32(&mut frame)?;
    let prioritized = wire::read_bool(&mut frame)?;
    let unique_id = if wire::read_bool(&mut frame)? {
        Some(wire::read_u128(&mut frame)?)
    } else {
        None
    };
    let body = wire::read_block(&mut frame)?;
    if frame.has_remaining() {
        return Err(WireError::LengthOutOfRange(frame.remaining() as i32));
    }
    Ok(Packet {
        channel,
        prioritized,
        unique_id,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(packet: &Packet) -> Packet {
        let mut out = BytesMut::new();
        encode_packet(&mut out, packet);
        assert_eq!(out.len(), packet.encoded_len());
        decode_packet(out.freeze()).unwrap()
    }

    #[test]
    fn plain_packet_round_trip() {
        let packet = Packet::new(4, Bytes::from_static(b"snapshot"));
        let decoded = round_trip(&packet);
        assert_eq!(decoded.channel, 4);
        assert!(!decoded.prioritized);
        assert_eq!(decoded.unique_id, None);
        assert_eq!(decoded.body.as_ref(), b"snapshot");
    }

    #[test]
    fn query_packet_round_trip() {
        let mut packet = Packet::prioritized(2, Bytes::from_static(b"rpc"));
        packet.unique_id = Some(0xDEAD_BEEF_0000_0001_0000_0002_0000_0003);
        let decoded = round_trip(&packet);
        assert!(decoded.prioritized);
        assert_eq!(decoded.unique_id, packet.unique_id);
        assert_eq!(decoded.body.as_ref(), b"rpc");
    }

    #[test]
    fn response_channel_round_trips_negative() {
        let response = Packet::response(42, Bytes::from_static(b"ok"));
        let decoded = round_trip(&response);
        assert_eq!(decoded.channel, RESPONSE_CHANNEL);
        assert_eq!(decoded.unique_id, Some(42));
    }

    #[test]
    fn empty_body_is_legal() {
        let decoded = round_trip(&Packet::new(9, Bytes::new()));
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut out = BytesMut::new();
        encode_packet(&mut out, &Packet::new(1, Bytes::from_static(b"x")));
        out.put_u8(0xAB);
        assert!(decode_packet(out.freeze()).is_err());
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let mut out = BytesMut::new();
        encode_packet(
            &mut out,
            &Packet::new(1, Bytes::from_static(b"full body here")),
        );
        let frame = out.freeze();
        assert!(decode_packet(frame.slice(..frame.len() - 3)).is_err());
    }
}
