//! The object mapper seam — how RPC arguments and results hit the wire.
//!
//! The protocol treats argument bytes as opaque; the mapper decides their
//! encoding. The default writes each value as a length-prefixed JSON block,
//! which keeps the wire self-delimiting without the mapper knowing anything
//! about packet layout.

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use cairn_core::wire;

use crate::error::NetError;

/// Writes and reads one value at the current buffer position.
pub trait ObjectMapper: Send + Sync {
    fn write_object(&self, buf: &mut BytesMut, value: &Value) -> Result<(), NetError>;
    fn read_object(&self, buf: &mut Bytes) -> Result<Value, NetError>;
}

/// Length-prefixed JSON, the default encoding.
#[derive(Debug, Default)]
pub struct JsonObjectMapper;

impl ObjectMapper for JsonObjectMapper {
    fn write_object(&self, buf: &mut BytesMut, value: &Value) -> Result<(), NetError> {
        let encoded = serde_json::to_vec(value)?;
        wire::write_block(buf, &encoded);
        Ok(())
    }

    fn read_object(&self, buf: &mut Bytes) -> Result<Value, NetError> {
        let block = wire::read_block(buf)?;
        Ok(serde_json::from_slice(&block)?)
    }
}

/// Convert a typed value into the mapper's intermediate representation.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value, NetError> {
    Ok(serde_json::to_value(value)?)
}

/// Convert the mapper's intermediate representation into a typed value.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, NetError> {
    Ok(serde_json::from_value(value)?)
}
