//! RPC — typed remote calls encoded as packets.
//!
//! A call names a target, a method and a descriptor (the overload
//! disambiguator), and carries mapper-encoded arguments. Fired as a query it
//! yields exactly one decoded result; fired with the result dropped it is a
//! plain packet and nothing is awaited. `join` batches calls into a chain:
//! one packet, sequential server-side invocation, the last call's result in
//! the response.

pub mod handler;

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use cairn_core::{wire, Packet};

use crate::channel::Channel;
use crate::channels;
use crate::error::NetError;
use crate::object::{self, ObjectMapper};

pub(crate) const STATUS_OK: u8 = 0;
pub(crate) const STATUS_EXECUTION_ERROR: u8 = 1;
pub(crate) const STATUS_BAD_REQUEST: u8 = 2;

/// Builds RPC call objects bound to one object mapper.
///
/// Explicitly constructed and passed by reference; there is no process-wide
/// default factory.
#[derive(Clone)]
pub struct RpcFactory {
    mapper: Arc<dyn ObjectMapper>,
}

impl RpcFactory {
    pub fn new(mapper: Arc<dyn ObjectMapper>) -> Self {
        Self { mapper }
    }

    pub fn mapper(&self) -> &Arc<dyn ObjectMapper> {
        &self.mapper
    }

    /// Start a call against `target.method` with the given descriptor.
    pub fn call(&self, target: &str, method: &str, descriptor: &str) -> Rpc {
        Rpc {
            mapper: self.mapper.clone(),
            target: target.to_string(),
            method: method.to_string(),
            descriptor: descriptor.to_string(),
            args: Vec::new(),
            timeout: None,
            drop_result: false,
        }
    }
}

/// One remote call, built fluently and fired at most once.
#[derive(Clone)]
pub struct Rpc {
    mapper: Arc<dyn ObjectMapper>,
    target: String,
    method: String,
    descriptor: String,
    args: Vec<Value>,
    timeout: Option<Duration>,
    drop_result: bool,
}

impl Rpc {
    /// Append an argument, encoded through the mapper's representation.
    pub fn arg<T: Serialize>(mut self, value: &T) -> Result<Self, NetError> {
        self.args.push(object::to_value(value)?);
        Ok(self)
    }

    /// Deadline for the caller's await. The pending query entry is not
    /// affected and still expires on its own TTL schedule if never claimed.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fire-and-forget mode: no query, no round trip.
    pub fn drop_result(mut self) -> Self {
        self.drop_result = true;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn result_dropped(&self) -> bool {
        self.drop_result
    }

    /// Chain this call with another into one packet.
    pub fn join(self, next: Rpc) -> RpcChain {
        let mapper = self.mapper.clone();
        RpcChain {
            mapper,
            calls: vec![self, next],
            timeout: None,
            drop_result: false,
        }
    }

    /// Fire and await the decoded result.
    pub async fn fire<R: DeserializeOwned>(&self, channel: &Arc<Channel>) -> Result<R, NetError> {
        fire_calls(
            channel,
            self.mapper.as_ref(),
            std::slice::from_ref(self),
            self.timeout,
            self.drop_result,
        )
        .await
    }

    /// Fire and wait for completion. Identical semantics to [`Rpc::fire`]:
    /// a remote handler failure surfaces as `Execution`, everything else is
    /// already typed by the transport.
    pub async fn fire_sync<R: DeserializeOwned>(
        &self,
        channel: &Arc<Channel>,
    ) -> Result<R, NetError> {
        self.fire(channel).await
    }

    /// Send as a plain packet and return immediately.
    pub fn fire_and_forget(&self, channel: &Arc<Channel>) -> Result<(), NetError> {
        let body = encode_calls(self.mapper.as_ref(), std::slice::from_ref(self))?;
        channel.send(Packet::new(channels::RPC, body))
    }
}

/// An ordered batch of calls transmitted as one packet.
pub struct RpcChain {
    mapper: Arc<dyn ObjectMapper>,
    calls: Vec<Rpc>,
    timeout: Option<Duration>,
    drop_result: bool,
}

impl RpcChain {
    /// Append another call to the chain.
    pub fn join(mut self, next: Rpc) -> Self {
        self.calls.push(next);
        self
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn drop_result(mut self) -> Self {
        self.drop_result = true;
        self
    }

    /// Fire the whole chain; the result is the final call's result.
    pub async fn fire<R: DeserializeOwned>(&self, channel: &Arc<Channel>) -> Result<R, NetError> {
        fire_calls(
            channel,
            self.mapper.as_ref(),
            &self.calls,
            self.timeout,
            self.drop_result,
        )
        .await
    }

    pub async fn fire_sync<R: DeserializeOwned>(
        &self,
        channel: &Arc<Channel>,
    ) -> Result<R, NetError> {
        self.fire(channel).await
    }

    pub fn fire_and_forget(&self, channel: &Arc<Channel>) -> Result<(), NetError> {
        let body = encode_calls(self.mapper.as_ref(), &self.calls)?;
        channel.send(Packet::new(channels::RPC, body))
    }
}

pub(crate) fn encode_calls(
    mapper: &dyn ObjectMapper,
    calls: &[Rpc],
) -> Result<bytes::Bytes, NetError> {
    let mut out = BytesMut::new();
    wire::write_var_i32(&mut out, calls.len() as i32);
    for call in calls {
        let declared = handler::descriptor_arity(&call.descriptor).ok_or_else(|| {
            NetError::Malformed(format!("invalid method descriptor {:?}", call.descriptor))
        })?;
        if declared != call.args.len() {
            return Err(NetError::Malformed(format!(
                "{}.{}{} takes {declared} arguments, {} provided",
                call.target,
                call.method,
                call.descriptor,
                call.args.len()
            )));
        }
        wire::write_str(&mut out, &call.target);
        wire::write_str(&mut out, &call.method);
        wire::write_str(&mut out, &call.descriptor);
        for arg in &call.args {
            mapper.write_object(&mut out, arg)?;
        }
    }
    Ok(out.freeze())
}

async fn fire_calls<R: DeserializeOwned>(
    channel: &Arc<Channel>,
    mapper: &dyn ObjectMapper,
    calls: &[Rpc],
    timeout: Option<Duration>,
    drop_result: bool,
) -> Result<R, NetError> {
    let body = encode_calls(mapper, calls)?;
    let packet = Packet::new(channels::RPC, body);

    if drop_result {
        // no round trip: send plain and hand back an already-empty result
        channel.send(packet)?;
        return object::from_value(Value::Null);
    }

    let response = channel.send_query(packet)?;
    let reply = match timeout {
        Some(deadline) => tokio::time::timeout(deadline, response.wait())
            .await
            .map_err(|_| NetError::Timeout)??,
        None => response.wait().await?,
    };
    decode_result(mapper, reply)
}

fn decode_result<R: DeserializeOwned>(
    mapper: &dyn ObjectMapper,
    packet: Packet,
) -> Result<R, NetError> {
    let mut body = packet.body;
    if !body.has_remaining() {
        return Err(NetError::Malformed("empty rpc response".into()));
    }
    match wire::read_u8(&mut body)? {
        STATUS_OK => {
            let value = mapper.read_object(&mut body)?;
            object::from_value(value)
        }
        STATUS_EXECUTION_ERROR => Err(NetError::Execution(wire::read_str(&mut body)?)),
        STATUS_BAD_REQUEST => Err(NetError::Malformed(wire::read_str(&mut body)?)),
        status => Err(NetError::Malformed(format!(
            "unknown rpc response status {status}"
        ))),
    }
}
