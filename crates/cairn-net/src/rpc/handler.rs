//! Server-side RPC dispatch.
//!
//! Handlers are built once at init time: every exposed method registers a
//! typed async invoker closure keyed by name + descriptor, so dispatch is a
//! table lookup with no runtime introspection. The bound instance, when there
//! is one, is whatever the closures capture.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;

use cairn_core::{wire, Packet};

use crate::channel::Channel;
use crate::error::NetError;
use crate::listener::PacketListener;
use crate::object::ObjectMapper;
use crate::rpc::{STATUS_BAD_REQUEST, STATUS_EXECUTION_ERROR, STATUS_OK};

/// Upper bound on calls per packet; anything above this is a malformed or
/// hostile request, not a legitimate chain.
pub const MAX_CALLS_PER_PACKET: i32 = 16;

/// How a server-side invocation can fail.
///
/// `Execution` travels back to the caller as a remote execution error and is
/// re-raised there; `BadRequest` marks requests the dispatch layer itself
/// refused (unknown target, unknown method, undecodable arguments).
#[derive(Debug)]
pub enum RpcFailure {
    Execution(String),
    BadRequest(String),
}

impl RpcFailure {
    pub fn execution(message: impl std::fmt::Display) -> Self {
        Self::Execution(message.to_string())
    }

    pub fn bad_request(message: impl std::fmt::Display) -> Self {
        Self::BadRequest(message.to_string())
    }
}

type Invoker = Box<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RpcFailure>> + Send + Sync>;

struct MethodEntry {
    arity: usize,
    invoker: Invoker,
}

/// Number of parameters a descriptor declares, e.g. `"()"` → 0,
/// `"(str,u32)"` → 2. Anything after the closing paren is ignored (return
/// type annotations are allowed but not interpreted).
pub fn descriptor_arity(descriptor: &str) -> Option<usize> {
    let open = descriptor.find('(')?;
    let close = descriptor[open..].find(')')? + open;
    let params = descriptor[open + 1..close].trim();
    if params.is_empty() {
        Some(0)
    } else {
        Some(params.split(',').count())
    }
}

/// Dispatch table for one RPC target.
pub struct RpcHandler {
    target: String,
    methods: HashMap<(String, String), MethodEntry>,
}

impl RpcHandler {
    pub fn builder(target: &str) -> RpcHandlerBuilder {
        RpcHandlerBuilder {
            target: target.to_string(),
            methods: HashMap::new(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn method(&self, name: &str, descriptor: &str) -> Option<&MethodEntry> {
        self.methods.get(&(name.to_string(), descriptor.to_string()))
    }
}

/// Builds the dispatch table. Registration is init-time configuration, so a
/// malformed descriptor fails loudly here instead of at call time.
pub struct RpcHandlerBuilder {
    target: String,
    methods: HashMap<(String, String), MethodEntry>,
}

impl RpcHandlerBuilder {
    pub fn method<F>(mut self, name: &str, descriptor: &str, invoker: F) -> Self
    where
        F: Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RpcFailure>> + Send + Sync + 'static,
    {
        let arity = descriptor_arity(descriptor)
            .unwrap_or_else(|| panic!("invalid method descriptor {descriptor:?} on {}", self.target));
        self.methods.insert(
            (name.to_string(), descriptor.to_string()),
            MethodEntry {
                arity,
                invoker: Box::new(invoker),
            },
        );
        self
    }

    pub fn build(self) -> Arc<RpcHandler> {
        Arc::new(RpcHandler {
            target: self.target,
            methods: self.methods,
        })
    }
}

/// Registry of handlers keyed by target name, last writer wins.
#[derive(Default)]
pub struct RpcHandlerRegistry {
    handlers: DashMap<String, Arc<RpcHandler>>,
}

impl RpcHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<RpcHandler>) {
        if self
            .handlers
            .insert(handler.target().to_string(), handler.clone())
            .is_some()
        {
            tracing::debug!(target = handler.target(), "rpc handler replaced");
        }
    }

    pub fn unregister(&self, target: &str) -> bool {
        self.handlers.remove(target).is_some()
    }

    pub fn handler(&self, target: &str) -> Option<Arc<RpcHandler>> {
        self.handlers.get(target).map(|entry| entry.value().clone())
    }
}

/// Decode and invoke every call in a request body, strictly in order.
/// A failing step aborts the remainder; the last completed value is the
/// chain's result.
pub(crate) async fn invoke_calls(
    registry: &RpcHandlerRegistry,
    mapper: &dyn ObjectMapper,
    body: Bytes,
) -> Result<Value, RpcFailure> {
    let mut body = body;
    let count = wire::read_var_i32(&mut body)
        .map_err(|e| RpcFailure::bad_request(format!("unreadable call count: {e}")))?;
    if !(1..=MAX_CALLS_PER_PACKET).contains(&count) {
        return Err(RpcFailure::bad_request(format!(
            "invalid call count {count}"
        )));
    }

    let mut last = Value::Null;
    for _ in 0..count {
        let target = wire::read_str(&mut body)
            .map_err(|e| RpcFailure::bad_request(format!("unreadable target: {e}")))?;
        let method = wire::read_str(&mut body)
            .map_err(|e| RpcFailure::bad_request(format!("unreadable method: {e}")))?;
        let descriptor = wire::read_str(&mut body)
            .map_err(|e| RpcFailure::bad_request(format!("unreadable descriptor: {e}")))?;

        let handler = registry.handler(&target).ok_or_else(|| {
            RpcFailure::bad_request(format!("no rpc handler bound for target {target:?}"))
        })?;
        let entry = handler.method(&method, &descriptor).ok_or_else(|| {
            RpcFailure::bad_request(format!(
                "target {target:?} has no method {method}{descriptor}"
            ))
        })?;

        let mut args = Vec::with_capacity(entry.arity);
        for position in 0..entry.arity {
            args.push(mapper.read_object(&mut body).map_err(|e| {
                RpcFailure::bad_request(format!(
                    "undecodable argument {position} for {target}.{method}: {e}"
                ))
            })?);
        }

        last = (entry.invoker)(args).await?;
    }
    Ok(last)
}

/// Listens on the RPC packet channel, invokes, and answers queries.
pub struct RpcRequestListener {
    registry: Arc<RpcHandlerRegistry>,
    mapper: Arc<dyn ObjectMapper>,
}

impl RpcRequestListener {
    pub fn new(registry: Arc<RpcHandlerRegistry>, mapper: Arc<dyn ObjectMapper>) -> Self {
        Self { registry, mapper }
    }

    async fn process(
        registry: Arc<RpcHandlerRegistry>,
        mapper: Arc<dyn ObjectMapper>,
        channel: Arc<Channel>,
        packet: Packet,
    ) -> Result<(), NetError> {
        let outcome = invoke_calls(&registry, mapper.as_ref(), packet.body.clone()).await;

        let unique_id = match packet.unique_id {
            Some(id) => id,
            None => {
                // fire-and-forget: nothing goes back, but a failure is still
                // worth an operator-visible trace
                if let Err(failure) = outcome {
                    tracing::warn!(
                        channel_id = channel.id(),
                        failure = ?failure,
                        "fire-and-forget rpc failed"
                    );
                }
                return Ok(());
            }
        };

        let mut out = BytesMut::new();
        match &outcome {
            Ok(value) => {
                out.extend_from_slice(&[STATUS_OK]);
                mapper.write_object(&mut out, value)?;
            }
            Err(RpcFailure::Execution(message)) => {
                out.extend_from_slice(&[STATUS_EXECUTION_ERROR]);
                wire::write_str(&mut out, message);
            }
            Err(RpcFailure::BadRequest(message)) => {
                out.extend_from_slice(&[STATUS_BAD_REQUEST]);
                wire::write_str(&mut out, message);
            }
        }
        channel.send(Packet::response(unique_id, out.freeze()))
    }
}

impl PacketListener for RpcRequestListener {
    fn handle(&self, channel: &Arc<Channel>, packet: Packet) -> anyhow::Result<()> {
        // invocation may await the target's own async work; never on the
        // read task
        let registry = self.registry.clone();
        let mapper = self.mapper.clone();
        let channel = channel.clone();
        tokio::spawn(async move {
            let channel_id = channel.id();
            if let Err(error) = Self::process(registry, mapper, channel, packet).await {
                tracing::warn!(channel_id, error = %error, "rpc response send failed");
            }
        });
        Ok(())
    }
}
