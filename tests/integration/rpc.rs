//! Remote calls over a real connection: invocation, chaining, failure
//! propagation and the two timeout paths.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use serde_json::json;

use cairn_core::Packet;
use cairn_net::rpc::handler::{RpcFailure, RpcHandler};
use cairn_net::NetError;

use crate::{spawn_node, spawn_node_with, wait_for, CLUSTER_KEY};

/// A small target exposed by the serving node: arithmetic, a deliberate
/// failure, a slow call and a fire-and-forget recorder.
fn register_calculator(node: &crate::TestNode, recorded: Arc<Mutex<Vec<i64>>>) {
    let handler = RpcHandler::builder("Calculator")
        .method("add", "(i64,i64)", |args| {
            async move {
                let a = args[0]
                    .as_i64()
                    .ok_or_else(|| RpcFailure::bad_request("argument 0 is not an integer"))?;
                let b = args[1]
                    .as_i64()
                    .ok_or_else(|| RpcFailure::bad_request("argument 1 is not an integer"))?;
                Ok(json!(a + b))
            }
            .boxed()
        })
        .method("fail", "()", |_args| {
            async move { Err(RpcFailure::execution("deliberate failure")) }.boxed()
        })
        .method("slow", "()", |_args| {
            async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!("done"))
            }
            .boxed()
        })
        .method("record", "(i64)", move |args| {
            let recorded = recorded.clone();
            async move {
                let value = args[0]
                    .as_i64()
                    .ok_or_else(|| RpcFailure::bad_request("argument 0 is not an integer"))?;
                recorded.lock().unwrap().push(value);
                Ok(json!(null))
            }
            .boxed()
        })
        .build();
    node.network.rpc_handlers().register(handler);
}

#[tokio::test]
async fn single_call_round_trip() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;
    register_calculator(&b, Arc::new(Mutex::new(Vec::new())));
    a.join(&b).await?;

    let channel = a.channel_to("node-b").expect("live channel to b");
    let result: i64 = a
        .network
        .rpc_factory()
        .call("Calculator", "add", "(i64,i64)")
        .arg(&20)?
        .arg(&22)?
        .fire(&channel)
        .await?;
    assert_eq!(result, 42);
    Ok(())
}

#[tokio::test]
async fn remote_failure_surfaces_as_execution_error() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;
    register_calculator(&b, Arc::new(Mutex::new(Vec::new())));
    a.join(&b).await?;

    let channel = a.channel_to("node-b").expect("live channel to b");
    let outcome = a
        .network
        .rpc_factory()
        .call("Calculator", "fail", "()")
        .fire::<serde_json::Value>(&channel)
        .await;
    match outcome {
        Err(NetError::Execution(message)) => assert_eq!(message, "deliberate failure"),
        other => panic!("expected execution error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn unknown_target_is_rejected_not_executed() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;
    a.join(&b).await?;

    let channel = a.channel_to("node-b").expect("live channel to b");
    let outcome = a
        .network
        .rpc_factory()
        .call("Nowhere", "anything", "()")
        .fire::<serde_json::Value>(&channel)
        .await;
    assert!(matches!(outcome, Err(NetError::Malformed(_))));
    Ok(())
}

#[tokio::test]
async fn chain_runs_sequentially_and_returns_the_last_result() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;
    let recorded = Arc::new(Mutex::new(Vec::new()));
    register_calculator(&b, recorded.clone());
    a.join(&b).await?;

    let channel = a.channel_to("node-b").expect("live channel to b");
    let factory = a.network.rpc_factory();
    let result: i64 = factory
        .call("Calculator", "record", "(i64)")
        .arg(&7)?
        .join(factory.call("Calculator", "add", "(i64,i64)").arg(&40)?.arg(&2)?)
        .fire(&channel)
        .await?;

    // one round trip carried both calls; the first ran before the second
    assert_eq!(result, 42);
    assert_eq!(recorded.lock().unwrap().as_slice(), &[7]);
    Ok(())
}

#[tokio::test]
async fn fire_and_forget_invokes_without_a_response() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;
    let recorded = Arc::new(Mutex::new(Vec::new()));
    register_calculator(&b, recorded.clone());
    a.join(&b).await?;

    let channel = a.channel_to("node-b").expect("live channel to b");
    a.network
        .rpc_factory()
        .call("Calculator", "record", "(i64)")
        .arg(&9)?
        .fire_and_forget(&channel)?;

    let observed = recorded.clone();
    wait_for("fire-and-forget call to land", Duration::from_secs(2), move || {
        observed.lock().unwrap().as_slice() == [9]
    })
    .await
}

#[tokio::test]
async fn caller_timeout_fails_only_the_await() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;
    register_calculator(&b, Arc::new(Mutex::new(Vec::new())));
    a.join(&b).await?;

    let channel = a.channel_to("node-b").expect("live channel to b");
    let factory = a.network.rpc_factory();

    let outcome = factory
        .call("Calculator", "slow", "()")
        .timeout(Duration::from_millis(50))
        .fire::<String>(&channel)
        .await;
    assert!(matches!(outcome, Err(NetError::Timeout)));

    // the connection is unaffected; the next call completes normally
    let result: i64 = factory
        .call("Calculator", "add", "(i64,i64)")
        .arg(&1)?
        .arg(&2)?
        .fire(&channel)
        .await?;
    assert_eq!(result, 3);
    Ok(())
}

#[tokio::test]
async fn unanswered_query_times_out_via_ttl() -> Result<()> {
    let a = spawn_node_with("node-a", 100, CLUSTER_KEY, Duration::from_secs(1)).await?;
    let b = spawn_node_with("node-b", 200, CLUSTER_KEY, Duration::from_secs(1)).await?;
    a.join(&b).await?;

    // nothing listens on this packet channel, so the query can only expire
    let channel = a.channel_to("node-b").expect("live channel to b");
    let response = channel.send_query(Packet::new(77, bytes::Bytes::from_static(b"void")))?;
    let outcome = response.wait().await;
    assert!(matches!(outcome, Err(NetError::Timeout)));
    Ok(())
}
