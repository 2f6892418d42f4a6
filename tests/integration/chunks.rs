//! Chunked bulk transfer across a real connection: reconstruction around the
//! chunk-size boundaries, fan-out isolation, and rejection of unclaimed
//! sessions.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use cairn_net::chunk::sender::ChunkedPacketSender;
use cairn_net::chunk::splitter::{ChannelPacketSplitter, ChannelsPacketSplitter};
use cairn_net::chunk::{ChunkSessionInfo, TransferStatus};

use crate::{spawn_node, wait_for};

const CHUNK_SIZE: u32 = 16;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn reconstruction_is_byte_identical_around_chunk_boundaries() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;

    let results: Arc<Mutex<HashMap<usize, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
    let sink = results.clone();
    b.network.chunk_handlers().register_in_memory(
        "blob",
        Arc::new(move |info, data| {
            let len = info.transfer_info["len"].as_u64().unwrap() as usize;
            sink.lock().unwrap().insert(len, data);
            Ok(true)
        }),
    );

    a.join(&b).await?;
    let channel = a.channel_to("node-b").expect("live channel to b");

    let chunk = CHUNK_SIZE as usize;
    let sizes = [0, chunk - 1, chunk, chunk + 1, 10 * chunk];
    for &len in &sizes {
        let payload = pattern(len);
        let session = ChunkSessionInfo::new("blob", CHUNK_SIZE, json!({ "len": len }));
        let sender = ChunkedPacketSender::new(
            session,
            Cursor::new(payload),
            Arc::new(ChannelPacketSplitter::new(channel.clone())),
            4,
        );
        assert_eq!(sender.transfer().await?, TransferStatus::Success);
    }

    let received = results.clone();
    wait_for("all transfers to complete", Duration::from_secs(3), move || {
        received.lock().unwrap().len() == sizes.len()
    })
    .await?;

    let received = results.lock().unwrap();
    for &len in &sizes {
        assert_eq!(
            received.get(&len).map(Vec::as_slice),
            Some(pattern(len).as_slice()),
            "payload of {len} bytes must survive the transfer unmodified"
        );
    }
    Ok(())
}

#[tokio::test]
async fn fan_out_isolates_a_dead_destination() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;
    let c = spawn_node("node-c", 300).await?;

    let delivered: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let sink = delivered.clone();
    b.network.chunk_handlers().register_in_memory(
        "fanout",
        Arc::new(move |_info, data| {
            *sink.lock().unwrap() = Some(data);
            Ok(true)
        }),
    );

    a.join(&b).await?;
    a.join(&c).await?;
    let live = a.channel_to("node-b").expect("live channel to b");
    let dead = a.channel_to("node-c").expect("live channel to c");
    dead.close();

    // the dead destination is listed first so its failure would poison the
    // payload for the live one if isolation were broken
    let payload = pattern(100);
    let session = ChunkSessionInfo::new("fanout", CHUNK_SIZE, json!(null));
    let sender = ChunkedPacketSender::new(
        session,
        Cursor::new(payload.clone()),
        Arc::new(ChannelsPacketSplitter::new(vec![dead, live])),
        4,
    );
    assert_eq!(sender.transfer().await?, TransferStatus::Success);

    let received = delivered.clone();
    wait_for("live destination to receive", Duration::from_secs(3), move || {
        received.lock().unwrap().is_some()
    })
    .await?;
    assert_eq!(delivered.lock().unwrap().as_deref(), Some(payload.as_slice()));
    Ok(())
}

#[tokio::test]
async fn unclaimed_sessions_fail_fast_without_poisoning_the_connection() -> Result<()> {
    let a = spawn_node("node-a", 100).await?;
    let b = spawn_node("node-b", 200).await?;

    let delivered: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let sink = delivered.clone();
    b.network.chunk_handlers().register_in_memory(
        "claimed",
        Arc::new(move |_info, data| {
            *sink.lock().unwrap() = Some(data);
            Ok(true)
        }),
    );

    a.join(&b).await?;
    let channel = a.channel_to("node-b").expect("live channel to b");

    // nobody registered for this tag: the receiver rejects the session
    let rejected = ChunkedPacketSender::new(
        ChunkSessionInfo::new("nobody-home", CHUNK_SIZE, json!(null)),
        Cursor::new(pattern(40)),
        Arc::new(ChannelPacketSplitter::new(channel.clone())),
        4,
    );
    assert_eq!(rejected.transfer().await?, TransferStatus::Success);

    // the same connection still services claimed sessions afterwards
    let payload = pattern(40);
    let accepted = ChunkedPacketSender::new(
        ChunkSessionInfo::new("claimed", CHUNK_SIZE, json!(null)),
        Cursor::new(payload.clone()),
        Arc::new(ChannelPacketSplitter::new(channel)),
        4,
    );
    assert_eq!(accepted.transfer().await?, TransferStatus::Success);

    let received = delivered.clone();
    wait_for("claimed session to complete", Duration::from_secs(3), move || {
        received.lock().unwrap().is_some()
    })
    .await?;
    assert_eq!(delivered.lock().unwrap().as_deref(), Some(payload.as_slice()));
    Ok(())
}
