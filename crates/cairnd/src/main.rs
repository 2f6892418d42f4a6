//! cairnd — the cairn cluster node daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use cairn_cluster::{ClusterConnector, ClusterNetwork, ClusterTasks, NodeServerProvider};
use cairn_core::config::CairnConfig;
use cairn_core::snapshot::{current_millis, NodeIdentity};
use cairn_net::NetworkServer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CairnConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = CairnConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CairnConfig::default()
    });

    let identity = NodeIdentity::new(
        config.identity.unique_id.clone(),
        config.identity.listeners.clone(),
    );
    tracing::info!(node = %identity.unique_id, "cairnd starting");

    // Membership table: the local node plus every configured member
    let provider = Arc::new(NodeServerProvider::new(identity, current_millis()));
    for node in &config.cluster.nodes {
        provider.register_node(NodeIdentity::new(
            node.unique_id.clone(),
            node.listeners.clone(),
        ));
    }

    let query_ttl = Duration::from_secs(config.timing.query_ttl_secs);
    let network = ClusterNetwork::new(
        provider.clone(),
        config.cluster.cluster_key.clone(),
        query_ttl,
    );

    // Listen on every configured address
    let server = NetworkServer::new(network.channel_handler(), query_ttl);
    for addr in &config.identity.listeners {
        let bound = server
            .listen(*addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        tracing::info!(addr = %bound, "listening");
    }

    // Initial dial-out; members that are not up yet are retried by the
    // disconnect tracker
    let connector = ClusterConnector::new(
        network.clone(),
        Duration::from_millis(config.timing.connect_timeout_ms.max(1)),
    );
    for member in provider.node_servers() {
        if member.is_local() {
            continue;
        }
        if let Err(error) = connector.connect_node(&member, false).await {
            tracing::warn!(
                node = %member.info().unique_id,
                error = %error,
                "initial connect failed, will retry"
            );
        }
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let tasks = ClusterTasks::new(network, config.timing.clone(), shutdown_tx.subscribe());
    let cluster_loop = tokio::spawn(tasks.run());

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
        result = cluster_loop => tracing::error!("cluster task loop exited: {result:?}"),
    }

    let _ = shutdown_tx.send(());
    server.shutdown();
    Ok(())
}
