//! Oracle node binary
//!
//! Loads configuration, connects to the ledger and peers, then runs rounds
//! until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use oracle_node::config::AppConfig;
use oracle_node::gossip::TcpGossip;
use oracle_node::identity::NodeIdentity;
use oracle_node::ledger::RpcLedgerClient;
use oracle_node::node::{launch, NodeServices};
use oracle_node::oracle::build_adapters;

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let check_only = std::env::args().skip(1).any(|arg| arg == "--check-config");

    let config = match AppConfig::load().and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Invalid configuration: {:#}", e);
            std::process::exit(2);
        }
    };

    init_logging(config.node.log_json);

    if check_only {
        info!(digest = %config.digest(), "✅ Configuration is valid");
        return;
    }

    if let Err(e) = run(config).await {
        error!("❌ Fatal: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let identity = NodeIdentity::from_env(&config.node.key_env)
        .with_context(|| format!("Cannot load node key from {}", config.node.key_env))?;

    info!(
        tag = %config.node.tag,
        node = ?identity.node_id(),
        config_digest = %config.digest(),
        feeds = config.feeds.len(),
        "🚀 Starting oracle node"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ledger = RpcLedgerClient::new(
        &config.ledger.rpc_url,
        std::time::Duration::from_millis(config.ledger.request_timeout_ms),
    )?;
    let (gossip, inbound) =
        TcpGossip::bind(&config.gossip.listen_addr, &config.gossip.peers, shutdown_rx.clone())
            .await
            .context("Cannot open gossip listener")?;
    let adapters = build_adapters(
        config
            .feeds
            .iter()
            .flat_map(|feed| feed.tracked_exchanges.iter().copied()),
        config.fetcher.request_timeout(),
    )?;

    let node = launch(
        &config,
        identity,
        NodeServices {
            ledger: Arc::new(ledger),
            gossip: Arc::new(gossip),
            inbound,
            adapters,
        },
        shutdown_rx.clone(),
    )
    .await?;

    #[cfg(feature = "status-api")]
    let api_task = if config.api.enabled {
        let state = oracle_node::api::ApiState {
            tag: config.node.tag.clone(),
            status: node.status.clone(),
            control: node.control.clone(),
            collectors: Arc::clone(&node.collectors),
        };
        let listen_addr = config.api.listen_addr.clone();
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = oracle_node::api::start_server(state, &listen_addr, shutdown).await {
                error!("Status API stopped: {}", e);
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Cannot install Ctrl+C handler")?;
    warn!("🛑 Shutdown requested");
    let _ = shutdown_tx.send(true);

    #[cfg(feature = "status-api")]
    if let Some(task) = api_task {
        let _ = task.await;
    }
    node.join().await;

    info!("👋 Oracle node stopped");
    Ok(())
}
