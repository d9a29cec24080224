//! Node wiring
//!
//! Starts every long-lived task of one oracle node and hands back the
//! channels the status surface needs. Transports are passed in, so the same
//! wiring runs against the JSON-RPC ledger and TCP gossip in production and
//! against in-process doubles in simulations.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::consensus::{ControlCommand, DriverContext, DriverSettings, NodeStatus, RoundDriver};
use crate::gossip::{run_listener, GossipTransport, SignedMessage};
use crate::identity::NodeIdentity;
use crate::ledger::LedgerClient;
use crate::oracle::{AdapterSet, AggregationParams, Aggregator, CollectorHandle, FetcherSettings, PriceFetcher};
use crate::persistence::RoundJournal;
use crate::sequencer::{Sequencer, SequencerSettings};
use crate::stake::{fetch_snapshot, spawn_refresh, StakeSnapshot};
use crate::types::NodeId;

/// External collaborators of a node
pub struct NodeServices {
    pub ledger: Arc<dyn LedgerClient>,
    pub gossip: Arc<dyn GossipTransport>,
    /// Unverified inbound gossip
    pub inbound: mpsc::Receiver<SignedMessage>,
    pub adapters: AdapterSet,
}

/// Running node
pub struct NodeHandle {
    pub node_id: NodeId,
    pub status: watch::Receiver<NodeStatus>,
    pub control: mpsc::Sender<ControlCommand>,
    pub collectors: Arc<Vec<CollectorHandle>>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// Wait for every task to stop (after shutdown was signalled)
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Fatal checks before anything is spawned: the ledger answers and has a stake table
pub async fn startup_checks(ledger: &dyn LedgerClient, node_id: NodeId) -> Result<StakeSnapshot> {
    let anchor = ledger
        .get_current_round_anchor()
        .await
        .context("Ledger RPC unreachable at startup")?;
    let snapshot = fetch_snapshot(ledger, 1)
        .await
        .context("Stake table unavailable at startup")?;
    if snapshot.is_empty() {
        bail!("Stake table is empty; no node can lead a round");
    }
    if !snapshot.contains(&node_id) {
        warn!(node = ?node_id, "This node holds no stake; it will validate but never lead");
    }
    info!(
        anchor,
        nodes = snapshot.len(),
        total_stake = %snapshot.total(),
        own_stake = snapshot.stake_of(&node_id),
        "✅ Ledger reachable"
    );
    Ok(snapshot)
}

/// Start fetchers, stake refresh, gossip listener and the round driver
pub async fn launch(
    config: &AppConfig,
    identity: NodeIdentity,
    services: NodeServices,
    shutdown: watch::Receiver<bool>,
) -> Result<NodeHandle> {
    let node_id = identity.node_id();
    let snapshot = startup_checks(services.ledger.as_ref(), node_id).await?;

    let journal = if config.persistence.journal_enabled {
        Some(Arc::new(RoundJournal::new(&config.persistence.data_dir)?))
    } else {
        None
    };

    let mut tasks = Vec::new();

    let (stake_tx, stake_rx) = watch::channel(snapshot);
    tasks.push(spawn_refresh(
        Arc::clone(&services.ledger),
        stake_tx,
        config.consensus.stake_refresh(),
        shutdown.clone(),
    ));

    let mut fetcher = PriceFetcher::spawn(
        &config.feeds,
        &services.adapters,
        FetcherSettings::from(&config.fetcher),
        shutdown.clone(),
    );
    tasks.extend(fetcher.take_tasks());
    let collectors: Vec<CollectorHandle> = fetcher.collectors().cloned().collect();

    let aggregators: BTreeMap<_, _> = config
        .feeds
        .iter()
        .map(|feed| {
            (
                feed.asset_id.clone(),
                Aggregator::new(AggregationParams::for_feed(&config.aggregation, feed)),
            )
        })
        .collect();

    let (peer_tx, peer_rx) = mpsc::channel(256);
    tasks.push(tokio::spawn(run_listener(
        services.inbound,
        stake_rx.clone(),
        node_id,
        peer_tx,
        shutdown.clone(),
    )));

    let sequencer = Arc::new(Sequencer::new(
        Arc::clone(&services.ledger),
        identity.clone(),
        SequencerSettings::from(&config.sequencer),
    ));

    let (status_tx, status_rx) = watch::channel(NodeStatus::starting(node_id));
    let (control_tx, control_rx) = mpsc::channel(8);

    let driver = RoundDriver::new(DriverContext {
        identity,
        settings: DriverSettings::new(&config.consensus, &config.feeds),
        max_fallback_attempts: config.consensus.max_fallback_attempts,
        collectors: collectors.clone(),
        aggregators,
        ledger: services.ledger,
        sequencer,
        gossip: services.gossip,
        stake: stake_rx,
        journal,
        status: status_tx,
    });
    tasks.push(tokio::spawn(driver.run(peer_rx, control_rx, shutdown)));

    info!(node = ?node_id, feeds = config.feeds.len(), "🟢 Oracle node running");

    Ok(NodeHandle {
        node_id,
        status: status_rx,
        control: control_tx,
        collectors: Arc::new(collectors),
        tasks,
    })
}
