//! Round Driver
//!
//! Async shell around `ConsensusEngine`. Owns the round lifecycle for this
//! node: picks the round id, opens collection on every asset, aggregates
//! and builds the batch once the window closes, and then carries out the
//! engine's actions (gossip, sequencer hand-off, attempt deadlines,
//! journaling). Rounds run one at a time, at most one per `round_window`.
//! Everything reaches the driver as a message, so the engine is only ever
//! touched from this task.

use chrono::Utc;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::engine::{Action, ConsensusEngine, ConsensusError, RoundOutcome, RoundStatus, RoundSummary};
use super::status::NodeStatus;
use crate::batch::Batch;
use crate::config::{AssetFeed, ConsensusConfig};
use crate::gossip::{GossipPayload, GossipTransport, PeerMessage, SignedMessage};
use crate::identity::NodeIdentity;
use crate::ledger::LedgerClient;
use crate::oracle::{Aggregator, CollectorHandle};
use crate::persistence::RoundJournal;
use crate::sequencer::{InFlightSubmission, Sequencer};
use crate::stake::StakeSnapshot;
use crate::types::{AssetId, NodeId, RoundId, SubmissionReceipt};

#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Minimum spacing between round starts
    pub round_window: Duration,
    /// Longest feed window; collection closes after this unless every exchange reported
    pub collection_window: Duration,
    pub attempt_timeout: Duration,
    /// Delay before retrying a failed round anchor read
    pub anchor_poll: Duration,
}

impl DriverSettings {
    pub fn new(consensus: &ConsensusConfig, feeds: &[AssetFeed]) -> Self {
        let round_window = consensus.round_window();
        let collection_window = feeds
            .iter()
            .map(|f| f.round_window())
            .max()
            .unwrap_or(round_window)
            .min(round_window);
        Self {
            round_window,
            collection_window,
            attempt_timeout: consensus.attempt_timeout(),
            anchor_poll: consensus.anchor_poll(),
        }
    }
}

/// Operator commands
#[derive(Debug)]
pub enum ControlCommand {
    /// Fail the live round and start a new one right away; replies with the restarted round id
    RestartRound {
        reply: oneshot::Sender<Result<RoundId, ConsensusError>>,
    },
}

#[derive(Debug)]
enum DriverEvent {
    CollectionDone { round_id: RoundId, early: bool },
    AttemptExpired { round_id: RoundId, attempt: u32 },
}

/// Everything the driver needs from the rest of the node
pub struct DriverContext {
    pub identity: NodeIdentity,
    pub settings: DriverSettings,
    pub max_fallback_attempts: u32,
    pub collectors: Vec<CollectorHandle>,
    pub aggregators: BTreeMap<AssetId, Aggregator>,
    pub ledger: Arc<dyn LedgerClient>,
    pub sequencer: Arc<Sequencer>,
    pub gossip: Arc<dyn GossipTransport>,
    pub stake: watch::Receiver<StakeSnapshot>,
    pub journal: Option<Arc<RoundJournal>>,
    pub status: watch::Sender<NodeStatus>,
}

pub struct RoundDriver {
    engine: ConsensusEngine,
    identity: NodeIdentity,
    settings: DriverSettings,
    collectors: Vec<CollectorHandle>,
    aggregators: BTreeMap<AssetId, Aggregator>,
    ledger: Arc<dyn LedgerClient>,
    sequencer: Arc<Sequencer>,
    gossip: Arc<dyn GossipTransport>,
    stake: watch::Receiver<StakeSnapshot>,
    journal: Option<Arc<RoundJournal>>,
    status: watch::Sender<NodeStatus>,
    events_tx: mpsc::Sender<DriverEvent>,
    events_rx: mpsc::Receiver<DriverEvent>,
    receipts_tx: mpsc::Sender<SubmissionReceipt>,
    receipts_rx: mpsc::Receiver<SubmissionReceipt>,
    /// This node's batch for the live round
    batch: Option<Batch>,
    in_flight: Option<InFlightSubmission>,
    attempt_timer: Option<JoinHandle<()>>,
    next_start: Instant,
    started: Instant,
    batches_built: u64,
    submissions: u64,
    price_observations: u64,
}

impl RoundDriver {
    pub fn new(ctx: DriverContext) -> Self {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (receipts_tx, receipts_rx) = mpsc::channel(4);
        Self {
            engine: ConsensusEngine::new(ctx.identity.node_id(), ctx.max_fallback_attempts),
            identity: ctx.identity,
            settings: ctx.settings,
            collectors: ctx.collectors,
            aggregators: ctx.aggregators,
            ledger: ctx.ledger,
            sequencer: ctx.sequencer,
            gossip: ctx.gossip,
            stake: ctx.stake,
            journal: ctx.journal,
            status: ctx.status,
            events_tx,
            events_rx,
            receipts_tx,
            receipts_rx,
            batch: None,
            in_flight: None,
            attempt_timer: None,
            next_start: Instant::now(),
            started: Instant::now(),
            batches_built: 0,
            submissions: 0,
            price_observations: 0,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.engine.self_id()
    }

    /// Drive rounds until shutdown
    pub async fn run(
        mut self,
        mut peers: mpsc::Receiver<PeerMessage>,
        mut control: mpsc::Receiver<ControlCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            node = ?self.node_id(),
            round_window_ms = self.settings.round_window.as_millis() as u64,
            collection_window_ms = self.settings.collection_window.as_millis() as u64,
            assets = self.collectors.len(),
            "🚀 Round driver started"
        );

        loop {
            let idle = self.is_idle();
            let next_start = self.next_start;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep_until(next_start), if idle => self.start_round().await,
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                Some(receipt) = self.receipts_rx.recv() => self.handle_receipt(receipt).await,
                Some(message) = peers.recv() => self.handle_peer(message).await,
                Some(command) = control.recv() => self.handle_control(command).await,
            }
            self.publish_status();
        }

        if let Some(in_flight) = self.in_flight.take() {
            in_flight.cancel();
        }
        if let Some(timer) = self.attempt_timer.take() {
            timer.abort();
        }
        info!("🛑 Round driver stopped");
    }

    fn is_idle(&self) -> bool {
        self.engine
            .live()
            .map(|live| live.status.is_terminal())
            .unwrap_or(true)
    }

    fn publish_status(&self) {
        let mut status = self.engine.status();
        status.metrics.batches_built = self.batches_built;
        status.metrics.submissions = self.submissions;
        status.metrics.price_observations = self.price_observations;
        status.metrics.uptime_secs = self.started.elapsed().as_secs();
        self.status.send_replace(status);
    }

    async fn start_round(&mut self) {
        let round_id = self.next_round_id().await;
        let snapshot = self.stake.borrow().clone();
        self.next_start = Instant::now() + self.settings.round_window;
        self.batch = None;

        match self.engine.begin_round(round_id, snapshot) {
            Ok(actions) => self.execute(actions).await,
            Err(e) => {
                warn!(round_id, error = %e, "Could not start round");
                return;
            }
        }
        if self.is_idle() {
            return;
        }

        let mut readies = Vec::with_capacity(self.collectors.len());
        for collector in &self.collectors {
            match collector.begin_round(round_id).await {
                Some(ready) => readies.push(ready),
                None => warn!(asset = %collector.asset_id, "Collector unavailable"),
            }
        }

        let events = self.events_tx.clone();
        let window = self.settings.collection_window;
        tokio::spawn(async move {
            let early = if readies.is_empty() {
                sleep(window).await;
                false
            } else {
                timeout(window, join_all(readies)).await.is_ok()
            };
            let _ = events
                .send(DriverEvent::CollectionDone { round_id, early })
                .await;
        });
        self.publish_status();
    }

    /// Ledger anchor, never below the round after the last one seen here
    async fn next_round_id(&self) -> RoundId {
        let floor = self.engine.latest_round().map(|r| r + 1).unwrap_or(0);
        let anchor = match self.ledger.get_current_round_anchor().await {
            Ok(anchor) => anchor,
            Err(first) => {
                debug!(error = %first, "Round anchor read failed, retrying");
                sleep(self.settings.anchor_poll).await;
                match self.ledger.get_current_round_anchor().await {
                    Ok(anchor) => anchor,
                    Err(e) => {
                        let fallback = wall_clock_round(self.settings.round_window);
                        warn!(error = %e, fallback, "⚠️ Round anchor unavailable, using wall-clock round");
                        fallback
                    }
                }
            }
        };
        if anchor < floor {
            debug!(anchor, floor, "Anchor behind local rounds");
        }
        anchor.max(floor)
    }

    async fn handle_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::CollectionDone { round_id, early } => {
                self.finish_collection(round_id, early).await
            }
            DriverEvent::AttemptExpired { round_id, attempt } => {
                match self.engine.on_attempt_timeout(round_id, attempt) {
                    Ok(actions) => self.execute(actions).await,
                    Err(e) => debug!(round_id, attempt, error = %e, "Attempt expiry ignored"),
                }
            }
        }
    }

    /// Aggregate every asset, build the batch and hand over to election
    async fn finish_collection(&mut self, round_id: RoundId, early: bool) {
        let collecting = self
            .engine
            .live()
            .map(|live| live.round_id == round_id && live.status == RoundStatus::Collecting)
            .unwrap_or(false);
        if !collecting {
            debug!(round_id, "Collection result for an inactive round");
            return;
        }

        let mut prices = Vec::with_capacity(self.collectors.len());
        for collector in &self.collectors {
            let Some(window) = collector.take_window(round_id).await else {
                warn!(asset = %collector.asset_id, "Collector unavailable at handoff");
                continue;
            };
            let Some(aggregator) = self.aggregators.get(&window.asset_id) else {
                continue;
            };
            self.price_observations += window.observations.len() as u64;
            match aggregator.aggregate(&window.asset_id, round_id, &window.observations) {
                Some(price) => prices.push(price),
                None => debug!(
                    asset = %window.asset_id,
                    round_id,
                    observations = window.observations.len(),
                    excluded = window.excluded.len(),
                    "Asset left out of batch"
                ),
            }
        }

        let batch = if prices.is_empty() {
            info!(round_id, "No asset qualified this round");
            None
        } else {
            match Batch::build(round_id, prices) {
                Ok(batch) => Some(batch),
                Err(e) => {
                    warn!(round_id, error = %e, "Batch build failed");
                    None
                }
            }
        };

        let (root, feed_count) = match &batch {
            Some(b) => (Some(b.merkle_root), b.feed_count()),
            None => (None, 0),
        };
        if let Err(e) = self.engine.record_local_batch(round_id, root, feed_count) {
            warn!(round_id, error = %e, "Round moved on during collection");
            return;
        }
        if let Some(b) = &batch {
            self.batches_built += 1;
            info!(round_id, root = %b.root_hex(), feeds = feed_count, early, "🌳 Batch built");
            self.broadcast(GossipPayload::RootAnnouncement {
                round_id,
                batch_root: b.merkle_root,
                feed_count,
            })
            .await;
        }
        self.batch = batch;

        match self.engine.elect(round_id) {
            Ok(actions) => self.execute(actions).await,
            Err(e) => warn!(round_id, error = %e, "Election skipped"),
        }
    }

    async fn handle_receipt(&mut self, receipt: SubmissionReceipt) {
        let ours = self
            .in_flight
            .as_ref()
            .map(|f| f.round_id == receipt.round_id && f.attempt == receipt.attempt)
            .unwrap_or(false);
        if ours {
            self.in_flight = None;
        }
        match self.engine.on_receipt(&receipt) {
            Ok(actions) => self.execute(actions).await,
            Err(e) => debug!(
                round_id = receipt.round_id,
                attempt = receipt.attempt,
                error = %e,
                "Receipt ignored"
            ),
        }
    }

    async fn handle_peer(&mut self, message: PeerMessage) {
        let sender = message.sender;
        let result = match message.payload {
            GossipPayload::RootAnnouncement {
                round_id,
                batch_root,
                ..
            } => self.engine.on_announcement(sender, round_id, batch_root),
            GossipPayload::BatchClaim {
                round_id,
                attempt,
                batch_root,
            } => self.engine.on_claim(sender, round_id, attempt, batch_root),
            GossipPayload::SubmissionOutcome {
                round_id,
                attempt,
                outcome,
                ledger_tx_id,
            } => self
                .engine
                .on_peer_outcome(sender, round_id, attempt, &outcome, ledger_tx_id),
        };
        match result {
            Ok(actions) => self.execute(actions).await,
            Err(ConsensusError::StaleRound { round_id, latest }) => {
                debug!(sender = ?sender, round_id, latest, "Stale gossip ignored")
            }
            Err(e) => debug!(sender = ?sender, error = %e, "Gossip message ignored"),
        }
    }

    async fn handle_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::RestartRound { reply } => {
                let round_id = self.engine.live().map(|live| live.round_id);
                match (self.engine.restart(), round_id) {
                    (Ok(actions), Some(round_id)) => {
                        info!(round_id, "🔁 Manual round restart");
                        self.execute(actions).await;
                        self.next_start = Instant::now();
                        let _ = reply.send(Ok(round_id));
                    }
                    (Ok(actions), None) => {
                        self.execute(actions).await;
                        let _ = reply.send(Err(ConsensusError::NoLiveRound));
                    }
                    (Err(e), _) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
        }
    }

    async fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::BroadcastClaim {
                    round_id,
                    attempt,
                    root,
                } => {
                    self.broadcast(GossipPayload::BatchClaim {
                        round_id,
                        attempt,
                        batch_root: root,
                    })
                    .await
                }
                Action::Submit { round_id, attempt } => self.submit(round_id, attempt),
                Action::BroadcastOutcome {
                    round_id,
                    attempt,
                    outcome,
                    ledger_tx_id,
                } => {
                    self.broadcast(GossipPayload::SubmissionOutcome {
                        round_id,
                        attempt,
                        outcome,
                        ledger_tx_id,
                    })
                    .await
                }
                Action::ArmAttemptTimer {
                    round_id,
                    attempt,
                    leader,
                } => self.arm_attempt_timer(round_id, attempt, leader),
                Action::CancelSubmission { round_id } => self.cancel_submission(round_id),
                Action::Finalized(summary) => self.finalized(summary).await,
            }
        }
    }

    fn submit(&mut self, round_id: RoundId, attempt: u32) {
        let Some(batch) = self.batch.as_ref().filter(|b| b.round_id == round_id) else {
            warn!(round_id, attempt, "No local batch to submit");
            return;
        };
        if let Some(previous) = self.in_flight.take() {
            previous.cancel();
        }
        self.submissions += 1;
        self.in_flight = Some(
            self.sequencer
                .spawn(batch.clone(), attempt, self.receipts_tx.clone()),
        );
    }

    fn cancel_submission(&mut self, round_id: RoundId) {
        if self.in_flight.as_ref().map(|f| f.round_id) == Some(round_id) {
            if let Some(in_flight) = self.in_flight.take() {
                in_flight.cancel();
            }
        }
    }

    fn arm_attempt_timer(&mut self, round_id: RoundId, attempt: u32, leader: NodeId) {
        if let Some(timer) = self.attempt_timer.take() {
            timer.abort();
        }
        debug!(round_id, attempt, leader = ?leader, "Attempt deadline armed");
        let events = self.events_tx.clone();
        let after = self.settings.attempt_timeout;
        self.attempt_timer = Some(tokio::spawn(async move {
            sleep(after).await;
            let _ = events
                .send(DriverEvent::AttemptExpired { round_id, attempt })
                .await;
        }));
    }

    async fn finalized(&mut self, summary: RoundSummary) {
        if let Some(timer) = self.attempt_timer.take() {
            timer.abort();
        }
        match &summary.outcome {
            RoundOutcome::Committed => info!(
                round_id = summary.round_id,
                leader = ?summary.leader,
                attempt = summary.attempt,
                root = summary.merkle_root.as_deref().unwrap_or("-"),
                tx = summary.ledger_tx_id.as_deref().unwrap_or("-"),
                "✅ Round finalized: committed"
            ),
            RoundOutcome::Failed { reason } => warn!(
                round_id = summary.round_id,
                attempt = summary.attempt,
                reason = %reason,
                "Round finalized: failed"
            ),
        }
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(&summary).await {
                warn!(round_id = summary.round_id, error = %e, "Failed to journal round");
            }
        }
    }

    async fn broadcast(&self, payload: GossipPayload) {
        let round_id = payload.round_id();
        let message = match SignedMessage::sign(&self.identity, payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(round_id, error = %e, "Could not sign gossip message");
                return;
            }
        };
        match self.gossip.broadcast(&message).await {
            Ok(peers) => debug!(round_id, peers, "Gossip sent"),
            Err(e) => warn!(round_id, error = %e, "Gossip broadcast failed"),
        }
    }
}

/// Round id derived from wall-clock time, used when the ledger anchor is unreachable
pub fn wall_clock_round(window: Duration) -> RoundId {
    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);
    let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
    now_ms / window_ms
}
