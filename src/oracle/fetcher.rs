//! Price Fetcher
//!
//! One polling loop per (asset, exchange) pair feeds a per-asset collector
//! task. The collector is the only writer of that asset's observation buffer
//! and hands the current window to the round driver on request, so nothing
//! is shared or mutated across tasks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::sources::{AdapterSet, ExchangeAdapter, FetchError, Quote};
use crate::config::{AssetFeed, FetcherConfig};
use crate::types::{AssetId, Exchange, ObservedAt, PriceObservation, RoundId};

/// Fetcher tunables shared by every loop
#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub request_timeout: Duration,
    pub unhealthy_after_failures: u32,
    pub buffer_capacity: usize,
}

impl From<&FetcherConfig> for FetcherSettings {
    fn from(config: &FetcherConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            unhealthy_after_failures: config.unhealthy_after_failures,
            buffer_capacity: config.buffer_capacity,
        }
    }
}

/// Result of one tick of one fetch loop
#[derive(Debug)]
pub enum FetchEvent {
    Observed { exchange: Exchange, quote: Quote },
    Failed { exchange: Exchange, error: FetchError },
}

/// Per-exchange health as seen by one asset's collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for ExchangeHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            total_failures: 0,
            last_success: None,
            last_error: None,
        }
    }
}

impl ExchangeHealth {
    /// Record a success; returns true if this heals the exchange
    fn record_success(&mut self) -> bool {
        let healed = !self.healthy;
        self.healthy = true;
        self.consecutive_failures = 0;
        self.last_success = Some(Utc::now());
        healed
    }

    /// Record a failure; returns true if this marks the exchange unhealthy
    fn record_failure(&mut self, error: &FetchError, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.total_failures += 1;
        self.last_error = Some(error.to_string());
        if self.healthy && self.consecutive_failures >= threshold {
            self.healthy = false;
            return true;
        }
        false
    }
}

/// Observations handed to the aggregator for one round
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub asset_id: AssetId,
    pub round_id: RoundId,
    pub observations: Vec<PriceObservation>,
    /// Unhealthy exchanges whose observations were withheld
    pub excluded: Vec<Exchange>,
}

/// Requests served by a collector
#[derive(Debug)]
pub enum CollectorCommand {
    /// Start tracking which exchanges report for `round_id`; `ready` fires
    /// once every healthy exchange has reported
    BeginRound {
        round_id: RoundId,
        ready: oneshot::Sender<()>,
    },
    /// Drain the buffer and return the observations inside `window`
    TakeWindow {
        round_id: RoundId,
        window: Duration,
        reply: oneshot::Sender<WindowSnapshot>,
    },
    Health {
        reply: oneshot::Sender<BTreeMap<Exchange, ExchangeHealth>>,
    },
}

struct PendingRound {
    round_id: RoundId,
    reported: BTreeSet<Exchange>,
    ready: Option<oneshot::Sender<()>>,
}

/// Owner of one asset's observation buffer and exchange health
pub struct AssetCollector {
    asset_id: AssetId,
    tracked: Vec<Exchange>,
    buffer: VecDeque<PriceObservation>,
    capacity: usize,
    unhealthy_after: u32,
    health: BTreeMap<Exchange, ExchangeHealth>,
    next_sequence: u64,
    pending: Option<PendingRound>,
}

impl AssetCollector {
    pub fn new(feed: &AssetFeed, settings: &FetcherSettings) -> Self {
        let health = feed
            .tracked_exchanges
            .iter()
            .map(|e| (*e, ExchangeHealth::default()))
            .collect();
        Self {
            asset_id: feed.asset_id.clone(),
            tracked: feed.tracked_exchanges.clone(),
            buffer: VecDeque::with_capacity(settings.buffer_capacity),
            capacity: settings.buffer_capacity.max(1),
            unhealthy_after: settings.unhealthy_after_failures.max(1),
            health,
            next_sequence: 0,
            pending: None,
        }
    }

    pub fn handle_event(&mut self, event: FetchEvent) {
        match event {
            FetchEvent::Observed { exchange, quote } => {
                let health = self.health.entry(exchange).or_default();
                if health.record_success() {
                    info!(asset = %self.asset_id, %exchange, "✅ Exchange recovered");
                }

                if self.buffer.len() >= self.capacity {
                    self.buffer.pop_front();
                }
                self.next_sequence += 1;
                self.buffer.push_back(PriceObservation {
                    asset_id: self.asset_id.clone(),
                    exchange_id: exchange,
                    price: quote.price,
                    observed_at: ObservedAt {
                        wall: quote.timestamp,
                        monotonic: Instant::now(),
                    },
                    sequence_id: self.next_sequence,
                });

                if let Some(pending) = self.pending.as_mut() {
                    pending.reported.insert(exchange);
                }
            }
            FetchEvent::Failed { exchange, error } => {
                let threshold = self.unhealthy_after;
                let health = self.health.entry(exchange).or_default();
                if health.record_failure(&error, threshold) {
                    warn!(
                        asset = %self.asset_id,
                        %exchange,
                        failures = health.consecutive_failures,
                        error = %error,
                        "⚠️ Exchange marked unhealthy"
                    );
                } else {
                    debug!(asset = %self.asset_id, %exchange, error = %error, "Fetch failed");
                }
            }
        }
        self.check_ready();
    }

    pub fn begin_round(&mut self, round_id: RoundId, ready: oneshot::Sender<()>) {
        self.pending = Some(PendingRound {
            round_id,
            reported: BTreeSet::new(),
            ready: Some(ready),
        });
        self.check_ready();
    }

    /// Drain the buffer; keeps observations younger than `window` from healthy exchanges
    pub fn take_window(&mut self, round_id: RoundId, window: Duration) -> WindowSnapshot {
        let now = Instant::now();
        let excluded: Vec<Exchange> = self
            .health
            .iter()
            .filter(|(_, h)| !h.healthy)
            .map(|(e, _)| *e)
            .collect();

        let observations: Vec<PriceObservation> = self
            .buffer
            .drain(..)
            .filter(|o| now.saturating_duration_since(o.observed_at.monotonic) <= window)
            .filter(|o| !excluded.contains(&o.exchange_id))
            .collect();

        if self.pending.as_ref().map(|p| p.round_id) == Some(round_id) {
            self.pending = None;
        }

        WindowSnapshot {
            asset_id: self.asset_id.clone(),
            round_id,
            observations,
            excluded,
        }
    }

    pub fn health(&self) -> &BTreeMap<Exchange, ExchangeHealth> {
        &self.health
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn check_ready(&mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.ready.is_none() {
            return;
        }
        let mut healthy = self
            .tracked
            .iter()
            .filter(|e| self.health.get(*e).map(|h| h.healthy).unwrap_or(true))
            .peekable();
        if healthy.peek().is_none() {
            return;
        }
        if healthy.all(|e| pending.reported.contains(e)) {
            if let Some(ready) = pending.ready.take() {
                debug!(asset = %self.asset_id, round_id = pending.round_id, "All exchanges reported");
                let _ = ready.send(());
            }
        }
    }

    /// Serve events and commands until both channels close or shutdown is signalled
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<FetchEvent>,
        mut commands: mpsc::Receiver<CollectorCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event),
                command = commands.recv() => match command {
                    Some(CollectorCommand::BeginRound { round_id, ready }) => {
                        self.begin_round(round_id, ready);
                    }
                    Some(CollectorCommand::TakeWindow { round_id, window, reply }) => {
                        let _ = reply.send(self.take_window(round_id, window));
                    }
                    Some(CollectorCommand::Health { reply }) => {
                        let _ = reply.send(self.health.clone());
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(asset = %self.asset_id, "Collector stopped");
    }
}

/// Poll one exchange for one asset until shutdown
pub async fn run_fetch_loop(
    adapter: Arc<dyn ExchangeAdapter>,
    asset_id: AssetId,
    every: Duration,
    request_timeout: Duration,
    events: mpsc::Sender<FetchEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let exchange = adapter.exchange();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let event = match timeout(request_timeout, adapter.fetch_price(&asset_id)).await {
            Ok(Ok(quote)) => FetchEvent::Observed { exchange, quote },
            Ok(Err(error)) => FetchEvent::Failed { exchange, error },
            Err(_) => FetchEvent::Failed {
                exchange,
                error: FetchError::Timeout,
            },
        };

        if events.send(event).await.is_err() {
            break;
        }
    }
    debug!(asset = %asset_id, %exchange, "Fetch loop stopped");
}

/// Command side of a running collector
#[derive(Debug, Clone)]
pub struct CollectorHandle {
    pub asset_id: AssetId,
    pub window: Duration,
    commands: mpsc::Sender<CollectorCommand>,
}

impl CollectorHandle {
    /// Returns a receiver that resolves once every healthy exchange reported
    pub async fn begin_round(&self, round_id: RoundId) -> Option<oneshot::Receiver<()>> {
        let (ready, rx) = oneshot::channel();
        self.commands
            .send(CollectorCommand::BeginRound { round_id, ready })
            .await
            .ok()?;
        Some(rx)
    }

    pub async fn take_window(&self, round_id: RoundId) -> Option<WindowSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(CollectorCommand::TakeWindow {
                round_id,
                window: self.window,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn health(&self) -> Option<BTreeMap<Exchange, ExchangeHealth>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(CollectorCommand::Health { reply })
            .await
            .ok()?;
        rx.await.ok()
    }
}

/// All collectors plus their fetch loops
pub struct PriceFetcher {
    collectors: BTreeMap<AssetId, CollectorHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl PriceFetcher {
    /// Spawn one collector per feed and one fetch loop per (asset, exchange)
    pub fn spawn(
        feeds: &[AssetFeed],
        adapters: &AdapterSet,
        settings: FetcherSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut collectors = BTreeMap::new();
        let mut tasks = Vec::new();

        for feed in feeds {
            let (event_tx, event_rx) = mpsc::channel(settings.buffer_capacity.max(16));
            let (command_tx, command_rx) = mpsc::channel(16);

            let collector = AssetCollector::new(feed, &settings);
            tasks.push(tokio::spawn(collector.run(
                event_rx,
                command_rx,
                shutdown.clone(),
            )));

            for exchange in &feed.tracked_exchanges {
                let Some(adapter) = adapters.get(exchange) else {
                    warn!(asset = %feed.asset_id, %exchange, "No adapter registered, skipping");
                    continue;
                };
                tasks.push(tokio::spawn(run_fetch_loop(
                    Arc::clone(adapter),
                    feed.asset_id.clone(),
                    feed.update_interval(),
                    settings.request_timeout,
                    event_tx.clone(),
                    shutdown.clone(),
                )));
            }

            info!(
                asset = %feed.asset_id,
                exchanges = feed.tracked_exchanges.len(),
                interval_ms = feed.update_interval_ms,
                "📡 Price feed started"
            );

            collectors.insert(
                feed.asset_id.clone(),
                CollectorHandle {
                    asset_id: feed.asset_id.clone(),
                    window: feed.round_window(),
                    commands: command_tx,
                },
            );
        }

        Self { collectors, tasks }
    }

    pub fn collectors(&self) -> impl Iterator<Item = &CollectorHandle> {
        self.collectors.values()
    }

    /// Take ownership of the spawned task handles (for shutdown joins)
    pub fn take_tasks(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.tasks)
    }

    /// Health of every (asset, exchange) pair
    pub async fn health(&self) -> BTreeMap<AssetId, BTreeMap<Exchange, ExchangeHealth>> {
        let mut out = BTreeMap::new();
        for handle in self.collectors.values() {
            if let Some(health) = handle.health().await {
                out.insert(handle.asset_id.clone(), health);
            }
        }
        out
    }
}
