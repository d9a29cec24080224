//! Multi-node simulations: three nodes, one in-memory ledger, in-process gossip

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    use oracle_node::config::{AppConfig, AssetFeed};
    use oracle_node::consensus::{elect_leader, leader_schedule};
    use oracle_node::gossip::LocalGossipHub;
    use oracle_node::identity::NodeIdentity;
    use oracle_node::ledger::{InMemoryLedger, LedgerClient, StakeEntry};
    use oracle_node::node::{launch, NodeHandle, NodeServices};
    use oracle_node::oracle::{AdapterSet, ExchangeAdapter, FetchError, Quote};
    use oracle_node::stake::StakeSnapshot;
    use oracle_node::types::{hex_digest, AssetId, Exchange, RoundId};

    const FIRST_ROUND: RoundId = 10;

    /// Exchange that always quotes the same price
    struct FixedPrice {
        exchange: Exchange,
        price: Decimal,
    }

    #[async_trait]
    impl ExchangeAdapter for FixedPrice {
        fn exchange(&self) -> Exchange {
            self.exchange
        }

        async fn fetch_price(&self, _asset_id: &AssetId) -> Result<Quote, FetchError> {
            Ok(Quote {
                price: self.price,
                timestamp: Utc::now(),
            })
        }
    }

    fn adapters() -> AdapterSet {
        let mut set = AdapterSet::new();
        for (exchange, price) in [
            (Exchange::Binance, dec!(65000.00)),
            (Exchange::Kraken, dec!(65010.50)),
        ] {
            set.insert(exchange, Arc::new(FixedPrice { exchange, price }) as Arc<dyn ExchangeAdapter>);
        }
        set
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::defaults().unwrap();
        config.feeds = vec![AssetFeed {
            asset_id: AssetId::new("BTC/USD").unwrap(),
            tracked_exchanges: vec![Exchange::Binance, Exchange::Kraken],
            min_publishers: 2,
            update_interval_ms: 10,
            round_window_ms: 100,
        }];
        config.fetcher.request_timeout_ms = 50;
        config.consensus.round_window_ms = 200;
        config.consensus.attempt_timeout_ms = 600;
        config.consensus.max_fallback_attempts = 2;
        config.consensus.stake_refresh_secs = 60;
        config.consensus.anchor_poll_ms = 10;
        config.sequencer.confirm_timeout_ms = 100;
        config.sequencer.status_poll_ms = 10;
        config.persistence.journal_enabled = false;
        config
    }

    struct Cluster {
        ledger: Arc<InMemoryLedger>,
        nodes: Vec<NodeHandle>,
        stake: StakeSnapshot,
        shutdown: watch::Sender<bool>,
    }

    /// Launch three nodes; with `silence_first_leader` the ledger never
    /// confirms the elected leader of the first round
    async fn cluster(silence_first_leader: bool) -> Cluster {
        let identities: Vec<NodeIdentity> = (0..3).map(|_| NodeIdentity::random()).collect();
        let entries: Vec<StakeEntry> = identities
            .iter()
            .zip([300u64, 200, 100])
            .map(|(identity, stake)| StakeEntry {
                node_id: identity.node_id(),
                stake,
            })
            .collect();
        let stake = StakeSnapshot::from_entries(&entries, 1);
        let ledger = Arc::new(InMemoryLedger::new(entries, FIRST_ROUND));
        if silence_first_leader {
            if let Some(leader) = elect_leader(FIRST_ROUND, &stake) {
                ledger.silence(leader).await;
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let hub = LocalGossipHub::new(256);
        let config = test_config();
        let mut nodes = Vec::new();
        for identity in identities {
            let (gossip, inbound) = hub.join();
            let node = launch(
                &config,
                identity,
                NodeServices {
                    ledger: ledger.clone() as Arc<dyn LedgerClient>,
                    gossip: Arc::new(gossip),
                    inbound,
                    adapters: adapters(),
                },
                shutdown_rx.clone(),
            )
            .await
            .unwrap();
            nodes.push(node);
        }

        Cluster {
            ledger,
            nodes,
            stake,
            shutdown,
        }
    }

    /// Wait until every node has seen a commit for `round_id` or later
    async fn wait_for_commits(nodes: &[NodeHandle], round_id: RoundId) {
        let reached = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let done = nodes.iter().all(|node| {
                    node.status
                        .borrow()
                        .last_commit
                        .as_ref()
                        .map(|c| c.round_id >= round_id)
                        .unwrap_or(false)
                });
                if done {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "nodes did not reach round {}", round_id);
    }

    async fn stop(cluster: Cluster) {
        cluster.shutdown.send(true).unwrap();
        for node in cluster.nodes {
            let _ = tokio::time::timeout(Duration::from_secs(5), node.join()).await;
        }
    }

    // ============================================================================
    // Happy path
    // ============================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_three_nodes_commit_each_round_once() {
        let cluster = cluster(false).await;
        wait_for_commits(&cluster.nodes, FIRST_ROUND + 2).await;

        let committed = cluster.ledger.committed_rounds().await;
        assert!(committed.contains(&FIRST_ROUND));
        for round_id in &committed {
            assert_eq!(cluster.ledger.commits_for(*round_id).await.len(), 1);
        }

        let first = &cluster.ledger.commits_for(FIRST_ROUND).await[0];
        assert_eq!(Some(first.submitter), elect_leader(FIRST_ROUND, &cluster.stake));
        assert_eq!(first.feed_count, 1);

        // Every node agrees with the ledger on what it reports as committed
        for node in &cluster.nodes {
            let summary = node.status.borrow().last_commit.clone().unwrap();
            let record = cluster.ledger.commits_for(summary.round_id).await;
            assert_eq!(record.len(), 1);
            assert_eq!(summary.leader, Some(record[0].submitter));
            assert_eq!(summary.merkle_root, Some(hex_digest(&record[0].merkle_root)));

            let metrics = node.status.borrow().metrics.clone();
            assert!(metrics.rounds_committed >= 1);
            assert!(metrics.rounds_started >= metrics.rounds_committed);
        }

        stop(cluster).await;
    }

    // ============================================================================
    // Fallback
    // ============================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_silenced_leader_is_replaced_by_next_in_schedule() {
        let cluster = cluster(true).await;
        let silenced = elect_leader(FIRST_ROUND, &cluster.stake).unwrap();

        wait_for_commits(&cluster.nodes, FIRST_ROUND).await;

        let commits = cluster.ledger.commits_for(FIRST_ROUND).await;
        assert_eq!(commits.len(), 1);
        let schedule = leader_schedule(FIRST_ROUND, &cluster.stake);
        assert_eq!(schedule[0], silenced);
        assert_eq!(commits[0].submitter, schedule[1]);

        let summary = cluster
            .nodes
            .iter()
            .find(|n| n.node_id == schedule[1])
            .and_then(|n| {
                n.status
                    .borrow()
                    .recent_rounds
                    .iter()
                    .find(|r| r.round_id == FIRST_ROUND)
                    .cloned()
            })
            .unwrap();
        assert!(summary.is_committed());
        assert_eq!(summary.attempt, 1);
        assert_eq!(summary.leader, Some(schedule[1]));

        stop(cluster).await;
    }
}
