//! Configuration management for the oracle node
//!
//! Loads from YAML/TOML files + environment variables via .env

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

/// Upper bound on fallback leaders tried within one round
pub const MAX_FALLBACK_ATTEMPTS_LIMIT: u32 = 16;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub node: NodeConfig,
    #[serde(default = "types::default_feeds")]
    pub feeds: Vec<AssetFeed>,
    pub fetcher: FetcherConfig,
    pub aggregation: AggregationConfig,
    pub consensus: ConsensusConfig,
    pub sequencer: SequencerConfig,
    pub ledger: LedgerConfig,
    pub gossip: GossipConfig,
    pub api: ApiConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Version tag for logging
    pub tag: String,
    /// Environment variable holding the hex-encoded node key
    pub key_env: String,
    /// Emit JSON log lines instead of human-readable ones
    pub log_json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    /// Per-request timeout for exchange calls
    pub request_timeout_ms: u64,
    /// Consecutive failures before an exchange is marked unhealthy
    pub unhealthy_after_failures: u32,
    /// Max observations kept per asset between handoffs
    pub buffer_capacity: usize,
}

impl FetcherConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Outlier threshold in MAD units
    pub outlier_k: Decimal,
    /// Lower bound on the rejection distance, in basis points of the median
    pub mad_floor_bps: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    /// Collection window per round
    pub round_window_ms: u64,
    /// Deadline for one leader attempt (claim + submission outcome)
    pub attempt_timeout_ms: u64,
    /// Fallback leaders tried after the elected one
    pub max_fallback_attempts: u32,
    /// Stake table refresh cadence
    pub stake_refresh_secs: u64,
    /// Delay before retrying a failed round anchor read
    pub anchor_poll_ms: u64,
}

impl ConsensusConfig {
    pub fn round_window(&self) -> Duration {
        Duration::from_millis(self.round_window_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn stake_refresh(&self) -> Duration {
        Duration::from_secs(self.stake_refresh_secs)
    }

    pub fn anchor_poll(&self) -> Duration {
        Duration::from_millis(self.anchor_poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SequencerConfig {
    /// How long to wait for a submitted transaction to confirm
    pub confirm_timeout_ms: u64,
    /// Poll cadence for transaction status
    pub status_poll_ms: u64,
}

impl SequencerConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint
    pub rpc_url: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GossipConfig {
    /// TCP listen address for inbound gossip
    pub listen_addr: String,
    /// Peer gossip addresses (host:port)
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
    /// Write one CSV row per finalized round
    pub journal_enabled: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::builder()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (ORACLE__*)
            .add_source(Environment::with_prefix("ORACLE").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Defaults only; file and environment sources are layered on top by `load`
    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let builder = Config::builder()
            .set_default("node.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("node.key_env", "ORACLE_NODE_KEY")?
            .set_default("node.log_json", false)?
            // Fetcher defaults
            .set_default("fetcher.request_timeout_ms", 3_000)?
            .set_default("fetcher.unhealthy_after_failures", 5)?
            .set_default("fetcher.buffer_capacity", 256)?
            // Aggregation defaults
            .set_default("aggregation.outlier_k", "3")?
            .set_default("aggregation.mad_floor_bps", 10)?
            // Consensus defaults
            .set_default("consensus.round_window_ms", 60_000)?
            .set_default("consensus.attempt_timeout_ms", 30_000)?
            .set_default("consensus.max_fallback_attempts", 2)?
            .set_default("consensus.stake_refresh_secs", 30)?
            .set_default("consensus.anchor_poll_ms", 1_000)?
            // Sequencer defaults
            .set_default("sequencer.confirm_timeout_ms", 12_000)?
            .set_default("sequencer.status_poll_ms", 500)?
            // Ledger defaults
            .set_default("ledger.rpc_url", "http://127.0.0.1:8899")?
            .set_default("ledger.request_timeout_ms", 5_000)?
            // Gossip defaults
            .set_default("gossip.listen_addr", "0.0.0.0:9000")?
            .set_default("gossip.peers", Vec::<String>::new())?
            // API defaults
            .set_default("api.enabled", true)?
            .set_default("api.listen_addr", "127.0.0.1:7777")?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.journal_enabled", true)?;
        Ok(builder)
    }

    /// Configuration built from defaults alone
    pub fn defaults() -> Result<Self> {
        Self::builder()?
            .build()
            .context("Failed to build default configuration")?
            .try_deserialize()
            .context("Failed to deserialize default configuration")
    }

    /// Reject configurations the node cannot run safely with
    pub fn validate(&self) -> Result<()> {
        if self.feeds.is_empty() {
            bail!("At least one feed must be configured");
        }

        let mut seen = HashSet::new();
        for feed in &self.feeds {
            if !seen.insert(feed.asset_id.clone()) {
                bail!("Duplicate feed for asset {}", feed.asset_id);
            }
            if feed.tracked_exchanges.is_empty() {
                bail!("Feed {} has no tracked exchanges", feed.asset_id);
            }
            let distinct: HashSet<_> = feed.tracked_exchanges.iter().collect();
            if distinct.len() != feed.tracked_exchanges.len() {
                bail!("Feed {} lists an exchange twice", feed.asset_id);
            }
            if feed.min_publishers == 0 || feed.min_publishers > feed.tracked_exchanges.len() {
                bail!(
                    "Feed {}: min_publishers must be between 1 and {} (got {})",
                    feed.asset_id,
                    feed.tracked_exchanges.len(),
                    feed.min_publishers
                );
            }
            if feed.update_interval_ms == 0 {
                bail!("Feed {}: update_interval_ms must be positive", feed.asset_id);
            }
            if feed.round_window_ms == 0 || feed.round_window_ms > self.consensus.round_window_ms {
                bail!(
                    "Feed {}: round_window_ms must be in 1..={}",
                    feed.asset_id,
                    self.consensus.round_window_ms
                );
            }
        }

        if self.aggregation.outlier_k <= Decimal::ZERO {
            bail!("aggregation.outlier_k must be positive");
        }
        if self.fetcher.unhealthy_after_failures == 0 {
            bail!("fetcher.unhealthy_after_failures must be positive");
        }
        if self.fetcher.buffer_capacity == 0 {
            bail!("fetcher.buffer_capacity must be positive");
        }
        if self.consensus.round_window_ms == 0 {
            bail!("consensus.round_window_ms must be positive");
        }
        if self.consensus.max_fallback_attempts > MAX_FALLBACK_ATTEMPTS_LIMIT {
            bail!(
                "consensus.max_fallback_attempts must be at most {}",
                MAX_FALLBACK_ATTEMPTS_LIMIT
            );
        }

        // A leader's first submission plus its single resubmission must fit in one attempt
        let submit_budget =
            2 * self.sequencer.confirm_timeout_ms + 2 * self.sequencer.status_poll_ms;
        if self.consensus.attempt_timeout_ms < submit_budget {
            bail!(
                "consensus.attempt_timeout_ms ({}) must be at least {} (2x confirm timeout + 2x poll)",
                self.consensus.attempt_timeout_ms,
                submit_budget
            );
        }

        Ok(())
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        let assets: Vec<&str> = self.feeds.iter().map(|f| f.asset_id.as_str()).collect();
        format!(
            "node={} assets={:?} window_ms={} fallbacks={} k={} peers={} rpc={}",
            self.node.tag,
            assets,
            self.consensus.round_window_ms,
            self.consensus.max_fallback_attempts,
            self.aggregation.outlier_k,
            self.gossip.peers.len(),
            self.ledger.rpc_url
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Exchange;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::defaults().expect("defaults should load");
        config.validate().expect("defaults should validate");
        assert_eq!(config.consensus.round_window_ms, 60_000);
        assert_eq!(config.aggregation.outlier_k, Decimal::from(3));
        assert_eq!(config.feeds.len(), 3);
    }

    #[test]
    fn rejects_min_publishers_above_exchange_count() {
        let mut config = AppConfig::defaults().unwrap();
        config.feeds[0].min_publishers = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_exchange_in_feed() {
        let mut config = AppConfig::defaults().unwrap();
        config.feeds[0].tracked_exchanges = vec![Exchange::Binance, Exchange::Binance];
        config.feeds[0].min_publishers = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_attempt_timeout_shorter_than_submission_budget() {
        let mut config = AppConfig::defaults().unwrap();
        config.consensus.attempt_timeout_ms = config.sequencer.confirm_timeout_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_feed_window_longer_than_round() {
        let mut config = AppConfig::defaults().unwrap();
        config.feeds[1].round_window_ms = config.consensus.round_window_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn digest_omits_secrets() {
        let config = AppConfig::defaults().unwrap();
        let digest = config.digest();
        assert!(digest.contains("BTC/USD"));
        assert!(!digest.contains("ORACLE_NODE_KEY"));
    }
}
