//! Feed configuration types
//!
//! One `AssetFeed` per tracked asset pair. Loaded once at startup and
//! never mutated afterwards.

use serde::Deserialize;
use std::time::Duration;

use crate::types::{AssetId, Exchange};

/// Per-asset feed definition
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AssetFeed {
    /// Asset pair, e.g. "BTC/USD"
    pub asset_id: AssetId,
    /// Exchanges polled for this asset
    pub tracked_exchanges: Vec<Exchange>,
    /// Minimum distinct exchanges required after outlier rejection
    pub min_publishers: usize,
    /// Fetch cadence per exchange in milliseconds
    pub update_interval_ms: u64,
    /// Observation window used for aggregation (must fit in the round window)
    pub round_window_ms: u64,
}

impl AssetFeed {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn round_window(&self) -> Duration {
        Duration::from_millis(self.round_window_ms)
    }
}

pub(super) fn default_feeds() -> Vec<AssetFeed> {
    let majors = [Exchange::Binance, Exchange::Coinbase, Exchange::Kraken];
    ["BTC/USD", "ETH/USD", "SOL/USD"]
        .iter()
        .filter_map(|id| AssetId::new(*id).ok())
        .map(|asset_id| AssetFeed {
            asset_id,
            tracked_exchanges: majors.to_vec(),
            min_publishers: 2,
            update_interval_ms: 5_000,
            round_window_ms: 60_000,
        })
        .collect()
}
