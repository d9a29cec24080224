//! Oracle module - Multi-exchange price collection and aggregation
//!
//! Polls Binance, Bybit, Coinbase, Kraken and OKX over REST and reduces each
//! asset's observations to one outlier-resistant price per round.

pub mod aggregator;
pub mod fetcher;
pub mod sources;

pub use aggregator::{AggregationParams, Aggregator};
pub use fetcher::{
    AssetCollector, CollectorHandle, ExchangeHealth, FetchEvent, FetcherSettings, PriceFetcher,
    WindowSnapshot,
};
pub use sources::{build_adapters, AdapterSet, ExchangeAdapter, FetchError, Quote};
