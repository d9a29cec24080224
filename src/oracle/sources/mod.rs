//! Exchange adapters (Binance, Bybit, Coinbase, Kraken, OKX)
//!
//! Thin REST wrappers: one request, one price. Retrying is the fetcher's
//! job (the next tick is the retry).

mod binance;
mod bybit;
mod coinbase;
mod kraken;
mod okx;

pub use binance::BinanceClient;
pub use bybit::BybitClient;
pub use coinbase::CoinbaseClient;
pub use kraken::KrakenClient;
pub use okx::OkxClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::types::{AssetId, Exchange};

/// Price as reported by an exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub price: Decimal,
    /// Exchange-side timestamp when provided, local receive time otherwise
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("http error: {0}")]
    Http(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("asset {0} is not listed")]
    UnsupportedAsset(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_decode() {
            FetchError::Malformed(e.to_string())
        } else {
            FetchError::Http(e.to_string())
        }
    }
}

/// Trait for exchange price adapters
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Exchange this adapter talks to
    fn exchange(&self) -> Exchange;

    /// Fetch the current price of one asset
    async fn fetch_price(&self, asset_id: &AssetId) -> Result<Quote, FetchError>;
}

/// Registry of adapters keyed by exchange
pub type AdapterSet = HashMap<Exchange, Arc<dyn ExchangeAdapter>>;

/// Build REST adapters for the given exchanges sharing one HTTP client
pub fn build_adapters(
    exchanges: impl IntoIterator<Item = Exchange>,
    request_timeout: Duration,
) -> Result<AdapterSet, FetchError> {
    let client = Client::builder()
        .timeout(request_timeout)
        .build()
        .map_err(|e| FetchError::Http(format!("failed to create HTTP client: {}", e)))?;

    let mut adapters: AdapterSet = HashMap::new();
    for exchange in exchanges {
        let adapter: Arc<dyn ExchangeAdapter> = match exchange {
            Exchange::Binance => Arc::new(BinanceClient::new(client.clone())),
            Exchange::Bybit => Arc::new(BybitClient::new(client.clone())),
            Exchange::Coinbase => Arc::new(CoinbaseClient::new(client.clone())),
            Exchange::Kraken => Arc::new(KrakenClient::new(client.clone())),
            Exchange::Okx => Arc::new(OkxClient::new(client.clone())),
        };
        adapters.insert(exchange, adapter);
    }
    Ok(adapters)
}

/// GET a JSON document, mapping throttling and HTTP failures to `FetchError`
pub(crate) async fn get_json(client: &Client, url: &str) -> Result<serde_json::Value, FetchError> {
    let response = client.get(url).send().await?;
    match response.status() {
        StatusCode::TOO_MANY_REQUESTS => return Err(FetchError::RateLimited),
        status if !status.is_success() => {
            return Err(FetchError::Http(format!("status {}", status)));
        }
        _ => {}
    }
    Ok(response.json().await?)
}

/// Parse a positive decimal price string
pub(crate) fn parse_price(raw: &str) -> Result<Decimal, FetchError> {
    let price = Decimal::from_str(raw.trim())
        .map_err(|e| FetchError::Malformed(format!("price '{}': {}", raw, e)))?;
    if price <= Decimal::ZERO {
        return Err(FetchError::Malformed(format!("non-positive price {}", price)));
    }
    Ok(price)
}

/// Quote currency as exchanges list it for USD-quoted pairs (`USD` -> `USDT`)
pub(crate) fn stable_quote(asset_id: &AssetId) -> &str {
    match asset_id.quote() {
        Some("USD") | None => "USDT",
        Some(quote) => quote,
    }
}
