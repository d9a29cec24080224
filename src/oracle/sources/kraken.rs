//! Kraken public ticker adapter

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use super::{get_json, parse_price, ExchangeAdapter, FetchError, Quote};
use crate::types::{AssetId, Exchange};

const KRAKEN_REST_URL: &str = "https://api.kraken.com/0/public/Ticker";

#[derive(Debug, Clone, Deserialize)]
struct KrakenResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: HashMap<String, KrakenTicker>,
}

#[derive(Debug, Clone, Deserialize)]
struct KrakenTicker {
    /// Last trade closed: [price, lot volume]
    c: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KrakenClient {
    client: Client,
}

impl KrakenClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pair(asset_id: &AssetId) -> String {
        format!("{}{}", asset_id.base(), asset_id.quote().unwrap_or("USD")).to_uppercase()
    }

    fn parse_ticker(asset_id: &AssetId, body: Value) -> Result<Quote, FetchError> {
        let response: KrakenResponse =
            serde_json::from_value(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
        if let Some(err) = response.error.first() {
            if err.contains("Unknown asset pair") {
                return Err(FetchError::UnsupportedAsset(asset_id.to_string()));
            }
            if err.contains("Too many requests") {
                return Err(FetchError::RateLimited);
            }
            return Err(FetchError::Http(format!("kraken: {}", err)));
        }
        // Kraken renames pairs in the result map (BTCUSD -> XXBTZUSD); there is one entry
        let raw = response
            .result
            .values()
            .next()
            .and_then(|t| t.c.first())
            .ok_or_else(|| FetchError::Malformed("empty ticker result".to_string()))?;
        Ok(Quote {
            price: parse_price(raw)?,
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl ExchangeAdapter for KrakenClient {
    fn exchange(&self) -> Exchange {
        Exchange::Kraken
    }

    async fn fetch_price(&self, asset_id: &AssetId) -> Result<Quote, FetchError> {
        let url = format!("{}?pair={}", KRAKEN_REST_URL, Self::pair(asset_id));
        let body = get_json(&self.client, &url).await?;
        Self::parse_ticker(asset_id, body)
    }
}
