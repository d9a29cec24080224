//! Coinbase spot price adapter

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{get_json, parse_price, ExchangeAdapter, FetchError, Quote};
use crate::types::{AssetId, Exchange};

const COINBASE_REST_URL: &str = "https://api.coinbase.com/v2/prices";

#[derive(Debug, Clone, Deserialize)]
struct CoinbaseResponse {
    data: Option<CoinbaseData>,
    #[serde(default)]
    errors: Vec<CoinbaseError>,
}

#[derive(Debug, Clone, Deserialize)]
struct CoinbaseData {
    amount: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CoinbaseError {
    id: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone)]
pub struct CoinbaseClient {
    client: Client,
}

impl CoinbaseClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Coinbase lists USD pairs directly ("BTC-USD")
    fn pair(asset_id: &AssetId) -> String {
        format!("{}-{}", asset_id.base(), asset_id.quote().unwrap_or("USD")).to_uppercase()
    }

    fn parse_spot(asset_id: &AssetId, body: Value) -> Result<Quote, FetchError> {
        let response: CoinbaseResponse =
            serde_json::from_value(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
        if let Some(err) = response.errors.first() {
            return match err.id.as_str() {
                "not_found" | "invalid_request" => {
                    Err(FetchError::UnsupportedAsset(asset_id.to_string()))
                }
                "rate_limit_exceeded" => Err(FetchError::RateLimited),
                _ => Err(FetchError::Http(format!("coinbase {}: {}", err.id, err.message))),
            };
        }
        let data = response
            .data
            .ok_or_else(|| FetchError::Malformed("missing data field".to_string()))?;
        Ok(Quote {
            price: parse_price(&data.amount)?,
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl ExchangeAdapter for CoinbaseClient {
    fn exchange(&self) -> Exchange {
        Exchange::Coinbase
    }

    async fn fetch_price(&self, asset_id: &AssetId) -> Result<Quote, FetchError> {
        let url = format!("{}/{}/spot", COINBASE_REST_URL, Self::pair(asset_id));
        let body = get_json(&self.client, &url).await?;
        Self::parse_spot(asset_id, body)
    }
}
