//! Bybit V5 spot ticker adapter

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{get_json, parse_price, stable_quote, ExchangeAdapter, FetchError, Quote};
use crate::types::{AssetId, Exchange};

const BYBIT_REST_URL: &str = "https://api.bybit.com/v5/market/tickers";

#[derive(Debug, Clone, Deserialize)]
struct BybitResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    result: Option<BybitResult>,
    time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct BybitResult {
    #[serde(default)]
    list: Vec<BybitTicker>,
}

#[derive(Debug, Clone, Deserialize)]
struct BybitTicker {
    #[serde(rename = "lastPrice")]
    last_price: String,
}

#[derive(Debug, Clone)]
pub struct BybitClient {
    client: Client,
}

impl BybitClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn symbol(asset_id: &AssetId) -> String {
        format!("{}{}", asset_id.base(), stable_quote(asset_id)).to_uppercase()
    }

    fn parse_ticker(asset_id: &AssetId, body: Value) -> Result<Quote, FetchError> {
        let response: BybitResponse =
            serde_json::from_value(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
        match response.ret_code {
            0 => {}
            10006 => return Err(FetchError::RateLimited),
            10001 => return Err(FetchError::UnsupportedAsset(asset_id.to_string())),
            code => {
                return Err(FetchError::Http(format!(
                    "bybit error {}: {}",
                    code, response.ret_msg
                )))
            }
        }
        let ticker = response
            .result
            .and_then(|r| r.list.into_iter().next())
            .ok_or_else(|| FetchError::UnsupportedAsset(asset_id.to_string()))?;
        let timestamp = response
            .time
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        Ok(Quote {
            price: parse_price(&ticker.last_price)?,
            timestamp,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BybitClient {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn fetch_price(&self, asset_id: &AssetId) -> Result<Quote, FetchError> {
        let url = format!(
            "{}?category=spot&symbol={}",
            BYBIT_REST_URL,
            Self::symbol(asset_id)
        );
        let body = get_json(&self.client, &url).await?;
        Self::parse_ticker(asset_id, body)
    }
}
