//! OKX market ticker adapter

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{get_json, parse_price, stable_quote, ExchangeAdapter, FetchError, Quote};
use crate::types::{AssetId, Exchange};

const OKX_REST_URL: &str = "https://www.okx.com/api/v5/market/ticker";

#[derive(Debug, Clone, Deserialize)]
struct OkxResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<OkxTicker>,
}

#[derive(Debug, Clone, Deserialize)]
struct OkxTicker {
    last: String,
    ts: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OkxClient {
    client: Client,
}

impl OkxClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn inst_id(asset_id: &AssetId) -> String {
        format!("{}-{}", asset_id.base(), stable_quote(asset_id)).to_uppercase()
    }

    fn parse_ticker(asset_id: &AssetId, body: Value) -> Result<Quote, FetchError> {
        let response: OkxResponse =
            serde_json::from_value(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
        match response.code.as_str() {
            "0" => {}
            "50011" => return Err(FetchError::RateLimited),
            "51001" => return Err(FetchError::UnsupportedAsset(asset_id.to_string())),
            code => return Err(FetchError::Http(format!("okx error {}: {}", code, response.msg))),
        }
        let ticker = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::Malformed("empty ticker data".to_string()))?;
        let timestamp = ticker
            .ts
            .as_deref()
            .and_then(|ts| ts.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        Ok(Quote {
            price: parse_price(&ticker.last)?,
            timestamp,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for OkxClient {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    async fn fetch_price(&self, asset_id: &AssetId) -> Result<Quote, FetchError> {
        let url = format!("{}?instId={}", OKX_REST_URL, Self::inst_id(asset_id));
        let body = get_json(&self.client, &url).await?;
        Self::parse_ticker(asset_id, body)
    }
}
