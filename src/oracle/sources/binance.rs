//! Binance spot ticker adapter

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::Value;

use super::{get_json, parse_price, stable_quote, ExchangeAdapter, FetchError, Quote};
use crate::types::{AssetId, Exchange};

const BINANCE_REST_URL: &str = "https://api.binance.com/api/v3/ticker/price";

#[derive(Debug, Clone)]
pub struct BinanceClient {
    client: Client,
}

impl BinanceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn symbol(asset_id: &AssetId) -> String {
        format!("{}{}", asset_id.base(), stable_quote(asset_id)).to_uppercase()
    }

    /// `{"symbol":"BTCUSDT","price":"65000.00"}` or `{"code":-1121,"msg":"Invalid symbol."}`
    fn parse_ticker(asset_id: &AssetId, body: &Value) -> Result<Quote, FetchError> {
        if let Some(code) = body.get("code").and_then(Value::as_i64) {
            let msg = body.get("msg").and_then(Value::as_str).unwrap_or_default();
            if code == -1121 {
                return Err(FetchError::UnsupportedAsset(asset_id.to_string()));
            }
            return Err(FetchError::Http(format!("binance error {}: {}", code, msg)));
        }
        let raw = body
            .get("price")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::Malformed("missing price field".to_string()))?;
        Ok(Quote {
            price: parse_price(raw)?,
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceClient {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn fetch_price(&self, asset_id: &AssetId) -> Result<Quote, FetchError> {
        let url = format!("{}?symbol={}", BINANCE_REST_URL, Self::symbol(asset_id));
        let body = get_json(&self.client, &url).await?;
        Self::parse_ticker(asset_id, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn symbol_uses_usdt_for_usd_pairs() {
        let btc = AssetId::new("BTC/USD").unwrap();
        assert_eq!(BinanceClient::symbol(&btc), "BTCUSDT");
    }

    #[test]
    fn parses_ticker_price() {
        let btc = AssetId::new("BTC/USD").unwrap();
        let body = serde_json::json!({"symbol": "BTCUSDT", "price": "65010.50000000"});
        let quote = BinanceClient::parse_ticker(&btc, &body).unwrap();
        assert_eq!(quote.price, dec!(65010.5));
    }

    #[test]
    fn invalid_symbol_is_unsupported_asset() {
        let asset = AssetId::new("FOO/USD").unwrap();
        let body = serde_json::json!({"code": -1121, "msg": "Invalid symbol."});
        assert!(matches!(
            BinanceClient::parse_ticker(&asset, &body),
            Err(FetchError::UnsupportedAsset(_))
        ));
    }
}
