//! JSON-RPC 2.0 ledger client

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{LedgerClient, LedgerError, SignedPayload, StakeEntry, TxStatus};
use crate::types::{RoundId, TxId};

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: String,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// Ledger client over HTTP JSON-RPC
pub struct RpcLedgerClient {
    client: Client,
    url: String,
}

impl RpcLedgerClient {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LedgerError::Transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, LedgerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: Uuid::new_v4().to_string(),
            method,
            params,
        };
        debug!(method, id = %request.id, "Ledger RPC call");

        let response = self.client.post(&self.url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(LedgerError::Transport(format!(
                "{} returned status {}",
                method,
                response.status()
            )));
        }
        let body: RpcResponse = response.json().await?;
        decode_response(body)
    }
}

fn decode_response<T: DeserializeOwned>(body: RpcResponse) -> Result<T, LedgerError> {
    if let Some(err) = body.error {
        return Err(LedgerError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    let result = body
        .result
        .ok_or_else(|| LedgerError::InvalidResponse("missing result".to_string()))?;
    serde_json::from_value(result).map_err(|e| LedgerError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl LedgerClient for RpcLedgerClient {
    async fn submit_batch(&self, payload: &SignedPayload) -> Result<TxId, LedgerError> {
        let params = serde_json::to_value(payload)
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;
        match self.call::<TxId>("oracle_submitBatch", json!([params])).await {
            // Any application-level refusal of a submission is final
            Err(LedgerError::Rpc { message, .. }) => Err(LedgerError::Rejected(message)),
            other => other,
        }
    }

    async fn transaction_status(&self, tx_id: &TxId) -> Result<TxStatus, LedgerError> {
        self.call("oracle_getTransactionStatus", json!([tx_id])).await
    }

    async fn latest_nonce(&self) -> Result<String, LedgerError> {
        self.call("oracle_getLatestNonce", json!([])).await
    }

    async fn get_stake_table(&self) -> Result<Vec<StakeEntry>, LedgerError> {
        self.call("oracle_getStakeTable", json!([])).await
    }

    async fn get_current_round_anchor(&self) -> Result<RoundId, LedgerError> {
        self.call("oracle_getRoundAnchor", json!([])).await
    }
}
