//! Ledger client
//!
//! The ledger is an external append-only service reached over JSON-RPC. This
//! module defines the narrow interface the node consumes plus an HTTP
//! implementation and an in-memory ledger for simulations and tests.

mod memory;
mod rpc;

pub use memory::{CommitRecord, InMemoryLedger};
pub use rpc::RpcLedgerClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{NodeId, RoundId, TxId};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Explicit refusal by the ledger; never retried
    #[error("rejected by ledger: {0}")]
    Rejected(String),
    #[error("ledger request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LedgerError::Timeout
        } else if e.is_decode() {
            LedgerError::InvalidResponse(e.to_string())
        } else {
            LedgerError::Transport(e.to_string())
        }
    }
}

/// Status of a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Confirmed,
    Rejected { reason: String },
}

/// One row of the on-chain stake table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeEntry {
    pub node_id: NodeId,
    pub stake: u64,
}

/// Batch payload plus anti-replay nonce, signed by the submitting node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub round_id: RoundId,
    /// Hex of the 52-byte canonical batch record
    pub payload: String,
    pub nonce: String,
    pub signer: NodeId,
    /// Hex of the 65-byte signature over `payload || nonce`
    pub signature: String,
}

impl SignedPayload {
    /// Bytes covered by the signature
    pub fn signing_bytes(payload: &[u8], nonce: &str) -> Vec<u8> {
        let mut message = Vec::with_capacity(payload.len() + nonce.len());
        message.extend_from_slice(payload);
        message.extend_from_slice(nonce.as_bytes());
        message
    }

    pub fn payload_bytes(&self) -> Result<Vec<u8>, LedgerError> {
        hex::decode(&self.payload).map_err(|e| LedgerError::InvalidResponse(e.to_string()))
    }
}

/// Operations the node needs from the ledger
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a signed batch record; returns the transaction id
    async fn submit_batch(&self, payload: &SignedPayload) -> Result<TxId, LedgerError>;

    async fn transaction_status(&self, tx_id: &TxId) -> Result<TxStatus, LedgerError>;

    /// Fresh anti-replay value for the next submission
    async fn latest_nonce(&self) -> Result<String, LedgerError>;

    async fn get_stake_table(&self) -> Result<Vec<StakeEntry>, LedgerError>;

    /// Round hint derived from chain height, shared by every node
    async fn get_current_round_anchor(&self) -> Result<RoundId, LedgerError>;
}
