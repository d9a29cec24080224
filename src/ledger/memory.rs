//! In-process ledger
//!
//! Keeps only the latest committed root, like the real contract, plus a
//! commit log so simulations can assert at-most-once commits per round.
//! Nodes can be made to lose or have their submissions refused.

use async_trait::async_trait;
use ethers::types::Signature;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use tokio::sync::Mutex;

use super::{LedgerClient, LedgerError, SignedPayload, StakeEntry, TxStatus};
use crate::batch::Hash;
use crate::identity::verify_signature;
use crate::sequencer::BatchPayload;
use crate::types::{NodeId, RoundId, TxId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub round_id: RoundId,
    pub merkle_root: Hash,
    pub feed_count: u32,
    pub submitter: NodeId,
    pub tx_id: TxId,
}

#[derive(Debug, Default)]
struct LedgerState {
    stake: Vec<StakeEntry>,
    anchor: RoundId,
    next_nonce: u64,
    issued_nonces: HashSet<String>,
    used_nonces: HashSet<String>,
    next_tx: u64,
    txs: HashMap<TxId, TxStatus>,
    /// Current on-chain record (overwritten on every commit)
    current: Option<CommitRecord>,
    history: BTreeMap<RoundId, Vec<CommitRecord>>,
    silent: HashSet<NodeId>,
    rejecting: HashSet<NodeId>,
    submissions: u64,
    anchor_unavailable: bool,
}

/// Ledger held in memory
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new(stake: Vec<StakeEntry>, anchor: RoundId) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                stake,
                anchor,
                ..LedgerState::default()
            }),
        }
    }

    pub async fn set_anchor(&self, anchor: RoundId) {
        self.state.lock().await.anchor = anchor;
    }

    pub async fn advance_anchor(&self) -> RoundId {
        let mut state = self.state.lock().await;
        state.anchor += 1;
        state.anchor
    }

    pub async fn set_stake(&self, stake: Vec<StakeEntry>) {
        self.state.lock().await.stake = stake;
    }

    /// Accept but never confirm this node's submissions
    pub async fn silence(&self, node: NodeId) {
        self.state.lock().await.silent.insert(node);
    }

    /// Refuse this node's submissions
    pub async fn reject_from(&self, node: NodeId) {
        self.state.lock().await.rejecting.insert(node);
    }

    /// Make the anchor RPC fail
    pub async fn set_anchor_unavailable(&self, unavailable: bool) {
        self.state.lock().await.anchor_unavailable = unavailable;
    }

    pub async fn current(&self) -> Option<CommitRecord> {
        self.state.lock().await.current.clone()
    }

    pub async fn commits_for(&self, round_id: RoundId) -> Vec<CommitRecord> {
        self.state
            .lock()
            .await
            .history
            .get(&round_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn committed_rounds(&self) -> Vec<RoundId> {
        self.state.lock().await.history.keys().copied().collect()
    }

    pub async fn submission_count(&self) -> u64 {
        self.state.lock().await.submissions
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn submit_batch(&self, signed: &SignedPayload) -> Result<TxId, LedgerError> {
        let mut state = self.state.lock().await;
        state.submissions += 1;

        let bytes = signed.payload_bytes()?;
        let payload = BatchPayload::decode(&bytes)
            .ok_or_else(|| LedgerError::Rejected("malformed payload".to_string()))?;
        if payload.round_id != signed.round_id {
            return Err(LedgerError::Rejected("round id mismatch".to_string()));
        }

        let signature = Signature::from_str(&signed.signature)
            .map_err(|e| LedgerError::Rejected(format!("bad signature: {}", e)))?;
        let message = SignedPayload::signing_bytes(&bytes, &signed.nonce);
        if !verify_signature(&message, &signature, signed.signer) {
            return Err(LedgerError::Rejected("signature does not match signer".to_string()));
        }
        if !state.stake.iter().any(|e| e.node_id == signed.signer && e.stake > 0) {
            return Err(LedgerError::Rejected("signer is not staked".to_string()));
        }
        let fresh = state.issued_nonces.contains(&signed.nonce)
            && state.used_nonces.insert(signed.nonce.clone());
        if !fresh {
            return Err(LedgerError::Rejected("nonce unknown or already used".to_string()));
        }

        state.next_tx += 1;
        let tx_id = format!("tx-{:08}", state.next_tx);

        if state.silent.contains(&signed.signer) {
            state.txs.insert(tx_id.clone(), TxStatus::Pending);
            return Ok(tx_id);
        }
        if state.rejecting.contains(&signed.signer) {
            state.txs.insert(
                tx_id.clone(),
                TxStatus::Rejected {
                    reason: "submitter refused".to_string(),
                },
            );
            return Ok(tx_id);
        }

        let stale = state
            .current
            .as_ref()
            .map(|c| payload.round_id <= c.round_id)
            .unwrap_or(false);
        if stale {
            state.txs.insert(
                tx_id.clone(),
                TxStatus::Rejected {
                    reason: "stale round".to_string(),
                },
            );
            return Ok(tx_id);
        }

        let record = CommitRecord {
            round_id: payload.round_id,
            merkle_root: payload.merkle_root,
            feed_count: payload.feed_count,
            submitter: signed.signer,
            tx_id: tx_id.clone(),
        };
        state
            .history
            .entry(payload.round_id)
            .or_default()
            .push(record.clone());
        state.current = Some(record);
        state.txs.insert(tx_id.clone(), TxStatus::Confirmed);
        Ok(tx_id)
    }

    async fn transaction_status(&self, tx_id: &TxId) -> Result<TxStatus, LedgerError> {
        self.state
            .lock()
            .await
            .txs
            .get(tx_id)
            .cloned()
            .ok_or_else(|| LedgerError::InvalidResponse(format!("unknown transaction {}", tx_id)))
    }

    async fn latest_nonce(&self) -> Result<String, LedgerError> {
        let mut state = self.state.lock().await;
        state.next_nonce += 1;
        let nonce = format!("{:016x}", state.next_nonce);
        state.issued_nonces.insert(nonce.clone());
        Ok(nonce)
    }

    async fn get_stake_table(&self) -> Result<Vec<StakeEntry>, LedgerError> {
        Ok(self.state.lock().await.stake.clone())
    }

    async fn get_current_round_anchor(&self) -> Result<RoundId, LedgerError> {
        let state = self.state.lock().await;
        if state.anchor_unavailable {
            return Err(LedgerError::Transport("anchor unavailable".to_string()));
        }
        // The round after the last committed one, never below the configured anchor
        let next = state.current.as_ref().map(|c| c.round_id + 1).unwrap_or(0);
        Ok(state.anchor.max(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::identity::NodeIdentity;
    use crate::sequencer::{Sequencer, SequencerSettings};
    use crate::types::{AggregatedPrice, AssetId, SubmissionOutcome};
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    fn batch(round_id: RoundId) -> Batch {
        Batch::build(
            round_id,
            vec![AggregatedPrice {
                asset_id: AssetId::new("BTC/USD").unwrap(),
                price: dec!(65005.25),
                confidence_interval: dec!(7.78365),
                contributing_exchange_count: 2,
                round_id,
            }],
        )
        .unwrap()
    }

    fn sequencer(ledger: Arc<InMemoryLedger>, identity: NodeIdentity) -> Sequencer {
        Sequencer::new(
            ledger,
            identity,
            SequencerSettings {
                confirm_timeout: Duration::from_millis(50),
                status_poll: Duration::from_millis(5),
            },
        )
    }

    #[tokio::test]
    async fn test_commit_overwrites_current_record() {
        let identity = NodeIdentity::random();
        let ledger = Arc::new(InMemoryLedger::new(
            vec![StakeEntry { node_id: identity.node_id(), stake: 10 }],
            7,
        ));
        let sequencer = sequencer(Arc::clone(&ledger), identity.clone());

        assert_eq!(ledger.get_current_round_anchor().await.unwrap(), 7);
        let receipt = sequencer.submit(&batch(7), 0).await;
        assert_eq!(receipt.outcome, SubmissionOutcome::Confirmed);
        assert_eq!(ledger.get_current_round_anchor().await.unwrap(), 8);

        let receipt = sequencer.submit(&batch(8), 0).await;
        assert_eq!(receipt.outcome, SubmissionOutcome::Confirmed);
        let current = ledger.current().await.unwrap();
        assert_eq!(current.round_id, 8);
        assert_eq!(current.submitter, identity.node_id());
        assert_eq!(ledger.committed_rounds().await, vec![7, 8]);
    }

    #[tokio::test]
    async fn test_stale_round_rejected_on_chain() {
        let identity = NodeIdentity::random();
        let ledger = Arc::new(InMemoryLedger::new(
            vec![StakeEntry { node_id: identity.node_id(), stake: 10 }],
            0,
        ));
        let sequencer = sequencer(Arc::clone(&ledger), identity);
        sequencer.submit(&batch(5), 0).await;

        let receipt = sequencer.submit(&batch(5), 1).await;
        assert_eq!(
            receipt.outcome,
            SubmissionOutcome::Rejected { reason: "stale round".to_string() }
        );
        assert_eq!(ledger.commits_for(5).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unstaked_signer_refused() {
        let staked = NodeIdentity::random();
        let outsider = NodeIdentity::random();
        let ledger = Arc::new(InMemoryLedger::new(
            vec![StakeEntry { node_id: staked.node_id(), stake: 10 }],
            0,
        ));
        let receipt = sequencer(Arc::clone(&ledger), outsider).submit(&batch(1), 0).await;
        assert!(matches!(receipt.outcome, SubmissionOutcome::Rejected { .. }));
        assert!(ledger.current().await.is_none());
    }

    #[tokio::test]
    async fn test_silenced_node_times_out_after_resubmission() {
        let identity = NodeIdentity::random();
        let ledger = Arc::new(InMemoryLedger::new(
            vec![StakeEntry { node_id: identity.node_id(), stake: 10 }],
            0,
        ));
        ledger.silence(identity.node_id()).await;
        let receipt = sequencer(Arc::clone(&ledger), identity).submit(&batch(1), 0).await;
        assert_eq!(receipt.outcome, SubmissionOutcome::TimedOut);
        assert_eq!(ledger.submission_count().await, 2);
        assert!(ledger.current().await.is_none());
    }

    #[tokio::test]
    async fn test_nonce_cannot_be_reused() {
        let identity = NodeIdentity::random();
        let ledger = InMemoryLedger::new(
            vec![StakeEntry { node_id: identity.node_id(), stake: 10 }],
            0,
        );
        let payload = crate::sequencer::BatchPayload::from_batch(&batch(3)).encode();
        let nonce = ledger.latest_nonce().await.unwrap();
        let signature = identity
            .sign(&SignedPayload::signing_bytes(&payload, &nonce))
            .unwrap();
        let signed = SignedPayload {
            round_id: 3,
            payload: hex::encode(payload),
            nonce,
            signer: identity.node_id(),
            signature: hex::encode(signature.to_vec()),
        };
        assert!(ledger.submit_batch(&signed).await.is_ok());
        assert!(matches!(
            ledger.submit_batch(&signed).await,
            Err(LedgerError::Rejected(_))
        ));
    }
}
