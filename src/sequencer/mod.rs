//! Sequencer / Submitter
//!
//! Turns the acting leader's batch into one signed ledger transaction and
//! follows it to a terminal outcome:
//! - confirmation is awaited up to `confirm_timeout`
//! - on timeout the record is resubmitted once with a fresh nonce
//! - an explicit rejection is final and never retried
//!
//! Only the in-flight attempt is held; the receipt goes back to the round
//! driver over a channel.

mod payload;

pub use payload::{BatchPayload, PAYLOAD_LEN};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::batch::Batch;
use crate::config::SequencerConfig;
use crate::identity::NodeIdentity;
use crate::ledger::{LedgerClient, LedgerError, SignedPayload, TxStatus};
use crate::types::{RoundId, SubmissionOutcome, SubmissionReceipt, TxId};

/// Total ledger transactions allowed per attempt (first try plus one resubmission)
const MAX_SUBMISSIONS: usize = 2;

#[derive(Debug, Clone)]
pub struct SequencerSettings {
    pub confirm_timeout: Duration,
    pub status_poll: Duration,
}

impl From<&SequencerConfig> for SequencerSettings {
    fn from(config: &SequencerConfig) -> Self {
        Self {
            confirm_timeout: config.confirm_timeout(),
            status_poll: config.status_poll(),
        }
    }
}

enum PollResult {
    Confirmed(TxId),
    Rejected(TxId, String),
    Pending,
}

/// Submits batches on behalf of this node
pub struct Sequencer {
    ledger: Arc<dyn LedgerClient>,
    identity: NodeIdentity,
    settings: SequencerSettings,
}

impl Sequencer {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        identity: NodeIdentity,
        settings: SequencerSettings,
    ) -> Self {
        Self {
            ledger,
            identity,
            settings,
        }
    }

    /// Submit `batch` and wait for a terminal outcome
    pub async fn submit(&self, batch: &Batch, attempt: u32) -> SubmissionReceipt {
        let round_id = batch.round_id;
        let payload = BatchPayload::from_batch(batch).encode();
        let mut submitted: Vec<TxId> = Vec::new();

        for try_index in 0..MAX_SUBMISSIONS {
            match self.send(round_id, &payload).await {
                Ok(tx_id) => {
                    info!(
                        round_id,
                        attempt,
                        tx = %tx_id,
                        root = %batch.root_hex(),
                        feeds = batch.feed_count(),
                        resubmission = try_index > 0,
                        "📤 Batch submitted"
                    );
                    submitted.push(tx_id);
                }
                Err(LedgerError::Rejected(reason)) => {
                    warn!(round_id, attempt, reason = %reason, "❌ Submission rejected");
                    return receipt(round_id, attempt, None, rejected(reason));
                }
                Err(e) => {
                    warn!(round_id, attempt, error = %e, "Submission failed to reach ledger");
                }
            }

            match self.await_confirmation(&submitted).await {
                PollResult::Confirmed(tx_id) => {
                    info!(round_id, attempt, tx = %tx_id, "✅ Batch confirmed");
                    return receipt(round_id, attempt, Some(tx_id), SubmissionOutcome::Confirmed);
                }
                PollResult::Rejected(tx_id, reason) => {
                    warn!(round_id, attempt, tx = %tx_id, reason = %reason, "❌ Batch rejected on-chain");
                    return receipt(round_id, attempt, Some(tx_id), rejected(reason));
                }
                PollResult::Pending if try_index + 1 < MAX_SUBMISSIONS => {
                    warn!(round_id, attempt, "⏱️ Confirmation timed out, resubmitting with fresh nonce");
                }
                PollResult::Pending => {}
            }
        }

        warn!(round_id, attempt, "⏱️ Submission timed out");
        receipt(round_id, attempt, submitted.pop(), SubmissionOutcome::TimedOut)
    }

    /// Fetch a nonce, sign `payload || nonce` and hand it to the ledger
    async fn send(&self, round_id: RoundId, payload: &[u8]) -> Result<TxId, LedgerError> {
        let nonce = self.ledger.latest_nonce().await?;
        let message = SignedPayload::signing_bytes(payload, &nonce);
        let signature = self
            .identity
            .sign(&message)
            .map_err(|e| LedgerError::Rejected(e.to_string()))?;

        let signed = SignedPayload {
            round_id,
            payload: hex::encode(payload),
            nonce,
            signer: self.identity.node_id(),
            signature: hex::encode(signature.to_vec()),
        };
        self.ledger.submit_batch(&signed).await
    }

    /// Poll every transaction sent so far until one is terminal or the timeout passes
    async fn await_confirmation(&self, submitted: &[TxId]) -> PollResult {
        if submitted.is_empty() {
            return PollResult::Pending;
        }
        let deadline = Instant::now() + self.settings.confirm_timeout;
        loop {
            for tx_id in submitted.iter().rev() {
                match self.ledger.transaction_status(tx_id).await {
                    Ok(TxStatus::Confirmed) => return PollResult::Confirmed(tx_id.clone()),
                    Ok(TxStatus::Rejected { reason }) => {
                        return PollResult::Rejected(tx_id.clone(), reason)
                    }
                    Ok(TxStatus::Pending) => {}
                    Err(e) => debug!(tx = %tx_id, error = %e, "Status poll failed"),
                }
            }
            if Instant::now() + self.settings.status_poll > deadline {
                return PollResult::Pending;
            }
            sleep(self.settings.status_poll).await;
        }
    }

    /// Run `submit` on its own task; the receipt is sent on `receipts` unless cancelled first
    pub fn spawn(
        self: &Arc<Self>,
        batch: Batch,
        attempt: u32,
        receipts: mpsc::Sender<SubmissionReceipt>,
    ) -> InFlightSubmission {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let round_id = batch.round_id;
        let sequencer = Arc::clone(self);

        let handle = tokio::spawn(async move {
            tokio::select! {
                receipt = sequencer.submit(&batch, attempt) => {
                    if receipts.send(receipt).await.is_err() {
                        debug!(round_id, attempt, "Receipt dropped, driver gone");
                    }
                }
                _ = cancel_rx => {
                    info!(round_id, attempt, "🛑 In-flight submission cancelled");
                }
            }
        });

        InFlightSubmission {
            round_id,
            attempt,
            cancel: Some(cancel_tx),
            handle,
        }
    }
}

fn rejected(reason: String) -> SubmissionOutcome {
    SubmissionOutcome::Rejected { reason }
}

fn receipt(
    round_id: RoundId,
    attempt: u32,
    ledger_tx_id: Option<TxId>,
    outcome: SubmissionOutcome,
) -> SubmissionReceipt {
    SubmissionReceipt {
        round_id,
        attempt,
        ledger_tx_id,
        outcome,
    }
}

/// Handle on the single submission a node may have in flight
///
/// Dropping the handle cancels the submission too.
#[derive(Debug)]
pub struct InFlightSubmission {
    pub round_id: RoundId,
    pub attempt: u32,
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl InFlightSubmission {
    /// Stop polling and resubmitting; a transaction already accepted by the ledger stays there
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
