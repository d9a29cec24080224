//! Gossip between oracle nodes
//!
//! Nodes exchange three kinds of signed messages: the batch root each node
//! computed for a round, the acting leader's claim for an attempt, and the
//! leader's submission outcome. Nothing reaches consensus before the
//! listener has checked that the sender is staked and that the signature
//! recovers to it.

mod local;
mod tcp;

pub use local::{LocalGossip, LocalGossipHub};
pub use tcp::TcpGossip;

use async_trait::async_trait;
use ethers::types::Signature;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::batch::merkle::hex_hash;
use crate::batch::Hash;
use crate::identity::{verify_signature, NodeIdentity};
use crate::stake::StakeSnapshot;
use crate::types::{NodeId, RoundId, SubmissionOutcome, TxId};

const DOMAIN_TAG: &[u8] = b"oracle-gossip-v1";

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("no peer reachable")]
    NoPeerReachable,
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipPayload {
    /// Root a node computed locally after collection
    RootAnnouncement {
        round_id: RoundId,
        #[serde(with = "hex_hash")]
        batch_root: Hash,
        feed_count: u32,
    },
    /// Acting leader's root for one attempt
    BatchClaim {
        round_id: RoundId,
        attempt: u32,
        #[serde(with = "hex_hash")]
        batch_root: Hash,
    },
    /// Acting leader's submission result
    SubmissionOutcome {
        round_id: RoundId,
        attempt: u32,
        outcome: SubmissionOutcome,
        ledger_tx_id: Option<TxId>,
    },
}

impl GossipPayload {
    pub fn round_id(&self) -> RoundId {
        match self {
            GossipPayload::RootAnnouncement { round_id, .. }
            | GossipPayload::BatchClaim { round_id, .. }
            | GossipPayload::SubmissionOutcome { round_id, .. } => *round_id,
        }
    }

    /// Fixed binary encoding covered by the signature
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(DOMAIN_TAG);
        match self {
            GossipPayload::RootAnnouncement {
                round_id,
                batch_root,
                feed_count,
            } => {
                out.push(0x01);
                out.extend_from_slice(&round_id.to_le_bytes());
                out.extend_from_slice(batch_root);
                out.extend_from_slice(&feed_count.to_le_bytes());
            }
            GossipPayload::BatchClaim {
                round_id,
                attempt,
                batch_root,
            } => {
                out.push(0x02);
                out.extend_from_slice(&round_id.to_le_bytes());
                out.extend_from_slice(&attempt.to_le_bytes());
                out.extend_from_slice(batch_root);
            }
            GossipPayload::SubmissionOutcome {
                round_id,
                attempt,
                outcome,
                ledger_tx_id,
            } => {
                out.push(0x03);
                out.extend_from_slice(&round_id.to_le_bytes());
                out.extend_from_slice(&attempt.to_le_bytes());
                match outcome {
                    SubmissionOutcome::Confirmed => out.push(0),
                    SubmissionOutcome::Rejected { reason } => {
                        out.push(1);
                        push_prefixed(&mut out, reason.as_bytes());
                    }
                    SubmissionOutcome::TimedOut => out.push(2),
                }
                match ledger_tx_id {
                    Some(tx) => {
                        out.push(1);
                        push_prefixed(&mut out, tx.as_bytes());
                    }
                    None => out.push(0),
                }
            }
        }
        out
    }
}

fn push_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&bytes[..len as usize]);
}

/// Payload plus sender and signature, as sent on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub sender: NodeId,
    pub payload: GossipPayload,
    /// Hex of the 65-byte signature over `payload.canonical_bytes()`
    pub signature: String,
}

impl SignedMessage {
    pub fn sign(identity: &NodeIdentity, payload: GossipPayload) -> Result<Self, GossipError> {
        let signature = identity
            .sign(&payload.canonical_bytes())
            .map_err(|e| GossipError::Signing(e.to_string()))?;
        Ok(Self {
            sender: identity.node_id(),
            payload,
            signature: hex::encode(signature.to_vec()),
        })
    }

    /// True when the signature recovers to `sender`
    pub fn verify(&self) -> bool {
        match Signature::from_str(&self.signature) {
            Ok(signature) => {
                verify_signature(&self.payload.canonical_bytes(), &signature, self.sender)
            }
            Err(_) => false,
        }
    }
}

/// Message that passed membership and signature checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    pub sender: NodeId,
    pub payload: GossipPayload,
}

/// Outbound side of a gossip transport
#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Send to every peer; returns how many peers took the message
    async fn broadcast(&self, message: &SignedMessage) -> Result<usize, GossipError>;
}

/// Why the listener dropped a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    OwnMessage,
    UnknownSender,
    BadSignature,
}

/// Membership and signature check against the current stake table
pub fn check_message(
    message: &SignedMessage,
    stake: &StakeSnapshot,
    self_id: NodeId,
) -> Result<PeerMessage, Rejection> {
    if message.sender == self_id {
        return Err(Rejection::OwnMessage);
    }
    if !stake.contains(&message.sender) {
        return Err(Rejection::UnknownSender);
    }
    if !message.verify() {
        return Err(Rejection::BadSignature);
    }
    Ok(PeerMessage {
        sender: message.sender,
        payload: message.payload.clone(),
    })
}

/// Verify inbound messages and forward the valid ones until shutdown
pub async fn run_listener(
    mut inbound: mpsc::Receiver<SignedMessage>,
    stake: watch::Receiver<StakeSnapshot>,
    self_id: NodeId,
    out: mpsc::Sender<PeerMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut dropped: u64 = 0;
    loop {
        let message = tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let checked = check_message(&message, &stake.borrow(), self_id);
        match checked {
            Ok(peer_message) => {
                if out.send(peer_message).await.is_err() {
                    break;
                }
            }
            Err(Rejection::OwnMessage) => {}
            Err(reason) => {
                dropped += 1;
                warn!(
                    sender = ?message.sender,
                    round_id = message.payload.round_id(),
                    ?reason,
                    dropped,
                    "Dropped gossip message"
                );
            }
        }
    }
    debug!("Gossip listener stopped");
}
