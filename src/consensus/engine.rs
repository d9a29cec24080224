//! Consensus Engine
//!
//! Pure per-round state machine. Inputs are local results, verified peer
//! messages, sequencer receipts and timer expiries; outputs are `Action`s
//! the round driver carries out. No I/O happens here.
//!
//! Round lifecycle: `Collecting -> LeaderElected -> Submitting -> Committed | Failed`.
//! A failed attempt promotes the next leader in the schedule and re-enters
//! `LeaderElected` with a higher attempt number. The round itself only
//! fails once the schedule is exhausted, it is superseded, or an operator
//! restarts it. Terminal rounds are never reopened.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::{debug, info, warn};

use super::election::leader_schedule;
use super::faults::{FaultKind, FaultLedger};
use crate::batch::Hash;
use crate::stake::StakeSnapshot;
use crate::types::{hex_digest, NodeId, RoundId, SubmissionOutcome, SubmissionReceipt, TxId};

/// Finalized rounds kept for status output
pub const MAX_HISTORY: usize = 32;

/// Peer messages held for rounds this node has not started yet
pub const MAX_EARLY_MESSAGES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Collecting,
    LeaderElected,
    Submitting,
    Committed,
    Failed,
}

impl RoundStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundStatus::Committed | RoundStatus::Failed)
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundStatus::Collecting => "COLLECTING",
            RoundStatus::LeaderElected => "LEADER_ELECTED",
            RoundStatus::Submitting => "SUBMITTING",
            RoundStatus::Committed => "COMMITTED",
            RoundStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Why a round ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    FallbacksExhausted,
    Superseded { by: RoundId },
    ManualRestart,
    NoStake,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::FallbacksExhausted => write!(f, "fallbacks exhausted"),
            FailureReason::Superseded { by } => write!(f, "superseded by round {}", by),
            FailureReason::ManualRestart => write!(f, "manual restart"),
            FailureReason::NoStake => write!(f, "no staked nodes"),
        }
    }
}

/// How one leader attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Confirmed,
    Rejected { reason: String },
    TimedOut,
    /// No claim or outcome before the attempt deadline
    LeaderUnresponsive,
    /// Leader had nothing to publish
    NoBatch,
    /// Peers had already moved past this attempt
    Skipped,
}

impl From<&SubmissionOutcome> for AttemptOutcome {
    fn from(outcome: &SubmissionOutcome) -> Self {
        match outcome {
            SubmissionOutcome::Confirmed => AttemptOutcome::Confirmed,
            SubmissionOutcome::Rejected { reason } => AttemptOutcome::Rejected {
                reason: reason.clone(),
            },
            SubmissionOutcome::TimedOut => AttemptOutcome::TimedOut,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub leader: NodeId,
    pub outcome: AttemptOutcome,
}

/// Acting leader's claim for the current attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub leader: NodeId,
    pub attempt: u32,
    pub root: Hash,
    /// `None` until a local root exists to compare against
    pub endorsed: Option<bool>,
}

/// Stake-weighted view of how many peers announced our root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Agreement {
    pub matching_stake: u128,
    pub total_stake: u128,
    pub announcements: usize,
}

#[derive(Debug, Clone)]
pub struct RoundState {
    pub round_id: RoundId,
    pub status: RoundStatus,
    pub stake_snapshot: StakeSnapshot,
    /// Leader order for this round (elected first, then fallbacks)
    pub schedule: Vec<NodeId>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub local_root: Option<Hash>,
    pub local_feed_count: u32,
    pub claim: Option<Claim>,
    /// Root each acting leader claimed, by attempt
    pub claimed_roots: BTreeMap<u32, Hash>,
    pub announcements: BTreeMap<NodeId, Hash>,
    pub attempts: Vec<AttemptRecord>,
    pub failure: Option<FailureReason>,
    pub committed_tx: Option<TxId>,
    pub committed_by: Option<NodeId>,
    /// Root that went on-chain, when known
    pub committed_root: Option<Hash>,
    pub started_at: DateTime<Utc>,
}

impl RoundState {
    /// Leader of the current attempt
    pub fn leader_node_id(&self) -> Option<NodeId> {
        self.schedule.get(self.attempt as usize).copied()
    }

    fn leader_for(&self, attempt: u32) -> Option<NodeId> {
        if attempt >= self.max_attempts {
            return None;
        }
        self.schedule.get(attempt as usize).copied()
    }

    pub fn agreement(&self, self_id: NodeId) -> Agreement {
        let total_stake = self.stake_snapshot.total();
        let Some(local) = self.local_root else {
            return Agreement {
                matching_stake: 0,
                total_stake,
                announcements: self.announcements.len(),
            };
        };
        let mut matching_stake = u128::from(self.stake_snapshot.stake_of(&self_id));
        for (node, root) in &self.announcements {
            if *node != self_id && *root == local {
                matching_stake += u128::from(self.stake_snapshot.stake_of(node));
            }
        }
        Agreement {
            matching_stake,
            total_stake,
            announcements: self.announcements.len(),
        }
    }
}

/// Final result of a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RoundOutcome {
    Committed,
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundSummary {
    pub round_id: RoundId,
    #[serde(flatten)]
    pub outcome: RoundOutcome,
    /// Committing leader, or the last leader tried
    pub leader: Option<NodeId>,
    pub attempt: u32,
    pub merkle_root: Option<String>,
    pub feed_count: u32,
    pub ledger_tx_id: Option<TxId>,
    pub finalized_at: DateTime<Utc>,
}

impl RoundSummary {
    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, RoundOutcome::Committed)
    }
}

/// Work for the round driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    BroadcastClaim {
        round_id: RoundId,
        attempt: u32,
        root: Hash,
    },
    /// Hand this round's batch to the sequencer
    Submit { round_id: RoundId, attempt: u32 },
    BroadcastOutcome {
        round_id: RoundId,
        attempt: u32,
        outcome: SubmissionOutcome,
        ledger_tx_id: Option<TxId>,
    },
    /// Start the deadline for `attempt`
    ArmAttemptTimer {
        round_id: RoundId,
        attempt: u32,
        leader: NodeId,
    },
    CancelSubmission { round_id: RoundId },
    Finalized(RoundSummary),
}

/// Verified peer message for a round that has not started locally
#[derive(Debug, Clone, PartialEq, Eq)]
enum EarlyMessage {
    Claim {
        sender: NodeId,
        round_id: RoundId,
        attempt: u32,
        root: Hash,
    },
    Announcement {
        sender: NodeId,
        round_id: RoundId,
        root: Hash,
    },
    Outcome {
        sender: NodeId,
        round_id: RoundId,
        attempt: u32,
        outcome: SubmissionOutcome,
        ledger_tx_id: Option<TxId>,
    },
}

impl EarlyMessage {
    fn round_id(&self) -> RoundId {
        match self {
            EarlyMessage::Claim { round_id, .. }
            | EarlyMessage::Announcement { round_id, .. }
            | EarlyMessage::Outcome { round_id, .. } => *round_id,
        }
    }
}

/// Lifetime round totals; never reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoundCounters {
    pub started: u64,
    pub committed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("round {round_id} is not newer than {latest}")]
    StaleRound { round_id: RoundId, latest: RoundId },
    #[error("no live round")]
    NoLiveRound,
    #[error("round {found} is not the live round {live}")]
    RoundMismatch { live: RoundId, found: RoundId },
    #[error("cannot {event} while {status}")]
    InvalidTransition {
        status: RoundStatus,
        event: &'static str,
    },
}

pub struct ConsensusEngine {
    self_id: NodeId,
    max_fallback_attempts: u32,
    live: Option<RoundState>,
    last_finalized: Option<RoundId>,
    last_commit: Option<RoundSummary>,
    history: VecDeque<RoundSummary>,
    faults: FaultLedger,
    early: VecDeque<EarlyMessage>,
    counters: RoundCounters,
}

impl ConsensusEngine {
    pub fn new(self_id: NodeId, max_fallback_attempts: u32) -> Self {
        Self {
            self_id,
            max_fallback_attempts,
            live: None,
            last_finalized: None,
            last_commit: None,
            history: VecDeque::with_capacity(MAX_HISTORY),
            faults: FaultLedger::default(),
            early: VecDeque::new(),
            counters: RoundCounters::default(),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    pub fn live(&self) -> Option<&RoundState> {
        self.live.as_ref()
    }

    pub fn last_finalized(&self) -> Option<RoundId> {
        self.last_finalized
    }

    pub fn last_commit(&self) -> Option<&RoundSummary> {
        self.last_commit.as_ref()
    }

    pub fn history(&self) -> impl DoubleEndedIterator<Item = &RoundSummary> {
        self.history.iter()
    }

    pub fn faults(&self) -> &FaultLedger {
        &self.faults
    }

    pub fn counters(&self) -> RoundCounters {
        self.counters
    }

    /// Number of peer messages waiting for their round to start
    pub fn early_messages(&self) -> usize {
        self.early.len()
    }

    /// Highest round id this node has started or finalized
    pub fn latest_round(&self) -> Option<RoundId> {
        let live = self.live.as_ref().map(|r| r.round_id);
        live.max(self.last_finalized)
    }

    fn ensure_fresh(&self, round_id: RoundId) -> Result<(), ConsensusError> {
        match self.last_finalized {
            Some(latest) if round_id <= latest => Err(ConsensusError::StaleRound { round_id, latest }),
            _ => Ok(()),
        }
    }

    /// Open `round_id` in `Collecting`; an unfinished older round is superseded
    pub fn begin_round(
        &mut self,
        round_id: RoundId,
        stake: StakeSnapshot,
    ) -> Result<Vec<Action>, ConsensusError> {
        self.ensure_fresh(round_id)?;
        let mut actions = Vec::new();
        if let Some(live) = &self.live {
            if round_id <= live.round_id {
                return Err(ConsensusError::StaleRound {
                    round_id,
                    latest: live.round_id,
                });
            }
            if !live.status.is_terminal() {
                actions.extend(self.fail_live(FailureReason::Superseded { by: round_id }));
            }
        }

        let schedule = leader_schedule(round_id, &stake);
        let max_attempts = (self.max_fallback_attempts as usize + 1).min(schedule.len()) as u32;
        info!(
            round_id,
            leader = ?schedule.first(),
            max_attempts,
            stake_version = stake.version(),
            "🟢 Round started"
        );

        self.live = Some(RoundState {
            round_id,
            status: RoundStatus::Collecting,
            stake_snapshot: stake,
            schedule,
            attempt: 0,
            max_attempts,
            local_root: None,
            local_feed_count: 0,
            claim: None,
            claimed_roots: BTreeMap::new(),
            announcements: BTreeMap::new(),
            attempts: Vec::new(),
            failure: None,
            committed_tx: None,
            committed_by: None,
            committed_root: None,
            started_at: Utc::now(),
        });
        self.counters.started += 1;

        if max_attempts == 0 {
            actions.extend(self.fail_live(FailureReason::NoStake));
        }
        actions.extend(self.replay_early(round_id));
        Ok(actions)
    }

    /// Store this node's root for the live round (`None` when nothing qualified)
    pub fn record_local_batch(
        &mut self,
        round_id: RoundId,
        root: Option<Hash>,
        feed_count: u32,
    ) -> Result<(), ConsensusError> {
        let live = self.live_mut(round_id)?;
        if live.status.is_terminal() {
            // Peers closed the round before collection finished here
            debug!(round_id, status = %live.status, "Local batch for a finalized round not recorded");
            return Ok(());
        }
        live.local_root = root;
        live.local_feed_count = feed_count;
        Ok(())
    }

    /// Collection finished: elect and start the current attempt
    pub fn elect(&mut self, round_id: RoundId) -> Result<Vec<Action>, ConsensusError> {
        let live = self.live_mut(round_id)?;
        match live.status {
            RoundStatus::Collecting => {}
            // A peer's outcome already closed the round while collecting
            status if status.is_terminal() => return Ok(Vec::new()),
            status => {
                return Err(ConsensusError::InvalidTransition {
                    status,
                    event: "elect",
                })
            }
        }
        Ok(self.start_attempt())
    }

    /// Verified `BatchClaim` from a peer
    pub fn on_claim(
        &mut self,
        sender: NodeId,
        round_id: RoundId,
        attempt: u32,
        root: Hash,
    ) -> Result<Vec<Action>, ConsensusError> {
        self.ensure_fresh(round_id)?;
        let mut actions = self.observe_round(round_id);
        if self.is_ahead(round_id) {
            self.hold(EarlyMessage::Claim {
                sender,
                round_id,
                attempt,
                root,
            });
            return Ok(actions);
        }

        let Some(live) = self.live.as_mut().filter(|l| l.round_id == round_id) else {
            return Ok(actions);
        };
        if live.status.is_terminal() {
            return Ok(actions);
        }
        if live.leader_for(attempt) != Some(sender) {
            self.faults
                .record(sender, round_id, FaultKind::NotLeader { attempt });
            return Ok(actions);
        }
        live.claimed_roots.insert(attempt, root);
        if attempt < live.attempt {
            debug!(round_id, attempt, current = live.attempt, "Claim for past attempt ignored");
            return Ok(actions);
        }
        if attempt > live.attempt {
            actions.extend(self.fast_forward(attempt));
        }

        let self_id = self.self_id;
        let Some(live) = self.live.as_mut().filter(|l| !l.status.is_terminal()) else {
            return Ok(actions);
        };
        live.claim = Some(Claim {
            leader: sender,
            attempt,
            root,
            endorsed: None,
        });
        if live.status != RoundStatus::Collecting && sender != self_id {
            self.validate_claim();
        }
        Ok(actions)
    }

    /// Verified `RootAnnouncement` from a peer (agreement tally only)
    pub fn on_announcement(
        &mut self,
        sender: NodeId,
        round_id: RoundId,
        root: Hash,
    ) -> Result<Vec<Action>, ConsensusError> {
        self.ensure_fresh(round_id)?;
        let actions = self.observe_round(round_id);
        if self.is_ahead(round_id) {
            self.hold(EarlyMessage::Announcement {
                sender,
                round_id,
                root,
            });
            return Ok(actions);
        }
        if let Some(live) = self.live.as_mut().filter(|l| l.round_id == round_id) {
            live.announcements.insert(sender, root);
        }
        Ok(actions)
    }

    /// Receipt from this node's own sequencer
    pub fn on_receipt(&mut self, receipt: &SubmissionReceipt) -> Result<Vec<Action>, ConsensusError> {
        let self_id = self.self_id;
        let live = self.live_mut(receipt.round_id)?;
        if live.status != RoundStatus::Submitting
            || live.attempt != receipt.attempt
            || live.leader_node_id() != Some(self_id)
        {
            return Err(ConsensusError::InvalidTransition {
                status: live.status,
                event: "accept receipt",
            });
        }

        let mut actions = vec![Action::BroadcastOutcome {
            round_id: receipt.round_id,
            attempt: receipt.attempt,
            outcome: receipt.outcome.clone(),
            ledger_tx_id: receipt.ledger_tx_id.clone(),
        }];
        if receipt.outcome.is_confirmed() {
            actions.extend(self.commit(self_id, receipt.attempt, receipt.ledger_tx_id.clone()));
        } else {
            actions.extend(self.advance_attempt(AttemptOutcome::from(&receipt.outcome)));
        }
        Ok(actions)
    }

    /// Verified `SubmissionOutcome` from a peer leader
    pub fn on_peer_outcome(
        &mut self,
        sender: NodeId,
        round_id: RoundId,
        attempt: u32,
        outcome: &SubmissionOutcome,
        ledger_tx_id: Option<TxId>,
    ) -> Result<Vec<Action>, ConsensusError> {
        self.ensure_fresh(round_id)?;
        let mut actions = self.observe_round(round_id);
        if self.is_ahead(round_id) {
            self.hold(EarlyMessage::Outcome {
                sender,
                round_id,
                attempt,
                outcome: outcome.clone(),
                ledger_tx_id,
            });
            return Ok(actions);
        }

        let Some(live) = self.live.as_ref().filter(|l| l.round_id == round_id) else {
            return Ok(actions);
        };
        if live.status.is_terminal() {
            return Ok(actions);
        }
        if live.leader_for(attempt) != Some(sender) {
            self.faults
                .record(sender, round_id, FaultKind::NotLeader { attempt });
            return Ok(actions);
        }

        if outcome.is_confirmed() {
            // Late confirmations from an earlier leader still close the round
            if live.status == RoundStatus::Submitting {
                actions.push(Action::CancelSubmission { round_id });
            }
            actions.extend(self.commit(sender, attempt, ledger_tx_id));
            return Ok(actions);
        }

        if attempt < live.attempt {
            return Ok(actions);
        }
        if attempt > live.attempt {
            actions.extend(self.fast_forward(attempt));
        }
        if self.live.as_ref().map(|l| l.status.is_terminal()).unwrap_or(true) {
            return Ok(actions);
        }
        info!(round_id, attempt, leader = ?sender, %outcome, "Leader reported failed attempt");
        actions.extend(self.advance_attempt(AttemptOutcome::from(outcome)));
        Ok(actions)
    }

    /// Deadline for `attempt` passed
    pub fn on_attempt_timeout(
        &mut self,
        round_id: RoundId,
        attempt: u32,
    ) -> Result<Vec<Action>, ConsensusError> {
        let self_id = self.self_id;
        let live = self.live_mut(round_id)?;
        if live.status.is_terminal()
            || live.status == RoundStatus::Collecting
            || live.attempt != attempt
        {
            return Ok(Vec::new());
        }
        let Some(leader) = live.leader_node_id() else {
            return Ok(Vec::new());
        };

        let mut actions = Vec::new();
        if leader == self_id {
            if live.status == RoundStatus::Submitting {
                actions.push(Action::CancelSubmission { round_id });
            }
            actions.push(Action::BroadcastOutcome {
                round_id,
                attempt,
                outcome: SubmissionOutcome::TimedOut,
                ledger_tx_id: None,
            });
            actions.extend(self.advance_attempt(AttemptOutcome::TimedOut));
        } else {
            warn!(round_id, attempt, leader = ?leader, "⏱️ Leader attempt expired");
            self.faults
                .record(leader, round_id, FaultKind::LeaderUnresponsive { attempt });
            actions.extend(self.advance_attempt(AttemptOutcome::LeaderUnresponsive));
        }
        Ok(actions)
    }

    /// Operator-requested restart of the live round
    pub fn restart(&mut self) -> Result<Vec<Action>, ConsensusError> {
        let live = self.live.as_ref().ok_or(ConsensusError::NoLiveRound)?;
        if live.status.is_terminal() {
            return Err(ConsensusError::InvalidTransition {
                status: live.status,
                event: "restart",
            });
        }
        Ok(self.fail_live(FailureReason::ManualRestart))
    }

    fn live_mut(&mut self, round_id: RoundId) -> Result<&mut RoundState, ConsensusError> {
        let live = self.live.as_mut().ok_or(ConsensusError::NoLiveRound)?;
        if live.round_id != round_id {
            return Err(ConsensusError::RoundMismatch {
                live: live.round_id,
                found: round_id,
            });
        }
        Ok(live)
    }

    /// True when `round_id` has not been started locally yet
    fn is_ahead(&self, round_id: RoundId) -> bool {
        self.live
            .as_ref()
            .map(|live| round_id > live.round_id)
            .unwrap_or(true)
    }

    fn hold(&mut self, message: EarlyMessage) {
        if self.early.len() >= MAX_EARLY_MESSAGES {
            self.early.pop_front();
        }
        debug!(round_id = message.round_id(), held = self.early.len() + 1, "Holding message for a round not started yet");
        self.early.push_back(message);
    }

    /// Feed held messages for `round_id` into the freshly started round
    fn replay_early(&mut self, round_id: RoundId) -> Vec<Action> {
        let held = std::mem::take(&mut self.early);
        let mut actions = Vec::new();
        for message in held {
            if message.round_id() > round_id {
                self.early.push_back(message);
                continue;
            }
            if message.round_id() < round_id {
                continue;
            }
            let result = match message {
                EarlyMessage::Claim {
                    sender,
                    round_id,
                    attempt,
                    root,
                } => self.on_claim(sender, round_id, attempt, root),
                EarlyMessage::Announcement {
                    sender,
                    round_id,
                    root,
                } => self.on_announcement(sender, round_id, root),
                EarlyMessage::Outcome {
                    sender,
                    round_id,
                    attempt,
                    outcome,
                    ledger_tx_id,
                } => self.on_peer_outcome(sender, round_id, attempt, &outcome, ledger_tx_id),
            };
            match result {
                Ok(replayed) => actions.extend(replayed),
                Err(e) => debug!(round_id, error = %e, "Held message dropped on replay"),
            }
        }
        actions
    }

    /// A newer round seen from a peer supersedes a round still submitting
    fn observe_round(&mut self, round_id: RoundId) -> Vec<Action> {
        match &self.live {
            Some(live) if round_id > live.round_id && live.status == RoundStatus::Submitting => {
                warn!(
                    round_id = live.round_id,
                    newer = round_id,
                    "Round superseded while submitting"
                );
                self.fail_live(FailureReason::Superseded { by: round_id })
            }
            _ => Vec::new(),
        }
    }

    /// Enter `LeaderElected` for the current attempt
    fn start_attempt(&mut self) -> Vec<Action> {
        let self_id = self.self_id;
        let Some(live) = self.live.as_mut() else {
            return Vec::new();
        };
        let Some(leader) = live.leader_node_id() else {
            return self.fail_live(FailureReason::FallbacksExhausted);
        };
        let round_id = live.round_id;
        let attempt = live.attempt;
        live.status = RoundStatus::LeaderElected;
        info!(round_id, attempt, leader = ?leader, is_self = leader == self_id, "👑 Leader elected");

        if leader != self_id {
            let pending_claim = live
                .claim
                .as_ref()
                .map(|c| c.attempt == attempt)
                .unwrap_or(false);
            if pending_claim {
                self.validate_claim();
            }
            return vec![Action::ArmAttemptTimer {
                round_id,
                attempt,
                leader,
            }];
        }

        match live.local_root {
            Some(root) => {
                live.status = RoundStatus::Submitting;
                vec![
                    Action::BroadcastClaim {
                        round_id,
                        attempt,
                        root,
                    },
                    Action::Submit { round_id, attempt },
                    Action::ArmAttemptTimer {
                        round_id,
                        attempt,
                        leader,
                    },
                ]
            }
            None => {
                info!(round_id, attempt, "Acting leader has no batch, passing");
                let mut actions = vec![Action::BroadcastOutcome {
                    round_id,
                    attempt,
                    outcome: SubmissionOutcome::Rejected {
                        reason: "no batch".to_string(),
                    },
                    ledger_tx_id: None,
                }];
                actions.extend(self.advance_attempt(AttemptOutcome::NoBatch));
                actions
            }
        }
    }

    /// Close the current attempt and promote the next leader
    fn advance_attempt(&mut self, outcome: AttemptOutcome) -> Vec<Action> {
        let Some(live) = self.live.as_mut() else {
            return Vec::new();
        };
        if let Some(leader) = live.leader_node_id() {
            live.attempts.push(AttemptRecord {
                attempt: live.attempt,
                leader,
                outcome,
            });
        }
        live.attempt += 1;
        live.claim = None;

        if live.attempt >= live.max_attempts {
            return self.fail_live(FailureReason::FallbacksExhausted);
        }
        if live.status == RoundStatus::Collecting {
            return Vec::new();
        }
        self.start_attempt()
    }

    /// Jump to `attempt` without running the attempts in between
    fn fast_forward(&mut self, attempt: u32) -> Vec<Action> {
        let mut actions = Vec::new();
        let self_id = self.self_id;
        let Some(live) = self.live.as_mut() else {
            return actions;
        };
        if live.status == RoundStatus::Submitting && live.leader_node_id() == Some(self_id) {
            actions.push(Action::CancelSubmission {
                round_id: live.round_id,
            });
        }
        while live.attempt < attempt {
            if let Some(leader) = live.leader_node_id() {
                live.attempts.push(AttemptRecord {
                    attempt: live.attempt,
                    leader,
                    outcome: AttemptOutcome::Skipped,
                });
            }
            live.attempt += 1;
        }
        live.claim = None;
        if live.status != RoundStatus::Collecting {
            actions.extend(self.start_attempt());
        }
        actions
    }

    fn validate_claim(&mut self) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let round_id = live.round_id;
        let (Some(claim), Some(local)) = (live.claim.as_mut(), live.local_root) else {
            return;
        };
        if claim.endorsed.is_some() {
            return;
        }
        let matches = claim.root == local;
        claim.endorsed = Some(matches);
        if matches {
            info!(round_id, attempt = claim.attempt, root = %hex_digest(&local), "✅ Leader root matches local root");
        } else {
            let leader = claim.leader;
            let fault = FaultKind::RootMismatch {
                claimed: hex_digest(&claim.root),
                local: hex_digest(&local),
            };
            self.faults.record(leader, round_id, fault);
        }
    }

    fn commit(&mut self, leader: NodeId, attempt: u32, tx: Option<TxId>) -> Vec<Action> {
        let self_id = self.self_id;
        let Some(live) = self.live.as_mut() else {
            return Vec::new();
        };
        live.committed_root = if leader == self_id {
            live.local_root
        } else {
            live.claimed_roots.get(&attempt).copied()
        };
        live.attempts.push(AttemptRecord {
            attempt,
            leader,
            outcome: AttemptOutcome::Confirmed,
        });
        live.attempt = attempt;
        live.status = RoundStatus::Committed;
        live.committed_tx = tx;
        live.committed_by = Some(leader);
        info!(round_id = live.round_id, attempt, leader = ?leader, "🏁 Round committed");
        self.finalize()
    }

    fn fail_live(&mut self, reason: FailureReason) -> Vec<Action> {
        let self_id = self.self_id;
        let Some(live) = self.live.as_mut() else {
            return Vec::new();
        };
        if live.status.is_terminal() {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if live.status == RoundStatus::Submitting && live.leader_node_id() == Some(self_id) {
            actions.push(Action::CancelSubmission {
                round_id: live.round_id,
            });
        }
        warn!(round_id = live.round_id, reason = %reason, "❌ Round failed");
        live.status = RoundStatus::Failed;
        live.failure = Some(reason);
        actions.extend(self.finalize());
        actions
    }

    /// Record the live (terminal) round as finalized
    fn finalize(&mut self) -> Vec<Action> {
        let Some(summary) = self.live.as_ref().map(summarize) else {
            return Vec::new();
        };
        self.last_finalized = Some(summary.round_id);
        if summary.is_committed() {
            self.counters.committed += 1;
            self.last_commit = Some(summary.clone());
        } else {
            self.counters.failed += 1;
        }
        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        vec![Action::Finalized(summary)]
    }
}

fn summarize(live: &RoundState) -> RoundSummary {
    let outcome = match (&live.status, &live.failure) {
        (RoundStatus::Committed, _) => RoundOutcome::Committed,
        (_, Some(reason)) => RoundOutcome::Failed {
            reason: reason.clone(),
        },
        _ => RoundOutcome::Failed {
            reason: FailureReason::FallbacksExhausted,
        },
    };
    let leader = live
        .committed_by
        .or_else(|| live.attempts.last().map(|a| a.leader))
        .or_else(|| live.leader_node_id());
    let merkle_root = match &outcome {
        RoundOutcome::Committed => live.committed_root.as_ref().map(hex_digest),
        RoundOutcome::Failed { .. } => live.local_root.as_ref().map(hex_digest),
    };
    RoundSummary {
        round_id: live.round_id,
        outcome,
        leader,
        attempt: live.attempt,
        merkle_root,
        feed_count: live.local_feed_count,
        ledger_tx_id: live.committed_tx.clone(),
        finalized_at: Utc::now(),
    }
}
