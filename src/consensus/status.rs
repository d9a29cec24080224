//! Read-only status views published by the round driver

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use super::engine::{
    Agreement, AttemptRecord, ConsensusEngine, FailureReason, RoundState, RoundStatus,
    RoundSummary,
};
use super::faults::FaultRecord;
use crate::types::{hex_digest, NodeId, RoundId};

#[derive(Debug, Clone, Serialize)]
pub struct RoundView {
    pub round_id: RoundId,
    pub status: RoundStatus,
    pub leader: Option<NodeId>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub schedule: Vec<NodeId>,
    pub local_root: Option<String>,
    pub feed_count: u32,
    pub agreement: Agreement,
    pub attempts: Vec<AttemptRecord>,
    pub failure: Option<FailureReason>,
    pub stake_version: u64,
    pub started_at: DateTime<Utc>,
}

impl RoundView {
    pub fn from_state(state: &RoundState, self_id: NodeId) -> Self {
        Self {
            round_id: state.round_id,
            status: state.status,
            leader: state.committed_by.or_else(|| state.leader_node_id()),
            attempt: state.attempt,
            max_attempts: state.max_attempts,
            schedule: state.schedule.clone(),
            local_root: state.local_root.as_ref().map(hex_digest),
            feed_count: state.local_feed_count,
            agreement: state.agreement(self_id),
            attempts: state.attempts.clone(),
            failure: state.failure.clone(),
            stake_version: state.stake_snapshot.version(),
            started_at: state.started_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FaultView {
    pub total: u64,
    pub per_node: BTreeMap<NodeId, u64>,
    pub recent: Vec<FaultRecord>,
}

/// Monotonic counters since the node started
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeMetrics {
    pub rounds_started: u64,
    pub rounds_committed: u64,
    pub rounds_failed: u64,
    pub batches_built: u64,
    pub submissions: u64,
    pub price_observations: u64,
    pub consensus_faults: u64,
    pub uptime_secs: u64,
}

impl NodeMetrics {
    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let counters = [
            ("oracle_rounds_started_total", "Rounds opened", self.rounds_started),
            ("oracle_rounds_committed_total", "Rounds committed on the ledger", self.rounds_committed),
            ("oracle_rounds_failed_total", "Rounds that ended without a commit", self.rounds_failed),
            ("oracle_batches_built_total", "Local batches built", self.batches_built),
            ("oracle_submissions_total", "Batches handed to the sequencer", self.submissions),
            ("oracle_price_observations_total", "Price observations aggregated", self.price_observations),
            ("oracle_consensus_faults_total", "Consensus faults recorded", self.consensus_faults),
        ];
        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!("# HELP {} {}\n# TYPE {} counter\n{} {}\n", name, help, name, name, value));
        }
        out.push_str(&format!(
            "# HELP oracle_uptime_seconds Seconds since start\n# TYPE oracle_uptime_seconds gauge\noracle_uptime_seconds {}\n",
            self.uptime_secs
        ));
        out
    }
}

/// Everything the status surface reports about consensus
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub round: Option<RoundView>,
    pub last_commit: Option<RoundSummary>,
    pub recent_rounds: Vec<RoundSummary>,
    pub faults: FaultView,
    pub metrics: NodeMetrics,
    pub updated_at: DateTime<Utc>,
}

impl NodeStatus {
    /// Status before the first round starts
    pub fn starting(node_id: NodeId) -> Self {
        Self {
            node_id,
            round: None,
            last_commit: None,
            recent_rounds: Vec::new(),
            faults: FaultView::default(),
            metrics: NodeMetrics::default(),
            updated_at: Utc::now(),
        }
    }
}

impl ConsensusEngine {
    /// Status with the engine's own counters filled in; the driver adds the rest
    pub fn status(&self) -> NodeStatus {
        let faults = self.faults();
        let rounds = self.counters();
        NodeStatus {
            node_id: self.self_id(),
            round: self
                .live()
                .map(|state| RoundView::from_state(state, self.self_id())),
            last_commit: self.last_commit().cloned(),
            recent_rounds: self.history().rev().cloned().collect(),
            faults: FaultView {
                total: faults.total(),
                per_node: faults.counts().clone(),
                recent: faults.recent().cloned().collect(),
            },
            metrics: NodeMetrics {
                rounds_started: rounds.started,
                rounds_committed: rounds.committed,
                rounds_failed: rounds.failed,
                consensus_faults: faults.total(),
                ..NodeMetrics::default()
            },
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StakeEntry;
    use crate::stake::StakeSnapshot;

    #[test]
    fn test_status_reflects_live_round() {
        let node = NodeId::from_low_u64_be(1);
        let stake = StakeSnapshot::from_entries(&[StakeEntry { node_id: node, stake: 10 }], 3);
        let mut engine = ConsensusEngine::new(node, 2);
        engine.begin_round(9, stake).unwrap();
        engine.record_local_batch(9, Some([1u8; 32]), 2).unwrap();

        let status = engine.status();
        let round = status.round.unwrap();
        assert_eq!(round.round_id, 9);
        assert_eq!(round.status, RoundStatus::Collecting);
        assert_eq!(round.leader, Some(node));
        assert_eq!(round.max_attempts, 1);
        assert_eq!(round.stake_version, 3);
        assert_eq!(round.agreement.matching_stake, 10);
        assert_eq!(round.local_root.unwrap(), "01".repeat(32));

        let json = serde_json::to_value(engine.status()).unwrap();
        assert_eq!(json["round"]["status"], "collecting");
        assert_eq!(json["metrics"]["rounds_started"], 1);
    }

    #[test]
    fn test_metrics_render_as_prometheus_counters() {
        let metrics = NodeMetrics {
            rounds_committed: 4,
            submissions: 5,
            uptime_secs: 30,
            ..NodeMetrics::default()
        };
        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE oracle_rounds_committed_total counter\noracle_rounds_committed_total 4\n"));
        assert!(text.contains("oracle_submissions_total 5\n"));
        assert!(text.contains("oracle_rounds_failed_total 0\n"));
        assert!(text.ends_with("oracle_uptime_seconds 30\n"));
    }
}
