//! Observed consensus faults per node
//!
//! Counting only; penalties are decided elsewhere.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::warn;

use crate::types::{NodeId, RoundId};

/// Recent faults kept for status output
pub const MAX_RECENT_FAULTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultKind {
    /// Claimed root differs from the locally computed one
    RootMismatch { claimed: String, local: String },
    /// Claim or outcome from a node that is not the leader for that attempt
    NotLeader { attempt: u32 },
    /// Leader let its attempt expire without an outcome
    LeaderUnresponsive { attempt: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultRecord {
    pub node: NodeId,
    pub round_id: RoundId,
    pub fault: FaultKind,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct FaultLedger {
    counts: BTreeMap<NodeId, u64>,
    recent: VecDeque<FaultRecord>,
}

impl FaultLedger {
    pub fn record(&mut self, node: NodeId, round_id: RoundId, fault: FaultKind) {
        warn!(?node, round_id, ?fault, "⚠️ Consensus fault recorded");
        *self.counts.entry(node).or_default() += 1;
        if self.recent.len() >= MAX_RECENT_FAULTS {
            self.recent.pop_front();
        }
        self.recent.push_back(FaultRecord {
            node,
            round_id,
            fault,
            at: Utc::now(),
        });
    }

    pub fn count(&self, node: &NodeId) -> u64 {
        self.counts.get(node).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn counts(&self) -> &BTreeMap<NodeId, u64> {
        &self.counts
    }

    pub fn recent(&self) -> impl Iterator<Item = &FaultRecord> {
        self.recent.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_bounded_history() {
        let mut ledger = FaultLedger::default();
        let a = NodeId::from_low_u64_be(1);
        let b = NodeId::from_low_u64_be(2);
        for round in 0..(MAX_RECENT_FAULTS as u64 + 10) {
            ledger.record(a, round, FaultKind::LeaderUnresponsive { attempt: 0 });
        }
        ledger.record(b, 1, FaultKind::NotLeader { attempt: 1 });

        assert_eq!(ledger.count(&a), MAX_RECENT_FAULTS as u64 + 10);
        assert_eq!(ledger.count(&b), 1);
        assert_eq!(ledger.recent().count(), MAX_RECENT_FAULTS);
        assert_eq!(ledger.recent().last().map(|f| f.node), Some(b));
    }
}
