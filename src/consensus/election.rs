//! Stake-weighted leader election
//!
//! Every node derives the same leader from (round_id, stake table) alone:
//! a SHA-256 seed over the round and the sorted table picks a point in
//! `[0, total_stake)`, and the node whose cumulative stake range covers it
//! leads. Nodes are walked in ascending id order, so equal stakes resolve to
//! the smallest id first.

use sha2::{Digest, Sha256};

use crate::stake::StakeSnapshot;
use crate::types::{NodeId, RoundId};

const ELECTION_DOMAIN: &[u8] = b"oracle-leader-v1";

/// Seed for `round_id` over the sorted stake table
pub fn election_seed(round_id: RoundId, stake: &StakeSnapshot) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(ELECTION_DOMAIN);
    hasher.update(round_id.to_le_bytes());
    for (node, amount) in stake.iter() {
        hasher.update(node.as_bytes());
        hasher.update(amount.to_le_bytes());
    }
    hasher.finalize().into()
}

/// Elected leader for `round_id`; `None` when nobody is staked
pub fn elect_leader(round_id: RoundId, stake: &StakeSnapshot) -> Option<NodeId> {
    let total = stake.total();
    if total == 0 {
        return None;
    }
    let seed = election_seed(round_id, stake);
    let mut head = [0u8; 16];
    head.copy_from_slice(&seed[..16]);
    let target = u128::from_be_bytes(head) % total;

    let mut cumulative: u128 = 0;
    for (node, amount) in stake.iter() {
        cumulative += u128::from(*amount);
        if target < cumulative {
            return Some(*node);
        }
    }
    None
}

/// Leaders in attempt order: the elected node, then the rest by stake
/// descending (smallest id first on equal stake)
pub fn leader_schedule(round_id: RoundId, stake: &StakeSnapshot) -> Vec<NodeId> {
    let Some(leader) = elect_leader(round_id, stake) else {
        return Vec::new();
    };
    let mut rest: Vec<(NodeId, u64)> = stake
        .iter()
        .filter(|(node, _)| **node != leader)
        .map(|(node, amount)| (*node, *amount))
        .collect();
    rest.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut schedule = Vec::with_capacity(rest.len() + 1);
    schedule.push(leader);
    schedule.extend(rest.into_iter().map(|(node, _)| node));
    schedule
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StakeEntry;
    use std::collections::HashMap;

    fn node(n: u64) -> NodeId {
        NodeId::from_low_u64_be(n)
    }

    fn snapshot(entries: &[(u64, u64)]) -> StakeSnapshot {
        let rows: Vec<StakeEntry> = entries
            .iter()
            .map(|(n, s)| StakeEntry {
                node_id: node(*n),
                stake: *s,
            })
            .collect();
        StakeSnapshot::from_entries(&rows, 1)
    }

    #[test]
    fn test_empty_table_has_no_leader() {
        let stake = StakeSnapshot::empty();
        assert_eq!(elect_leader(1, &stake), None);
        assert!(leader_schedule(1, &stake).is_empty());
    }

    #[test]
    fn test_single_node_always_leads() {
        let stake = snapshot(&[(9, 1)]);
        for round in 0..50 {
            assert_eq!(elect_leader(round, &stake), Some(node(9)));
        }
    }

    #[test]
    fn test_row_order_and_version_do_not_matter() {
        let a = snapshot(&[(1, 100_000), (2, 50_000), (3, 25_000)]);
        let b = snapshot(&[(3, 25_000), (1, 100_000), (2, 50_000)]);
        for round in 0..100 {
            assert_eq!(elect_leader(round, &a), elect_leader(round, &b));
        }
    }

    #[test]
    fn test_schedule_orders_fallbacks_by_stake() {
        let stake = snapshot(&[(1, 10), (2, 40), (3, 40), (4, 5)]);
        for round in 0..20 {
            let schedule = leader_schedule(round, &stake);
            assert_eq!(schedule.len(), 4);
            assert_eq!(Some(schedule[0]), elect_leader(round, &stake));
            let fallbacks: Vec<u64> = schedule[1..].iter().map(|n| stake.stake_of(n)).collect();
            assert!(fallbacks.windows(2).all(|w| w[0] >= w[1]));
        }
        // Round where node 1 is elected: fallbacks are 2 and 3 (tie, smaller id first), then 4
        if let Some(round) = (0..1000).find(|r| elect_leader(*r, &stake) == Some(node(1))) {
            assert_eq!(
                leader_schedule(round, &stake),
                vec![node(1), node(2), node(3), node(4)]
            );
        }
    }

    #[test]
    fn test_selection_tracks_stake_weight() {
        let stake = snapshot(&[(1, 900), (2, 100)]);
        let mut wins: HashMap<NodeId, u32> = HashMap::new();
        for round in 0..2000 {
            if let Some(leader) = elect_leader(round, &stake) {
                *wins.entry(leader).or_default() += 1;
            }
        }
        let heavy = wins.get(&node(1)).copied().unwrap_or(0);
        let light = wins.get(&node(2)).copied().unwrap_or(0);
        assert_eq!(heavy + light, 2000);
        assert!(heavy > light * 4, "heavy={} light={}", heavy, light);
        assert!(light > 0);
    }
}
