//! Tests for leader election and the round state machine

#[cfg(test)]
mod tests {
    use oracle_node::consensus::{
        elect_leader, leader_schedule, Action, ConsensusEngine, FailureReason, RoundOutcome,
        RoundStatus,
    };
    use oracle_node::ledger::StakeEntry;
    use oracle_node::stake::StakeSnapshot;
    use oracle_node::types::{NodeId, SubmissionOutcome};

    fn node(n: u64) -> NodeId {
        NodeId::from_low_u64_be(n)
    }

    /// {A: 100_000, B: 50_000, C: 25_000}
    fn abc_stake() -> StakeSnapshot {
        StakeSnapshot::from_entries(
            &[
                StakeEntry { node_id: node(0xA), stake: 100_000 },
                StakeEntry { node_id: node(0xB), stake: 50_000 },
                StakeEntry { node_id: node(0xC), stake: 25_000 },
            ],
            1,
        )
    }

    // ============================================================================
    // Election
    // ============================================================================

    #[test]
    fn test_round_42_elects_the_same_leader_every_time() {
        let stake = abc_stake();
        let first = elect_leader(42, &stake).unwrap();
        for _ in 0..1_000 {
            assert_eq!(elect_leader(42, &stake), Some(first));
        }
        assert!(stake.contains(&first));
    }

    #[test]
    fn test_election_ignores_table_row_order() {
        let reordered = StakeSnapshot::from_entries(
            &[
                StakeEntry { node_id: node(0xC), stake: 25_000 },
                StakeEntry { node_id: node(0xA), stake: 100_000 },
                StakeEntry { node_id: node(0xB), stake: 50_000 },
            ],
            7,
        );
        for round in 0..200 {
            assert_eq!(elect_leader(round, &abc_stake()), elect_leader(round, &reordered));
        }
    }

    #[test]
    fn test_leadership_tracks_stake_share() {
        let stake = abc_stake();
        let mut wins = [0u32; 3];
        for round in 0..7_000 {
            match elect_leader(round, &stake) {
                Some(n) if n == node(0xA) => wins[0] += 1,
                Some(n) if n == node(0xB) => wins[1] += 1,
                Some(n) if n == node(0xC) => wins[2] += 1,
                other => panic!("unexpected leader {:?}", other),
            }
        }
        // Expected 4000 / 2000 / 1000
        assert!(wins[0] > wins[1] && wins[1] > wins[2]);
        assert!((3_600..4_400).contains(&wins[0]));
        assert!((700..1_300).contains(&wins[2]));
    }

    #[test]
    fn test_schedule_puts_elected_first_then_stake_order() {
        let stake = abc_stake();
        for round in 0..50 {
            let schedule = leader_schedule(round, &stake);
            assert_eq!(schedule.len(), 3);
            assert_eq!(Some(schedule[0]), elect_leader(round, &stake));
            let rest: Vec<NodeId> = [node(0xA), node(0xB), node(0xC)]
                .into_iter()
                .filter(|n| *n != schedule[0])
                .collect();
            assert_eq!(&schedule[1..], rest.as_slice());
        }
    }

    #[test]
    fn test_no_leader_without_stake() {
        assert_eq!(elect_leader(1, &StakeSnapshot::empty()), None);
        assert!(leader_schedule(1, &StakeSnapshot::empty()).is_empty());
    }

    // ============================================================================
    // Fallback progression across three engines
    // ============================================================================

    fn claims(actions: &[Action]) -> Vec<(u32, [u8; 32])> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::BroadcastClaim { attempt, root, .. } => Some((*attempt, *root)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_leaders_take_over_in_schedule_order() {
        let round = 42;
        let stake = abc_stake();
        let schedule = leader_schedule(round, &stake);
        let root = [7u8; 32];
        let ids = [node(0xA), node(0xB), node(0xC)];

        let mut engines: Vec<ConsensusEngine> =
            ids.iter().map(|id| ConsensusEngine::new(*id, 2)).collect();
        let mut elected_claims = Vec::new();
        for engine in engines.iter_mut() {
            engine.begin_round(round, stake.clone()).unwrap();
            engine.record_local_batch(round, Some(root), 1).unwrap();
            let actions = engine.elect(round).unwrap();
            if engine.self_id() == schedule[0] {
                elected_claims = claims(&actions);
            }
        }
        assert_eq!(elected_claims, vec![(0, root)]);

        // Every leader times out in turn; the next one in the schedule claims
        for (attempt, leader) in schedule.iter().enumerate() {
            let attempt = attempt as u32;
            for engine in &engines {
                let live = engine.live().unwrap();
                assert_eq!(live.attempt, attempt);
                assert_eq!(live.leader_node_id(), Some(*leader));
            }
            for engine in engines.iter_mut() {
                let actions = engine.on_attempt_timeout(round, attempt).unwrap();
                if let Some(next) = schedule.get(attempt as usize + 1) {
                    if engine.self_id() == *next {
                        assert_eq!(claims(&actions), vec![(attempt + 1, root)]);
                    }
                }
            }
        }

        for engine in &engines {
            assert_eq!(engine.live().unwrap().status, RoundStatus::Failed);
            assert_eq!(engine.live().unwrap().attempts.len(), 3);
            assert_eq!(engine.last_finalized(), Some(round));
            let summary = engine.history().next_back().unwrap();
            assert!(matches!(
                summary.outcome,
                RoundOutcome::Failed {
                    reason: FailureReason::FallbacksExhausted
                }
            ));
            assert_eq!(summary.leader, Some(schedule[2]));
            assert!(engine.last_commit().is_none());
        }
    }

    #[test]
    fn test_follower_commits_on_fallback_leader_confirmation() {
        let round = 42;
        let stake = abc_stake();
        let schedule = leader_schedule(round, &stake);
        let fallback = schedule[1];
        let follower = schedule[2];

        let mut engine = ConsensusEngine::new(follower, 2);
        engine.begin_round(round, stake).unwrap();
        engine.record_local_batch(round, Some([3u8; 32]), 1).unwrap();
        engine.elect(round).unwrap();
        engine.on_attempt_timeout(round, 0).unwrap();
        assert_eq!(engine.live().unwrap().leader_node_id(), Some(fallback));
        assert_eq!(engine.live().unwrap().status, RoundStatus::LeaderElected);

        engine.on_claim(fallback, round, 1, [3u8; 32]).unwrap();
        let actions = engine
            .on_peer_outcome(fallback, round, 1, &SubmissionOutcome::Confirmed, Some("tx-9".to_string()))
            .unwrap();
        assert!(actions.iter().any(|a| matches!(a, Action::Finalized(_))));

        let summary = engine.last_commit().unwrap();
        assert_eq!(summary.leader, Some(fallback));
        assert_eq!(summary.attempt, 1);
        assert_eq!(summary.ledger_tx_id.as_deref(), Some("tx-9"));
        assert_eq!(engine.latest_round(), Some(round));
    }
}
