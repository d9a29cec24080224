//! Stake/Governance client
//!
//! Reads the stake table from the ledger and publishes it as an immutable
//! `StakeSnapshot` through a watch channel. Every refresh replaces the whole
//! snapshot; readers always see one consistent table.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::ledger::{LedgerClient, LedgerError, StakeEntry};
use crate::types::NodeId;

/// Point-in-time stake table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeSnapshot {
    version: u64,
    taken_at: DateTime<Utc>,
    stakes: Arc<BTreeMap<NodeId, u64>>,
}

impl StakeSnapshot {
    /// Build from ledger rows; zero stakes are dropped and duplicate rows summed
    pub fn from_entries(entries: &[StakeEntry], version: u64) -> Self {
        let mut stakes = BTreeMap::new();
        for entry in entries.iter().filter(|e| e.stake > 0) {
            let total: &mut u64 = stakes.entry(entry.node_id).or_insert(0);
            *total = total.saturating_add(entry.stake);
        }
        Self {
            version,
            taken_at: Utc::now(),
            stakes: Arc::new(stakes),
        }
    }

    pub fn empty() -> Self {
        Self::from_entries(&[], 0)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn stake_of(&self, node: &NodeId) -> u64 {
        self.stakes.get(node).copied().unwrap_or(0)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.stakes.contains_key(node)
    }

    pub fn total(&self) -> u128 {
        self.stakes.values().map(|s| u128::from(*s)).sum()
    }

    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }

    /// Entries in ascending node id order
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &u64)> {
        self.stakes.iter()
    }

    /// Same table contents, ignoring version and timestamp
    pub fn same_table(&self, other: &StakeSnapshot) -> bool {
        self.stakes == other.stakes
    }

    /// SHA-256 over the sorted table, for cross-node comparison in logs
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for (node, stake) in self.stakes.iter() {
            hasher.update(node.as_bytes());
            hasher.update(stake.to_le_bytes());
        }
        hasher.finalize().into()
    }
}

/// Read the current table from the ledger
pub async fn fetch_snapshot(
    ledger: &dyn LedgerClient,
    version: u64,
) -> Result<StakeSnapshot, LedgerError> {
    let entries = ledger.get_stake_table().await?;
    Ok(StakeSnapshot::from_entries(&entries, version))
}

/// Keep `tx` current by polling the ledger every `every`
///
/// A failed refresh keeps the previous snapshot in place.
pub fn spawn_refresh(
    ledger: Arc<dyn LedgerClient>,
    tx: watch::Sender<StakeSnapshot>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; the caller already loaded the initial table
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let current_version = tx.borrow().version();
            match fetch_snapshot(ledger.as_ref(), current_version + 1).await {
                Ok(fresh) => {
                    if fresh.same_table(&tx.borrow()) {
                        debug!(version = current_version, "Stake table unchanged");
                        continue;
                    }
                    info!(
                        version = fresh.version(),
                        nodes = fresh.len(),
                        total = %fresh.total(),
                        digest = %hex::encode(fresh.digest()),
                        "🔄 Stake snapshot replaced"
                    );
                    tx.send_replace(fresh);
                }
                Err(e) => warn!(error = %e, "Stake refresh failed, keeping previous snapshot"),
            }
        }
    })
}
