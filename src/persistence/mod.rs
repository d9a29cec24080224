//! CSV Persistence Module
//!
//! Round journal: one row per finalized round, appended to
//! `<data_dir>/rounds.csv` for later analysis.

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info};

use crate::consensus::{RoundOutcome, RoundSummary};

const JOURNAL_FILE: &str = "rounds.csv";

/// Finalized round record for CSV storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// Unix milliseconds
    pub finalized_at: i64,
    pub round_id: u64,
    /// "COMMITTED" or "FAILED"
    pub outcome: String,
    #[serde(default)]
    pub leader: Option<String>,
    pub attempt: u32,
    #[serde(default)]
    pub merkle_root: Option<String>,
    pub feed_count: u32,
    #[serde(default)]
    pub tx_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl From<&RoundSummary> for RoundRecord {
    fn from(summary: &RoundSummary) -> Self {
        let (outcome, reason) = match &summary.outcome {
            RoundOutcome::Committed => ("COMMITTED", None),
            RoundOutcome::Failed { reason } => ("FAILED", Some(reason.to_string())),
        };
        Self {
            finalized_at: summary.finalized_at.timestamp_millis(),
            round_id: summary.round_id,
            outcome: outcome.to_string(),
            leader: summary.leader.map(|l| format!("{:?}", l)),
            attempt: summary.attempt,
            merkle_root: summary.merkle_root.clone(),
            feed_count: summary.feed_count,
            tx_id: summary.ledger_tx_id.clone(),
            reason,
        }
    }
}

/// Append-only journal of finalized rounds
pub struct RoundJournal {
    path: PathBuf,
    writer: Arc<AsyncRwLock<csv::Writer<std::fs::File>>>,
}

impl RoundJournal {
    /// Open (or create) the journal in `data_dir`
    pub fn new(data_dir: &str) -> Result<Self> {
        let data_dir = PathBuf::from(data_dir);
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let path = data_dir.join(JOURNAL_FILE);
        let writer = Self::create_writer(&path)?;
        info!(path = %path.display(), "📒 Round journal opened");

        Ok(Self {
            path,
            writer: Arc::new(AsyncRwLock::new(writer)),
        })
    }

    fn create_writer(path: &Path) -> Result<csv::Writer<std::fs::File>> {
        let file_has_data =
            path.exists() && fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context("Failed to open CSV file")?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one finalized round
    pub async fn append(&self, summary: &RoundSummary) -> Result<()> {
        let record = RoundRecord::from(summary);
        let mut writer = self.writer.write().await;
        writer
            .serialize(&record)
            .context("Failed to write round record")?;
        writer.flush().context("Failed to flush round writer")?;
        debug!(round_id = record.round_id, outcome = %record.outcome, "Round journaled");
        Ok(())
    }

    /// Last `limit` rows in file order
    pub fn load_recent(&self, limit: usize) -> Result<Vec<RoundRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path).context("Failed to open round journal")?;
        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

        let mut records = Vec::new();
        for result in reader.deserialize() {
            let record: RoundRecord = result.context("Failed to deserialize round record")?;
            records.push(record);
        }
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::FailureReason;
    use crate::types::NodeId;
    use chrono::Utc;

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "oracle_node_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn summary(round_id: u64, outcome: RoundOutcome) -> RoundSummary {
        RoundSummary {
            round_id,
            outcome,
            leader: Some(NodeId::from_low_u64_be(1)),
            attempt: 1,
            merkle_root: Some("ab".repeat(32)),
            feed_count: 3,
            ledger_tx_id: Some("tx-00000001".to_string()),
            finalized_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_and_reload_rounds() {
        let data_dir = temp_data_dir("journal");
        let journal = RoundJournal::new(data_dir.to_str().unwrap()).unwrap();

        journal
            .append(&summary(1, RoundOutcome::Committed))
            .await
            .unwrap();
        journal
            .append(&summary(
                2,
                RoundOutcome::Failed {
                    reason: FailureReason::FallbacksExhausted,
                },
            ))
            .await
            .unwrap();

        let records = journal.load_recent(10).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].outcome, "COMMITTED");
        assert_eq!(records[0].reason, None);
        assert_eq!(records[1].outcome, "FAILED");
        assert_eq!(records[1].reason.as_deref(), Some("fallbacks exhausted"));
        assert_eq!(records[1].feed_count, 3);

        assert_eq!(journal.load_recent(1).unwrap()[0].round_id, 2);
        let _ = fs::remove_dir_all(&data_dir);
    }

    #[tokio::test]
    async fn reopened_journal_does_not_repeat_header() {
        let data_dir = temp_data_dir("journal_reopen");
        let dir = data_dir.to_str().unwrap();
        {
            let journal = RoundJournal::new(dir).unwrap();
            journal
                .append(&summary(5, RoundOutcome::Committed))
                .await
                .unwrap();
        }
        let journal = RoundJournal::new(dir).unwrap();
        journal
            .append(&summary(6, RoundOutcome::Committed))
            .await
            .unwrap();

        let rounds: Vec<u64> = journal
            .load_recent(10)
            .unwrap()
            .iter()
            .map(|r| r.round_id)
            .collect();
        assert_eq!(rounds, vec![5, 6]);
        let _ = fs::remove_dir_all(&data_dir);
    }
}
