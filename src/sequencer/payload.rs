//! Canonical on-chain batch record
//!
//! 52 bytes: round_id u64 LE, merkle root (32 bytes), feed_count u32 LE,
//! timestamp i64 LE (seconds since epoch).

use crate::batch::{Batch, Hash};
use crate::types::RoundId;

pub const PAYLOAD_LEN: usize = 8 + 32 + 4 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPayload {
    pub round_id: RoundId,
    pub merkle_root: Hash,
    pub feed_count: u32,
    pub timestamp: i64,
}

impl BatchPayload {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            round_id: batch.round_id,
            merkle_root: batch.merkle_root,
            feed_count: batch.feed_count(),
            timestamp: batch.built_at.timestamp(),
        }
    }

    pub fn encode(&self) -> [u8; PAYLOAD_LEN] {
        let mut out = [0u8; PAYLOAD_LEN];
        out[..8].copy_from_slice(&self.round_id.to_le_bytes());
        out[8..40].copy_from_slice(&self.merkle_root);
        out[40..44].copy_from_slice(&self.feed_count.to_le_bytes());
        out[44..52].copy_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != PAYLOAD_LEN {
            return None;
        }
        Some(Self {
            round_id: u64::from_le_bytes(bytes[..8].try_into().ok()?),
            merkle_root: bytes[8..40].try_into().ok()?,
            feed_count: u32::from_le_bytes(bytes[40..44].try_into().ok()?),
            timestamp: i64::from_le_bytes(bytes[44..52].try_into().ok()?),
        })
    }
}
