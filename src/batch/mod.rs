//! Batch Builder
//!
//! Sorts a round's aggregated prices by asset id, encodes each as a fixed
//! 60-byte leaf and commits to them with a Merkle root. Pure: the same
//! prices always yield the same root on every node.

pub mod merkle;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

pub use merkle::{hash_leaf, hash_node, verify_proof, Hash, MerkleTree, ProofStep, Side};

use crate::types::{hex_digest, to_fixed_i64, AggregatedPrice, AssetId, RoundId, ASSET_ID_LEN};

/// Encoded size of one leaf payload
pub const LEAF_LEN: usize = ASSET_ID_LEN + 8 + 8 + 4 + 8;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch has no prices")]
    Empty,
    #[error("asset {0} appears more than once")]
    DuplicateAsset(AssetId),
    #[error("price for {asset} belongs to round {found}, expected {expected}")]
    RoundMismatch {
        asset: AssetId,
        expected: RoundId,
        found: RoundId,
    },
    #[error("value for {0} does not fit the fixed-point encoding")]
    ValueOutOfRange(AssetId),
}

/// Canonical leaf encoding
///
/// `asset_id` zero-padded to 32 bytes, then price and confidence interval as
/// i64 LE at 9 decimals, contributor count as u32 LE, round id as u64 LE.
pub fn encode_leaf(price: &AggregatedPrice) -> Result<[u8; LEAF_LEN], BatchError> {
    let fixed_price = to_fixed_i64(price.price)
        .filter(|p| *p > 0)
        .ok_or_else(|| BatchError::ValueOutOfRange(price.asset_id.clone()))?;
    let fixed_ci = to_fixed_i64(price.confidence_interval)
        .filter(|ci| *ci >= 0)
        .ok_or_else(|| BatchError::ValueOutOfRange(price.asset_id.clone()))?;

    let mut out = [0u8; LEAF_LEN];
    out[..32].copy_from_slice(&price.asset_id.to_padded_bytes());
    out[32..40].copy_from_slice(&fixed_price.to_le_bytes());
    out[40..48].copy_from_slice(&fixed_ci.to_le_bytes());
    out[48..52].copy_from_slice(&price.contributing_exchange_count.to_le_bytes());
    out[52..60].copy_from_slice(&price.round_id.to_le_bytes());
    Ok(out)
}

/// Merkle root over `prices` in the order given (no sorting)
pub fn merkle_root_of(prices: &[AggregatedPrice]) -> Result<Hash, BatchError> {
    let leaves = prices
        .iter()
        .map(encode_leaf)
        .collect::<Result<Vec<_>, _>>()?;
    MerkleTree::from_payloads(&leaves)
        .map(|tree| tree.root())
        .ok_or(BatchError::Empty)
}

/// One round's committed price set
#[derive(Debug, Clone)]
pub struct Batch {
    pub round_id: RoundId,
    /// Sorted by asset id ascending
    pub prices: Vec<AggregatedPrice>,
    pub merkle_root: Hash,
    pub built_at: DateTime<Utc>,
    tree: MerkleTree,
}

impl Batch {
    /// Validate, sort and commit to a round's prices
    pub fn build(round_id: RoundId, mut prices: Vec<AggregatedPrice>) -> Result<Self, BatchError> {
        if prices.is_empty() {
            return Err(BatchError::Empty);
        }

        let mut seen = BTreeSet::new();
        for price in &prices {
            if price.round_id != round_id {
                return Err(BatchError::RoundMismatch {
                    asset: price.asset_id.clone(),
                    expected: round_id,
                    found: price.round_id,
                });
            }
            if !seen.insert(&price.asset_id) {
                return Err(BatchError::DuplicateAsset(price.asset_id.clone()));
            }
        }

        prices.sort_by(|a, b| a.asset_id.cmp(&b.asset_id));

        let leaves = prices
            .iter()
            .map(encode_leaf)
            .collect::<Result<Vec<_>, _>>()?;
        let tree = MerkleTree::from_payloads(&leaves).ok_or(BatchError::Empty)?;

        Ok(Self {
            round_id,
            merkle_root: tree.root(),
            prices,
            built_at: Utc::now(),
            tree,
        })
    }

    pub fn feed_count(&self) -> u32 {
        u32::try_from(self.prices.len()).unwrap_or(u32::MAX)
    }

    pub fn root_hex(&self) -> String {
        hex_digest(&self.merkle_root)
    }

    /// Inclusion proof for one asset, with its encoded leaf
    pub fn proof(&self, asset_id: &AssetId) -> Option<(Vec<u8>, Vec<ProofStep>)> {
        let index = self
            .prices
            .binary_search_by(|p| p.asset_id.cmp(asset_id))
            .ok()?;
        let leaf = encode_leaf(&self.prices[index]).ok()?;
        Some((leaf.to_vec(), self.tree.proof(index)?))
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            round_id: self.round_id,
            merkle_root: self.root_hex(),
            feed_count: self.feed_count(),
            built_at: self.built_at,
        }
    }
}

/// Serializable view of a batch for status and journal output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub round_id: RoundId,
    pub merkle_root: String,
    pub feed_count: u32,
    pub built_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn price(asset: &str, value: rust_decimal::Decimal, round_id: RoundId) -> AggregatedPrice {
        AggregatedPrice {
            asset_id: AssetId::new(asset).unwrap(),
            price: value,
            confidence_interval: dec!(1.5),
            contributing_exchange_count: 3,
            round_id,
        }
    }

    #[test]
    fn test_leaf_layout() {
        let leaf = encode_leaf(&price("BTC/USD", dec!(65005.25), 42)).unwrap();
        assert_eq!(&leaf[..7], b"BTC/USD");
        assert!(leaf[7..32].iter().all(|b| *b == 0));
        assert_eq!(
            i64::from_le_bytes(leaf[32..40].try_into().unwrap()),
            65_005_250_000_000
        );
        assert_eq!(
            i64::from_le_bytes(leaf[40..48].try_into().unwrap()),
            1_500_000_000
        );
        assert_eq!(u32::from_le_bytes(leaf[48..52].try_into().unwrap()), 3);
        assert_eq!(u64::from_le_bytes(leaf[52..60].try_into().unwrap()), 42);
    }

    #[test]
    fn test_build_sorts_by_asset() {
        let batch = Batch::build(
            5,
            vec![
                price("SOL/USD", dec!(140), 5),
                price("BTC/USD", dec!(65000), 5),
                price("ETH/USD", dec!(3000), 5),
            ],
        )
        .unwrap();
        let order: Vec<&str> = batch.prices.iter().map(|p| p.asset_id.as_str()).collect();
        assert_eq!(order, vec!["BTC/USD", "ETH/USD", "SOL/USD"]);
        assert_eq!(batch.feed_count(), 3);
        assert_eq!(batch.merkle_root, merkle_root_of(&batch.prices).unwrap());
    }

    #[test]
    fn test_build_rejects_bad_input() {
        assert_eq!(Batch::build(1, vec![]).unwrap_err(), BatchError::Empty);

        let dup = vec![price("BTC/USD", dec!(1), 1), price("BTC/USD", dec!(2), 1)];
        assert!(matches!(
            Batch::build(1, dup),
            Err(BatchError::DuplicateAsset(_))
        ));

        let wrong_round = vec![price("BTC/USD", dec!(1), 2)];
        assert!(matches!(
            Batch::build(1, wrong_round),
            Err(BatchError::RoundMismatch { expected: 1, found: 2, .. })
        ));

        let huge = vec![price("BTC/USD", dec!(100000000000), 1)];
        assert!(matches!(
            Batch::build(1, huge),
            Err(BatchError::ValueOutOfRange(_))
        ));
    }

    #[test]
    fn test_asset_proof_verifies_against_root() {
        let batch = Batch::build(
            9,
            vec![
                price("BTC/USD", dec!(65000), 9),
                price("ETH/USD", dec!(3000), 9),
                price("SOL/USD", dec!(140), 9),
            ],
        )
        .unwrap();
        let eth = AssetId::new("ETH/USD").unwrap();
        let (leaf, proof) = batch.proof(&eth).unwrap();
        assert!(verify_proof(&batch.merkle_root, &leaf, &proof));
        assert!(batch.proof(&AssetId::new("DOGE/USD").unwrap()).is_none());
    }

    #[test]
    fn test_summary_hex_root() {
        let batch = Batch::build(3, vec![price("BTC/USD", dec!(1), 3)]).unwrap();
        let summary = batch.summary();
        assert_eq!(summary.merkle_root.len(), 64);
        assert_eq!(summary.feed_count, 1);
    }
}
