//! Binary Merkle tree over SHA-256
//!
//! Leaves and internal nodes are domain separated (`0x00` / `0x01` prefix).
//! An unpaired node at the end of a level is promoted unchanged; it is never
//! duplicated.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub fn hash_leaf(payload: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(payload);
    hasher.finalize().into()
}

pub fn hash_node(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Which side the sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    #[serde(with = "hex_hash")]
    pub sibling: Hash,
    pub side: Side,
}

/// All levels of the tree, leaves first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Build from leaf payloads in the given order; `None` for no leaves
    pub fn from_payloads<I, P>(payloads: I) -> Option<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let leaves: Vec<Hash> = payloads.into_iter().map(|p| hash_leaf(p.as_ref())).collect();
        if leaves.is_empty() {
            return None;
        }

        let mut levels = vec![leaves];
        while let Some(current) = levels.last().filter(|l| l.len() > 1) {
            let next: Vec<Hash> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_node(left, right),
                    promoted => promoted[0],
                })
                .collect();
            levels.push(next);
        }
        Some(Self { levels })
    }

    pub fn root(&self) -> Hash {
        // from_payloads guarantees a non-empty top level
        self.levels
            .last()
            .and_then(|top| top.first())
            .copied()
            .unwrap_or_default()
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    /// Inclusion proof for the leaf at `index`
    ///
    /// Levels where the node is promoted contribute no step.
    pub fn proof(&self, index: usize) -> Option<Vec<ProofStep>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut steps = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            if idx % 2 == 1 {
                steps.push(ProofStep {
                    sibling: level[idx - 1],
                    side: Side::Left,
                });
            } else if let Some(sibling) = level.get(idx + 1) {
                steps.push(ProofStep {
                    sibling: *sibling,
                    side: Side::Right,
                });
            }
            idx /= 2;
        }
        Some(steps)
    }
}

/// Check that `payload` is included under `root` via `proof`
pub fn verify_proof(root: &Hash, payload: &[u8], proof: &[ProofStep]) -> bool {
    let computed = proof.iter().fold(hash_leaf(payload), |acc, step| match step.side {
        Side::Left => hash_node(&step.sibling, &acc),
        Side::Right => hash_node(&acc, &step.sibling),
    });
    &computed == root
}

pub(crate) mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = hex::decode(raw.trim_start_matches("0x")).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32-byte hash"))
    }
}
