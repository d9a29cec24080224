//! Oracle Node Library
//!
//! Stake-weighted price oracle: multi-exchange collection, robust
//! aggregation, Merkle batches, leader election and ledger submission

pub mod batch;
pub mod config;
pub mod consensus;
pub mod gossip;
pub mod identity;
pub mod ledger;
pub mod node;
pub mod oracle;
pub mod persistence;
pub mod sequencer;
pub mod stake;
pub mod types;

#[cfg(feature = "status-api")]
pub mod api;
