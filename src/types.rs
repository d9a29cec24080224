//! Core types used throughout the oracle node
//!
//! Defines the pipeline data model: observations, aggregated prices,
//! round identifiers and submission receipts.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

pub use ethers::types::Address as NodeId;

/// Monotonically increasing round identifier
pub type RoundId = u64;

/// Ledger transaction identifier
pub type TxId = String;

/// Number of decimal places used for every published price
pub const PRICE_SCALE: u32 = 9;

/// Maximum encoded length of an asset id (bytes)
pub const ASSET_ID_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AssetIdError {
    #[error("asset id is empty")]
    Empty,
    #[error("asset id '{0}' is longer than 32 bytes")]
    TooLong(String),
    #[error("asset id '{0}' contains non-printable or non-ASCII characters")]
    InvalidCharacters(String),
}

/// Tracked asset pair, e.g. `BTC/USD`
///
/// Ordering is byte-lexicographic; batches are sorted on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetId(String);

impl AssetId {
    pub fn new(value: impl Into<String>) -> Result<Self, AssetIdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(AssetIdError::Empty);
        }
        if value.len() > ASSET_ID_LEN {
            return Err(AssetIdError::TooLong(value));
        }
        if !value.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(AssetIdError::InvalidCharacters(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base symbol (`BTC` for `BTC/USD`)
    pub fn base(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// Quote symbol (`USD` for `BTC/USD`), if the id carries one
    pub fn quote(&self) -> Option<&str> {
        self.0.split_once('/').map(|(_, q)| q)
    }

    /// Fixed-width, zero-padded encoding used in Merkle leaves
    pub fn to_padded_bytes(&self) -> [u8; ASSET_ID_LEN] {
        let mut out = [0u8; ASSET_ID_LEN];
        out[..self.0.len()].copy_from_slice(self.0.as_bytes());
        out
    }
}

impl TryFrom<String> for AssetId {
    type Error = AssetIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AssetId> for String {
    fn from(id: AssetId) -> Self {
        id.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Supported exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Coinbase,
    Kraken,
    Okx,
}

impl Exchange {
    pub const ALL: [Exchange; 5] = [
        Exchange::Binance,
        Exchange::Bybit,
        Exchange::Coinbase,
        Exchange::Kraken,
        Exchange::Okx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Coinbase => "coinbase",
            Exchange::Kraken => "kraken",
            Exchange::Okx => "okx",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "binance" => Some(Exchange::Binance),
            "bybit" => Some(Exchange::Bybit),
            "coinbase" => Some(Exchange::Coinbase),
            "kraken" => Some(Exchange::Kraken),
            "okx" => Some(Exchange::Okx),
            _ => None,
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observation timestamp: wall clock for reporting, monotonic for windowing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedAt {
    pub wall: DateTime<Utc>,
    pub monotonic: Instant,
}

impl ObservedAt {
    pub fn now() -> Self {
        Self {
            wall: Utc::now(),
            monotonic: Instant::now(),
        }
    }
}

/// One price reported by one exchange for one asset
#[derive(Debug, Clone, PartialEq)]
pub struct PriceObservation {
    pub asset_id: AssetId,
    pub exchange_id: Exchange,
    pub price: Decimal,
    pub observed_at: ObservedAt,
    pub sequence_id: u64,
}

/// Consensus-candidate price for one asset in one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedPrice {
    pub asset_id: AssetId,
    pub price: Decimal,
    pub confidence_interval: Decimal,
    pub contributing_exchange_count: u32,
    pub round_id: RoundId,
}

/// Terminal result of a ledger submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Confirmed,
    Rejected { reason: String },
    TimedOut,
}

impl SubmissionOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, SubmissionOutcome::Confirmed)
    }
}

impl fmt::Display for SubmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionOutcome::Confirmed => write!(f, "CONFIRMED"),
            SubmissionOutcome::Rejected { reason } => write!(f, "REJECTED ({})", reason),
            SubmissionOutcome::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Report from the sequencer once a ledger interaction completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub round_id: RoundId,
    /// Fallback attempt the submission belonged to (0 = elected leader)
    pub attempt: u32,
    pub ledger_tx_id: Option<TxId>,
    pub outcome: SubmissionOutcome,
}

/// Round a decimal to the published price scale (banker's rounding)
pub fn round_price(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointNearestEven)
}

/// Fixed-point integer representation at `PRICE_SCALE` decimals
pub fn to_fixed_i64(value: Decimal) -> Option<i64> {
    let mut scaled = round_price(value);
    scaled.rescale(PRICE_SCALE);
    i64::try_from(scaled.mantissa()).ok()
}

/// Lowercase hex of a 32-byte digest
pub fn hex_digest(digest: &[u8; 32]) -> String {
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn asset_id_validation() {
        assert!(AssetId::new("BTC/USD").is_ok());
        assert_eq!(AssetId::new(""), Err(AssetIdError::Empty));
        assert!(matches!(
            AssetId::new("X".repeat(33)),
            Err(AssetIdError::TooLong(_))
        ));
        assert!(matches!(
            AssetId::new("BTC USD"),
            Err(AssetIdError::InvalidCharacters(_))
        ));
    }

    #[test]
    fn asset_id_padding_and_parts() {
        let id = AssetId::new("ETH/USD").unwrap();
        let padded = id.to_padded_bytes();
        assert_eq!(&padded[..7], b"ETH/USD");
        assert!(padded[7..].iter().all(|b| *b == 0));
        assert_eq!(id.base(), "ETH");
        assert_eq!(id.quote(), Some("USD"));
    }

    #[test]
    fn fixed_point_conversion() {
        assert_eq!(to_fixed_i64(dec!(65005.25)), Some(65_005_250_000_000));
        assert_eq!(to_fixed_i64(dec!(0.0000000015)), Some(2));
        assert_eq!(to_fixed_i64(dec!(0.0000000025)), Some(2));
        assert_eq!(to_fixed_i64(dec!(100000000000)), None);
    }

    #[test]
    fn exchange_roundtrips_through_names() {
        for exchange in Exchange::ALL {
            assert_eq!(Exchange::from_str(exchange.as_str()), Some(exchange));
        }
        assert_eq!(Exchange::from_str("ftx"), None);
    }
}
