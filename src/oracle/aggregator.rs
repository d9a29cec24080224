//! Local Aggregator - Combines one asset's observations into a round price
//!
//! Each exchange is first reduced to a single value (the median of its own
//! observations in the window) so a chatty exchange cannot outvote the rest.
//! The cross-exchange median then goes through one pass of MAD-based outlier
//! rejection before the final median and confidence interval are computed.
//!
//! Everything here is exact decimal arithmetic with a fixed rounding rule, so
//! two nodes holding the same observations produce identical results.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::{AggregationConfig, AssetFeed};
use crate::types::{round_price, AggregatedPrice, AssetId, Exchange, PriceObservation, RoundId};

/// Consistency constant turning a MAD into a normal-equivalent sigma
const MAD_TO_SIGMA: Decimal = dec!(1.4826);

const BPS_DENOMINATOR: Decimal = dec!(10000);

/// Tunables for one asset's aggregation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationParams {
    /// Rejection distance in MAD units
    pub outlier_k: Decimal,
    /// Minimum rejection distance in basis points of the median
    pub mad_floor_bps: u32,
    /// Distinct exchanges required after rejection
    pub min_publishers: usize,
}

impl AggregationParams {
    pub fn for_feed(config: &AggregationConfig, feed: &AssetFeed) -> Self {
        Self {
            outlier_k: config.outlier_k,
            mad_floor_bps: config.mad_floor_bps,
            min_publishers: feed.min_publishers,
        }
    }
}

impl Default for AggregationParams {
    fn default() -> Self {
        Self {
            outlier_k: dec!(3),
            mad_floor_bps: 10,
            min_publishers: 1,
        }
    }
}

/// Per-asset aggregator
#[derive(Debug, Clone)]
pub struct Aggregator {
    params: AggregationParams,
}

impl Aggregator {
    pub fn new(params: AggregationParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &AggregationParams {
        &self.params
    }

    /// Aggregate the window's observations for `asset_id`
    ///
    /// Returns `None` when fewer than `min_publishers` exchanges survive
    /// outlier rejection. Observations for other assets are ignored.
    pub fn aggregate(
        &self,
        asset_id: &AssetId,
        round_id: RoundId,
        observations: &[PriceObservation],
    ) -> Option<AggregatedPrice> {
        let per_exchange = reduce_per_exchange(asset_id, observations);
        if per_exchange.len() < self.params.min_publishers || per_exchange.is_empty() {
            debug!(
                asset = %asset_id,
                round_id,
                exchanges = per_exchange.len(),
                min = self.params.min_publishers,
                "Not enough publishers before outlier rejection"
            );
            return None;
        }

        let values: Vec<Decimal> = per_exchange.values().copied().collect();
        let provisional = median(&values)?;
        let mad = median_abs_deviation(&values, provisional)?;

        let floor = provisional * Decimal::from(self.params.mad_floor_bps) / BPS_DENOMINATOR;
        let threshold = (self.params.outlier_k * mad).max(floor);

        let mut kept = Vec::with_capacity(per_exchange.len());
        for (exchange, value) in &per_exchange {
            if (*value - provisional).abs() <= threshold {
                kept.push(*value);
            } else {
                debug!(
                    asset = %asset_id,
                    round_id,
                    %exchange,
                    price = %value,
                    median = %provisional,
                    threshold = %threshold,
                    "Rejected outlier"
                );
            }
        }

        if kept.len() < self.params.min_publishers {
            debug!(
                asset = %asset_id,
                round_id,
                kept = kept.len(),
                min = self.params.min_publishers,
                "Not enough publishers after outlier rejection"
            );
            return None;
        }

        let price = median(&kept)?;
        let dispersion = median_abs_deviation(&kept, price)?;

        Some(AggregatedPrice {
            asset_id: asset_id.clone(),
            price: round_price(price),
            confidence_interval: round_price(dispersion * MAD_TO_SIGMA),
            contributing_exchange_count: u32::try_from(kept.len()).ok()?,
            round_id,
        })
    }
}

/// One value per exchange: the median of that exchange's observations
fn reduce_per_exchange(
    asset_id: &AssetId,
    observations: &[PriceObservation],
) -> BTreeMap<Exchange, Decimal> {
    let mut grouped: BTreeMap<Exchange, Vec<Decimal>> = BTreeMap::new();
    for obs in observations.iter().filter(|o| &o.asset_id == asset_id) {
        grouped.entry(obs.exchange_id).or_default().push(obs.price);
    }
    grouped
        .into_iter()
        .filter_map(|(exchange, prices)| median(&prices).map(|m| (exchange, m)))
        .collect()
}

/// Median; even counts average the two central values
pub fn median(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / Decimal::TWO)
    } else {
        Some(sorted[mid])
    }
}

/// Median of absolute deviations from `center`
pub fn median_abs_deviation(values: &[Decimal], center: Decimal) -> Option<Decimal> {
    let deviations: Vec<Decimal> = values.iter().map(|v| (*v - center).abs()).collect();
    median(&deviations)
}
