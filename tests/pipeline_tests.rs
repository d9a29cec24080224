//! Tests for the price pipeline: aggregation through batch commitment

#[cfg(test)]
mod tests {
    use oracle_node::batch::merkle::{verify_proof, MerkleTree};
    use oracle_node::batch::{encode_leaf, merkle_root_of, Batch, LEAF_LEN};
    use oracle_node::oracle::aggregator::median;
    use oracle_node::oracle::{AggregationParams, Aggregator};
    use oracle_node::sequencer::BatchPayload;
    use oracle_node::types::{AggregatedPrice, AssetId, Exchange, ObservedAt, PriceObservation};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn btc() -> AssetId {
        AssetId::new("BTC/USD").unwrap()
    }

    fn observation(asset: &AssetId, exchange: Exchange, price: Decimal, seq: u64) -> PriceObservation {
        PriceObservation {
            asset_id: asset.clone(),
            exchange_id: exchange,
            price,
            observed_at: ObservedAt::now(),
            sequence_id: seq,
        }
    }

    fn aggregator(min_publishers: usize) -> Aggregator {
        Aggregator::new(AggregationParams {
            min_publishers,
            ..AggregationParams::default()
        })
    }

    fn aggregated(asset: &str, price: Decimal, round_id: u64) -> AggregatedPrice {
        AggregatedPrice {
            asset_id: AssetId::new(asset).unwrap(),
            price,
            confidence_interval: dec!(0.5),
            contributing_exchange_count: 3,
            round_id,
        }
    }

    // ============================================================================
    // Aggregation
    // ============================================================================

    #[test]
    fn test_bad_feed_excluded_from_btc_price() {
        let asset = btc();
        let observations = vec![
            observation(&asset, Exchange::Binance, dec!(65000.00), 1),
            observation(&asset, Exchange::Coinbase, dec!(65010.50), 2),
            observation(&asset, Exchange::Kraken, dec!(1000000.00), 3),
        ];

        let price = aggregator(2).aggregate(&asset, 7, &observations).unwrap();

        assert_eq!(price.price, dec!(65005.25));
        assert_eq!(price.contributing_exchange_count, 2);
        assert_eq!(price.round_id, 7);
        assert!(price.confidence_interval > Decimal::ZERO);
    }

    #[test]
    fn test_hundredfold_outlier_cannot_move_price_out_of_cluster() {
        let asset = btc();
        let spread = [dec!(0.99985), dec!(0.99997), dec!(1.00006), dec!(1.00023)];
        let cluster_exchanges = [Exchange::Binance, Exchange::Coinbase, Exchange::Kraken, Exchange::Okx];

        for base in [dec!(65000.00), dec!(3200.10), dec!(150.25)] {
            let cluster: Vec<Decimal> = spread.iter().map(|m| base * m).collect();
            let mut observations: Vec<PriceObservation> = cluster_exchanges
                .iter()
                .zip(&cluster)
                .enumerate()
                .map(|(i, (exchange, price))| observation(&asset, *exchange, *price, i as u64))
                .collect();
            observations.push(observation(&asset, Exchange::Bybit, base * dec!(100), 99));

            let price = aggregator(cluster.len()).aggregate(&asset, 5, &observations).unwrap();
            let cluster_median = median(&cluster).unwrap();

            assert_eq!(price.contributing_exchange_count, cluster.len() as u32);
            assert!(price.confidence_interval > Decimal::ZERO);
            assert!(
                (price.price - cluster_median).abs() <= price.confidence_interval,
                "base {}: price {} vs cluster median {} (ci {})",
                base,
                price.price,
                cluster_median,
                price.confidence_interval
            );
            assert!(price.price >= cluster[0] && price.price <= cluster[3]);
        }
    }

    #[test]
    fn test_aggregation_is_deterministic_across_input_order() {
        let asset = btc();
        let observations = vec![
            observation(&asset, Exchange::Binance, dec!(65000.00), 1),
            observation(&asset, Exchange::Okx, dec!(64990.10), 2),
            observation(&asset, Exchange::Coinbase, dec!(65010.50), 3),
            observation(&asset, Exchange::Binance, dec!(65002.00), 4),
        ];
        let mut reversed = observations.clone();
        reversed.reverse();

        let agg = aggregator(2);
        let a = agg.aggregate(&asset, 3, &observations).unwrap();
        let b = agg.aggregate(&asset, 3, &reversed).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_too_few_publishers_yields_no_price() {
        let asset = btc();
        let observations = vec![
            observation(&asset, Exchange::Binance, dec!(65000.00), 1),
            observation(&asset, Exchange::Binance, dec!(65001.00), 2),
        ];
        assert!(aggregator(2).aggregate(&asset, 1, &observations).is_none());
    }

    #[test]
    fn test_outlier_rejection_can_drop_below_minimum() {
        let asset = btc();
        let observations = vec![
            observation(&asset, Exchange::Binance, dec!(65000.00), 1),
            observation(&asset, Exchange::Coinbase, dec!(65000.00), 2),
            observation(&asset, Exchange::Kraken, dec!(90000.00), 3),
        ];
        assert!(aggregator(3).aggregate(&asset, 1, &observations).is_none());
    }

    // ============================================================================
    // Batches and Merkle commitment
    // ============================================================================

    #[test]
    fn test_batch_root_independent_of_input_order() {
        let prices = vec![
            aggregated("SOL/USD", dec!(150.25), 9),
            aggregated("BTC/USD", dec!(65005.25), 9),
            aggregated("ETH/USD", dec!(3200.10), 9),
        ];
        let mut shuffled = prices.clone();
        shuffled.rotate_left(1);

        let a = Batch::build(9, prices).unwrap();
        let b = Batch::build(9, shuffled).unwrap();
        assert_eq!(a.merkle_root, b.merkle_root);
        assert_eq!(a.prices[0].asset_id.as_str(), "BTC/USD");
        assert_eq!(a.feed_count(), 3);
    }

    #[test]
    fn test_leaf_order_changes_the_root() {
        let first = encode_leaf(&aggregated("BTC/USD", dec!(1), 1)).unwrap();
        let second = encode_leaf(&aggregated("ETH/USD", dec!(2), 1)).unwrap();
        assert_eq!(first.len(), LEAF_LEN);

        let forward = MerkleTree::from_payloads([first, second]).unwrap().root();
        let backward = MerkleTree::from_payloads([second, first]).unwrap().root();
        assert_ne!(forward, backward);
    }

    #[test]
    fn test_price_change_changes_the_root() {
        let base = vec![aggregated("BTC/USD", dec!(65005.25), 1)];
        let moved = vec![aggregated("BTC/USD", dec!(65005.26), 1)];
        assert_ne!(merkle_root_of(&base).unwrap(), merkle_root_of(&moved).unwrap());
    }

    #[test]
    fn test_every_asset_has_a_valid_inclusion_proof() {
        let batch = Batch::build(
            4,
            vec![
                aggregated("BTC/USD", dec!(65005.25), 4),
                aggregated("ETH/USD", dec!(3200.10), 4),
                aggregated("SOL/USD", dec!(150.25), 4),
            ],
        )
        .unwrap();

        for price in &batch.prices {
            let (leaf, proof) = batch.proof(&price.asset_id).unwrap();
            assert!(verify_proof(&batch.merkle_root, &leaf, &proof));
        }
        let (leaf, proof) = batch.proof(&btc()).unwrap();
        assert!(!verify_proof(&[0u8; 32], &leaf, &proof));
    }

    #[test]
    fn test_batch_rejects_empty_and_mixed_rounds() {
        assert!(Batch::build(1, Vec::new()).is_err());
        assert!(Batch::build(
            1,
            vec![aggregated("BTC/USD", dec!(1), 1), aggregated("ETH/USD", dec!(1), 2)]
        )
        .is_err());
        assert!(Batch::build(
            1,
            vec![aggregated("BTC/USD", dec!(1), 1), aggregated("BTC/USD", dec!(2), 1)]
        )
        .is_err());
    }

    #[test]
    fn test_ledger_payload_carries_round_root_and_count() {
        let batch = Batch::build(11, vec![aggregated("BTC/USD", dec!(65005.25), 11)]).unwrap();
        let payload = BatchPayload::from_batch(&batch);
        let decoded = BatchPayload::decode(&payload.encode()).unwrap();
        assert_eq!(decoded.round_id, 11);
        assert_eq!(decoded.merkle_root, batch.merkle_root);
        assert_eq!(decoded.feed_count, 1);
    }
}
