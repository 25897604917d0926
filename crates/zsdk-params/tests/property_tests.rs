//! Property-based tests for zsdk-params
//!
//! Uses proptest to verify height and amount invariants across randomized inputs

use proptest::prelude::*;
use zsdk_params::{BlockHeight, ConsensusParams, NetworkType, Zatoshi};

fn network_strategy() -> impl Strategy<Value = NetworkType> {
    prop_oneof![
        Just(NetworkType::Mainnet),
        Just(NetworkType::Testnet),
        Just(NetworkType::Regtest),
    ]
}

proptest! {
    /// Property: a constructed height always lies in the network's range
    #[test]
    fn prop_height_in_range(network in network_strategy(), raw in 0u64..=(u32::MAX as u64 + 10)) {
        let params = ConsensusParams::from_network(network);
        match BlockHeight::new(raw, network) {
            Ok(h) => {
                prop_assert!(h.value() >= params.min_height());
                prop_assert!(h.value() <= params.max_height);
            }
            Err(_) => prop_assert!(!params.is_valid_height(raw)),
        }
    }

    /// Property: checked arithmetic never produces an out-of-range height
    #[test]
    fn prop_checked_arithmetic_stays_valid(
        network in network_strategy(),
        offset in 0u32..10_000_000,
        delta in any::<u32>(),
    ) {
        let base = BlockHeight::activation(network);
        let params = ConsensusParams::from_network(network);
        if let Ok(start) = base.checked_add(offset) {
            if let Ok(up) = start.checked_add(delta) {
                prop_assert!(params.is_valid_height(up.value() as u64));
                prop_assert_eq!(up.value() as u64, start.value() as u64 + delta as u64);
            }
            match start.checked_sub(delta) {
                Ok(down) => prop_assert!(down.value() >= params.min_height()),
                Err(_) => prop_assert!((start.value() as u64) < params.min_height() as u64 + delta as u64),
            }
        }
    }

    /// Property: amounts are accepted iff they are in [0, max_money]
    #[test]
    fn prop_amount_range(value in any::<i64>()) {
        let params = ConsensusParams::mainnet();
        let ok = Zatoshi::new(value, &params).is_ok();
        prop_assert_eq!(ok, value >= 0 && value <= params.max_money);
    }
}
