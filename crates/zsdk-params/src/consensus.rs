//! Consensus parameters

use crate::network::{Network, NetworkType};

/// Zatoshis per coin
pub const COIN: i64 = 100_000_000;

/// Consensus parameters
#[derive(Debug, Clone)]
pub struct ConsensusParams {
    /// Network configuration
    pub network: Network,
    /// Target block time in seconds
    pub block_time_target: u32,
    /// Coinbase maturity (blocks)
    pub coinbase_maturity: u32,
    /// Maximum supply (zatoshis)
    pub max_money: i64,
    /// Highest block height the wallet accepts
    pub max_height: u32,
    /// Blocks after creation at which an unmined transaction expires
    pub default_expiry_delta: u32,
}

impl ConsensusParams {
    /// Create consensus params for mainnet
    pub fn mainnet() -> Self {
        Self {
            network: Network::mainnet(),
            block_time_target: 75,
            coinbase_maturity: 100,
            max_money: 21_000_000 * COIN,
            max_height: u32::MAX,
            default_expiry_delta: 40,
        }
    }

    /// Create consensus params for testnet
    pub fn testnet() -> Self {
        Self {
            network: Network::testnet(),
            ..Self::mainnet()
        }
    }

    /// Create consensus params for regtest
    pub fn regtest() -> Self {
        Self {
            network: Network::regtest(),
            block_time_target: 1,
            coinbase_maturity: 10,
            ..Self::mainnet()
        }
    }

    /// Get consensus params by network type
    pub fn from_network(network_type: NetworkType) -> Self {
        match network_type {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// Lowest height a wallet on this network may reference
    pub fn min_height(&self) -> u32 {
        self.network.sapling_activation_height
    }

    /// Check if amount is valid (non-negative and within max supply)
    pub fn is_valid_amount(&self, amount: i64) -> bool {
        (0..=self.max_money).contains(&amount)
    }

    /// Check if height lies in the wallet's addressable range
    pub fn is_valid_height(&self, height: u64) -> bool {
        height >= self.min_height() as u64 && height <= self.max_height as u64
    }
}
