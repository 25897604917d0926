//! Network-tagged block heights

use crate::consensus::ConsensusParams;
use crate::network::NetworkType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A block height on a specific network.
///
/// Always lies in `[first activation height, max height]` for its network.
/// Arithmetic is checked and re-validated against the network's built-in
/// parameters; it never wraps. Deserialized heights are validated the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawBlockHeight")]
pub struct BlockHeight {
    value: u32,
    network: NetworkType,
}

#[derive(Deserialize)]
struct RawBlockHeight {
    value: u64,
    network: NetworkType,
}

impl TryFrom<RawBlockHeight> for BlockHeight {
    type Error = Error;

    fn try_from(raw: RawBlockHeight) -> Result<Self> {
        Self::new(raw.value, raw.network)
    }
}

impl BlockHeight {
    /// Validate and wrap a raw height
    pub fn new(value: u64, network: NetworkType) -> Result<Self> {
        Self::with_params(value, &ConsensusParams::from_network(network))
    }

    /// Validate against `params`, honouring a custom `max_height`
    pub fn with_params(value: u64, params: &ConsensusParams) -> Result<Self> {
        let network = params.network.network_type;
        if !params.is_valid_height(value) {
            return Err(Error::InvalidHeight {
                height: value,
                network,
            });
        }
        Ok(Self {
            value: value as u32,
            network,
        })
    }

    /// First height a light wallet can reference on `network`
    pub fn activation(network: NetworkType) -> Self {
        Self {
            value: ConsensusParams::from_network(network).min_height(),
            network,
        }
    }

    /// Raw height
    pub const fn value(&self) -> u32 {
        self.value
    }

    /// Network this height belongs to
    pub const fn network(&self) -> NetworkType {
        self.network
    }

    /// Add `blocks`, failing if the result leaves the valid range
    pub fn checked_add(&self, blocks: u32) -> Result<Self> {
        let next = self.value.checked_add(blocks).ok_or_else(|| {
            Error::HeightOutOfRange(format!("{} + {}", self.value, blocks))
        })?;
        Self::new(next as u64, self.network)
    }

    /// Subtract `blocks`, failing on underflow or below activation
    pub fn checked_sub(&self, blocks: u32) -> Result<Self> {
        let prev = self.value.checked_sub(blocks).ok_or_else(|| {
            Error::HeightOutOfRange(format!("{} - {}", self.value, blocks))
        })?;
        Self::new(prev as u64, self.network)
    }

    /// Subtract `blocks`, stopping at the activation height
    pub fn saturating_sub(&self, blocks: u32) -> Self {
        self.checked_sub(blocks)
            .unwrap_or_else(|_| Self::activation(self.network))
    }

    /// Same network, different value
    pub fn with_value(&self, value: u64) -> Result<Self> {
        Self::new(value, self.network)
    }
}

impl fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl From<BlockHeight> for u32 {
    fn from(height: BlockHeight) -> Self {
        height.value
    }
}

impl From<BlockHeight> for u64 {
    fn from(height: BlockHeight) -> Self {
        height.value as u64
    }
}
