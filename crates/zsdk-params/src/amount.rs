//! Validated zatoshi amounts

use crate::consensus::{ConsensusParams, COIN};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An amount in zatoshis, within `[0, max_money]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64")]
pub struct Zatoshi(i64);

impl TryFrom<i64> for Zatoshi {
    type Error = Error;

    /// Validates against the shared money range; every network uses the same supply cap
    fn try_from(value: i64) -> Result<Self> {
        Self::new(value, &ConsensusParams::mainnet())
    }
}

impl Zatoshi {
    /// Zero amount
    pub const ZERO: Zatoshi = Zatoshi(0);

    /// Validate against the chain's money range
    pub fn new(value: i64, params: &ConsensusParams) -> Result<Self> {
        if !params.is_valid_amount(value) {
            return Err(Error::InvalidAmount(value));
        }
        Ok(Self(value))
    }

    /// Raw zatoshi value
    pub const fn value(&self) -> i64 {
        self.0
    }

    /// Add, rejecting results outside the money range
    pub fn checked_add(&self, other: Zatoshi, params: &ConsensusParams) -> Result<Self> {
        let sum = self
            .0
            .checked_add(other.0)
            .ok_or(Error::InvalidAmount(i64::MAX))?;
        Self::new(sum, params)
    }

    /// Subtract, rejecting negative results
    pub fn checked_sub(&self, other: Zatoshi, params: &ConsensusParams) -> Result<Self> {
        Self::new(self.0 - other.0, params)
    }
}

impl fmt::Display for Zatoshi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:08}", self.0 / COIN, self.0 % COIN)
    }
}
