//! Wallet birthday checkpoints

use crate::height::BlockHeight;
use crate::network::NetworkType;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A chain checkpoint used to seed a new wallet.
///
/// `tree` is the hex-encoded note commitment tree at `height`, opaque to
/// this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Block height
    pub height: u32,
    /// Block hash (hex)
    pub hash: String,
    /// Block time (Unix epoch seconds)
    pub time: u64,
    /// Serialized note commitment tree (hex)
    pub tree: String,
}

impl Checkpoint {
    /// Height as a validated [`BlockHeight`]
    pub fn block_height(&self, network: NetworkType) -> Result<BlockHeight> {
        BlockHeight::new(self.height as u64, network)
    }
}

/// List of checkpoints, sorted by height
#[derive(Debug, Clone)]
pub struct CheckpointList {
    checkpoints: Vec<Checkpoint>,
}

impl CheckpointList {
    /// Create a new checkpoint list
    pub fn new(checkpoints: Vec<Checkpoint>) -> Self {
        let mut cp = Self { checkpoints };
        cp.sort();
        cp
    }

    /// Built-in checkpoints for a network
    pub fn for_network(network: NetworkType) -> Self {
        match network {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// Get mainnet checkpoints
    pub fn mainnet() -> Self {
        Self::new(vec![Checkpoint {
            height: 419_200,
            hash: "00000000025a57200d898ac7f21e26bf29028bbe96ec46e05b2c17cc9db9e4f3".to_string(),
            time: 1_540_779_337,
            tree: "000000".to_string(),
        }])
    }

    /// Get testnet checkpoints
    pub fn testnet() -> Self {
        Self::new(vec![Checkpoint {
            height: 280_000,
            hash: "000420e7fcc3a49d729479fb0b560dd7b8617b178a08e9e389620a9d1dd6361a".to_string(),
            time: 1_535_262_293,
            tree: "000000".to_string(),
        }])
    }

    /// Get regtest checkpoints
    pub fn regtest() -> Self {
        Self::new(vec![Checkpoint {
            height: 1,
            hash: "0000000000000000000000000000000000000000000000000000000000000000".to_string(),
            time: 0,
            tree: "000000".to_string(),
        }])
    }

    /// Parse a JSON array of checkpoints
    pub fn from_json(json: &str) -> Result<Self> {
        let checkpoints: Vec<Checkpoint> =
            serde_json::from_str(json).map_err(|e| Error::InvalidCheckpoint(e.to_string()))?;
        Ok(Self::new(checkpoints))
    }

    /// Load a JSON checkpoint file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::InvalidCheckpoint(e.to_string()))?;
        Self::from_json(&json)
    }

    /// Merge additional checkpoints, later entries replacing equal heights
    pub fn extend(&mut self, other: CheckpointList) {
        for cp in other.checkpoints {
            self.checkpoints.retain(|existing| existing.height != cp.height);
            self.checkpoints.push(cp);
        }
        self.sort();
    }

    fn sort(&mut self) {
        self.checkpoints.sort_by_key(|cp| cp.height);
    }

    /// Get checkpoint at or before given height
    pub fn checkpoint_at_height(&self, height: u32) -> Result<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|cp| cp.height <= height)
            .ok_or(Error::CheckpointNotFound(height))
    }

    /// Get all checkpoints
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Get latest checkpoint
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Get checkpoint count
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}
