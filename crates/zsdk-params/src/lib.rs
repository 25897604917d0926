//! Chain parameters for the light wallet SDK
//!
//! This crate provides network definitions, consensus constants, validated
//! block heights and amounts, and the checkpoint ("birthday") data used to
//! seed a fresh wallet.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod amount;
pub mod checkpoints;
pub mod consensus;
pub mod height;
pub mod network;

pub use amount::Zatoshi;
pub use checkpoints::{Checkpoint, CheckpointList};
pub use consensus::ConsensusParams;
pub use height::BlockHeight;
pub use network::{Network, NetworkType};

/// Error types for parameter operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid network specified
    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    /// Height below the network's first activation height or above the chain maximum
    #[error("Invalid block height {height} for {network}")]
    InvalidHeight {
        /// Offending height
        height: u64,
        /// Network the height was checked against
        network: NetworkType,
    },

    /// Height arithmetic left the representable range
    #[error("Block height arithmetic out of range: {0}")]
    HeightOutOfRange(String),

    /// Amount outside [0, max money]
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    /// Checkpoint not found
    #[error("No checkpoint found for height {0}")]
    CheckpointNotFound(u32),

    /// Checkpoint data could not be parsed
    #[error("Invalid checkpoint data: {0}")]
    InvalidCheckpoint(String),
}

/// Result type for parameter operations
pub type Result<T> = std::result::Result<T, Error>;
