//! Error types for the wallet coordinator

use zsdk_params::NetworkType;

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coordinator errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another synchronizer holds this identity
    #[error("A synchronizer for {network}/{alias} is already active")]
    AlreadyActive {
        /// Network of the identity
        network: NetworkType,
        /// Alias of the identity
        alias: String,
    },

    /// Operation needs a started synchronizer
    #[error("Synchronizer has not been started")]
    NotStarted,

    /// `start()` called twice
    #[error("Synchronizer already started")]
    AlreadyStarted,

    /// Synchronizer was closed; build a new one
    #[error("Synchronizer is closed")]
    Closed,

    /// Alias is empty, too long or contains unsupported characters
    #[error("Invalid alias '{0}': use 1-99 characters from [A-Za-z0-9_]")]
    InvalidAlias(String),

    /// Server setup could not be verified
    #[error("Setup failed: {0}")]
    Setup(String),

    /// Sync engine error
    #[error(transparent)]
    Sync(#[from] zsdk_sync::Error),

    /// Chain parameter error
    #[error(transparent)]
    Params(#[from] zsdk_params::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
