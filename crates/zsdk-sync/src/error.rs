//! Error types for sync and outbound operations

use zsdk_params::BlockHeight;

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(String),

    /// Scanning failed or made no progress
    #[error("Scan failed at height {height}: {reason}")]
    Scan {
        /// Height the scan was expected to reach next
        height: BlockHeight,
        /// Failure description
        reason: String,
    },

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,

    /// Setup verification failed (wrong chain, missing keys, branch mismatch)
    #[error("Setup error: {0}")]
    Setup(String),

    /// Transaction construction failed
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Server rejected a transaction
    #[error("Submission failed (code {code}): {message}")]
    Submission {
        /// Server error code
        code: i32,
        /// Server error message
        message: String,
    },

    /// Amount outside the chain's money range
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    /// Recipient address rejected
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Pending transaction missing from the ledger
    #[error("Pending transaction {0} not found")]
    TransactionNotFound(i64),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Chain parameter error
    #[error("Parameter error: {0}")]
    Params(#[from] zsdk_params::Error),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Status error
    #[error("Status error: {0}")]
    Status(#[from] tonic::Status),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure came from the network and may clear up on retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Connection(_)
                | Error::Transport(_)
                | Error::Status(_)
                | Error::Io(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".into()).is_transient());
        assert!(Error::Status(tonic::Status::unavailable("down")).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::Setup("wrong chain".into()).is_transient());
    }

    #[test]
    fn test_sqlite_error_maps_to_storage() {
        let err: Error = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, Error::Storage(_)));
    }
}
