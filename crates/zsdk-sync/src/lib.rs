//! Block synchronization and outbound transactions for Zcash-family light wallets
//!
//! This crate provides:
//! - A compact block processor that downloads, validates, scans and enhances
//!   blocks from a light server, repairing reorgs on its own
//! - An outbound transaction manager that tracks spends from creation to
//!   mined or discarded
//! - Capability traits for the light server, block cache and wallet store,
//!   with a lightwalletd gRPC client and SQLite stores as implementations

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod backend;
pub mod block_cache;
pub mod cancel;
pub mod download;
pub mod error;
pub mod events;
pub mod lightd;
pub mod outbound;
pub mod processor;
pub mod progress;
pub mod retry;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use backend::{
    BlockCacheStore, BlockRange, BlockStream, CompactBlock, EncodedTransaction, RawTransaction,
    RemoteChainService, ServerInfo, SubmitResponse, Utxo, WalletBalance, WalletDataStore,
    DEFAULT_ACCOUNT,
};
pub use block_cache::{default_data_dir, SqliteBlockCache, DATA_DIR_ENV};
pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use events::{Decision, Handlers, SyncEvent};
pub use lightd::{LightClient, LightClientConfig};
pub use outbound::{
    OutboundConfig, OutboundTransactionManager, PendingState, PendingTransaction,
    PendingTransactionLedger, Recipient, ReconcileReport, SqlitePendingLedger,
};
pub use processor::{Backends, CompactBlockProcessor, PassObserver, PassOutcome, SyncConfig};
pub use progress::{ProcessorInfo, ProcessorState, ProgressTracker};
