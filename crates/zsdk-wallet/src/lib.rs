//! Wallet coordinator for the light wallet SDK
//!
//! [`Synchronizer`] runs block sync and outbound transactions for one wallet
//! identity, guarded by a [`SynchronizerRegistry`] so at most one instance
//! per identity is live. Storage helpers lay out and erase the wallet's
//! databases; [`logging::init_logging`] installs a tracing subscriber.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod registry;
pub mod storage;
pub mod synchronizer;

pub use config::{validate_alias, SynchronizerConfig, DEFAULT_ALIAS};
pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
pub use models::{AddressType, SyncStatus, WalletBalances};
pub use registry::{InstanceLease, InstanceStatus, SynchronizerIdentity, SynchronizerRegistry};
pub use storage::{erase_wallet, EraseOutcome, StoragePaths, StoreKind};
pub use synchronizer::Synchronizer;

pub use zsdk_sync::{Decision, PendingState, PendingTransaction, SyncEvent};
