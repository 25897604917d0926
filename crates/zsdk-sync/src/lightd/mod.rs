//! Lightwalletd adapter for [`RemoteChainService`](crate::backend::RemoteChainService).

pub mod client;
pub mod proto;

pub use client::{
    compute_txid, LightClient, LightClientConfig, RetryConfig, DEFAULT_MAINNET_URL,
    DEFAULT_TESTNET_URL,
};
