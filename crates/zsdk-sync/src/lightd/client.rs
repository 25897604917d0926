//! Lightwalletd gRPC client
//!
//! Implements [`RemoteChainService`] over the `CompactTxStreamer` service with:
//! - lazy connection on first call
//! - optional TLS (inferred from the endpoint scheme)
//! - retry with jittered exponential backoff on the initial request

use super::proto;
use crate::backend::{
    BlockRange, BlockStream, CompactBlock, RawTransaction, RemoteChainService, ServerInfo,
    SubmitResponse, Utxo,
};
use crate::retry::jitter_duration;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use prost::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, error, info, warn};
use zsdk_params::{BlockHeight, ConsensusParams, NetworkType, Zatoshi};

use proto::compact_tx_streamer_client::CompactTxStreamerClient;

/// Default mainnet lightwalletd endpoint
pub const DEFAULT_MAINNET_URL: &str = "https://mainnet.lightwalletd.com:9067";
/// Default testnet lightwalletd endpoint
pub const DEFAULT_TESTNET_URL: &str = "https://testnet.lightwalletd.com:9067";

/// Retry configuration for network operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct LightClientConfig {
    /// Endpoint URL (e.g. "https://mainnet.lightwalletd.com:9067")
    pub endpoint: String,
    /// Network the server is expected to serve
    pub network: NetworkType,
    /// Use TLS
    pub tls: bool,
    /// Server name for TLS verification (uses endpoint host if None)
    pub tls_server_name: Option<String>,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Request timeout
    pub request_timeout: Duration,
}

impl LightClientConfig {
    /// Config for `endpoint`, inferring TLS from the scheme
    pub fn new(endpoint: &str, network: NetworkType) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            network,
            tls: !endpoint.trim_start().starts_with("http://"),
            tls_server_name: None,
            retry: RetryConfig::default(),
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
        }
    }

    /// Default endpoint for a network
    pub fn for_network(network: NetworkType) -> Self {
        match network {
            NetworkType::Mainnet => Self::new(DEFAULT_MAINNET_URL, network),
            NetworkType::Testnet => Self::new(DEFAULT_TESTNET_URL, network),
            NetworkType::Regtest => Self::new("http://127.0.0.1:9067", network),
        }
    }
}

/// Lightwalletd gRPC client
pub struct LightClient {
    config: LightClientConfig,
    channel: Arc<Mutex<Option<Channel>>>,
}

#[allow(dead_code)]
fn _assert_light_client_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<LightClient>();
}

impl LightClient {
    /// Create client with custom configuration
    pub fn with_config(config: LightClientConfig) -> Self {
        Self {
            config,
            channel: Arc::new(Mutex::new(None)),
        }
    }

    /// Get current endpoint URL
    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Check if client holds a channel
    pub fn is_connected(&self) -> bool {
        self.channel
            .try_lock()
            .map(|g| g.is_some())
            .unwrap_or(false)
    }

    /// Connect to lightwalletd server with retry
    pub async fn connect(&self) -> Result<()> {
        let channel = self.with_retry(|| self.try_connect()).await?;
        info!("Connected to lightwalletd at {}", self.config.endpoint);
        *self.channel.lock().await = Some(channel);
        Ok(())
    }

    /// Drop the channel; the next call reconnects
    pub async fn disconnect(&self) {
        *self.channel.lock().await = None;
        info!("Disconnected from lightwalletd");
    }

    async fn try_connect(&self) -> Result<Channel> {
        let endpoint_url = &self.config.endpoint;
        debug!("Connecting to {}", endpoint_url);

        let mut endpoint = Endpoint::from_shared(endpoint_url.to_string()).map_err(|e| {
            Error::Connection(format!(
                "Invalid endpoint URL format '{}': {}. Expected format: https://host:port",
                endpoint_url, e
            ))
        })?;
        endpoint = endpoint
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout);

        if self.config.tls {
            let mut tls_config = ClientTlsConfig::new();
            if let Some(name) = self
                .config
                .tls_server_name
                .clone()
                .or_else(|| extract_host(endpoint_url))
            {
                tls_config = tls_config.domain_name(name);
            }
            endpoint = endpoint
                .tls_config(tls_config)
                .map_err(|e| Error::Connection(format!("TLS configuration failed: {}", e)))?;
        }

        endpoint.connect().await.map_err(|e| {
            error!("Connection failed to {}: {}", endpoint_url, e);
            Error::Connection(format!("Transport connection failed: {}", e))
        })
    }

    async fn get_client(&self) -> Result<CompactTxStreamerClient<Channel>> {
        let mut guard = self.channel.lock().await;
        if guard.is_none() {
            *guard = Some(self.try_connect().await?);
        }
        let channel = guard
            .as_ref()
            .ok_or_else(|| Error::Connection("Not connected".to_string()))?
            .clone();
        Ok(CompactTxStreamerClient::new(channel))
    }

    fn height(&self, raw: u64) -> Result<BlockHeight> {
        Ok(BlockHeight::new(raw, self.config.network)?)
    }

    fn block_id(height: BlockHeight) -> proto::BlockId {
        proto::BlockId {
            height: height.value() as u64,
            hash: Vec::new(),
        }
    }

    fn proto_range(range: BlockRange) -> proto::BlockRange {
        proto::BlockRange {
            start: Some(Self::block_id(range.start)),
            end: Some(Self::block_id(range.end)),
        }
    }

    /// Execute operation with retry logic
    async fn with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T>> + Send,
    {
        let mut attempt = 0;
        let mut backoff = self.config.retry.initial_backoff;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.retry.max_attempts || !e.is_transient() {
                        return Err(e);
                    }

                    warn!(
                        "Operation failed (attempt {}), retrying in {:?}: {}",
                        attempt, backoff, e
                    );
                    if matches!(e, Error::Transport(_) | Error::Connection(_)) {
                        *self.channel.lock().await = None;
                    }

                    tokio::time::sleep(jitter_duration(backoff)).await;

                    backoff = std::cmp::min(
                        Duration::from_millis(
                            (backoff.as_millis() as f64 * self.config.retry.backoff_multiplier)
                                as u64,
                        ),
                        self.config.retry.max_backoff,
                    );
                }
            }
        }
    }
}

#[async_trait]
impl RemoteChainService for LightClient {
    async fn latest_height(&self) -> Result<BlockHeight> {
        let raw = self
            .with_retry(|| async {
                let mut client = self.get_client().await?;
                let response = client
                    .get_latest_block(tonic::Request::new(proto::ChainSpec {}))
                    .await?;
                let block_id = response.into_inner();
                debug!(
                    "Latest block: height={}, hash={}",
                    block_id.height,
                    hex::encode(&block_id.hash)
                );
                Ok(block_id.height)
            })
            .await?;
        self.height(raw)
    }

    async fn block_range(&self, range: BlockRange) -> Result<BlockStream> {
        let stream = self
            .with_retry(|| async {
                let mut client = self.get_client().await?;
                debug!("Requesting blocks {}", range);
                let request = tonic::Request::new(Self::proto_range(range));
                Ok(client.get_block_range(request).await?.into_inner())
            })
            .await?;

        let network = self.config.network;
        Ok(stream
            .map(move |item| -> Result<CompactBlock> {
                let block = item?;
                Ok(CompactBlock {
                    height: BlockHeight::new(block.height, network)?,
                    hash: block.hash.clone(),
                    prev_hash: block.prev_hash.clone(),
                    data: block.encode_to_vec(),
                })
            })
            .boxed())
    }

    async fn server_info(&self) -> Result<ServerInfo> {
        self.with_retry(|| async {
            let mut client = self.get_client().await?;
            let info = client
                .get_lightd_info(tonic::Request::new(proto::Empty {}))
                .await?
                .into_inner();
            Ok(ServerInfo {
                version: info.version,
                vendor: info.vendor,
                chain_name: info.chain_name,
                consensus_branch_id: info.consensus_branch_id,
                block_height: info.block_height,
                estimated_height: info.estimated_height,
                sapling_activation_height: info.sapling_activation_height,
                taddr_support: info.taddr_support,
            })
        })
        .await
    }

    async fn submit(&self, raw_tx: &[u8]) -> Result<SubmitResponse> {
        info!("Broadcasting transaction ({} bytes)", raw_tx.len());

        let response = self
            .with_retry(|| async {
                let mut client = self.get_client().await?;
                let request = tonic::Request::new(proto::RawTransaction {
                    data: raw_tx.to_vec(),
                    height: 0,
                });
                Ok(client.send_transaction(request).await?.into_inner())
            })
            .await?;

        if response.error_code < 0 {
            warn!(
                "Transaction broadcast rejected: code={}, message={}",
                response.error_code, response.error_message
            );
        } else {
            info!("Transaction broadcast successful: {}", compute_txid(raw_tx));
        }

        Ok(SubmitResponse {
            code: response.error_code,
            message: response.error_message,
        })
    }

    async fn fetch_transaction(&self, txid: &[u8]) -> Result<RawTransaction> {
        let raw = self
            .with_retry(|| async {
                let mut client = self.get_client().await?;
                let filter = proto::TxFilter {
                    block: None,
                    index: 0,
                    hash: txid.to_vec(),
                };
                Ok(client
                    .get_transaction(tonic::Request::new(filter))
                    .await?
                    .into_inner())
            })
            .await?;
        debug!("Received full transaction ({} bytes)", raw.data.len());
        Ok(RawTransaction {
            data: raw.data,
            height: self.height(raw.height).ok(),
        })
    }

    async fn transparent_transactions(
        &self,
        address: &str,
        range: BlockRange,
    ) -> Result<Vec<RawTransaction>> {
        let mut stream = self
            .with_retry(|| async {
                let mut client = self.get_client().await?;
                let filter = proto::TransparentAddressBlockFilter {
                    address: address.to_string(),
                    range: Some(Self::proto_range(range)),
                };
                Ok(client
                    .get_taddress_txids(tonic::Request::new(filter))
                    .await?
                    .into_inner())
            })
            .await?;

        let mut txs = Vec::new();
        while let Some(raw) = stream.message().await? {
            txs.push(RawTransaction {
                height: self.height(raw.height).ok(),
                data: raw.data,
            });
        }
        Ok(txs)
    }

    async fn utxos(&self, address: &str, start: BlockHeight) -> Result<Vec<Utxo>> {
        let list = self
            .with_retry(|| async {
                let mut client = self.get_client().await?;
                let arg = proto::GetAddressUtxosArg {
                    addresses: vec![address.to_string()],
                    start_height: start.value() as u64,
                    max_entries: 0,
                };
                Ok(client
                    .get_address_utxos(tonic::Request::new(arg))
                    .await?
                    .into_inner())
            })
            .await?;

        let params = ConsensusParams::from_network(self.config.network);
        list.address_utxos
            .into_iter()
            .map(|reply| {
                Ok(Utxo {
                    address: reply.address,
                    txid: reply.txid,
                    index: u32::try_from(reply.index)
                        .map_err(|_| Error::Network(format!("Negative output index {}", reply.index)))?,
                    script: reply.script,
                    value: Zatoshi::new(reply.value_zat, &params)?,
                    height: self.height(reply.height)?,
                })
            })
            .collect()
    }
}

impl Clone for LightClient {
    fn clone(&self) -> Self {
        // Clone shares the existing channel to avoid reconnect races.
        Self {
            config: self.config.clone(),
            channel: Arc::clone(&self.channel),
        }
    }
}

/// Extract hostname from URL
fn extract_host(url: &str) -> Option<String> {
    let without_proto = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    without_proto
        .split([':', '/'])
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Transaction id of raw transaction bytes: double SHA-256, byte-reversed, hex
pub fn compute_txid(raw_tx: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let hash1 = Sha256::digest(raw_tx);
    let hash2 = Sha256::digest(hash1);

    let mut txid_bytes: [u8; 32] = hash2.into();
    txid_bytes.reverse();

    hex::encode(txid_bytes)
}
