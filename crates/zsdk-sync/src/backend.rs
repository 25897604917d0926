//! Capability traits for the remote light server, the block cache and the
//! wallet data store, plus the value types that cross those seams.
//!
//! The engine never interprets compact block contents or transaction bytes;
//! trial decryption, note commitment trees and transaction construction all
//! live behind [`WalletDataStore`].

use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use zsdk_params::{BlockHeight, Checkpoint, ConsensusParams, Zatoshi};

/// Account used when the caller does not name one.
pub const DEFAULT_ACCOUNT: u32 = 0;

/// Inclusive height range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    /// First height
    pub start: BlockHeight,
    /// Last height (inclusive)
    pub end: BlockHeight,
}

impl BlockRange {
    /// Range `[start, end]`, or `None` when `start > end`
    pub fn new(start: BlockHeight, end: BlockHeight) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Number of blocks in the range
    pub fn len(&self) -> u32 {
        self.end.value() - self.start.value() + 1
    }

    /// Ranges are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether `height` lies inside the range
    pub fn contains(&self, height: BlockHeight) -> bool {
        height >= self.start && height <= self.end
    }

    /// Split into consecutive sub-ranges of at most `size` blocks
    pub fn chunks(&self, size: u32) -> Vec<BlockRange> {
        let size = size.max(1);
        let mut out = Vec::new();
        let mut start = self.start;
        loop {
            let end_value = start.value().saturating_add(size - 1).min(self.end.value());
            let end = start.with_value(end_value as u64).unwrap_or(self.end);
            out.push(BlockRange { start, end });
            if end >= self.end {
                break;
            }
            match end.checked_add(1) {
                Ok(next) => start = next,
                Err(_) => break,
            }
        }
        out
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Compact block as streamed by the light server.
///
/// `data` is the serialized block, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactBlock {
    /// Block height
    pub height: BlockHeight,
    /// Block hash
    pub hash: Vec<u8>,
    /// Hash of the parent block
    pub prev_hash: Vec<u8>,
    /// Serialized compact block
    pub data: Vec<u8>,
}

/// Light server metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    /// Server version
    pub version: String,
    /// Vendor name
    pub vendor: String,
    /// Chain name ("main", "test", ...)
    pub chain_name: String,
    /// Consensus branch id at the server's tip (hex)
    pub consensus_branch_id: String,
    /// Current block height
    pub block_height: u64,
    /// Estimated network height
    pub estimated_height: u64,
    /// Sapling activation height
    pub sapling_activation_height: u64,
    /// Whether transparent address queries are supported
    pub taddr_support: bool,
}

/// Result of handing a raw transaction to the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitResponse {
    /// Error code; negative values signal failure
    pub code: i32,
    /// Error message (empty on success)
    pub message: String,
}

impl SubmitResponse {
    /// Whether the server accepted the transaction
    pub fn is_success(&self) -> bool {
        self.code >= 0
    }
}

/// Full transaction bytes fetched from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    /// Serialized transaction
    pub data: Vec<u8>,
    /// Mined height, `None` if in mempool
    pub height: Option<BlockHeight>,
}

/// Unspent transparent output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// Owning address
    pub address: String,
    /// Transaction id
    pub txid: Vec<u8>,
    /// Output index
    pub index: u32,
    /// Locking script
    pub script: Vec<u8>,
    /// Value in zatoshis
    pub value: Zatoshi,
    /// Mined height
    pub height: BlockHeight,
}

/// Spendable and total balance for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    total: Zatoshi,
    available: Zatoshi,
}

impl WalletBalance {
    /// Build a balance, rejecting `available > total`
    pub fn new(total: Zatoshi, available: Zatoshi) -> Result<Self> {
        if available > total {
            return Err(Error::InvalidAmount(available.value()));
        }
        Ok(Self { total, available })
    }

    /// Build from raw zatoshi values
    pub fn from_values(total: i64, available: i64, params: &ConsensusParams) -> Result<Self> {
        Self::new(Zatoshi::new(total, params)?, Zatoshi::new(available, params)?)
    }

    /// Total balance, including unconfirmed funds
    pub fn total(&self) -> Zatoshi {
        self.total
    }

    /// Spendable balance
    pub fn available(&self) -> Zatoshi {
        self.available
    }

    /// Funds not yet spendable
    pub fn pending(&self) -> i64 {
        self.total.value() - self.available.value()
    }
}

/// Transaction built by the wallet data store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedTransaction {
    /// Transaction id
    pub txid: Vec<u8>,
    /// Serialized transaction
    pub raw: Vec<u8>,
    /// Expiry height
    pub expiry_height: Option<BlockHeight>,
}

/// Lazy sequence of compact blocks
pub type BlockStream = BoxStream<'static, Result<CompactBlock>>;

/// The remote light server.
#[async_trait]
pub trait RemoteChainService: Send + Sync {
    /// Current chain tip
    async fn latest_height(&self) -> Result<BlockHeight>;

    /// Stream compact blocks in `range`, in ascending order
    async fn block_range(&self, range: BlockRange) -> Result<BlockStream>;

    /// Server metadata
    async fn server_info(&self) -> Result<ServerInfo>;

    /// Broadcast a raw transaction
    async fn submit(&self, raw_tx: &[u8]) -> Result<SubmitResponse>;

    /// Fetch a full transaction by id
    async fn fetch_transaction(&self, txid: &[u8]) -> Result<RawTransaction>;

    /// Transactions touching a transparent address within `range`
    async fn transparent_transactions(
        &self,
        address: &str,
        range: BlockRange,
    ) -> Result<Vec<RawTransaction>>;

    /// Unspent outputs of a transparent address mined at or after `start`
    async fn utxos(&self, address: &str, start: BlockHeight) -> Result<Vec<Utxo>>;
}

/// Local store of downloaded but not yet scanned compact blocks.
#[async_trait]
pub trait BlockCacheStore: Send + Sync {
    /// Highest cached height, `None` when empty
    async fn highest_height(&self) -> Result<Option<BlockHeight>>;

    /// Persist a batch of blocks, replacing any at the same heights
    async fn write_batch(&self, blocks: Vec<CompactBlock>) -> Result<()>;

    /// Delete every block above `height`
    async fn truncate_above(&self, height: BlockHeight) -> Result<()>;

    /// Read one block
    async fn read(&self, height: BlockHeight) -> Result<Option<CompactBlock>>;
}

/// Wallet database plus the cryptographic backend that operates on it.
#[async_trait]
pub trait WalletDataStore: Send + Sync {
    /// Whether the store still needs seeding with a birthday and keys
    async fn needs_initialization(&self) -> Result<bool>;

    /// Seed the store with the birthday checkpoint and viewing keys
    async fn initialize(&self, birthday: &Checkpoint, viewing_keys: &[String]) -> Result<()>;

    /// Highest scanned height, `None` before the first scan
    async fn last_scanned_height(&self) -> Result<Option<BlockHeight>>;

    /// Lowest scanned height, `None` before the first scan
    async fn first_scanned_height(&self) -> Result<Option<BlockHeight>>;

    /// Check hash linkage of cached blocks above the last scanned height.
    /// Returns the first height where linkage breaks.
    async fn validate_continuity(&self, limit: Option<u32>) -> Result<Option<BlockHeight>>;

    /// Scan up to `limit` cached blocks; `false` signals a backend failure
    async fn scan(&self, limit: u32) -> Result<bool>;

    /// Nearest height at or below `height` the store can rewind to
    async fn nearest_rewind_height(&self, height: BlockHeight) -> Result<BlockHeight>;

    /// Discard wallet state above `height`
    async fn rewind_to(&self, height: BlockHeight) -> Result<()>;

    /// Shielded balance of an account
    async fn balances(&self, account: u32) -> Result<WalletBalance>;

    /// Transparent balance of an address
    async fn transparent_balances(&self, address: &str) -> Result<WalletBalance>;

    /// Height at which `txid` was mined, if known
    async fn mined_height(&self, txid: &[u8]) -> Result<Option<BlockHeight>>;

    /// Build a spend; returns the store's transaction row id
    async fn create_spend(
        &self,
        account: u32,
        spending_key: &str,
        to: &str,
        value: Zatoshi,
        memo: &[u8],
    ) -> Result<i64>;

    /// Build a shielding transaction; returns the store's transaction row id
    async fn create_shielding(&self, account: u32, spending_key: &str, memo: &[u8]) -> Result<i64>;

    /// Raw bytes, txid and expiry of a transaction built by this store
    async fn encoded_transaction(&self, tx_row: i64) -> Result<EncodedTransaction>;

    /// Consensus branch id active at `height`
    async fn branch_id_for_height(&self, height: BlockHeight) -> Result<u32>;

    /// Transaction ids found in `range` that still need full data
    async fn transactions_to_enhance(&self, range: BlockRange) -> Result<Vec<Vec<u8>>>;

    /// Store a full transaction, decrypting memos and outputs
    async fn decrypt_and_store_transaction(
        &self,
        raw: &[u8],
        height: Option<BlockHeight>,
    ) -> Result<()>;

    /// Replace the known UTXO set of an address
    async fn put_utxos(&self, address: &str, utxos: Vec<Utxo>) -> Result<()>;

    /// Unified address of an account
    async fn unified_address(&self, account: u32) -> Result<String>;

    /// Sapling address of an account
    async fn sapling_address(&self, account: u32) -> Result<String>;

    /// Transparent address of an account
    async fn transparent_address(&self, account: u32) -> Result<String>;

    /// Whether `address` is a shielded address on this network
    fn is_valid_shielded_address(&self, address: &str) -> bool;

    /// Whether `address` is a transparent address on this network
    fn is_valid_transparent_address(&self, address: &str) -> bool;
}
