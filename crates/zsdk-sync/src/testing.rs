//! In-memory doubles for the remote light server and the wallet data store.
//!
//! Blocks are synthetic: each hash is derived from the height and the fork
//! generation that height belongs to, so [`MockRemote::reorg_from`] changes
//! every hash at and above the fork point while leaving linkage intact.

use crate::backend::{
    BlockCacheStore, BlockRange, BlockStream, CompactBlock, EncodedTransaction, RawTransaction,
    RemoteChainService, ServerInfo, SubmitResponse, Utxo, WalletBalance, WalletDataStore,
};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use zsdk_params::{BlockHeight, Checkpoint, Network, NetworkType, Zatoshi};

/// Branch id reported by default (NU5)
pub const MOCK_BRANCH_ID: u32 = 0xc2d6_d0b4;

/// Blocks between creating a transaction and its expiry in the mock store
pub const MOCK_EXPIRY_DELTA: u32 = 40;

fn block_hash(height: u32, generation: u32) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(height.to_le_bytes());
    hasher.update(generation.to_le_bytes());
    hasher.finalize().to_vec()
}

struct ChainState {
    tip: u32,
    forks: Vec<u32>,
}

impl ChainState {
    fn generation(&self, height: u32) -> u32 {
        self.forks.iter().filter(|&&from| from <= height).count() as u32
    }

    fn hash(&self, height: u32) -> Vec<u8> {
        block_hash(height, self.generation(height))
    }
}

/// Scriptable light server.
pub struct MockRemote {
    network: NetworkType,
    chain: Mutex<ChainState>,
    tip_failures: AtomicU32,
    batch_failures: AtomicU32,
    withheld: Mutex<HashSet<u32>>,
    submit_failures: AtomicU32,
    submit_responses: Mutex<VecDeque<SubmitResponse>>,
    submit_gate: tokio::sync::watch::Sender<bool>,
    submitted: Mutex<Vec<Vec<u8>>>,
    server_info: Mutex<Option<ServerInfo>>,
    transactions: Mutex<HashMap<Vec<u8>, RawTransaction>>,
    transparent: Mutex<HashMap<String, Vec<RawTransaction>>>,
    utxos: Mutex<HashMap<String, Vec<Utxo>>>,
    tip_calls: AtomicUsize,
    range_calls: AtomicUsize,
}

impl MockRemote {
    /// Server whose chain currently ends at `tip`
    pub fn new(network: NetworkType, tip: u32) -> Self {
        Self {
            network,
            chain: Mutex::new(ChainState {
                tip,
                forks: Vec::new(),
            }),
            tip_failures: AtomicU32::new(0),
            batch_failures: AtomicU32::new(0),
            withheld: Mutex::new(HashSet::new()),
            submit_failures: AtomicU32::new(0),
            submit_responses: Mutex::new(VecDeque::new()),
            submit_gate: tokio::sync::watch::channel(true).0,
            submitted: Mutex::new(Vec::new()),
            server_info: Mutex::new(None),
            transactions: Mutex::new(HashMap::new()),
            transparent: Mutex::new(HashMap::new()),
            utxos: Mutex::new(HashMap::new()),
            tip_calls: AtomicUsize::new(0),
            range_calls: AtomicUsize::new(0),
        }
    }

    /// Current tip
    pub fn tip(&self) -> u32 {
        self.chain.lock().tip
    }

    /// Move the tip
    pub fn set_tip(&self, tip: u32) {
        self.chain.lock().tip = tip;
    }

    /// Mine `blocks` more blocks
    pub fn advance(&self, blocks: u32) {
        self.chain.lock().tip += blocks;
    }

    /// Replace every block at or above `height` with a competing branch
    pub fn reorg_from(&self, height: u32) {
        self.chain.lock().forks.push(height);
    }

    /// The block this server currently serves at `height`
    pub fn block(&self, height: u32) -> Result<CompactBlock> {
        let chain = self.chain.lock();
        Ok(CompactBlock {
            height: BlockHeight::new(height as u64, self.network)?,
            hash: chain.hash(height),
            prev_hash: chain.hash(height.saturating_sub(1)),
            data: height.to_le_bytes().to_vec(),
        })
    }

    /// Hash served at `height`
    pub fn hash_at(&self, height: u32) -> Vec<u8> {
        self.chain.lock().hash(height)
    }

    /// Fail the next `n` tip requests with a network error
    pub fn fail_next_tip_requests(&self, n: u32) {
        self.tip_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` block range requests with a network error
    pub fn fail_next_batches(&self, n: u32) {
        self.batch_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every block range request starting at `start` until released
    pub fn withhold_batches_from(&self, start: u32) {
        self.withheld.lock().insert(start);
    }

    /// Serve withheld ranges again
    pub fn release_batches(&self) {
        self.withheld.lock().clear();
    }

    /// Fail the next `n` submit calls at the transport level
    pub fn fail_next_submits(&self, n: u32) {
        self.submit_failures.store(n, Ordering::SeqCst);
    }

    /// Queue the response for a future submit call; accepted when empty
    pub fn queue_submit_response(&self, response: SubmitResponse) {
        self.submit_responses.lock().push_back(response);
    }

    /// Park submit calls until [`release_submits`](Self::release_submits)
    pub fn hold_submits(&self) {
        self.submit_gate.send_replace(false);
    }

    /// Let parked submit calls through
    pub fn release_submits(&self) {
        self.submit_gate.send_replace(true);
    }

    /// Raw transactions received so far
    pub fn submitted(&self) -> Vec<Vec<u8>> {
        self.submitted.lock().clone()
    }

    /// Override the server info
    pub fn set_server_info(&self, info: ServerInfo) {
        *self.server_info.lock() = Some(info);
    }

    /// Serve `tx` for `txid`
    pub fn add_transaction(&self, txid: Vec<u8>, tx: RawTransaction) {
        self.transactions.lock().insert(txid, tx);
    }

    /// Serve `txs` as the history of a transparent address
    pub fn set_transparent_transactions(&self, address: &str, txs: Vec<RawTransaction>) {
        self.transparent.lock().insert(address.to_string(), txs);
    }

    /// Serve `utxos` for a transparent address
    pub fn set_utxos(&self, address: &str, utxos: Vec<Utxo>) {
        self.utxos.lock().insert(address.to_string(), utxos);
    }

    /// Number of tip requests served or failed
    pub fn tip_calls(&self) -> usize {
        self.tip_calls.load(Ordering::SeqCst)
    }

    /// Number of block range requests served or failed
    pub fn range_calls(&self) -> usize {
        self.range_calls.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteChainService for MockRemote {
    async fn latest_height(&self) -> Result<BlockHeight> {
        self.tip_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.tip_failures) {
            return Err(Error::Network("mock: tip unavailable".to_string()));
        }
        Ok(BlockHeight::new(self.tip() as u64, self.network)?)
    }

    async fn block_range(&self, range: BlockRange) -> Result<BlockStream> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.batch_failures)
            || self.withheld.lock().contains(&range.start.value())
        {
            return Err(Error::Network(format!("mock: range {} unavailable", range)));
        }
        let end = range.end.value().min(self.tip());
        let blocks = (range.start.value()..=end)
            .map(|h| self.block(h))
            .collect::<Vec<_>>();
        Ok(stream::iter(blocks).boxed())
    }

    async fn server_info(&self) -> Result<ServerInfo> {
        if let Some(info) = self.server_info.lock().clone() {
            return Ok(info);
        }
        let network = Network::from_type(self.network);
        Ok(ServerInfo {
            version: "mock".to_string(),
            vendor: "zsdk".to_string(),
            chain_name: network.chain_name.to_string(),
            consensus_branch_id: format!("{:08x}", MOCK_BRANCH_ID),
            block_height: self.tip() as u64,
            estimated_height: self.tip() as u64,
            sapling_activation_height: network.sapling_activation_height as u64,
            taddr_support: true,
        })
    }

    async fn submit(&self, raw_tx: &[u8]) -> Result<SubmitResponse> {
        let mut gate = self.submit_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if Self::take_failure(&self.submit_failures) {
            return Err(Error::Network("mock: submit unavailable".to_string()));
        }
        self.submitted.lock().push(raw_tx.to_vec());
        Ok(self.submit_responses.lock().pop_front().unwrap_or_default())
    }

    async fn fetch_transaction(&self, txid: &[u8]) -> Result<RawTransaction> {
        self.transactions
            .lock()
            .get(txid)
            .cloned()
            .ok_or_else(|| Error::Network(format!("mock: unknown txid {}", hex::encode(txid))))
    }

    async fn transparent_transactions(
        &self,
        address: &str,
        range: BlockRange,
    ) -> Result<Vec<RawTransaction>> {
        let txs = self.transparent.lock().get(address).cloned().unwrap_or_default();
        Ok(txs
            .into_iter()
            .filter(|tx| tx.height.map_or(true, |h| range.contains(h)))
            .collect())
    }

    async fn utxos(&self, address: &str, start: BlockHeight) -> Result<Vec<Utxo>> {
        let utxos = self.utxos.lock().get(address).cloned().unwrap_or_default();
        Ok(utxos.into_iter().filter(|u| u.height >= start).collect())
    }
}

struct StoreState {
    birthday: BlockHeight,
    initialized: bool,
    viewing_keys: Vec<String>,
    scanned: BTreeMap<u32, Vec<u8>>,
    rewinds: Vec<BlockHeight>,
    rewind_interval: u32,
    balance: WalletBalance,
    transparent_balance: WalletBalance,
    mined: HashMap<Vec<u8>, BlockHeight>,
    to_enhance: Vec<Vec<u8>>,
    enhanced: Vec<Vec<u8>>,
    utxos: HashMap<String, Vec<Utxo>>,
    built: BTreeMap<i64, EncodedTransaction>,
    fail_scan: bool,
    fail_create: bool,
    branch_id: u32,
    scan_calls: usize,
}

/// Wallet data store that "scans" by recording block hashes.
///
/// Continuity is checked against the block cache it shares with the
/// processor, so reorgs served by [`MockRemote`] surface as validation errors.
pub struct MockWalletStore {
    network: NetworkType,
    cache: Arc<dyn BlockCacheStore>,
    state: Mutex<StoreState>,
}

impl MockWalletStore {
    /// Store for a wallet born at `birthday`, reading blocks from `cache`
    pub fn new(cache: Arc<dyn BlockCacheStore>, birthday: BlockHeight) -> Self {
        Self {
            network: birthday.network(),
            cache,
            state: Mutex::new(StoreState {
                birthday,
                initialized: false,
                viewing_keys: Vec::new(),
                scanned: BTreeMap::new(),
                rewinds: Vec::new(),
                rewind_interval: 1,
                balance: WalletBalance::default(),
                transparent_balance: WalletBalance::default(),
                mined: HashMap::new(),
                to_enhance: Vec::new(),
                enhanced: Vec::new(),
                utxos: HashMap::new(),
                built: BTreeMap::new(),
                fail_scan: false,
                fail_create: false,
                branch_id: MOCK_BRANCH_ID,
                scan_calls: 0,
            }),
        }
    }

    /// Round rewind targets down to multiples of `interval`
    pub fn set_rewind_interval(&self, interval: u32) {
        self.state.lock().rewind_interval = interval.max(1);
    }

    /// Shielded balance reported for every account
    pub fn set_balance(&self, balance: WalletBalance) {
        self.state.lock().balance = balance;
    }

    /// Transparent balance reported for every address
    pub fn set_transparent_balance(&self, balance: WalletBalance) {
        self.state.lock().transparent_balance = balance;
    }

    /// `txid` becomes visible as mined once the wallet has scanned `height`
    pub fn mine_transaction(&self, txid: Vec<u8>, height: BlockHeight) {
        self.state.lock().mined.insert(txid, height);
    }

    /// Transaction ids handed out by the next enhancement listing
    pub fn set_transactions_to_enhance(&self, txids: Vec<Vec<u8>>) {
        self.state.lock().to_enhance = txids;
    }

    /// Make `scan` report failure
    pub fn set_fail_scan(&self, fail: bool) {
        self.state.lock().fail_scan = fail;
    }

    /// Make transaction construction fail
    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    /// Branch id returned for every height
    pub fn set_branch_id(&self, branch_id: u32) {
        self.state.lock().branch_id = branch_id;
    }

    /// Heights the store was rewound to, in order
    pub fn rewinds(&self) -> Vec<BlockHeight> {
        self.state.lock().rewinds.clone()
    }

    /// Hash recorded when `height` was scanned
    pub fn scanned_hash(&self, height: u32) -> Option<Vec<u8>> {
        self.state.lock().scanned.get(&height).cloned()
    }

    /// Raw transactions stored by enhancement
    pub fn enhanced(&self) -> Vec<Vec<u8>> {
        self.state.lock().enhanced.clone()
    }

    /// UTXOs last stored for `address`
    pub fn utxos(&self, address: &str) -> Vec<Utxo> {
        self.state.lock().utxos.get(address).cloned().unwrap_or_default()
    }

    /// Viewing keys the store was initialized with
    pub fn viewing_keys(&self) -> Vec<String> {
        self.state.lock().viewing_keys.clone()
    }

    /// Number of scan calls
    pub fn scan_calls(&self) -> usize {
        self.state.lock().scan_calls
    }

    fn height(&self, value: u32) -> Result<BlockHeight> {
        Ok(BlockHeight::new(value as u64, self.network)?)
    }

    fn next_unscanned(&self) -> u32 {
        let state = self.state.lock();
        state
            .scanned
            .keys()
            .next_back()
            .copied()
            .unwrap_or(state.birthday.value())
            + 1
    }

    fn build(&self, to: &str, value: Zatoshi, memo: &[u8]) -> Result<i64> {
        let mut state = self.state.lock();
        if state.fail_create {
            return Err(Error::Encoding("mock: proving failed".to_string()));
        }
        let row = state.built.keys().next_back().copied().unwrap_or(0) + 1;
        let base = state
            .scanned
            .keys()
            .next_back()
            .copied()
            .unwrap_or(state.birthday.value());
        let expiry = BlockHeight::new((base + MOCK_EXPIRY_DELTA) as u64, self.network)?;

        let mut raw = Vec::new();
        raw.extend_from_slice(&row.to_le_bytes());
        raw.extend_from_slice(to.as_bytes());
        raw.extend_from_slice(&value.value().to_le_bytes());
        raw.extend_from_slice(memo);
        let txid = Sha256::digest(Sha256::digest(&raw)).to_vec();

        state.built.insert(
            row,
            EncodedTransaction {
                txid,
                raw,
                expiry_height: Some(expiry),
            },
        );
        Ok(row)
    }
}

#[async_trait]
impl WalletDataStore for MockWalletStore {
    async fn needs_initialization(&self) -> Result<bool> {
        Ok(!self.state.lock().initialized)
    }

    async fn initialize(&self, birthday: &Checkpoint, viewing_keys: &[String]) -> Result<()> {
        let birthday = birthday.block_height(self.network)?;
        let mut state = self.state.lock();
        state.birthday = birthday;
        state.viewing_keys = viewing_keys.to_vec();
        state.initialized = true;
        Ok(())
    }

    async fn last_scanned_height(&self) -> Result<Option<BlockHeight>> {
        let last = self.state.lock().scanned.keys().next_back().copied();
        last.map(|h| self.height(h)).transpose()
    }

    async fn first_scanned_height(&self) -> Result<Option<BlockHeight>> {
        let first = self.state.lock().scanned.keys().next().copied();
        first.map(|h| self.height(h)).transpose()
    }

    async fn validate_continuity(&self, limit: Option<u32>) -> Result<Option<BlockHeight>> {
        let Some(top) = self.cache.highest_height().await? else {
            return Ok(None);
        };
        let start = self.next_unscanned();
        let end = match limit {
            Some(limit) => top.value().min(start.saturating_add(limit.max(1) - 1)),
            None => top.value(),
        };
        if start > end {
            return Ok(None);
        }

        let mut prev = match self.scanned_hash(start - 1) {
            Some(hash) => Some(hash),
            None => match start.checked_sub(1).filter(|&h| h >= 1) {
                Some(h) => self
                    .cache
                    .read(self.height(h)?)
                    .await?
                    .map(|b| b.hash),
                None => None,
            },
        };

        for h in start..=end {
            let height = self.height(h)?;
            let Some(block) = self.cache.read(height).await? else {
                return Ok(Some(height));
            };
            if let Some(expected) = &prev {
                if &block.prev_hash != expected {
                    return Ok(Some(height));
                }
            }
            prev = Some(block.hash);
        }
        Ok(None)
    }

    async fn scan(&self, limit: u32) -> Result<bool> {
        let start = {
            let mut state = self.state.lock();
            state.scan_calls += 1;
            if state.fail_scan {
                return Ok(false);
            }
            drop(state);
            self.next_unscanned()
        };

        let mut blocks = Vec::new();
        for h in start..start.saturating_add(limit.max(1)) {
            match self.cache.read(self.height(h)?).await? {
                Some(block) => blocks.push(block),
                None => break,
            }
        }

        let mut state = self.state.lock();
        for block in blocks {
            state.scanned.insert(block.height.value(), block.hash);
        }
        Ok(true)
    }

    async fn nearest_rewind_height(&self, height: BlockHeight) -> Result<BlockHeight> {
        let (interval, birthday) = {
            let state = self.state.lock();
            (state.rewind_interval, state.birthday)
        };
        let rounded = height.value() - height.value() % interval;
        Ok(self.height(rounded.max(birthday.value()))?)
    }

    async fn rewind_to(&self, height: BlockHeight) -> Result<()> {
        let mut state = self.state.lock();
        state.scanned.retain(|&h, _| h <= height.value());
        state.rewinds.push(height);
        Ok(())
    }

    async fn balances(&self, _account: u32) -> Result<WalletBalance> {
        Ok(self.state.lock().balance)
    }

    async fn transparent_balances(&self, _address: &str) -> Result<WalletBalance> {
        Ok(self.state.lock().transparent_balance)
    }

    async fn mined_height(&self, txid: &[u8]) -> Result<Option<BlockHeight>> {
        let state = self.state.lock();
        let last = state.scanned.keys().next_back().copied();
        Ok(state
            .mined
            .get(txid)
            .copied()
            .filter(|h| last.is_some_and(|last| h.value() <= last)))
    }

    async fn create_spend(
        &self,
        _account: u32,
        _spending_key: &str,
        to: &str,
        value: Zatoshi,
        memo: &[u8],
    ) -> Result<i64> {
        let available = self.state.lock().balance.available();
        if value > available {
            return Err(Error::Encoding(format!(
                "insufficient funds: {} available, {} requested",
                available, value
            )));
        }
        self.build(to, value, memo)
    }

    async fn create_shielding(&self, account: u32, _spending_key: &str, memo: &[u8]) -> Result<i64> {
        let funds = self.state.lock().transparent_balance.available();
        if funds == Zatoshi::ZERO {
            return Err(Error::Encoding("no transparent funds to shield".to_string()));
        }
        self.build(&format!("self:{account}"), funds, memo)
    }

    async fn encoded_transaction(&self, tx_row: i64) -> Result<EncodedTransaction> {
        self.state
            .lock()
            .built
            .get(&tx_row)
            .cloned()
            .ok_or_else(|| Error::Encoding(format!("mock: no transaction row {tx_row}")))
    }

    async fn branch_id_for_height(&self, _height: BlockHeight) -> Result<u32> {
        Ok(self.state.lock().branch_id)
    }

    async fn transactions_to_enhance(&self, _range: BlockRange) -> Result<Vec<Vec<u8>>> {
        Ok(std::mem::take(&mut self.state.lock().to_enhance))
    }

    async fn decrypt_and_store_transaction(
        &self,
        raw: &[u8],
        _height: Option<BlockHeight>,
    ) -> Result<()> {
        self.state.lock().enhanced.push(raw.to_vec());
        Ok(())
    }

    async fn put_utxos(&self, address: &str, utxos: Vec<Utxo>) -> Result<()> {
        self.state.lock().utxos.insert(address.to_string(), utxos);
        Ok(())
    }

    async fn unified_address(&self, account: u32) -> Result<String> {
        Ok(format!("u1mock{}{account}", self.network.name()))
    }

    async fn sapling_address(&self, account: u32) -> Result<String> {
        Ok(format!("zs1mock{}{account}", self.network.name()))
    }

    async fn transparent_address(&self, account: u32) -> Result<String> {
        Ok(format!("t1mock{}{account}", self.network.name()))
    }

    fn is_valid_shielded_address(&self, address: &str) -> bool {
        address.starts_with("zs1") || address.starts_with("u1")
    }

    fn is_valid_transparent_address(&self, address: &str) -> bool {
        address.starts_with("t1")
    }
}
