//! Wallet coordinator
//!
//! [`Synchronizer`] wires a [`CompactBlockProcessor`] and an
//! [`OutboundTransactionManager`] to one wallet identity. It republishes
//! status, progress and balances as watch channels, refreshes wallet views
//! after every scanned range and runs spends in the background.

use crate::config::SynchronizerConfig;
use crate::models::{AddressType, SyncStatus, WalletBalances};
use crate::registry::{InstanceLease, SynchronizerIdentity, SynchronizerRegistry};
use crate::storage::StoragePaths;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zsdk_params::{BlockHeight, ConsensusParams, NetworkType};
use zsdk_sync::retry::backoff_delay;
use zsdk_sync::{
    Backends, BlockCacheStore, BlockRange, CancelToken, CompactBlockProcessor, Decision, Handlers,
    LightClient, OutboundTransactionManager, PassObserver, PendingState, PendingTransaction,
    PendingTransactionLedger, ProcessorInfo, ProcessorState, RemoteChainService, ServerInfo,
    SqliteBlockCache, SqlitePendingLedger, SyncConfig, SyncEvent, WalletDataStore,
    DEFAULT_ACCOUNT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Started,
    Closed,
}

/// State shared with the scan observer and background spend tasks
struct Shared {
    birthday: BlockHeight,
    backends: Backends,
    store_gate: Arc<RwLock<()>>,
    outbound: Arc<OutboundTransactionManager>,
    balances: watch::Sender<WalletBalances>,
    transactions: watch::Sender<u64>,
}

impl Shared {
    async fn refresh_utxos(&self, account: u32) -> zsdk_sync::Result<usize> {
        let store = &self.backends.store;
        let address = store.transparent_address(account).await?;
        let utxos = self.backends.remote.utxos(&address, self.birthday).await?;
        let count = utxos.len();
        store.put_utxos(&address, utxos).await?;
        debug!("Stored {} UTXOs for account {}", count, account);
        Ok(count)
    }

    async fn refresh_balances(&self) -> zsdk_sync::Result<WalletBalances> {
        let _gate = self.store_gate.read().await;
        let store = &self.backends.store;

        let shielded = store.balances(DEFAULT_ACCOUNT).await?;
        let address = store.transparent_address(DEFAULT_ACCOUNT).await?;
        let transparent = store.transparent_balances(&address).await?;

        let balances = WalletBalances {
            shielded: Some(shielded),
            transparent: Some(transparent),
        };
        self.balances.send_replace(balances);
        Ok(balances)
    }

    async fn reconcile(&self) -> zsdk_sync::Result<()> {
        let Some(last) = self.backends.store.last_scanned_height().await? else {
            return Ok(());
        };
        let report = self.outbound.reconcile(last).await?;
        if !report.mined.is_empty() || !report.removed.is_empty() {
            debug!(
                "Reconciled pending transactions: {} mined, {} marked, {} removed",
                report.mined.len(),
                report.marked.len(),
                report.removed.len()
            );
        }
        Ok(())
    }

    fn invalidate_transactions(&self) {
        self.transactions.send_modify(|version| *version = version.wrapping_add(1));
    }
}

/// Post-scan refresh, in a fixed order
struct ScanObserver {
    shared: Arc<Shared>,
}

#[async_trait]
impl PassObserver for ScanObserver {
    async fn on_scanned(&self, range: BlockRange) {
        debug!("Refreshing wallet views after {}", range);

        if let Err(e) = self.shared.refresh_utxos(DEFAULT_ACCOUNT).await {
            warn!(event = "utxo_refresh_failed", error = %e, "UTXO refresh failed");
        }
        if let Err(e) = self.shared.refresh_balances().await {
            warn!(event = "balance_refresh_failed", error = %e, "Balance refresh failed");
        }
        if let Err(e) = self.shared.reconcile().await {
            warn!(event = "reconcile_failed", error = %e, "Pending reconciliation failed");
        }
        self.shared.invalidate_transactions();
    }
}

/// A running wallet: block sync plus outbound transactions for one identity.
///
/// Build with [`Synchronizer::new`] or [`Synchronizer::open`], call
/// [`Synchronizer::start`], and finish with [`Synchronizer::close`]. A closed
/// synchronizer cannot be restarted.
pub struct Synchronizer {
    identity: SynchronizerIdentity,
    params: ConsensusParams,
    processor: Arc<CompactBlockProcessor>,
    shared: Arc<Shared>,
    status: watch::Sender<SyncStatus>,
    lifecycle: Mutex<Lifecycle>,
    lease: Mutex<Option<InstanceLease>>,
    driver: Mutex<Option<JoinHandle<zsdk_sync::Result<()>>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    spends: Mutex<Vec<JoinHandle<()>>>,
}

impl Synchronizer {
    /// Build a synchronizer over the given backends.
    ///
    /// Claims the identity first; fails with [`Error::AlreadyActive`] while
    /// another instance holds it. Initializes the wallet store from the
    /// birthday checkpoint on first use.
    pub async fn new(
        registry: &SynchronizerRegistry,
        config: SynchronizerConfig,
        backends: Backends,
        ledger: Arc<dyn PendingTransactionLedger>,
    ) -> Result<Self> {
        let identity = config.identity()?;
        let birthday = config.birthday_height()?;
        let lease = registry.claim(identity.clone()).await?;

        if backends.store.needs_initialization().await? {
            info!(
                event = "wallet_initialize",
                identity = %identity,
                birthday = %birthday,
                "Initializing wallet store"
            );
            backends
                .store
                .initialize(&config.birthday, &config.viewing_keys)
                .await?;
        }

        let params = ConsensusParams::from_network(config.network);
        let handlers = Handlers::new();
        let processor = Arc::new(CompactBlockProcessor::new(
            birthday,
            config.sync.clone(),
            backends.clone(),
            handlers,
        ));
        let outbound = Arc::new(OutboundTransactionManager::new(
            params.clone(),
            config.outbound.clone(),
            ledger,
            Arc::clone(&backends.store),
            Arc::clone(&backends.remote),
        ));

        let (balances, _) = watch::channel(WalletBalances::default());
        let (transactions, _) = watch::channel(0u64);
        let shared = Arc::new(Shared {
            birthday,
            backends,
            store_gate: processor.store_gate(),
            outbound,
            balances,
            transactions,
        });
        let (status, _) = watch::channel(SyncStatus::Disconnected);

        Ok(Self {
            identity,
            params,
            processor,
            shared,
            status,
            lifecycle: Mutex::new(Lifecycle::Created),
            lease: Mutex::new(Some(lease)),
            driver: Mutex::new(None),
            forwarder: Mutex::new(None),
            spends: Mutex::new(Vec::new()),
        })
    }

    /// Build a synchronizer with on-disk stores under `config.data_dir` and
    /// a lightwalletd client for the configured endpoint.
    ///
    /// `make_store` builds the wallet data store from the storage paths and
    /// the block cache it must scan from.
    pub async fn open<F>(
        registry: &SynchronizerRegistry,
        config: SynchronizerConfig,
        make_store: F,
    ) -> Result<Self>
    where
        F: FnOnce(&StoragePaths, Arc<dyn BlockCacheStore>) -> Result<Arc<dyn WalletDataStore>>,
    {
        let identity = config.identity()?;
        std::fs::create_dir_all(&config.data_dir)?;
        let paths = StoragePaths::for_identity(&config.data_dir, &identity);

        let cache: Arc<dyn BlockCacheStore> =
            Arc::new(SqliteBlockCache::open(&paths.cache, config.network)?);
        let store = make_store(&paths, Arc::clone(&cache))?;
        let remote: Arc<dyn RemoteChainService> =
            Arc::new(LightClient::with_config(config.light_client()));
        let ledger: Arc<dyn PendingTransactionLedger> =
            Arc::new(SqlitePendingLedger::open(&paths.pending, config.network)?);

        let backends = Backends {
            remote,
            cache,
            store,
        };
        Self::new(registry, config, backends, ledger).await
    }

    /// Verify the server and spawn the sync driver.
    ///
    /// A setup failure is fatal unless the setup handler returns
    /// [`Decision::Retry`], which ignores it.
    pub async fn start(&self) -> Result<()> {
        match *self.lifecycle.lock() {
            Lifecycle::Created => {}
            Lifecycle::Started => return Err(Error::AlreadyStarted),
            Lifecycle::Closed => return Err(Error::Closed),
        }

        let handlers = self.processor.handlers();
        match self.processor.verify_setup().await {
            Ok(info) => debug!("Server {} {} at {}", info.vendor, info.version, info.block_height),
            Err(e) => {
                if handlers.setup_error(&e) == Decision::Retry {
                    warn!(event = "setup_ignored", error = %e, "Setup check failed, continuing");
                } else {
                    handlers.critical_error(&e);
                    return Err(Error::Setup(e.to_string()));
                }
            }
        }

        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle != Lifecycle::Created {
            return Err(Error::AlreadyStarted);
        }

        self.processor.set_observer(Arc::new(ScanObserver {
            shared: Arc::clone(&self.shared),
        }));
        *self.forwarder.lock() = Some(tokio::spawn(forward_status(
            self.processor.subscribe_state(),
            self.processor.subscribe_info(),
            self.status.clone(),
        )));
        *self.driver.lock() = Some(self.processor.start());
        *lifecycle = Lifecycle::Started;

        info!(event = "synchronizer_start", identity = %self.identity, "Synchronizer started");
        Ok(())
    }

    /// Stop syncing and release the identity.
    ///
    /// Cancels the driver, waits for it and any in-flight spend tasks,
    /// publishes [`SyncStatus::Stopped`], then frees the identity so a new
    /// synchronizer can claim it. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            *lifecycle = Lifecycle::Closed;
        }

        if let Some(lease) = self.lease.lock().as_ref() {
            lease.begin_shutdown();
        }
        self.processor.stop();

        let driver = self.driver.lock().take();
        let spends: Vec<_> = self.spends.lock().drain(..).collect();
        join_tasks(driver, spends).await;

        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
        self.status.send_replace(SyncStatus::Stopped);

        if let Some(lease) = self.lease.lock().take() {
            lease.release();
        }
        info!(event = "synchronizer_close", identity = %self.identity, "Synchronizer closed");
        Ok(())
    }

    fn ensure_started(&self) -> Result<()> {
        match *self.lifecycle.lock() {
            Lifecycle::Started => Ok(()),
            Lifecycle::Created => Err(Error::NotStarted),
            Lifecycle::Closed => Err(Error::Closed),
        }
    }

    // ------------------------------------------------------------------
    // Observables
    // ------------------------------------------------------------------

    /// Collapsed sync status
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Scan progress, 0-100
    pub fn progress(&self) -> watch::Receiver<u8> {
        self.processor.subscribe_progress()
    }

    /// Processor heights and ranges
    pub fn processor_info(&self) -> watch::Receiver<ProcessorInfo> {
        self.processor.subscribe_info()
    }

    /// Balances per pool
    pub fn balances(&self) -> watch::Receiver<WalletBalances> {
        self.shared.balances.subscribe()
    }

    /// Bumped whenever the transaction list should be re-read
    pub fn transactions_changed(&self) -> watch::Receiver<u64> {
        self.shared.transactions.subscribe()
    }

    /// Sync events: state changes, reorgs, errors
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.processor.handlers().subscribe()
    }

    /// Error handler registration
    pub fn handlers(&self) -> &Handlers {
        self.processor.handlers()
    }

    /// Live view of all pending transactions
    pub async fn pending_transactions(&self) -> Result<BoxStream<'static, Vec<PendingTransaction>>> {
        Ok(self.shared.outbound.get_all().await?)
    }

    /// Outbound manager, for cancel and direct ledger access
    pub fn outbound(&self) -> &OutboundTransactionManager {
        &self.shared.outbound
    }

    // ------------------------------------------------------------------
    // Spends
    // ------------------------------------------------------------------

    /// Send `value` zatoshi from the default account to `to_address`.
    ///
    /// Returns once the row is persisted; encoding and submission run in
    /// the background and show up on the returned stream.
    pub async fn send_to_address(
        &self,
        spending_key: &str,
        value: i64,
        to_address: &str,
        memo: &[u8],
    ) -> Result<BoxStream<'static, PendingTransaction>> {
        self.ensure_started()?;
        let outbound = &self.shared.outbound;
        let row = outbound
            .init_spend(value, to_address, memo, DEFAULT_ACCOUNT)
            .await?;
        let stream = outbound.monitor_by_id(row.id).await?;
        self.spawn_spend(spending_key, row);
        Ok(stream)
    }

    /// Move transparent funds of the default account into its shielded pool
    pub async fn shield_funds(
        &self,
        spending_key: &str,
        memo: &[u8],
    ) -> Result<BoxStream<'static, PendingTransaction>> {
        self.ensure_started()?;
        let outbound = &self.shared.outbound;
        let row = outbound.init_shield(memo, DEFAULT_ACCOUNT).await?;
        let stream = outbound.monitor_by_id(row.id).await?;
        self.spawn_spend(spending_key, row);
        Ok(stream)
    }

    fn spawn_spend(&self, spending_key: &str, row: PendingTransaction) {
        let task = tokio::spawn(encode_and_submit(
            Arc::clone(&self.shared.outbound),
            self.processor.handlers().clone(),
            self.processor.cancel_token().clone(),
            self.processor.config().clone(),
            spending_key.to_string(),
            row,
        ));
        let mut spends = self.spends.lock();
        spends.retain(|t| !t.is_finished());
        spends.push(task);
    }

    // ------------------------------------------------------------------
    // Rewind and refresh
    // ------------------------------------------------------------------

    /// Rewind to the nearest supported height at or below `height`, never
    /// below the birthday. Returns the height rewound to.
    pub async fn rewind_to_nearest_height(
        &self,
        height: BlockHeight,
        clear_cache: bool,
    ) -> Result<BlockHeight> {
        self.ensure_started()?;
        let target = self
            .processor
            .rewind_to_nearest_height(height, clear_cache)
            .await?;
        if let Err(e) = self.shared.refresh_balances().await {
            warn!(event = "balance_refresh_failed", error = %e, "Balance refresh after rewind failed");
        }
        self.shared.invalidate_transactions();
        Ok(target)
    }

    /// Rewind a fixed distance below the last scanned height, or to the
    /// birthday when closer
    pub async fn quick_rewind(&self) -> Result<BlockHeight> {
        self.ensure_started()?;
        let height = self.processor.quick_rewind_height().await?;
        self.rewind_to_nearest_height(height, false).await
    }

    /// Fetch UTXOs for the account's transparent address into the store
    pub async fn refresh_utxos(&self, account: u32) -> Result<usize> {
        self.ensure_started()?;
        Ok(self.shared.refresh_utxos(account).await?)
    }

    /// Recompute and publish balances
    pub async fn refresh_all_balances(&self) -> Result<WalletBalances> {
        self.ensure_started()?;
        Ok(self.shared.refresh_balances().await?)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Classify `address` for this network
    pub fn validate_address(&self, address: &str) -> AddressType {
        let address = address.trim();
        if address.is_empty() {
            return AddressType::Invalid("empty address".to_string());
        }
        let store = &self.shared.backends.store;
        if store.is_valid_shielded_address(address) {
            if address.starts_with('u') {
                AddressType::Unified
            } else {
                AddressType::Shielded
            }
        } else if store.is_valid_transparent_address(address) {
            AddressType::Transparent
        } else {
            AddressType::Invalid(format!("not a valid {} address", self.identity.network))
        }
    }

    /// Light server metadata
    pub async fn server_info(&self) -> Result<ServerInfo> {
        Ok(self.shared.backends.remote.server_info().await?)
    }

    /// Unified address of `account`
    pub async fn unified_address(&self, account: u32) -> Result<String> {
        Ok(self.shared.backends.store.unified_address(account).await?)
    }

    /// Sapling address of `account`
    pub async fn sapling_address(&self, account: u32) -> Result<String> {
        Ok(self.shared.backends.store.sapling_address(account).await?)
    }

    /// Transparent address of `account`
    pub async fn transparent_address(&self, account: u32) -> Result<String> {
        Ok(self.shared.backends.store.transparent_address(account).await?)
    }

    /// Wallet identity
    pub fn identity(&self) -> &SynchronizerIdentity {
        &self.identity
    }

    /// Network
    pub fn network(&self) -> NetworkType {
        self.identity.network
    }

    /// Chain parameters
    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    /// Birthday height
    pub fn birthday(&self) -> BlockHeight {
        self.shared.birthday
    }

    /// Current processor state
    pub fn processor_state(&self) -> ProcessorState {
        self.processor.state()
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        if *self.lifecycle.get_mut() == Lifecycle::Closed {
            return;
        }
        warn!("Synchronizer {} dropped without close()", self.identity);
        let Some(lease) = self.lease.get_mut().take() else {
            return;
        };
        lease.begin_shutdown();
        self.processor.stop();
        if let Some(forwarder) = self.forwarder.get_mut().take() {
            forwarder.abort();
        }

        // The identity stays claimed until the driver and spend tasks are gone
        let driver = self.driver.get_mut().take();
        let spends: Vec<_> = self.spends.get_mut().drain(..).collect();
        if driver.is_none() && spends.is_empty() {
            lease.release();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    join_tasks(driver, spends).await;
                    lease.release();
                });
            }
            // Without a runtime the tasks cannot make progress anymore
            Err(_) => lease.release(),
        }
    }
}

async fn join_tasks(
    driver: Option<JoinHandle<zsdk_sync::Result<()>>>,
    spends: Vec<JoinHandle<()>>,
) {
    if let Some(driver) = driver {
        match driver.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Sync driver ended with error: {}", e),
            Err(e) => warn!("Sync driver task failed: {}", e),
        }
    }
    for spend in spends {
        if let Err(e) = spend.await {
            warn!("Spend task failed: {}", e);
        }
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("identity", &self.identity)
            .field("lifecycle", &*self.lifecycle.lock())
            .finish()
    }
}

/// Republish processor state and info as a collapsed status
async fn forward_status(
    mut state: watch::Receiver<ProcessorState>,
    mut info: watch::Receiver<ProcessorInfo>,
    status: watch::Sender<SyncStatus>,
) {
    loop {
        let current = {
            let state = state.borrow_and_update().clone();
            let info = info.borrow_and_update().clone();
            SyncStatus::from_processor(&state, &info)
        };
        status.send_if_modified(|previous| {
            if *previous == current {
                false
            } else {
                *previous = current;
                true
            }
        });

        tokio::select! {
            changed = state.changed() => if changed.is_err() { break },
            changed = info.changed() => if changed.is_err() { break },
        }
    }
}

/// Encode once, then submit, re-submitting while the submission handler
/// asks to retry and the retry budget lasts.
async fn encode_and_submit(
    outbound: Arc<OutboundTransactionManager>,
    handlers: Handlers,
    cancel: CancelToken,
    sync: SyncConfig,
    spending_key: String,
    row: PendingTransaction,
) {
    let encoded = match outbound.encode(&spending_key, &row).await {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!("Encoding {} failed: {}", row.id, e);
            return;
        }
    };
    if encoded.state() != PendingState::Encoded {
        debug!("Not submitting {} in state {:?}", encoded.id, encoded.state());
        return;
    }

    let max_retries = outbound.config().max_submit_retries;
    let mut retries = 0u32;
    loop {
        let error = match outbound.submit(&encoded).await {
            Ok(tx) if tx.state() == PendingState::FailedSubmit => zsdk_sync::Error::Submission {
                code: tx.error_code.unwrap_or_default(),
                message: tx.error_message.unwrap_or_default(),
            },
            Ok(tx) => {
                debug!("Submission of {} finished in state {:?}", tx.id, tx.state());
                return;
            }
            Err(e) => e,
        };

        if retries >= max_retries || handlers.submission_error(&error) == Decision::Abort {
            warn!(
                event = "submit_abandoned",
                id = encoded.id,
                retries,
                error = %error,
                "Giving up on submission"
            );
            return;
        }
        retries += 1;

        let delay = backoff_delay(sync.retry_backoff, retries, sync.max_backoff);
        if cancel.sleep(delay).await.is_err() {
            return;
        }
    }
}
