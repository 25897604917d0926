//! Compact block processor
//!
//! Drives the download → validate → scan → enhance cycle against a remote
//! light server, repairing reorgs by rewinding the block cache and the
//! wallet store. One driver task per processor; every network call and
//! sleep races the processor's [`CancelToken`].

use crate::backend::{
    BlockCacheStore, BlockRange, RemoteChainService, ServerInfo, WalletDataStore, DEFAULT_ACCOUNT,
};
use crate::cancel::CancelToken;
use crate::download::DownloadBatch;
use crate::events::{Decision, Handlers, SyncEvent};
use crate::progress::{ProcessorInfo, ProcessorState, ProgressTracker};
use crate::retry::backoff_delay;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use zsdk_params::{BlockHeight, Network, NetworkType};

/// Sync configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Blocks per download batch
    pub download_batch_size: u32,
    /// Blocks per scan call
    pub scan_batch_size: u32,
    /// Attempts per download batch before the pass fails
    pub max_batch_retries: u32,
    /// Base delay for exponential backoff
    pub retry_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Idle time between passes
    pub poll_interval: Duration,
    /// Blocks stepped back per consecutive chain error
    pub rewind_distance: u32,
    /// Deepest reorg repaired automatically
    pub max_reorg_size: u32,
    /// Blocks checked per validation call (`None` = all cached blocks)
    pub validation_limit: Option<u32>,
    /// Distance below the last scanned height used by quick rewind
    pub quick_rewind_blocks: u32,
    /// Fetch full transactions after each scan
    pub enhance_transactions: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            download_batch_size: 100,
            scan_batch_size: 100,
            max_batch_retries: 5,
            retry_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(600),
            poll_interval: Duration::from_secs(20),
            rewind_distance: 10,
            max_reorg_size: 100,
            validation_limit: None,
            quick_rewind_blocks: 100,
            enhance_transactions: true,
        }
    }
}

impl SyncConfig {
    /// Most chain errors repaired within one pass before it fails
    fn max_repairs_per_pass(&self) -> u32 {
        self.max_reorg_size / self.rewind_distance.max(1) + 2
    }
}

/// Backends the processor drives
#[derive(Clone)]
pub struct Backends {
    /// Light server
    pub remote: Arc<dyn RemoteChainService>,
    /// Compact block cache
    pub cache: Arc<dyn BlockCacheStore>,
    /// Wallet database and crypto backend
    pub store: Arc<dyn WalletDataStore>,
}

/// Hook run after every scanned range, before the pass moves on.
///
/// Runs while the pass lock is held, so it must not request a rewind.
#[async_trait]
pub trait PassObserver: Send + Sync {
    /// Called with the range that just finished scanning
    async fn on_scanned(&self, range: BlockRange);
}

/// Result of a single pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing new to download or scan
    UpToDate,
    /// Scanned the given range
    Scanned(BlockRange),
}

/// The block synchronizer state machine.
pub struct CompactBlockProcessor {
    network: NetworkType,
    birthday: BlockHeight,
    config: SyncConfig,
    backends: Backends,
    progress: ProgressTracker,
    handlers: Handlers,
    cancel: CancelToken,
    pass_lock: Mutex<()>,
    store_gate: Arc<RwLock<()>>,
    consecutive_chain_errors: AtomicU32,
    observer: parking_lot::RwLock<Option<Arc<dyn PassObserver>>>,
}

#[allow(dead_code)]
fn _assert_processor_send_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<CompactBlockProcessor>();
}

impl CompactBlockProcessor {
    /// Create a processor for a wallet born at `birthday`
    pub fn new(
        birthday: BlockHeight,
        config: SyncConfig,
        backends: Backends,
        handlers: Handlers,
    ) -> Self {
        Self {
            network: birthday.network(),
            birthday,
            config,
            backends,
            progress: ProgressTracker::new(),
            handlers,
            cancel: CancelToken::new(),
            pass_lock: Mutex::new(()),
            store_gate: Arc::new(RwLock::new(())),
            consecutive_chain_errors: AtomicU32::new(0),
            observer: parking_lot::RwLock::new(None),
        }
    }

    /// Install the hook run after each scanned range
    pub fn set_observer(&self, observer: Arc<dyn PassObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Spawn the driver task
    pub fn start(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    /// Request cooperative shutdown
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Driver loop. Returns once stopped, or with the error a processor
    /// handler chose to abort on.
    pub async fn run(&self) -> Result<()> {
        info!(
            event = "processor_start",
            network = %self.network,
            birthday = %self.birthday,
            "Starting compact block processor"
        );

        let mut failures: u32 = 0;
        let result = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }

            match self.run_pass().await {
                Ok(outcome) => {
                    failures = 0;
                    if let PassOutcome::Scanned(range) = outcome {
                        debug!("Pass complete, scanned {}", range);
                    }
                    self.set_state(ProcessorState::Initialized);
                    if self.cancel.sleep(self.config.poll_interval).await.is_err() {
                        break Ok(());
                    }
                }
                Err(Error::Cancelled) => break Ok(()),
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.set_state(ProcessorState::Disconnected);
                    warn!(
                        event = "pass_failed",
                        attempt = failures,
                        error = %e,
                        "Sync pass failed"
                    );

                    if self.handlers.processor_error(&e) == Decision::Abort {
                        error!("Processor error handler aborted sync: {}", e);
                        self.handlers.critical_error(&e);
                        break Err(e);
                    }

                    let delay =
                        backoff_delay(self.config.retry_backoff, failures, self.config.max_backoff);
                    debug!("Retrying pass in {:?}", delay);
                    if self.cancel.sleep(delay).await.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        self.set_state(ProcessorState::Stopped);
        info!(event = "processor_stop", "Compact block processor stopped");
        result
    }

    /// Run one download → validate → scan → enhance pass.
    pub async fn run_pass(&self) -> Result<PassOutcome> {
        let _pass = self.pass_lock.lock().await;

        let tip = self
            .cancel
            .run(self.backends.remote.latest_height())
            .await?;
        self.progress
            .update_info(|info| info.network_block_height = Some(tip));
        self.refresh_heights().await?;

        let mut repairs = 0;
        loop {
            if let Some(range) = self.download_range(tip).await? {
                self.download(range).await?;
            }

            self.set_state(ProcessorState::Validating);
            let Some(error_height) = self
                .backends
                .store
                .validate_continuity(self.config.validation_limit)
                .await?
            else {
                break;
            };

            repairs += 1;
            if repairs > self.config.max_repairs_per_pass() {
                return Err(Error::Sync(format!(
                    "Unable to repair chain discontinuity at {} after {} rewinds",
                    error_height,
                    repairs - 1
                )));
            }
            self.handle_chain_error(error_height).await?;
        }
        self.consecutive_chain_errors.store(0, Ordering::SeqCst);

        let Some(scan_range) = self.scan_range().await? else {
            debug!("No new blocks to scan");
            return Ok(PassOutcome::UpToDate);
        };

        self.scan(scan_range).await?;

        self.set_state(ProcessorState::Scanned(scan_range));
        self.handlers.emit(SyncEvent::Scanned(scan_range));
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_scanned(scan_range).await;
        }

        if self.config.enhance_transactions {
            self.enhance(scan_range).await?;
        }

        Ok(PassOutcome::Scanned(scan_range))
    }

    /// Check the server is on our chain and at the consensus branch we expect.
    pub async fn verify_setup(&self) -> Result<ServerInfo> {
        let info = self.cancel.run(self.backends.remote.server_info()).await?;

        let network = Network::from_type(self.network);
        if !network.matches_chain_name(&info.chain_name) {
            return Err(Error::Setup(format!(
                "Server chain '{}' does not match configured network {}",
                info.chain_name, self.network
            )));
        }

        let server_tip = BlockHeight::new(info.block_height, self.network)
            .map_err(|e| Error::Setup(format!("Server reported invalid height: {}", e)))?;
        let expected = self.backends.store.branch_id_for_height(server_tip).await?;
        let reported = parse_branch_id(&info.consensus_branch_id).ok_or_else(|| {
            Error::Setup(format!(
                "Server reported malformed consensus branch id '{}'",
                info.consensus_branch_id
            ))
        })?;
        if expected != reported {
            return Err(Error::Setup(format!(
                "Consensus branch mismatch at {}: wallet expects {:08x}, server reports {:08x}",
                server_tip, expected, reported
            )));
        }

        info!(
            event = "setup_verified",
            chain = %info.chain_name,
            tip = info.block_height,
            "Server setup verified"
        );
        Ok(info)
    }

    /// Rewind to the nearest height the store supports at or below `height`.
    ///
    /// Never goes below the birthday. With `clear_cache`, cached blocks above
    /// the target are dropped too. Returns the height actually rewound to.
    pub async fn rewind_to_nearest_height(
        &self,
        height: BlockHeight,
        clear_cache: bool,
    ) -> Result<BlockHeight> {
        let _pass = self.pass_lock.lock().await;

        let lower = height.max(self.birthday);
        let target = self
            .backends
            .store
            .nearest_rewind_height(lower)
            .await?
            .max(self.birthday);

        info!(
            event = "manual_rewind",
            requested = %height,
            target = %target,
            clear_cache,
            "Rewinding wallet"
        );
        self.rewind_stores(target, clear_cache).await?;
        Ok(target)
    }

    /// Height a quick rewind goes back to
    pub async fn quick_rewind_height(&self) -> Result<BlockHeight> {
        let last = self
            .backends
            .store
            .last_scanned_height()
            .await?
            .unwrap_or(self.birthday);
        Ok(last
            .saturating_sub(self.config.quick_rewind_blocks)
            .max(self.birthday))
    }

    async fn handle_chain_error(&self, error_height: BlockHeight) -> Result<()> {
        let previous = self.consecutive_chain_errors.fetch_add(1, Ordering::SeqCst);
        let offset = self
            .config
            .rewind_distance
            .saturating_mul(previous.saturating_add(1))
            .min(self.config.max_reorg_size)
            .max(1);

        let lower = error_height.saturating_sub(offset).max(self.birthday);
        let target = self
            .backends
            .store
            .nearest_rewind_height(lower)
            .await?
            .max(self.birthday);

        warn!(
            event = "chain_error",
            error_height = %error_height,
            rewind_height = %target,
            attempt = previous + 1,
            "Chain discontinuity detected, rewinding"
        );
        self.rewind_stores(target, true).await?;
        self.handlers.chain_error(error_height, target);
        Ok(())
    }

    async fn rewind_stores(&self, target: BlockHeight, clear_cache: bool) -> Result<()> {
        {
            let _gate = self.store_gate.write().await;
            if clear_cache {
                self.backends.cache.truncate_above(target).await?;
            }
            self.backends.store.rewind_to(target).await?;
        }
        self.refresh_heights().await
    }

    async fn download_range(&self, tip: BlockHeight) -> Result<Option<BlockRange>> {
        let cached = self.backends.cache.highest_height().await?;
        let scanned = self.backends.store.last_scanned_height().await?;
        let from = [cached, scanned, Some(self.birthday)]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.birthday);

        Ok(match from.checked_add(1) {
            Ok(start) => BlockRange::new(start, tip),
            Err(_) => None,
        })
    }

    async fn scan_range(&self) -> Result<Option<BlockRange>> {
        let Some(cached) = self.backends.cache.highest_height().await? else {
            return Ok(None);
        };
        let scanned = self
            .backends
            .store
            .last_scanned_height()
            .await?
            .unwrap_or(self.birthday)
            .max(self.birthday);

        Ok(match scanned.checked_add(1) {
            Ok(start) => BlockRange::new(start, cached),
            Err(_) => None,
        })
    }

    async fn download(&self, range: BlockRange) -> Result<()> {
        self.set_state(ProcessorState::Downloading);
        self.progress
            .update_info(|info| info.download_range = Some(range));
        info!(
            "Downloading blocks {} ({} blocks)",
            range,
            range.len()
        );

        for mut batch in DownloadBatch::plan(range, self.config.download_batch_size) {
            self.download_batch(&mut batch).await?;
            let end = batch.range.end;
            self.progress
                .update_info(|info| info.last_downloaded_height = Some(end));
            debug!("Downloaded batch {} ({})", batch.order, batch.range);
        }
        Ok(())
    }

    async fn download_batch(&self, batch: &mut DownloadBatch) -> Result<()> {
        let mut attempts = 0;
        loop {
            let fetch = batch.fetch(
                self.backends.remote.as_ref(),
                self.backends.cache.as_ref(),
            );
            match self.cancel.run(fetch).await {
                Ok(()) => return Ok(()),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.config.max_batch_retries {
                        error!(
                            "Batch {} failed after {} attempts: {}",
                            batch.range, attempts, e
                        );
                        return Err(e);
                    }
                    let delay =
                        backoff_delay(self.config.retry_backoff, attempts, self.config.max_backoff);
                    warn!(
                        "Batch {} failed (attempt {}/{}), retrying in {:?}: {}",
                        batch.range, attempts, self.config.max_batch_retries, delay, e
                    );
                    self.cancel.sleep(delay).await?;
                }
            }
        }
    }

    async fn scan(&self, range: BlockRange) -> Result<()> {
        self.set_state(ProcessorState::Scanning);
        self.progress.update_info(|info| {
            info.scan_range = Some(range);
            info.is_scanning = true;
        });
        let result = self.scan_chunks(range).await;
        self.progress.update_info(|info| info.is_scanning = false);
        result
    }

    async fn scan_chunks(&self, range: BlockRange) -> Result<()> {
        let store = &self.backends.store;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let before = store.last_scanned_height().await?;
            if before >= Some(range.end) {
                return Ok(());
            }
            let next = match before {
                Some(h) if h >= range.start => h.checked_add(1)?,
                _ => range.start,
            };

            if !store.scan(self.config.scan_batch_size).await? {
                return Err(Error::Scan {
                    height: next,
                    reason: "backend reported failure".to_string(),
                });
            }

            let after = store.last_scanned_height().await?;
            if after <= before {
                return Err(Error::Scan {
                    height: next,
                    reason: "scan made no progress".to_string(),
                });
            }

            let first = store.first_scanned_height().await?;
            self.progress.update_info(|info| {
                info.last_scanned_height = after;
                info.first_scanned_height = first;
            });
            if let Some(h) = after {
                debug!("Scanned up to {} of {}", h, range.end);
            }
        }
    }

    async fn enhance(&self, range: BlockRange) -> Result<()> {
        self.set_state(ProcessorState::Enhancing);
        let store = &self.backends.store;
        let remote = &self.backends.remote;

        let txids = match store.transactions_to_enhance(range).await {
            Ok(txids) => txids,
            Err(e) => {
                warn!("Could not list transactions to enhance in {}: {}", range, e);
                Vec::new()
            }
        };

        let mut enhanced = 0usize;
        for txid in &txids {
            match self.cancel.run(remote.fetch_transaction(txid)).await {
                Ok(raw) => match store.decrypt_and_store_transaction(&raw.data, raw.height).await {
                    Ok(()) => enhanced += 1,
                    Err(e) => warn!("Failed to store transaction {}: {}", hex::encode(txid), e),
                },
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!("Failed to fetch transaction {}: {}", hex::encode(txid), e),
            }
        }

        match store.transparent_address(DEFAULT_ACCOUNT).await {
            Ok(address) => {
                match self
                    .cancel
                    .run(remote.transparent_transactions(&address, range))
                    .await
                {
                    Ok(txs) => {
                        for tx in txs {
                            match store.decrypt_and_store_transaction(&tx.data, tx.height).await {
                                Ok(()) => enhanced += 1,
                                Err(e) => warn!("Failed to store transparent transaction: {}", e),
                            }
                        }
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => warn!("Failed to fetch transparent transactions: {}", e),
                }
            }
            Err(e) => debug!("No transparent address to enhance: {}", e),
        }

        debug!("Enhanced {} transactions in {}", enhanced, range);
        Ok(())
    }

    async fn refresh_heights(&self) -> Result<()> {
        let cached = self.backends.cache.highest_height().await?;
        let last = self.backends.store.last_scanned_height().await?;
        let first = self.backends.store.first_scanned_height().await?;
        self.progress.update_info(|info| {
            info.last_downloaded_height = cached;
            info.last_scanned_height = last;
            info.first_scanned_height = first;
        });
        Ok(())
    }

    fn set_state(&self, state: ProcessorState) {
        self.progress.set_state(state.clone());
        self.handlers.emit(SyncEvent::StateChanged(state));
    }

    /// Network this processor syncs
    pub fn network(&self) -> NetworkType {
        self.network
    }

    /// Wallet birthday
    pub fn birthday(&self) -> BlockHeight {
        self.birthday
    }

    /// Sync configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Backends driven by this processor
    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Registered handlers and event channel
    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    /// Cancellation token of the driver
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Gate held exclusively by rewinds; take it shared to read a consistent store
    pub fn store_gate(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.store_gate)
    }

    /// Current state
    pub fn state(&self) -> ProcessorState {
        self.progress.state()
    }

    /// Current info snapshot
    pub fn info(&self) -> ProcessorInfo {
        self.progress.info()
    }

    /// Subscribe to state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessorState> {
        self.progress.subscribe_state()
    }

    /// Subscribe to info changes
    pub fn subscribe_info(&self) -> watch::Receiver<ProcessorInfo> {
        self.progress.subscribe_info()
    }

    /// Subscribe to progress (0-100)
    pub fn subscribe_progress(&self) -> watch::Receiver<u8> {
        self.progress.subscribe_progress()
    }

    /// Progress publisher
    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }
}

fn parse_branch_id(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    let hex_digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(hex_digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.download_batch_size, 100);
        assert_eq!(config.rewind_distance, 10);
        assert_eq!(config.max_reorg_size, 100);
        assert_eq!(config.max_repairs_per_pass(), 12);
    }

    #[test]
    fn test_parse_branch_id() {
        assert_eq!(parse_branch_id("c2d6d0b4"), Some(0xc2d6_d0b4));
        assert_eq!(parse_branch_id("0x76b809bb"), Some(0x76b8_09bb));
        assert_eq!(parse_branch_id("zz"), None);
    }
}
