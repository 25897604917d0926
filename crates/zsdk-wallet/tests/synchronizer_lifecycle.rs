//! Synchronizer lifecycle, observables and spends against the in-memory chain.
//!
//! Run with:
//!   cargo test --package zsdk-wallet --test synchronizer_lifecycle

use futures::StreamExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use zsdk_params::{BlockHeight, Checkpoint, ConsensusParams, NetworkType, Zatoshi};
use zsdk_sync::testing::{MockRemote, MockWalletStore};
use zsdk_sync::{
    Backends, PendingTransactionLedger, ServerInfo, SqliteBlockCache, SqlitePendingLedger,
    SubmitResponse, SyncConfig, Utxo, WalletBalance, WalletDataStore,
};
use zsdk_wallet::{
    erase_wallet, AddressType, Decision, Error, InstanceStatus, PendingState, PendingTransaction,
    StoragePaths, SyncStatus, Synchronizer, SynchronizerConfig, SynchronizerRegistry,
};

const BIRTHDAY: u32 = 100;
const TIP: u32 = 200;
const RECIPIENT: &str = "zs1recipientaddress";
const WAIT: Duration = Duration::from_secs(10);

fn h(v: u64) -> BlockHeight {
    BlockHeight::new(v, NetworkType::Regtest).unwrap()
}

fn birthday() -> Checkpoint {
    Checkpoint {
        height: BIRTHDAY,
        hash: "00".repeat(32),
        time: 1_600_000_000,
        tree: String::new(),
    }
}

fn config(alias: &str) -> SynchronizerConfig {
    let mut config = SynchronizerConfig::new(NetworkType::Regtest, alias, birthday())
        .with_viewing_keys(vec!["zxviews1mock".to_string()]);
    config.sync = SyncConfig {
        download_batch_size: 25,
        scan_batch_size: 20,
        retry_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
        poll_interval: Duration::from_millis(50),
        enhance_transactions: false,
        quick_rewind_blocks: 30,
        ..SyncConfig::default()
    };
    config
}

struct Wallet {
    remote: Arc<MockRemote>,
    store: Arc<MockWalletStore>,
    ledger: Arc<SqlitePendingLedger>,
    sync: Synchronizer,
}

struct Chain {
    remote: Arc<MockRemote>,
    store: Arc<MockWalletStore>,
    ledger: Arc<SqlitePendingLedger>,
    backends: Backends,
}

fn chain() -> Chain {
    let remote = Arc::new(MockRemote::new(NetworkType::Regtest, TIP));
    let cache = Arc::new(SqliteBlockCache::open_in_memory(NetworkType::Regtest).unwrap());
    let store = Arc::new(MockWalletStore::new(cache.clone(), h(BIRTHDAY as u64)));
    let ledger = Arc::new(SqlitePendingLedger::open_in_memory(NetworkType::Regtest).unwrap());
    let backends = Backends {
        remote: remote.clone(),
        cache,
        store: store.clone(),
    };
    Chain {
        remote,
        store,
        ledger,
        backends,
    }
}

async fn wallet(registry: &SynchronizerRegistry, config: SynchronizerConfig) -> Wallet {
    let chain = chain();
    let sync = Synchronizer::new(registry, config, chain.backends, chain.ledger.clone())
        .await
        .unwrap();
    Wallet {
        remote: chain.remote,
        store: chain.store,
        ledger: chain.ledger,
        sync,
    }
}

async fn wait_status(rx: &mut watch::Receiver<SyncStatus>, status: SyncStatus) {
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == status))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", status))
        .unwrap();
}

async fn wait_row(
    stream: &mut futures::stream::BoxStream<'static, PendingTransaction>,
    done: impl Fn(&PendingTransaction) -> bool,
) -> PendingTransaction {
    tokio::time::timeout(WAIT, async {
        loop {
            let row = stream.next().await.expect("row stream ended");
            if done(&row) {
                return row;
            }
        }
    })
    .await
    .expect("timed out waiting for row")
}

#[tokio::test]
async fn test_fresh_wallet_reports_synced_with_zero_balance() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("fresh")).await;
    assert_eq!(w.store.viewing_keys(), vec!["zxviews1mock".to_string()]);

    let mut status = w.sync.status();
    let balances = w.sync.balances();
    let mut changed = w.sync.transactions_changed();

    w.sync.start().await.unwrap();
    wait_status(&mut status, SyncStatus::Synced).await;

    let info = w.sync.processor_info().borrow().clone();
    assert_eq!(info.last_scanned_height, Some(h(TIP as u64)));
    assert_eq!(*w.sync.progress().borrow(), 100);

    let balances = *balances.borrow();
    let shielded = balances.shielded.unwrap();
    assert_eq!(shielded.available(), Zatoshi::ZERO);
    assert!(balances.transparent.is_some());
    assert!(changed.has_changed().unwrap());
    changed.borrow_and_update();

    w.sync.close().await.unwrap();
}

#[tokio::test]
async fn test_second_instance_rejected_until_closed() {
    let registry = SynchronizerRegistry::new();
    let first = wallet(&registry, config("alias1")).await;

    let chain = chain();
    let err = Synchronizer::new(&registry, config("alias1"), chain.backends, chain.ledger)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyActive { .. }));

    // Other aliases are unaffected
    let other = wallet(&registry, config("alias2")).await;

    first.sync.start().await.unwrap();
    first.sync.close().await.unwrap();

    let again = wallet(&registry, config("alias1")).await;
    again.sync.close().await.unwrap();
    other.sync.close().await.unwrap();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_dropping_unclosed_synchronizer_frees_identity() {
    let registry = SynchronizerRegistry::new();
    {
        let _w = wallet(&registry, config("dropped")).await;
    }
    assert!(registry.is_empty());
    let w = wallet(&registry, config("dropped")).await;
    w.sync.close().await.unwrap();
}

#[tokio::test]
async fn test_dropping_running_synchronizer_releases_after_driver_exits() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("running")).await;
    let identity = w.sync.identity().clone();
    let mut status = w.sync.status();
    w.sync.start().await.unwrap();
    wait_status(&mut status, SyncStatus::Synced).await;

    let remote = w.remote.clone();
    drop(w);
    assert_eq!(registry.status(&identity), Some(InstanceStatus::ShuttingDown));

    let next = tokio::time::timeout(WAIT, wallet(&registry, config("running")))
        .await
        .expect("claim did not wait for the old driver");

    // The old driver is gone: it no longer polls the server
    let calls = remote.tip_calls();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(remote.tip_calls(), calls);

    next.sync.close().await.unwrap();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_invalid_alias_rejected_before_claim() {
    let registry = SynchronizerRegistry::new();
    let chain = chain();
    let err = Synchronizer::new(&registry, config("no spaces"), chain.backends, chain.ledger)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAlias(_)));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_lifecycle_misuse_is_rejected() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("misuse")).await;

    assert!(matches!(
        w.sync.send_to_address("sk", 1_000, RECIPIENT, b"").await,
        Err(Error::NotStarted)
    ));
    assert!(matches!(w.sync.quick_rewind().await, Err(Error::NotStarted)));

    w.sync.start().await.unwrap();
    assert!(matches!(w.sync.start().await, Err(Error::AlreadyStarted)));

    w.sync.close().await.unwrap();
    w.sync.close().await.unwrap();
    assert!(matches!(w.sync.start().await, Err(Error::Closed)));
    assert!(matches!(
        w.sync.refresh_all_balances().await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn test_close_publishes_stopped_and_releases() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("closing")).await;
    let mut status = w.sync.status();

    w.sync.start().await.unwrap();
    wait_status(&mut status, SyncStatus::Synced).await;

    w.sync.close().await.unwrap();
    assert_eq!(*status.borrow_and_update(), SyncStatus::Stopped);
    assert_eq!(w.sync.processor_state(), zsdk_sync::ProcessorState::Stopped);
    assert!(!registry.is_registered(w.sync.identity()));

    // A new instance can now erase the closed wallet's files
    let dir = tempfile::tempdir().unwrap();
    let paths = StoragePaths::for_identity(dir.path(), w.sync.identity());
    std::fs::write(&paths.pending, b"ledger").unwrap();
    let outcome = erase_wallet(&registry, dir.path(), w.sync.identity())
        .await
        .unwrap();
    assert!(outcome.erased_anything());
}

#[tokio::test]
async fn test_setup_mismatch_is_fatal_by_default() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("setup")).await;
    w.remote.set_server_info(ServerInfo {
        chain_name: "main".to_string(),
        consensus_branch_id: "c2d6d0b4".to_string(),
        block_height: TIP as u64,
        ..ServerInfo::default()
    });

    let critical = Arc::new(AtomicU32::new(0));
    let seen = critical.clone();
    w.sync.handlers().set_critical(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let err = w.sync.start().await.unwrap_err();
    assert!(matches!(err, Error::Setup(_)));
    assert_eq!(critical.load(Ordering::SeqCst), 1);

    // Ignoring setup errors lets sync proceed
    w.sync.handlers().set_setup(|_| Decision::Retry);
    let mut status = w.sync.status();
    w.sync.start().await.unwrap();
    wait_status(&mut status, SyncStatus::Synced).await;
    w.sync.close().await.unwrap();
}

#[tokio::test]
async fn test_send_until_mined() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("spender")).await;
    let params = ConsensusParams::regtest();
    w.store
        .set_balance(WalletBalance::from_values(50_000, 50_000, &params).unwrap());

    let mut status = w.sync.status();
    w.sync.start().await.unwrap();
    wait_status(&mut status, SyncStatus::Synced).await;

    let mut rows = w
        .sync
        .send_to_address("secret-extended-key", 10_000, RECIPIENT, b"rent")
        .await
        .unwrap();

    let submitted = wait_row(&mut rows, |r| r.state() == PendingState::SubmitSuccess).await;
    assert_eq!(submitted.submit_attempts, 1);
    assert_eq!(w.remote.submitted(), vec![submitted.raw.clone().unwrap()]);

    w.store
        .mine_transaction(submitted.txid.clone().unwrap(), h(TIP as u64 + 3));
    w.remote.advance(5);

    let mined = wait_row(&mut rows, |r| r.mined_height.is_some()).await;
    assert_eq!(mined.mined_height, Some(h(TIP as u64 + 3)));
    assert_eq!(mined.state(), PendingState::Mined);

    w.sync.close().await.unwrap();
}

#[tokio::test]
async fn test_insufficient_funds_fail_encoding_without_submit() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("broke")).await;
    w.sync.start().await.unwrap();

    let mut rows = w
        .sync
        .send_to_address("secret-extended-key", 10_000, RECIPIENT, b"")
        .await
        .unwrap();
    let failed = wait_row(&mut rows, |r| r.state() == PendingState::FailedEncoding).await;
    assert_eq!(failed.encode_attempts, 1);
    assert!(failed.error_message.is_some());

    w.sync.close().await.unwrap();
    assert!(w.remote.submitted().is_empty());
}

#[tokio::test]
async fn test_negative_amount_fails_immediately() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("negative")).await;
    w.sync.start().await.unwrap();

    let result = w
        .sync
        .send_to_address("secret-extended-key", -5, RECIPIENT, b"")
        .await;
    assert!(matches!(
        result,
        Err(Error::Sync(zsdk_sync::Error::InvalidAmount(-5)))
    ));
    assert!(w.ledger.all().await.unwrap().is_empty());

    w.sync.close().await.unwrap();
}

#[tokio::test]
async fn test_rejected_submission_retried_while_handler_asks() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("retrying")).await;
    let params = ConsensusParams::regtest();
    w.store
        .set_balance(WalletBalance::from_values(50_000, 50_000, &params).unwrap());
    for _ in 0..2 {
        w.remote.queue_submit_response(SubmitResponse {
            code: -26,
            message: "mempool full".to_string(),
        });
    }

    let rejections = Arc::new(AtomicU32::new(0));
    let seen = rejections.clone();
    w.sync.handlers().set_submission(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Decision::Retry
    });
    w.sync.start().await.unwrap();

    let mut rows = w
        .sync
        .send_to_address("secret-extended-key", 1_000, RECIPIENT, b"")
        .await
        .unwrap();
    let accepted = wait_row(&mut rows, |r| r.state() == PendingState::SubmitSuccess).await;
    assert_eq!(accepted.submit_attempts, 3);
    assert_eq!(accepted.error_code, None);
    assert_eq!(rejections.load(Ordering::SeqCst), 2);

    w.sync.close().await.unwrap();
}

#[tokio::test]
async fn test_rejected_submission_abandoned_by_default() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("rejected")).await;
    let params = ConsensusParams::regtest();
    w.store
        .set_balance(WalletBalance::from_values(50_000, 50_000, &params).unwrap());
    w.remote.queue_submit_response(SubmitResponse {
        code: -26,
        message: "mempool full".to_string(),
    });
    w.sync.start().await.unwrap();

    let mut rows = w
        .sync
        .send_to_address("secret-extended-key", 1_000, RECIPIENT, b"")
        .await
        .unwrap();
    let rejected = wait_row(&mut rows, |r| r.state() == PendingState::FailedSubmit).await;
    assert_eq!(rejected.error_code, Some(-26));

    // close() waits for the spend task, so no further attempt can follow
    w.sync.close().await.unwrap();
    let row = w.ledger.find(rejected.id).await.unwrap().unwrap();
    assert_eq!(row.submit_attempts, 1);
    assert_eq!(w.remote.submitted().len(), 1);
}

#[tokio::test]
async fn test_submission_retries_are_bounded() {
    let registry = SynchronizerRegistry::new();
    let mut cfg = config("bounded");
    cfg.outbound.max_submit_retries = 2;
    let w = wallet(&registry, cfg).await;
    let params = ConsensusParams::regtest();
    w.store
        .set_balance(WalletBalance::from_values(50_000, 50_000, &params).unwrap());
    w.remote.fail_next_submits(10);
    w.sync.handlers().set_submission(|_| Decision::Retry);
    w.sync.start().await.unwrap();

    let rows = w
        .sync
        .send_to_address("secret-extended-key", 1_000, RECIPIENT, b"")
        .await
        .unwrap();
    drop(rows);

    // Let the spend task run out of retries before closing
    tokio::time::timeout(WAIT, async {
        loop {
            let all = w.ledger.all().await.unwrap();
            if all.first().map_or(false, |r| r.submit_attempts == 3) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("spend task never reached its retry limit");

    w.sync.close().await.unwrap();
    let row = w.ledger.all().await.unwrap().remove(0);
    assert_eq!(row.submit_attempts, 3);
    assert_eq!(row.state(), PendingState::FailedSubmit);
}

#[tokio::test]
async fn test_shield_funds_targets_own_account() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("shielder")).await;
    let params = ConsensusParams::regtest();
    w.store
        .set_transparent_balance(WalletBalance::from_values(7_000, 7_000, &params).unwrap());
    w.sync.start().await.unwrap();

    let mut rows = w.sync.shield_funds("secret-extended-key", b"").await.unwrap();
    let row = wait_row(&mut rows, |r| r.state() == PendingState::SubmitSuccess).await;
    assert!(row.is_shielding());

    w.sync.close().await.unwrap();
}

#[tokio::test]
async fn test_manual_rewind_resyncs() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("rewinder")).await;
    let mut status = w.sync.status();
    w.sync.start().await.unwrap();
    wait_status(&mut status, SyncStatus::Synced).await;

    let target = w.sync.rewind_to_nearest_height(h(150), true).await.unwrap();
    assert_eq!(target, h(150));
    assert!(w.store.rewinds().contains(&h(150)));

    let mut info = w.sync.processor_info();
    tokio::time::timeout(WAIT, info.wait_for(|i| i.last_scanned_height == Some(h(TIP as u64))))
        .await
        .expect("did not resync after rewind")
        .unwrap();

    w.sync.close().await.unwrap();
}

#[tokio::test]
async fn test_quick_rewind_steps_back_from_last_scanned() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("quick")).await;
    let mut status = w.sync.status();
    w.sync.start().await.unwrap();
    wait_status(&mut status, SyncStatus::Synced).await;

    let target = w.sync.quick_rewind().await.unwrap();
    assert_eq!(target, h(TIP as u64 - 30));

    let target = w.sync.rewind_to_nearest_height(h(5), false).await.unwrap();
    assert_eq!(target, h(BIRTHDAY as u64));

    w.sync.close().await.unwrap();
}

#[tokio::test]
async fn test_scan_refreshes_utxos() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("utxos")).await;
    let address = w.sync.transparent_address(0).await.unwrap();
    let utxo = Utxo {
        address: address.clone(),
        txid: vec![7; 32],
        index: 0,
        script: vec![0x76, 0xa9],
        value: Zatoshi::new(2_500, &ConsensusParams::regtest()).unwrap(),
        height: h(150),
    };
    w.remote.set_utxos(&address, vec![utxo.clone()]);

    let mut status = w.sync.status();
    w.sync.start().await.unwrap();
    wait_status(&mut status, SyncStatus::Synced).await;
    assert_eq!(w.store.utxos(&address), vec![utxo]);

    w.remote.set_utxos(&address, Vec::new());
    assert_eq!(w.sync.refresh_utxos(0).await.unwrap(), 0);
    assert!(w.store.utxos(&address).is_empty());

    w.sync.close().await.unwrap();
}

#[tokio::test]
async fn test_refresh_all_balances_publishes() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("balances")).await;
    let params = ConsensusParams::regtest();
    let mut balances = w.sync.balances();
    let mut status = w.sync.status();
    w.sync.start().await.unwrap();
    wait_status(&mut status, SyncStatus::Synced).await;

    w.store
        .set_balance(WalletBalance::from_values(9_000, 4_000, &params).unwrap());
    let refreshed = w.sync.refresh_all_balances().await.unwrap();
    assert_eq!(refreshed.shielded.unwrap().pending(), 5_000);
    assert_eq!(*balances.borrow_and_update(), refreshed);

    w.sync.close().await.unwrap();
}

#[tokio::test]
async fn test_validate_address() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("addresses")).await;

    let unified = w.sync.unified_address(0).await.unwrap();
    let sapling = w.sync.sapling_address(0).await.unwrap();
    let transparent = w.sync.transparent_address(0).await.unwrap();
    assert!(w.store.is_valid_shielded_address(&unified));

    assert_eq!(w.sync.validate_address(&unified), AddressType::Unified);
    assert_eq!(w.sync.validate_address(&sapling), AddressType::Shielded);
    assert_eq!(w.sync.validate_address(&transparent), AddressType::Transparent);
    assert!(matches!(w.sync.validate_address("bogus"), AddressType::Invalid(_)));
    assert!(matches!(w.sync.validate_address("  "), AddressType::Invalid(_)));

    w.sync.close().await.unwrap();
}

#[tokio::test]
async fn test_server_info_passthrough() {
    let registry = SynchronizerRegistry::new();
    let w = wallet(&registry, config("info")).await;
    let info = w.sync.server_info().await.unwrap();
    assert_eq!(info.chain_name, "regtest");
    assert_eq!(info.block_height, TIP as u64);
    w.sync.close().await.unwrap();
}
