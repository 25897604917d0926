//! End-to-end processor passes against the in-memory chain.
//!
//! Run with:
//!   cargo test --package zsdk-sync --test processor_scenarios

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use zsdk_params::{BlockHeight, NetworkType};
use zsdk_sync::testing::{MockRemote, MockWalletStore};
use zsdk_sync::{
    Backends, BlockCacheStore, BlockRange, CompactBlockProcessor, Decision, Error, Handlers,
    PassObserver, PassOutcome, ProcessorState, RawTransaction, RemoteChainService, ServerInfo,
    SqliteBlockCache, SyncConfig, SyncEvent, WalletDataStore,
};

const BIRTHDAY: u64 = 100;

fn h(v: u64) -> BlockHeight {
    BlockHeight::new(v, NetworkType::Regtest).unwrap()
}

fn test_config() -> SyncConfig {
    SyncConfig {
        download_batch_size: 25,
        scan_batch_size: 20,
        max_batch_retries: 3,
        retry_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_secs(1),
        poll_interval: Duration::from_secs(30),
        enhance_transactions: false,
        ..SyncConfig::default()
    }
}

struct Harness {
    remote: Arc<MockRemote>,
    cache: Arc<SqliteBlockCache>,
    store: Arc<MockWalletStore>,
    handlers: Handlers,
    processor: Arc<CompactBlockProcessor>,
}

fn harness(tip: u32, config: SyncConfig) -> Harness {
    let remote = Arc::new(MockRemote::new(NetworkType::Regtest, tip));
    let cache = Arc::new(SqliteBlockCache::open_in_memory(NetworkType::Regtest).unwrap());
    let store = Arc::new(MockWalletStore::new(cache.clone(), h(BIRTHDAY)));
    let handlers = Handlers::new();
    let backends = Backends {
        remote: remote.clone(),
        cache: cache.clone(),
        store: store.clone(),
    };
    let processor = Arc::new(CompactBlockProcessor::new(
        h(BIRTHDAY),
        config,
        backends,
        handlers.clone(),
    ));
    Harness {
        remote,
        cache,
        store,
        handlers,
        processor,
    }
}

fn record_chain_errors(handlers: &Handlers) -> Arc<Mutex<Vec<(u32, u32)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    handlers.set_chain(move |error_height, rewind_height| {
        sink.lock().push((error_height.value(), rewind_height.value()));
    });
    seen
}

#[tokio::test]
async fn test_fresh_wallet_syncs_to_tip() {
    let hx = harness(250, test_config());

    let outcome = hx.processor.run_pass().await.unwrap();
    assert_eq!(
        outcome,
        PassOutcome::Scanned(BlockRange::new(h(101), h(250)).unwrap())
    );

    assert_eq!(hx.cache.highest_height().await.unwrap(), Some(h(250)));
    assert_eq!(hx.store.last_scanned_height().await.unwrap(), Some(h(250)));
    assert_eq!(hx.store.first_scanned_height().await.unwrap(), Some(h(101)));

    let info = hx.processor.info();
    assert!(info.is_synced());
    assert_eq!(info.progress(), 100);
    assert_eq!(*hx.processor.subscribe_progress().borrow(), 100);
    assert!(matches!(hx.processor.state(), ProcessorState::Scanned(_)));

    let balance = hx.store.balances(0).await.unwrap();
    assert_eq!(balance.available().value(), 0);
}

#[tokio::test]
async fn test_second_pass_is_up_to_date() {
    let hx = harness(130, test_config());
    hx.processor.run_pass().await.unwrap();
    let calls = hx.remote.range_calls();

    assert_eq!(hx.processor.run_pass().await.unwrap(), PassOutcome::UpToDate);
    assert_eq!(hx.remote.range_calls(), calls);

    hx.remote.advance(7);
    assert_eq!(
        hx.processor.run_pass().await.unwrap(),
        PassOutcome::Scanned(BlockRange::new(h(131), h(137)).unwrap())
    );
}

#[tokio::test]
async fn test_reorg_rewinds_below_error_height() {
    let config = SyncConfig {
        max_batch_retries: 1,
        ..test_config()
    };
    let hx = harness(150, config);
    let chain_errors = record_chain_errors(&hx.handlers);
    let mut events = hx.handlers.subscribe();

    hx.processor.run_pass().await.unwrap();
    let stale_hash = hx.store.scanned_hash(150).unwrap();

    hx.remote.reorg_from(145);
    hx.remote.advance(5);
    hx.remote.withhold_batches_from(142);

    // The repair happens, then the re-download is withheld so the rewound state is observable
    assert!(hx.processor.run_pass().await.is_err());

    assert_eq!(*chain_errors.lock(), vec![(151, 141)]);
    assert_eq!(hx.cache.highest_height().await.unwrap(), Some(h(141)));
    assert_eq!(hx.store.last_scanned_height().await.unwrap(), Some(h(141)));
    assert_eq!(hx.store.rewinds(), vec![h(141)]);

    let mut saw_chain_event = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::ChainError {
            error_height,
            rewind_height,
        } = event
        {
            assert_eq!((error_height, rewind_height), (h(151), h(141)));
            saw_chain_event = true;
        }
    }
    assert!(saw_chain_event);

    hx.remote.release_batches();
    hx.processor.run_pass().await.unwrap();
    assert_eq!(hx.store.last_scanned_height().await.unwrap(), Some(h(155)));
    assert_eq!(hx.store.scanned_hash(150), Some(hx.remote.hash_at(150)));
    assert_ne!(hx.store.scanned_hash(150), Some(stale_hash));
}

#[tokio::test]
async fn test_deep_reorg_steps_further_back() {
    let hx = harness(150, test_config());
    let chain_errors = record_chain_errors(&hx.handlers);
    hx.processor.run_pass().await.unwrap();

    hx.remote.reorg_from(120);
    hx.remote.advance(5);
    hx.processor.run_pass().await.unwrap();

    assert_eq!(
        *chain_errors.lock(),
        vec![(151, 141), (142, 122), (123, 100)]
    );
    for (error_height, rewind_height) in chain_errors.lock().iter() {
        assert!(rewind_height < error_height);
        assert!(*rewind_height as u64 >= BIRTHDAY);
    }
    assert_eq!(hx.store.last_scanned_height().await.unwrap(), Some(h(155)));
    assert_eq!(hx.store.scanned_hash(121), Some(hx.remote.hash_at(121)));

    // Offsets start over once a pass validates cleanly
    hx.remote.reorg_from(150);
    hx.remote.advance(1);
    hx.processor.run_pass().await.unwrap();
    assert_eq!(chain_errors.lock().last(), Some(&(156, 146)));
}

#[tokio::test]
async fn test_rewind_targets_follow_store_granularity() {
    let hx = harness(150, test_config());
    let chain_errors = record_chain_errors(&hx.handlers);
    hx.store.set_rewind_interval(20);
    hx.processor.run_pass().await.unwrap();

    hx.remote.reorg_from(148);
    hx.remote.advance(2);
    hx.processor.run_pass().await.unwrap();

    assert_eq!(*chain_errors.lock(), vec![(151, 140)]);
    assert_eq!(hx.store.last_scanned_height().await.unwrap(), Some(h(152)));
}

#[tokio::test]
async fn test_manual_rewind_with_cache_clear_redownloads() {
    let hx = harness(250, test_config());
    hx.store.set_rewind_interval(50);
    hx.processor.run_pass().await.unwrap();

    let target = hx
        .processor
        .rewind_to_nearest_height(h(237), true)
        .await
        .unwrap();
    assert_eq!(target, h(200));
    assert_eq!(hx.cache.highest_height().await.unwrap(), Some(h(200)));
    assert_eq!(hx.store.last_scanned_height().await.unwrap(), Some(h(200)));
    assert_eq!(hx.processor.info().last_scanned_height, Some(h(200)));

    let calls = hx.remote.range_calls();
    assert_eq!(
        hx.processor.run_pass().await.unwrap(),
        PassOutcome::Scanned(BlockRange::new(h(201), h(250)).unwrap())
    );
    assert!(hx.remote.range_calls() > calls);
    assert_eq!(hx.cache.highest_height().await.unwrap(), Some(h(250)));
}

#[tokio::test]
async fn test_manual_rewind_keeps_cache_when_asked() {
    let hx = harness(250, test_config());
    hx.processor.run_pass().await.unwrap();

    let target = hx
        .processor
        .rewind_to_nearest_height(h(220), false)
        .await
        .unwrap();
    assert_eq!(target, h(220));
    assert_eq!(hx.cache.highest_height().await.unwrap(), Some(h(250)));

    let calls = hx.remote.range_calls();
    hx.processor.run_pass().await.unwrap();
    assert_eq!(hx.remote.range_calls(), calls);
    assert_eq!(hx.store.last_scanned_height().await.unwrap(), Some(h(250)));
}

#[tokio::test]
async fn test_manual_rewind_clamps_to_birthday() {
    let hx = harness(150, test_config());
    hx.processor.run_pass().await.unwrap();

    let target = hx
        .processor
        .rewind_to_nearest_height(h(10), true)
        .await
        .unwrap();
    assert_eq!(target, h(BIRTHDAY));
    assert_eq!(hx.store.last_scanned_height().await.unwrap(), None);
    assert_eq!(hx.cache.highest_height().await.unwrap(), None);
}

#[tokio::test]
async fn test_quick_rewind_height() {
    let hx = harness(400, test_config());
    assert_eq!(hx.processor.quick_rewind_height().await.unwrap(), h(BIRTHDAY));

    hx.processor.run_pass().await.unwrap();
    assert_eq!(hx.processor.quick_rewind_height().await.unwrap(), h(300));
}

#[tokio::test(start_paused = true)]
async fn test_batch_failures_are_retried() {
    let hx = harness(160, test_config());
    hx.remote.fail_next_batches(2);

    hx.processor.run_pass().await.unwrap();
    assert_eq!(hx.store.last_scanned_height().await.unwrap(), Some(h(160)));
}

#[tokio::test(start_paused = true)]
async fn test_batch_gives_up_after_max_retries() {
    let hx = harness(160, test_config());
    hx.remote.fail_next_batches(3);

    let err = hx.processor.run_pass().await.unwrap_err();
    assert!(matches!(err, Error::Network(_)));
    assert!(err.is_transient());
    assert_eq!(hx.store.last_scanned_height().await.unwrap(), None);
}

#[tokio::test]
async fn test_scan_failure_is_reported() {
    let hx = harness(150, test_config());
    hx.store.set_fail_scan(true);

    let err = hx.processor.run_pass().await.unwrap_err();
    assert!(matches!(err, Error::Scan { height, .. } if height == h(101)));
}

#[tokio::test(start_paused = true)]
async fn test_driver_survives_disconnects() {
    let hx = harness(180, test_config());
    hx.remote.fail_next_tip_requests(3);
    let mut events = hx.handlers.subscribe();

    let handle = hx.processor.start();
    hx.processor
        .subscribe_info()
        .wait_for(|info| info.last_scanned_height == Some(h(180)))
        .await
        .unwrap();

    assert!(hx.remote.tip_calls() >= 4);
    let mut processor_errors = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SyncEvent::ProcessorError(_)) {
            processor_errors += 1;
        }
    }
    assert_eq!(processor_errors, 3);

    hx.processor.stop();
    handle.await.unwrap().unwrap();
    assert_eq!(hx.processor.state(), ProcessorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_processor_handler_abort_stops_driver() {
    let hx = harness(150, test_config());
    hx.remote.fail_next_tip_requests(1);
    hx.handlers.set_processor(|_| Decision::Abort);
    let critical = Arc::new(Mutex::new(Vec::new()));
    let sink = critical.clone();
    hx.handlers.set_critical(move |e| sink.lock().push(e.to_string()));

    let result = hx.processor.start().await.unwrap();
    assert!(matches!(result, Err(Error::Network(_))));
    assert_eq!(critical.lock().len(), 1);
    assert_eq!(hx.processor.state(), ProcessorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_interrupts_poll_sleep() {
    let config = SyncConfig {
        poll_interval: Duration::from_secs(3600),
        ..test_config()
    };
    let hx = harness(120, config);
    let handle = hx.processor.start();

    hx.processor
        .subscribe_info()
        .wait_for(|info| info.last_scanned_height == Some(h(120)))
        .await
        .unwrap();
    tokio::task::yield_now().await;
    hx.processor.stop();

    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("driver did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(hx.processor.state(), ProcessorState::Stopped);
    assert!(hx.processor.cancel_token().is_cancelled());
}

struct RecordingObserver {
    ranges: Mutex<Vec<BlockRange>>,
}

#[async_trait]
impl PassObserver for RecordingObserver {
    async fn on_scanned(&self, range: BlockRange) {
        self.ranges.lock().push(range);
    }
}

#[tokio::test]
async fn test_observer_sees_each_scanned_range() {
    let hx = harness(140, test_config());
    let observer = Arc::new(RecordingObserver {
        ranges: Mutex::new(Vec::new()),
    });
    hx.processor.set_observer(observer.clone());

    hx.processor.run_pass().await.unwrap();
    hx.remote.advance(10);
    hx.processor.run_pass().await.unwrap();

    assert_eq!(
        *observer.ranges.lock(),
        vec![
            BlockRange::new(h(101), h(140)).unwrap(),
            BlockRange::new(h(141), h(150)).unwrap(),
        ]
    );
}

#[tokio::test]
async fn test_enhancement_stores_fetched_transactions() {
    let config = SyncConfig {
        enhance_transactions: true,
        ..test_config()
    };
    let hx = harness(140, config);
    hx.store
        .set_transactions_to_enhance(vec![vec![1; 32], vec![2; 32]]);
    hx.remote.add_transaction(
        vec![1; 32],
        RawTransaction {
            data: vec![0xaa],
            height: Some(h(120)),
        },
    );
    let taddr = hx.store.transparent_address(0).await.unwrap();
    hx.remote.set_transparent_transactions(
        &taddr,
        vec![RawTransaction {
            data: vec![0xbb],
            height: Some(h(130)),
        }],
    );

    // The second txid is unknown to the server; enhancement carries on
    hx.processor.run_pass().await.unwrap();

    assert_eq!(hx.store.enhanced(), vec![vec![0xaa], vec![0xbb]]);
    assert_eq!(hx.processor.state(), ProcessorState::Enhancing);
}

#[tokio::test]
async fn test_verify_setup() {
    let hx = harness(150, test_config());
    let info = hx.processor.verify_setup().await.unwrap();
    assert_eq!(info.chain_name, "regtest");

    hx.store.set_branch_id(0x76b8_09bb);
    assert!(matches!(
        hx.processor.verify_setup().await,
        Err(Error::Setup(_))
    ));

    hx.store.set_branch_id(zsdk_sync::testing::MOCK_BRANCH_ID);
    hx.remote.set_server_info(ServerInfo {
        chain_name: "main".to_string(),
        consensus_branch_id: "c2d6d0b4".to_string(),
        block_height: 150,
        ..ServerInfo::default()
    });
    let err = hx.processor.verify_setup().await.unwrap_err();
    assert!(err.to_string().contains("main"));

    let remote: &dyn RemoteChainService = hx.remote.as_ref();
    assert_eq!(remote.server_info().await.unwrap().chain_name, "main");
}
