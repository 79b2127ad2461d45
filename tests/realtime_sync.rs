//! Realtime sync end-to-end tests: head tailing, shallow-reorg recovery,
//! deep-reorg detection, and finality advancement.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use evm_indexer::{
    EventStore, EvmIndexerError, GetLogEventsRequest, LogFilter, RealtimeSyncService,
    SqliteEventStore, SyncEvent,
};

use common::{address, block_hash, fork_hash, make_block, make_log, make_tx, topic, tx_hash, MockRpc};

const CHAIN_ID: u64 = 1;
const FINALITY: u64 = 2;

fn realtime_filter() -> LogFilter {
    LogFilter {
        name: "live".to_string(),
        chain_id: CHAIN_ID,
        addresses: Some(vec![address(0xa)]),
        topics: [Some(vec![topic(1)]), None, None, None],
        start_block: 0,
        end_block: None,
        max_block_range: 2_000,
    }
}

/// Canonical chain 10..=12 with matching logs in blocks 11 and 12.
fn seed_chain(rpc: &MockRpc) {
    for number in 10u64..=12 {
        rpc.add_canonical_block(make_block(
            number,
            number * 100,
            block_hash(number),
            block_hash(number - 1),
            vec![make_tx(tx_hash(number), block_hash(number), number, 0)],
        ));
    }
    for number in [11u64, 12] {
        rpc.add_log(make_log(
            address(0xa),
            block_hash(number),
            number,
            tx_hash(number),
            0,
            vec![topic(1)],
        ));
    }
}

fn service(
    rpc: Arc<MockRpc>,
    store: Arc<SqliteEventStore>,
) -> (RealtimeSyncService, mpsc::Receiver<SyncEvent>) {
    let (sync_tx, sync_rx) = mpsc::channel(64);
    let service = RealtimeSyncService::new(
        CHAIN_ID,
        rpc,
        store as Arc<dyn EventStore>,
        &[realtime_filter()],
        FINALITY,
        Duration::from_millis(10),
        sync_tx,
        CancellationToken::new(),
    );
    (service, sync_rx)
}

fn drain(rx: &mut mpsc::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn stored_log_blocks(store: &SqliteEventStore) -> Vec<(u64, Vec<u8>)> {
    let filters = [realtime_filter()];
    store
        .get_log_events(GetLogEventsRequest {
            from_timestamp: 0,
            to_timestamp: 100_000,
            filters: &filters,
            include_event_selectors: None,
            page_size: 100,
            cursor: None,
        })
        .await
        .unwrap()
        .events
        .iter()
        .map(|e| (e.log.block_number, e.log.block_hash.to_vec()))
        .collect()
}

#[tokio::test]
async fn test_setup_ingests_the_unfinalized_window() {
    let rpc = Arc::new(MockRpc::new());
    seed_chain(&rpc);
    let store = Arc::new(SqliteEventStore::in_memory().await.unwrap());
    store.migrate().await.unwrap();

    let (mut service, mut rx) = service(Arc::clone(&rpc), Arc::clone(&store));
    let setup = service.setup().await.unwrap();
    assert_eq!(setup.latest_block_number, 12);
    assert_eq!(setup.finalized_block_number, 10);

    // The head block's own logs are ingested, so a filter starting at the
    // current head still sees realtime intake.
    let logs = stored_log_blocks(&store).await;
    assert_eq!(
        logs.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
        vec![11, 12]
    );

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![
            SyncEvent::RealtimeCheckpoint { chain_id: CHAIN_ID, timestamp: 1_100 },
            SyncEvent::RealtimeCheckpoint { chain_id: CHAIN_ID, timestamp: 1_200 },
        ]
    );
}

#[tokio::test]
async fn test_shallow_reorg_recovery() {
    let rpc = Arc::new(MockRpc::new());
    seed_chain(&rpc);
    let store = Arc::new(SqliteEventStore::in_memory().await.unwrap());
    store.migrate().await.unwrap();

    let (mut service, mut rx) = service(Arc::clone(&rpc), Arc::clone(&store));
    service.setup().await.unwrap();
    drain(&mut rx);

    // A fork replaces 11 and 12 and extends to 13; common ancestor is 10.
    let fork_parent = |n: u64| if n == 11 { block_hash(10) } else { fork_hash(n - 1) };
    for number in 11u64..=13 {
        let block = make_block(
            number,
            number * 100 + 1,
            fork_hash(number),
            fork_parent(number),
            vec![make_tx(tx_hash(1_000 + number), fork_hash(number), number, 0)],
        );
        rpc.add_fork_block(block.clone());
        rpc.add_canonical_block(block);
    }
    rpc.add_log(make_log(
        address(0xa),
        fork_hash(11),
        11,
        tx_hash(1_011),
        0,
        vec![topic(1)],
    ));

    service.tick().await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(
        events[0],
        SyncEvent::ShallowReorg {
            chain_id: CHAIN_ID,
            common_ancestor_timestamp: 1_000,
        }
    );
    assert_eq!(
        &events[1..=3],
        &[
            SyncEvent::RealtimeCheckpoint { chain_id: CHAIN_ID, timestamp: 1_101 },
            SyncEvent::RealtimeCheckpoint { chain_id: CHAIN_ID, timestamp: 1_201 },
            SyncEvent::RealtimeCheckpoint { chain_id: CHAIN_ID, timestamp: 1_301 },
        ]
    );
    // head 13, finality 2 → block 11' finalized.
    assert!(events.contains(&SyncEvent::FinalityCheckpoint {
        chain_id: CHAIN_ID,
        timestamp: 1_101,
    }));

    // The store now holds only the new canonical chain from block 11 up.
    let logs = stored_log_blocks(&store).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].0, 11);
    assert_eq!(logs[0].1, fork_hash(11).to_vec());
}

#[tokio::test]
async fn test_deep_reorg_is_fatal() {
    let rpc = Arc::new(MockRpc::new());
    // Need block 9 canonical so the fork can reference it below the window.
    rpc.add_canonical_block(make_block(
        9,
        900,
        block_hash(9),
        block_hash(8),
        vec![],
    ));
    seed_chain(&rpc);
    let store = Arc::new(SqliteEventStore::in_memory().await.unwrap());
    store.migrate().await.unwrap();

    let (mut service, mut rx) = service(Arc::clone(&rpc), Arc::clone(&store));
    service.setup().await.unwrap();
    drain(&mut rx);

    // A fork diverging at block 9 — beyond the unfinalized window.
    let fork_parent = |n: u64| if n == 10 { block_hash(9) } else { fork_hash(n - 1) };
    for number in 10u64..=13 {
        let block = make_block(
            number,
            number * 100 + 7,
            fork_hash(number),
            fork_parent(number),
            vec![],
        );
        rpc.add_fork_block(block.clone());
        if number == 13 {
            rpc.add_canonical_block(block);
        }
    }

    let err = service.tick().await.unwrap_err();
    assert!(matches!(err, EvmIndexerError::InvariantViolation(_)));
}

#[tokio::test]
async fn test_finality_is_monotone() {
    let rpc = Arc::new(MockRpc::new());
    seed_chain(&rpc);
    let store = Arc::new(SqliteEventStore::in_memory().await.unwrap());
    store.migrate().await.unwrap();

    let (mut service, mut rx) = service(Arc::clone(&rpc), Arc::clone(&store));
    service.setup().await.unwrap();
    drain(&mut rx);

    for number in 13u64..=15 {
        rpc.add_canonical_block(make_block(
            number,
            number * 100,
            block_hash(number),
            block_hash(number - 1),
            vec![],
        ));
        service.tick().await.unwrap();
    }

    let finality: Vec<u64> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            SyncEvent::FinalityCheckpoint { timestamp, .. } => Some(timestamp),
            _ => None,
        })
        .collect();
    assert_eq!(finality, vec![1_100, 1_200, 1_300]);
    assert!(finality.windows(2).all(|w| w[0] < w[1]));
}
