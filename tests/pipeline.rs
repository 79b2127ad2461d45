//! Handler pipeline tests: ordered processing against the derived store,
//! rollback on reorg, halt on handler error, and hot reload.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_dyn_abi::DynSolValue;
use alloy_json_abi::JsonAbi;
use alloy_primitives::{Bytes, B256, B64, U256};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use evm_indexer::{
    AbiEventRegistry, Block, ContractReader, DecodedLogEvent, DerivedStore, EntityOp,
    EventAggregator, EventSource, EventStore, EvmIndexerError, HandlerContext, HandlerPipeline,
    HandlerRegistry, Log, LogEventHandler, LogFilter, PipelineHandle, Result, SqliteDerivedStore,
    SqliteEventStore, SyncEvent, Transaction, TransactionKind,
};

use common::{address, block_hash, tx_hash};

const CHAIN_ID: u64 = 1;

fn transfer_abi() -> JsonAbi {
    serde_json::from_str(
        r#"[{"type":"event","name":"Transfer","anonymous":false,"inputs":[
            {"name":"from","type":"address","indexed":true},
            {"name":"to","type":"address","indexed":true},
            {"name":"value","type":"uint256","indexed":false}]}]"#,
    )
    .unwrap()
}

fn selector() -> B256 {
    transfer_abi().events().next().unwrap().selector()
}

fn erc20_filter() -> LogFilter {
    LogFilter {
        name: "erc20".to_string(),
        chain_id: CHAIN_ID,
        addresses: Some(vec![address(0xa)]),
        topics: [Some(vec![selector()]), None, None, None],
        start_block: 0,
        end_block: None,
        max_block_range: 2_000,
    }
}

fn block(number: u64, timestamp: u64) -> Block {
    Block {
        hash: block_hash(number),
        parent_hash: block_hash(number - 1),
        number,
        timestamp,
        miner: address(0xbeef),
        gas_limit: U256::from(30_000_000u64),
        gas_used: U256::from(21_000u64),
        base_fee_per_gas: None,
        difficulty: U256::ZERO,
        total_difficulty: U256::ZERO,
        extra_data: Bytes::new(),
        logs_bloom: Bytes::new(),
        mix_hash: B256::ZERO,
        nonce: B64::ZERO,
        receipts_root: B256::ZERO,
        sha3_uncles: B256::ZERO,
        size: U256::ZERO,
        state_root: B256::ZERO,
        transactions_root: B256::ZERO,
        chain_id: CHAIN_ID,
    }
}

fn transaction(block: &Block) -> Transaction {
    Transaction {
        hash: tx_hash(block.number),
        block_hash: block.hash,
        block_number: block.number,
        transaction_index: 0,
        from: address(0xaaaa),
        to: Some(address(0xa)),
        input: Bytes::new(),
        nonce: 0,
        value: U256::ZERO,
        gas: U256::from(21_000u64),
        v: U256::ZERO,
        r: U256::ZERO,
        s: U256::ZERO,
        kind: TransactionKind::Eip1559,
        gas_price: None,
        max_fee_per_gas: Some(U256::from(9u64)),
        max_priority_fee_per_gas: Some(U256::from(1u64)),
        access_list: None,
        chain_id: CHAIN_ID,
    }
}

fn transfer_log(block: &Block, tx: &Transaction, value: u64) -> Log {
    Log {
        address: address(0xa),
        block_hash: block.hash,
        block_number: block.number,
        transaction_hash: tx.hash,
        transaction_index: 0,
        log_index: 0,
        data: Bytes::from(U256::from(value).to_be_bytes::<32>().to_vec()),
        topic0: Some(selector()),
        topic1: Some(address(0xaaaa).into_word()),
        topic2: Some(address(0xbbbb).into_word()),
        topic3: None,
        chain_id: CHAIN_ID,
    }
}

/// Writes `Account 0xA` with the transferred value as its balance.
struct BalanceHandler;

#[async_trait]
impl LogEventHandler for BalanceHandler {
    async fn handle(&self, event: &DecodedLogEvent, ctx: &HandlerContext<'_>) -> Result<()> {
        let DynSolValue::Uint(value, _) = &event.event.params[2].value else {
            return Err(EvmIndexerError::Decoding("expected uint value".to_string()));
        };
        ctx.entities
            .set("Account", "0xA", json!({ "balance": value.to::<u64>() }));
        Ok(())
    }
}

/// Fails on any transfer of exactly `poison`.
struct PoisonHandler {
    poison: u64,
}

#[async_trait]
impl LogEventHandler for PoisonHandler {
    async fn handle(&self, event: &DecodedLogEvent, ctx: &HandlerContext<'_>) -> Result<()> {
        let DynSolValue::Uint(value, _) = &event.event.params[2].value else {
            return Err(EvmIndexerError::Decoding("expected uint value".to_string()));
        };
        if value.to::<u64>() == self.poison {
            return Err(EvmIndexerError::Internal("poisoned transfer".to_string()));
        }
        ctx.entities
            .set("Account", "0xA", json!({ "balance": value.to::<u64>() }));
        Ok(())
    }
}

struct Harness {
    event_store: Arc<SqliteEventStore>,
    derived: Arc<SqliteDerivedStore>,
    aggregator: Arc<EventAggregator>,
    handle: PipelineHandle,
}

/// Event store seeded with Transfer(100) at ts 500 and Transfer(150) at
/// ts 700; a pipeline running the given handler consumes the aggregator.
async fn harness(handler: Arc<dyn LogEventHandler>) -> Harness {
    let event_store = Arc::new(SqliteEventStore::in_memory().await.unwrap());
    event_store.migrate().await.unwrap();
    let derived = Arc::new(SqliteDerivedStore::in_memory().await.unwrap());
    derived.migrate().await.unwrap();

    for (number, timestamp, value) in [(100u64, 500u64, 100u64), (101, 700, 150)] {
        let b = block(number, timestamp);
        let tx = transaction(&b);
        let log = transfer_log(&b, &tx, value);
        event_store
            .insert_realtime_block(
                CHAIN_ID,
                &b,
                std::slice::from_ref(&tx),
                std::slice::from_ref(&log),
            )
            .await
            .unwrap();
    }

    let mut abi = AbiEventRegistry::new();
    abi.register_filter(
        "erc20",
        transfer_abi().events().map(|e| (e.selector(), e.clone())),
    );
    let abi = Arc::new(abi);

    let (agg_tx, agg_rx) = mpsc::channel(64);
    let aggregator = Arc::new(EventAggregator::new(
        Arc::clone(&event_store) as Arc<dyn EventStore>,
        vec![erc20_filter()],
        Arc::clone(&abi),
        &[CHAIN_ID],
        agg_tx,
    ));

    let mut registry = HandlerRegistry::new();
    registry.register("erc20", "Transfer", handler);

    let contracts = Arc::new(ContractReader::new(
        Arc::clone(&event_store) as Arc<dyn EventStore>,
        HashMap::new(),
    ));
    let pipeline = HandlerPipeline::new(
        Arc::clone(&aggregator) as Arc<dyn EventSource>,
        Arc::clone(&derived) as Arc<dyn DerivedStore>,
        contracts,
        abi,
        registry,
        CancellationToken::new(),
    )
    .with_page_size(10);
    let handle = pipeline.handle();
    tokio::spawn(pipeline.run(agg_rx));

    Harness {
        event_store,
        derived,
        aggregator,
        handle,
    }
}

async fn wait_for(predicate: impl Fn() -> bool + Send) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_events_processed_through_checkpoint() {
    let h = harness(Arc::new(BalanceHandler)).await;
    h.aggregator.handle_new_historical_checkpoint(CHAIN_ID, 700).await;

    let handle = h.handle.clone();
    wait_for(move || handle.processed_through() >= 700).await;
    assert_eq!(
        h.derived.find("Account", "0xA").await.unwrap(),
        Some(json!({ "balance": 150 }))
    );
    assert!(h.handle.user_error().is_none());
}

#[tokio::test]
async fn test_reorg_rolls_back_derived_state() {
    let h = harness(Arc::new(BalanceHandler)).await;
    h.aggregator.handle_new_historical_checkpoint(CHAIN_ID, 700).await;
    let handle = h.handle.clone();
    wait_for(move || handle.processed_through() >= 700).await;

    // The chain reorgs out block 101 (the ts-700 transfer); realtime sync
    // rewrites the store, then the reorg signal reaches the pipeline.
    h.event_store.delete_realtime_data(CHAIN_ID, 101).await.unwrap();
    h.aggregator
        .handle_sync_event(SyncEvent::ShallowReorg {
            chain_id: CHAIN_ID,
            common_ancestor_timestamp: 600,
        })
        .await;

    // The balance-150 version is deleted and the balance-100 row is live
    // again; reprocessing past 600 finds no events.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let live = h.derived.find("Account", "0xA").await.unwrap();
            if live == Some(json!({ "balance": 100 })) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("derived store was not rolled back in time");
    assert!(h.handle.user_error().is_none());
}

#[tokio::test]
async fn test_handler_error_halts_until_reset() {
    let h = harness(Arc::new(PoisonHandler { poison: 150 })).await;
    h.aggregator.handle_new_historical_checkpoint(CHAIN_ID, 700).await;

    let handle = h.handle.clone();
    wait_for(move || handle.user_error().is_some()).await;
    // The failed page is dropped wholesale: even the first (successful)
    // event's writes are not applied, and the watermark did not move.
    assert_eq!(h.derived.find("Account", "0xA").await.unwrap(), None);
    assert_eq!(h.handle.processed_through(), 0);

    // Further checkpoints do not resume processing.
    h.aggregator.handle_new_realtime_checkpoint(CHAIN_ID, 800).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.handle.processed_through(), 0);

    // A reset with a healthy registry reprocesses from scratch.
    let mut registry = HandlerRegistry::new();
    registry.register("erc20", "Transfer", Arc::new(BalanceHandler));
    h.handle.reset(registry).await.unwrap();

    let handle = h.handle.clone();
    wait_for(move || handle.processed_through() >= 700).await;
    assert_eq!(
        h.derived.find("Account", "0xA").await.unwrap(),
        Some(json!({ "balance": 150 }))
    );
    assert!(h.handle.user_error().is_none());
}

#[tokio::test]
async fn test_derived_store_versioning_and_rollback() {
    // The literal rollback scenario: a live row from ts 500, a new version
    // at ts 700, reorg back to ts 600.
    let derived = SqliteDerivedStore::in_memory().await.unwrap();
    derived.migrate().await.unwrap();

    derived
        .apply(&[EntityOp::Upsert {
            entity: "Account".to_string(),
            id: "0xA".to_string(),
            data: json!({ "balance": 100 }),
            timestamp: 500,
        }])
        .await
        .unwrap();
    derived
        .apply(&[EntityOp::Upsert {
            entity: "Account".to_string(),
            id: "0xA".to_string(),
            data: json!({ "balance": 150 }),
            timestamp: 700,
        }])
        .await
        .unwrap();
    assert_eq!(
        derived.find("Account", "0xA").await.unwrap(),
        Some(json!({ "balance": 150 }))
    );

    derived.revert(600).await.unwrap();
    assert_eq!(
        derived.find("Account", "0xA").await.unwrap(),
        Some(json!({ "balance": 100 }))
    );

    // Deletes close the live row and are likewise reverted.
    derived
        .apply(&[EntityOp::Delete {
            entity: "Account".to_string(),
            id: "0xA".to_string(),
            timestamp: 800,
        }])
        .await
        .unwrap();
    assert_eq!(derived.find("Account", "0xA").await.unwrap(), None);
    derived.revert(600).await.unwrap();
    assert_eq!(
        derived.find("Account", "0xA").await.unwrap(),
        Some(json!({ "balance": 100 }))
    );

    derived.truncate().await.unwrap();
    assert_eq!(derived.find("Account", "0xA").await.unwrap(), None);
}

#[tokio::test]
async fn test_same_timestamp_rewrite_keeps_one_live_row() {
    let derived = SqliteDerivedStore::in_memory().await.unwrap();
    derived.migrate().await.unwrap();

    derived
        .apply(&[
            EntityOp::Upsert {
                entity: "Account".to_string(),
                id: "0xA".to_string(),
                data: json!({ "balance": 1 }),
                timestamp: 500,
            },
            EntityOp::Upsert {
                entity: "Account".to_string(),
                id: "0xA".to_string(),
                data: json!({ "balance": 2 }),
                timestamp: 500,
            },
        ])
        .await
        .unwrap();
    assert_eq!(
        derived.find("Account", "0xA").await.unwrap(),
        Some(json!({ "balance": 2 }))
    );
    // Rolling back to before the write removes the entity entirely.
    derived.revert(499).await.unwrap();
    assert_eq!(derived.find("Account", "0xA").await.unwrap(), None);
}
