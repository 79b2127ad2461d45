//! Realtime sync: tails the chain head, maintains the unfinalized block
//! window, detects and recovers shallow reorgs, and advances finality.
//!
//! The in-memory window spans the most-recently-finalized block (kept as the
//! parent-hash anchor) up to the current head. Appends must link to the tail
//! by parent hash; a mismatch triggers a walk back along the new chain's
//! parent hashes until a common ancestor inside the window is found.
//! Divergence below the window is a reorg past finality and is fatal.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::rpc::{BlockNumberOrTag, GetLogsSelection, RpcClient};
use crate::storage::EventStore;
use crate::types::events::SyncEvent;
use crate::types::{Block, Log, LogFilter, Transaction};
use crate::utils::error::{EvmIndexerError, Result};

/// Upper bound on blocks ingested per poll tick; deeper deficits are caught
/// up across subsequent ticks.
const MAX_BLOCKS_PER_POLL: u64 = 50;

/// Reported by [`RealtimeSyncService::setup`] so the historical sync knows
/// its upper bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupOutcome {
    pub latest_block_number: u64,
    pub finalized_block_number: u64,
}

/// Per-network realtime head-tailing service.
pub struct RealtimeSyncService {
    chain_id: u64,
    rpc: Arc<dyn RpcClient>,
    store: Arc<dyn EventStore>,
    finality_block_count: u64,
    polling_interval: Duration,
    events: mpsc::Sender<SyncEvent>,
    cancel: CancellationToken,
    /// Ascending, parent-hash contiguous; first element is the finalized
    /// anchor.
    unfinalized: Vec<Block>,
    last_finality_timestamp: u64,
    /// Union of the network's filter addresses; `None` once any filter is
    /// unconstrained.
    log_addresses: Option<Vec<Address>>,
    /// Union of the network's filter topic0 values, same convention.
    log_topic0: Option<Vec<B256>>,
}

impl RealtimeSyncService {
    pub fn new(
        chain_id: u64,
        rpc: Arc<dyn RpcClient>,
        store: Arc<dyn EventStore>,
        filters: &[LogFilter],
        finality_block_count: u64,
        polling_interval: Duration,
        events: mpsc::Sender<SyncEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let mut log_addresses: Option<Vec<Address>> = Some(Vec::new());
        let mut log_topic0: Option<Vec<B256>> = Some(Vec::new());
        for filter in filters {
            match (&mut log_addresses, &filter.addresses) {
                (Some(union), Some(addresses)) if !addresses.is_empty() => {
                    for address in addresses {
                        if !union.contains(address) {
                            union.push(*address);
                        }
                    }
                }
                _ => log_addresses = None,
            }
            match (&mut log_topic0, &filter.topics[0]) {
                (Some(union), Some(values)) if !values.is_empty() => {
                    for value in values {
                        if !union.contains(value) {
                            union.push(*value);
                        }
                    }
                }
                _ => log_topic0 = None,
            }
        }
        if filters.is_empty() {
            log_addresses = None;
            log_topic0 = None;
        }
        Self {
            chain_id,
            rpc,
            store,
            finality_block_count,
            polling_interval,
            events,
            cancel,
            unfinalized: Vec::new(),
            last_finality_timestamp: 0,
            log_addresses,
            log_topic0,
        }
    }

    /// Fetches the head, backfills the unfinalized window down to the
    /// finality boundary, and reports the boundary to the historical sync.
    pub async fn setup(&mut self) -> Result<SetupOutcome> {
        let latest = self
            .rpc
            .get_block_by_number(BlockNumberOrTag::Latest, true)
            .await?
            .ok_or_else(|| {
                EvmIndexerError::Internal("provider returned no latest block".to_string())
            })?;
        let (latest_block, latest_transactions) = latest.into_parts(self.chain_id);
        let latest_block_number = latest_block.number;
        let finalized_block_number = latest_block_number.saturating_sub(self.finality_block_count);

        // Walk back to the finality boundary so every unfinalized block's
        // logs are ingested, including the head itself (a filter starting at
        // the current head must still see it). The boundary block is kept as
        // the window's parent-hash anchor; its data belongs to historical
        // sync.
        let mut chain = vec![(latest_block, latest_transactions)];
        while chain[0].0.number > finalized_block_number && chain[0].0.number > 0 {
            let parent_hash = chain[0].0.parent_hash;
            let parent = self
                .rpc
                .get_block_by_hash(parent_hash, true)
                .await?
                .ok_or_else(|| {
                    EvmIndexerError::Internal(format!(
                        "parent block {parent_hash} not available during setup"
                    ))
                })?;
            chain.insert(0, parent.into_parts(self.chain_id));
        }
        if chain.len() > 1 && chain[0].0.number == finalized_block_number {
            let (anchor, _) = chain.remove(0);
            self.unfinalized.push(anchor);
        }
        for (block, transactions) in chain {
            self.ingest_block(block, transactions).await?;
        }

        tracing::info!(
            chain_id = self.chain_id,
            latest_block_number,
            finalized_block_number,
            "Realtime sync ready"
        );
        Ok(SetupOutcome {
            latest_block_number,
            finalized_block_number,
        })
    }

    /// Polls the head until cancelled. Transient failures are logged and
    /// re-attempted next tick; an invariant violation is fatal.
    pub async fn start(mut self) -> Result<()> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!(chain_id = self.chain_id, "Realtime sync stopping");
                    return Ok(());
                }
                () = sleep(self.polling_interval) => {
                    if let Err(err) = self.tick().await {
                        if matches!(err, EvmIndexerError::InvariantViolation(_)) {
                            let _ = self
                                .events
                                .send(SyncEvent::Fatal {
                                    chain_id: self.chain_id,
                                    message: err.to_string(),
                                })
                                .await;
                            return Err(err);
                        }
                        tracing::error!(
                            chain_id = self.chain_id,
                            error = %err,
                            "Realtime poll failed"
                        );
                    }
                }
            }
        }
    }

    /// One poll iteration: fetch the head number, ingest the new blocks,
    /// advance finality. Exposed for tests.
    pub async fn tick(&mut self) -> Result<()> {
        let head = self.rpc.block_number().await?;
        let tail_number = self
            .unfinalized
            .last()
            .map(|b| b.number)
            .ok_or_else(|| EvmIndexerError::Internal("tick before setup".to_string()))?;
        if head <= tail_number {
            return Ok(());
        }

        let target = head.min(tail_number + MAX_BLOCKS_PER_POLL);
        for number in tail_number + 1..=target {
            let Some(rpc_block) = self
                .rpc
                .get_block_by_number(BlockNumberOrTag::Number(number), true)
                .await?
            else {
                // Head advanced but the block body is not served yet.
                break;
            };
            let (block, transactions) = rpc_block.into_parts(self.chain_id);
            self.process_block(block, transactions).await?;
        }

        self.advance_finality(head).await
    }

    async fn process_block(&mut self, block: Block, transactions: Vec<Transaction>) -> Result<()> {
        let tail = self
            .unfinalized
            .last()
            .expect("unfinalized window is never empty after setup");

        if block.parent_hash == tail.hash {
            return self.ingest_block(block, transactions).await;
        }

        tracing::warn!(
            chain_id = self.chain_id,
            number = block.number,
            hash = %block.hash,
            "Reorg detected — walking back to common ancestor"
        );

        // Collect the new canonical chain back to a block we know.
        let mut new_chain = vec![(block, transactions)];
        loop {
            let parent_hash = new_chain[0].0.parent_hash;
            if let Some(pos) = self.unfinalized.iter().rposition(|b| b.hash == parent_hash) {
                let ancestor_number = self.unfinalized[pos].number;
                let ancestor_timestamp = self.unfinalized[pos].timestamp;

                self.unfinalized.truncate(pos + 1);
                self.store
                    .delete_realtime_data(self.chain_id, ancestor_number + 1)
                    .await?;
                let _ = self
                    .events
                    .send(SyncEvent::ShallowReorg {
                        chain_id: self.chain_id,
                        common_ancestor_timestamp: ancestor_timestamp,
                    })
                    .await;
                tracing::warn!(
                    chain_id = self.chain_id,
                    ancestor_number,
                    ancestor_timestamp,
                    depth = new_chain.len(),
                    "Shallow reorg recovered"
                );

                for (block, transactions) in new_chain {
                    self.ingest_block(block, transactions).await?;
                }
                return Ok(());
            }

            let oldest = self
                .unfinalized
                .first()
                .expect("unfinalized window is never empty after setup")
                .number;
            if new_chain[0].0.number <= oldest {
                return Err(EvmIndexerError::InvariantViolation(format!(
                    "reorg extends beyond the finalized block {oldest}"
                )));
            }
            let parent = self
                .rpc
                .get_block_by_hash(parent_hash, true)
                .await?
                .ok_or_else(|| {
                    EvmIndexerError::Internal(format!(
                        "parent block {parent_hash} not available during reorg walk"
                    ))
                })?;
            new_chain.insert(0, parent.into_parts(self.chain_id));
        }
    }

    /// Fetches the block's matching logs, persists everything atomically,
    /// appends to the window, and emits the realtime checkpoint.
    async fn ingest_block(&mut self, block: Block, transactions: Vec<Transaction>) -> Result<()> {
        let selection = GetLogsSelection {
            block_hash: Some(block.hash),
            from_block: None,
            to_block: None,
            addresses: self.log_addresses.clone(),
            topics: [self.log_topic0.clone(), None, None, None],
        };
        let logs: Vec<Log> = self
            .rpc
            .get_logs(&selection)
            .await?
            .into_iter()
            .map(|log| log.into_log(self.chain_id))
            .collect();

        let referenced: HashSet<B256> = logs.iter().map(|l| l.transaction_hash).collect();
        let transactions: Vec<Transaction> = transactions
            .into_iter()
            .filter(|tx| referenced.contains(&tx.hash))
            .collect();

        self.store
            .insert_realtime_block(self.chain_id, &block, &transactions, &logs)
            .await?;
        tracing::debug!(
            chain_id = self.chain_id,
            number = block.number,
            logs = logs.len(),
            "Realtime block ingested"
        );

        let _ = self
            .events
            .send(SyncEvent::RealtimeCheckpoint {
                chain_id: self.chain_id,
                timestamp: block.timestamp,
            })
            .await;
        self.unfinalized.push(block);
        Ok(())
    }

    /// Emits the finality checkpoint for the greatest block at or below the
    /// finality boundary and drops everything older than it; the boundary
    /// block itself stays as the parent-hash anchor.
    async fn advance_finality(&mut self, head: u64) -> Result<()> {
        let boundary = head.saturating_sub(self.finality_block_count);
        let Some(pos) = self.unfinalized.iter().rposition(|b| b.number <= boundary) else {
            return Ok(());
        };
        let timestamp = self.unfinalized[pos].timestamp;
        if timestamp > self.last_finality_timestamp {
            self.last_finality_timestamp = timestamp;
            let _ = self
                .events
                .send(SyncEvent::FinalityCheckpoint {
                    chain_id: self.chain_id,
                    timestamp,
                })
                .await;
        }
        self.unfinalized.drain(..pos);
        Ok(())
    }
}
