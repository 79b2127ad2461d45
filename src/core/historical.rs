//! Historical sync: bounded backfill of logs, blocks, and transactions over
//! the uncached portions of each filter's block range.
//!
//! For every filter the service merges the cached-range index, subtracts it
//! from the required range, and partitions the gaps into range tasks capped
//! at the filter's effective `max_block_range`. Tasks run on a
//! semaphore-bounded pool; each one fetches logs, persists them, fetches the
//! referenced blocks (plus the range-end anchor block), and commits the
//! cached range. A provider rejecting the span splits the task in half and
//! halves the filter's effective span.
//!
//! A range only becomes cached after its commit, so the emitted checkpoint
//! never covers blocks that are still in flight.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use alloy_primitives::B256;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::rpc::retry::is_range_too_large;
use crate::rpc::{BlockNumberOrTag, GetLogsSelection, RpcClient};
use crate::storage::{sql, EventStore};
use crate::types::events::SyncEvent;
use crate::types::{Log, LogFilter};
use crate::utils::error::{EvmIndexerError, Result};

struct FilterProgress {
    filter: LogFilter,
    key: String,
    /// Lowered when a provider rejects the span; floor 1.
    effective_max_block_range: AtomicU64,
    /// Max committed end-block timestamp for this filter.
    checkpoint: AtomicU64,
}

enum TaskOutcome {
    Committed {
        filter_idx: usize,
        end_block_timestamp: u64,
    },
    Split {
        filter_idx: usize,
        first: (u64, u64),
        second: (u64, u64),
    },
    Retry {
        filter_idx: usize,
        from: u64,
        to: u64,
    },
}

/// Splits `[from, to]` into consecutive chunks of at most `max` blocks.
fn partition_range(from: u64, to: u64, max: u64) -> Vec<(u64, u64)> {
    let max = max.max(1);
    let mut chunks = Vec::new();
    let mut cursor = from;
    while cursor <= to {
        let end = to.min(cursor.saturating_add(max - 1));
        chunks.push((cursor, end));
        if end == u64::MAX {
            break;
        }
        cursor = end + 1;
    }
    chunks
}

/// Per-network historical backfill service.
pub struct HistoricalSyncService {
    chain_id: u64,
    rpc: Arc<dyn RpcClient>,
    store: Arc<dyn EventStore>,
    filters: Vec<Arc<FilterProgress>>,
    concurrency: usize,
    events: mpsc::Sender<SyncEvent>,
    cancel: CancellationToken,
    emitted_checkpoint: AtomicU64,
}

impl HistoricalSyncService {
    pub fn new(
        chain_id: u64,
        rpc: Arc<dyn RpcClient>,
        store: Arc<dyn EventStore>,
        filters: Vec<LogFilter>,
        concurrency: usize,
        events: mpsc::Sender<SyncEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let filters = filters
            .into_iter()
            .map(|filter| {
                let key = filter.key();
                let max = filter.max_block_range;
                Arc::new(FilterProgress {
                    filter,
                    key,
                    effective_max_block_range: AtomicU64::new(max),
                    checkpoint: AtomicU64::new(0),
                })
            })
            .collect();
        Self {
            chain_id,
            rpc,
            store,
            filters,
            concurrency: concurrency.max(1),
            events,
            cancel,
            emitted_checkpoint: AtomicU64::new(0),
        }
    }

    /// Backfills every filter up to `latest_finalized_block`, then emits
    /// `HistoricalSyncComplete`. Returns early without error on
    /// cancellation.
    pub async fn run(&self, latest_finalized_block: u64) -> Result<()> {
        tracing::info!(
            chain_id = self.chain_id,
            latest_finalized_block,
            filters = self.filters.len(),
            "Starting historical sync"
        );

        // Seed each filter's checkpoint from the already-cached leading
        // range, then emit the network checkpoint once.
        for progress in &self.filters {
            let starting_range_end_timestamp = self
                .store
                .merge_log_filter_cached_ranges(&progress.key, progress.filter.start_block)
                .await?;
            progress
                .checkpoint
                .store(starting_range_end_timestamp, Ordering::SeqCst);
        }
        self.emit_network_checkpoint().await;

        let mut tasks: JoinSet<Result<TaskOutcome>> = JoinSet::new();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        for (filter_idx, progress) in self.filters.iter().enumerate() {
            let end = progress
                .filter
                .end_block
                .map_or(latest_finalized_block, |e| e.min(latest_finalized_block));
            if end < progress.filter.start_block {
                continue;
            }
            let cached = self.store.get_log_filter_cached_ranges(&progress.key).await?;
            let cached = sql::coalesce_ranges(cached);
            let max = progress.effective_max_block_range.load(Ordering::SeqCst);
            for (gap_from, gap_to) in sql::subtract_ranges(progress.filter.start_block, end, &cached)
            {
                for (from, to) in partition_range(gap_from, gap_to, max) {
                    self.spawn_range_task(&mut tasks, &semaphore, filter_idx, from, to);
                }
            }
        }

        loop {
            let joined = tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!(chain_id = self.chain_id, "Historical sync cancelled");
                    tasks.abort_all();
                    return Ok(());
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            match joined {
                Err(join_err) if join_err.is_cancelled() => continue,
                Err(join_err) => {
                    return Err(EvmIndexerError::Internal(format!(
                        "historical task join error: {join_err}"
                    )));
                }
                Ok(Err(err)) => {
                    let _ = self
                        .events
                        .send(SyncEvent::Fatal {
                            chain_id: self.chain_id,
                            message: err.to_string(),
                        })
                        .await;
                    return Err(err);
                }
                Ok(Ok(TaskOutcome::Committed {
                    filter_idx,
                    end_block_timestamp,
                })) => {
                    self.filters[filter_idx]
                        .checkpoint
                        .fetch_max(end_block_timestamp, Ordering::SeqCst);
                    self.emit_network_checkpoint().await;
                }
                Ok(Ok(TaskOutcome::Split {
                    filter_idx,
                    first,
                    second,
                })) => {
                    self.spawn_range_task(&mut tasks, &semaphore, filter_idx, first.0, first.1);
                    self.spawn_range_task(&mut tasks, &semaphore, filter_idx, second.0, second.1);
                }
                Ok(Ok(TaskOutcome::Retry { filter_idx, from, to })) => {
                    self.spawn_range_task(&mut tasks, &semaphore, filter_idx, from, to);
                }
            }
        }

        tracing::info!(chain_id = self.chain_id, "Historical sync complete");
        let _ = self
            .events
            .send(SyncEvent::HistoricalSyncComplete {
                chain_id: self.chain_id,
            })
            .await;
        Ok(())
    }

    fn spawn_range_task(
        &self,
        tasks: &mut JoinSet<Result<TaskOutcome>>,
        semaphore: &Arc<Semaphore>,
        filter_idx: usize,
        from: u64,
        to: u64,
    ) {
        let semaphore = Arc::clone(semaphore);
        let rpc = Arc::clone(&self.rpc);
        let store = Arc::clone(&self.store);
        let progress = Arc::clone(&self.filters[filter_idx]);
        let chain_id = self.chain_id;
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|e| EvmIndexerError::Internal(e.to_string()))?;
            run_range_task(chain_id, &*rpc, &*store, &progress, filter_idx, from, to).await
        });
    }

    /// The network's historical checkpoint is the minimum across filters of
    /// each filter's committed progress; emitted only when it advances.
    async fn emit_network_checkpoint(&self) {
        let minimum = self
            .filters
            .iter()
            .map(|p| p.checkpoint.load(Ordering::SeqCst))
            .min()
            .unwrap_or(0);
        if minimum > 0 && minimum > self.emitted_checkpoint.load(Ordering::SeqCst) {
            self.emitted_checkpoint.store(minimum, Ordering::SeqCst);
            let _ = self
                .events
                .send(SyncEvent::HistoricalCheckpoint {
                    chain_id: self.chain_id,
                    timestamp: minimum,
                })
                .await;
        }
    }
}

async fn run_range_task(
    chain_id: u64,
    rpc: &dyn RpcClient,
    store: &dyn EventStore,
    progress: &FilterProgress,
    filter_idx: usize,
    from: u64,
    to: u64,
) -> Result<TaskOutcome> {
    let selection = GetLogsSelection {
        block_hash: None,
        from_block: Some(from),
        to_block: Some(to),
        addresses: progress.filter.addresses.clone(),
        topics: progress.filter.topics.clone(),
    };
    let raw_logs = match rpc.get_logs(&selection).await {
        Ok(logs) => logs,
        Err(err) if is_range_too_large(&err) && to > from => {
            let mid = from + (to - from) / 2;
            let _ = progress.effective_max_block_range.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |current| Some((current / 2).max(1)),
            );
            tracing::warn!(
                chain_id,
                filter = %progress.filter.name,
                from,
                to,
                "Provider rejected log range — splitting"
            );
            return Ok(TaskOutcome::Split {
                filter_idx,
                first: (from, mid),
                second: (mid + 1, to),
            });
        }
        Err(err) => return Err(err),
    };

    let logs: Vec<Log> = raw_logs
        .into_iter()
        .map(|log| log.into_log(chain_id))
        .collect();
    store.insert_historical_logs(chain_id, &logs).await?;

    // Transactions referenced by the inserted logs, grouped per block.
    let mut blocks: BTreeMap<(u64, B256), HashSet<B256>> = BTreeMap::new();
    for log in &logs {
        blocks
            .entry((log.block_number, log.block_hash))
            .or_default()
            .insert(log.transaction_hash);
    }

    let mut end_block_timestamp = None;
    for ((_, block_hash), tx_hashes) in &blocks {
        let Some(rpc_block) = rpc.get_block_by_hash(*block_hash, true).await? else {
            // The block vanished between the log fetch and now (reorg race).
            // Skip the insertion and retry the whole range.
            tracing::warn!(chain_id, %block_hash, "Block not available — retrying range");
            return Ok(TaskOutcome::Retry { filter_idx, from, to });
        };
        let (block, mut transactions) = rpc_block.into_parts(chain_id);
        transactions.retain(|tx| tx_hashes.contains(&tx.hash));
        store
            .insert_historical_block(chain_id, &block, &transactions, &progress.key, from)
            .await?;
        if block.number == to {
            end_block_timestamp = Some(block.timestamp);
        }
    }

    let end_block_timestamp = match end_block_timestamp {
        Some(timestamp) => timestamp,
        None => {
            // No fetched log lives in the end block; anchor it explicitly so
            // the committed range covers [from, to] and carries its
            // timestamp.
            let Some(rpc_block) = rpc
                .get_block_by_number(BlockNumberOrTag::Number(to), true)
                .await?
            else {
                tracing::warn!(chain_id, number = to, "End block not available — retrying range");
                return Ok(TaskOutcome::Retry { filter_idx, from, to });
            };
            let (block, _) = rpc_block.into_parts(chain_id);
            store
                .insert_historical_block(chain_id, &block, &[], &progress.key, from)
                .await?;
            block.timestamp
        }
    };

    tracing::debug!(
        chain_id,
        filter = %progress.filter.name,
        from,
        to,
        logs = logs.len(),
        "Range committed"
    );
    Ok(TaskOutcome::Committed {
        filter_idx,
        end_block_timestamp,
    })
}
