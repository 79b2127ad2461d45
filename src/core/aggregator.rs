//! Cross-network event aggregation.
//!
//! The aggregator owns per-network checkpoint state and folds it into a
//! single monotone global checkpoint:
//! `per_net = historical_sync_complete ? max(historical, realtime) : historical`,
//! `checkpoint = min(per_net)`. Its inbound handlers are driven by one
//! consumer task draining the sync-event channel, which totally orders
//! checkpoint advances against reorg signals.
//!
//! The handler pipeline consumes the aggregator through the [`EventSource`]
//! capability set, so a transport variant backed by a remote indexer can
//! stand in unchanged.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy_primitives::B256;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::abi::{decode_log, AbiEventRegistry, DecodedLog};
use crate::storage::{EventStore, GetLogEventsRequest, PageMetadata};
use crate::types::events::{AggregatorEvent, SyncEvent};
use crate::types::{Block, Cursor, Log, LogFilter, Transaction};
use crate::utils::error::Result;

/// Per-filter set of event selectors the consumer has handlers for.
pub type IncludeSelectors = HashMap<String, HashSet<B256>>;

/// One fully decoded event: the ABI decode plus its store context.
#[derive(Debug, Clone)]
pub struct DecodedLogEvent {
    pub filter_name: String,
    pub event: DecodedLog,
    pub log: Log,
    pub block: Block,
    pub transaction: Transaction,
}

/// A page of decoded events.
#[derive(Debug, Clone)]
pub struct DecodedEventPage {
    pub events: Vec<DecodedLogEvent>,
    pub metadata: PageMetadata,
}

/// The capability set the handler pipeline consumes. Satisfied by the local
/// [`EventAggregator`]; a remote-indexer transport implements the same
/// contract.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Timestamp through which events are safe to process. Monotone.
    fn checkpoint(&self) -> u64;

    /// Minimum finality timestamp across networks. Monotone.
    fn finality_checkpoint(&self) -> u64;

    /// The global checkpoint at the moment every network finished its
    /// backfill, once that has happened.
    fn historical_sync_completed_at(&self) -> Option<u64>;

    /// One decoded page of `[from_timestamp, to_timestamp]`, resuming after
    /// `cursor`. Only events whose `(filter, selector)` appears in `include`
    /// are decoded when it is given; logs that fail to decode are reported
    /// and skipped.
    async fn events_page(
        &self,
        from_timestamp: u64,
        to_timestamp: u64,
        cursor: Option<Cursor>,
        include: Option<&IncludeSelectors>,
        page_size: usize,
    ) -> Result<DecodedEventPage>;
}

#[derive(Debug, Clone, Copy, Default)]
struct NetworkCheckpoints {
    historical: u64,
    realtime: u64,
    finality: u64,
    historical_sync_complete: bool,
}

impl NetworkCheckpoints {
    fn per_network(self) -> u64 {
        if self.historical_sync_complete {
            self.historical.max(self.realtime)
        } else {
            self.historical
        }
    }
}

/// Tracks per-network checkpoints and emits the ordered control events the
/// pipeline consumes.
pub struct EventAggregator {
    store: Arc<dyn EventStore>,
    filters: Vec<LogFilter>,
    abi: Arc<AbiEventRegistry>,
    state: Mutex<HashMap<u64, NetworkCheckpoints>>,
    checkpoint: AtomicU64,
    finality_checkpoint: AtomicU64,
    historical_complete: std::sync::atomic::AtomicBool,
    historical_complete_at: AtomicU64,
    out: mpsc::Sender<AggregatorEvent>,
}

impl EventAggregator {
    /// `chain_ids` pre-registers every network at checkpoint zero so the
    /// global minimum accounts for networks that have not reported yet.
    pub fn new(
        store: Arc<dyn EventStore>,
        filters: Vec<LogFilter>,
        abi: Arc<AbiEventRegistry>,
        chain_ids: &[u64],
        out: mpsc::Sender<AggregatorEvent>,
    ) -> Self {
        let state = chain_ids
            .iter()
            .map(|&chain_id| (chain_id, NetworkCheckpoints::default()))
            .collect();
        Self {
            store,
            filters,
            abi,
            state: Mutex::new(state),
            checkpoint: AtomicU64::new(0),
            finality_checkpoint: AtomicU64::new(0),
            historical_complete: std::sync::atomic::AtomicBool::new(false),
            historical_complete_at: AtomicU64::new(0),
            out,
        }
    }

    /// Single-consumer intake loop; serializes every inbound handler.
    pub async fn run(&self, mut rx: mpsc::Receiver<SyncEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Aggregator stopping");
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_sync_event(event).await;
                }
            }
        }
    }

    /// Dispatches one sync event to its handler.
    pub async fn handle_sync_event(&self, event: SyncEvent) {
        match event {
            SyncEvent::HistoricalCheckpoint { chain_id, timestamp } => {
                self.handle_new_historical_checkpoint(chain_id, timestamp).await;
            }
            SyncEvent::HistoricalSyncComplete { chain_id } => {
                self.handle_historical_sync_complete(chain_id).await;
            }
            SyncEvent::RealtimeCheckpoint { chain_id, timestamp } => {
                self.handle_new_realtime_checkpoint(chain_id, timestamp).await;
            }
            SyncEvent::FinalityCheckpoint { chain_id, timestamp } => {
                self.handle_new_finality_checkpoint(chain_id, timestamp).await;
            }
            SyncEvent::ShallowReorg {
                chain_id,
                common_ancestor_timestamp,
            } => {
                tracing::warn!(chain_id, common_ancestor_timestamp, "Propagating reorg");
                let _ = self
                    .out
                    .send(AggregatorEvent::Reorg {
                        common_ancestor_timestamp,
                    })
                    .await;
            }
            SyncEvent::Fatal { chain_id, message } => {
                tracing::error!(chain_id, error = %message, "Fatal sync failure");
                let _ = self.out.send(AggregatorEvent::Fatal { message }).await;
            }
        }
    }

    pub async fn handle_new_historical_checkpoint(&self, chain_id: u64, timestamp: u64) {
        {
            let mut state = self.state.lock().expect("aggregator state poisoned");
            state.entry(chain_id).or_default().historical = timestamp;
        }
        self.recompute_checkpoint().await;
    }

    pub async fn handle_historical_sync_complete(&self, chain_id: u64) {
        let all_complete = {
            let mut state = self.state.lock().expect("aggregator state poisoned");
            state.entry(chain_id).or_default().historical_sync_complete = true;
            state.values().all(|n| n.historical_sync_complete)
        };
        self.recompute_checkpoint().await;
        if all_complete && !self.historical_complete.swap(true, Ordering::SeqCst) {
            let at = self.checkpoint.load(Ordering::SeqCst);
            self.historical_complete_at.store(at, Ordering::SeqCst);
            tracing::info!(at, "Historical sync complete on every network");
            let _ = self
                .out
                .send(AggregatorEvent::HistoricalSyncComplete { at })
                .await;
        }
    }

    pub async fn handle_new_realtime_checkpoint(&self, chain_id: u64, timestamp: u64) {
        {
            let mut state = self.state.lock().expect("aggregator state poisoned");
            state.entry(chain_id).or_default().realtime = timestamp;
        }
        self.recompute_checkpoint().await;
    }

    pub async fn handle_new_finality_checkpoint(&self, chain_id: u64, timestamp: u64) {
        let minimum = {
            let mut state = self.state.lock().expect("aggregator state poisoned");
            state.entry(chain_id).or_default().finality = timestamp;
            state.values().map(|n| n.finality).min().unwrap_or(0)
        };
        if minimum > self.finality_checkpoint.load(Ordering::SeqCst) {
            self.finality_checkpoint.store(minimum, Ordering::SeqCst);
            let _ = self
                .out
                .send(AggregatorEvent::NewFinalityCheckpoint { timestamp: minimum })
                .await;
        }
    }

    async fn recompute_checkpoint(&self) {
        let minimum = {
            let state = self.state.lock().expect("aggregator state poisoned");
            state
                .values()
                .map(|n| n.per_network())
                .min()
                .unwrap_or(0)
        };
        if minimum > self.checkpoint.load(Ordering::SeqCst) {
            self.checkpoint.store(minimum, Ordering::SeqCst);
            tracing::debug!(checkpoint = minimum, "Checkpoint advanced");
            let _ = self
                .out
                .send(AggregatorEvent::NewCheckpoint { timestamp: minimum })
                .await;
        }
    }
}

#[async_trait]
impl EventSource for EventAggregator {
    fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::SeqCst)
    }

    fn finality_checkpoint(&self) -> u64 {
        self.finality_checkpoint.load(Ordering::SeqCst)
    }

    fn historical_sync_completed_at(&self) -> Option<u64> {
        self.historical_complete
            .load(Ordering::SeqCst)
            .then(|| self.historical_complete_at.load(Ordering::SeqCst))
    }

    async fn events_page(
        &self,
        from_timestamp: u64,
        to_timestamp: u64,
        cursor: Option<Cursor>,
        include: Option<&IncludeSelectors>,
        page_size: usize,
    ) -> Result<DecodedEventPage> {
        let page = self
            .store
            .get_log_events(GetLogEventsRequest {
                from_timestamp,
                to_timestamp,
                filters: &self.filters,
                include_event_selectors: include,
                page_size,
                cursor,
            })
            .await?;

        let mut events = Vec::with_capacity(page.events.len());
        for event in page.events {
            let Some(topic0) = event.log.topic0 else {
                tracing::warn!(
                    block = event.log.block_number,
                    log_index = event.log.log_index,
                    "Skipping log without topic0"
                );
                continue;
            };
            let mut decoded = None;
            for filter in self.filters.iter().filter(|f| f.matches(&event.log)) {
                if let Some(include) = include {
                    // Absent entry means the consumer handles nothing on
                    // this filter.
                    match include.get(&filter.name) {
                        Some(selectors) if selectors.contains(&topic0) => {}
                        _ => continue,
                    }
                }
                let Some(abi_event) = self.abi.event_for(&filter.name, topic0) else {
                    tracing::warn!(
                        filter = %filter.name,
                        selector = %topic0,
                        "No ABI event registered for selector — skipping log"
                    );
                    continue;
                };
                match decode_log(abi_event, &event.log) {
                    Ok(d) => {
                        decoded = Some((filter.name.clone(), d));
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(
                            filter = %filter.name,
                            error = %err,
                            "Failed to decode log — skipping"
                        );
                    }
                }
            }
            if let Some((filter_name, decoded)) = decoded {
                events.push(DecodedLogEvent {
                    filter_name,
                    event: decoded,
                    log: event.log,
                    block: event.block,
                    transaction: event.transaction,
                });
            }
        }

        Ok(DecodedEventPage {
            events,
            metadata: page.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteEventStore;

    async fn aggregator_with(
        chain_ids: &[u64],
    ) -> (Arc<EventAggregator>, mpsc::Receiver<AggregatorEvent>) {
        let store = Arc::new(SqliteEventStore::in_memory().await.unwrap());
        let (tx, rx) = mpsc::channel(64);
        let aggregator = Arc::new(EventAggregator::new(
            store,
            Vec::new(),
            Arc::new(AbiEventRegistry::new()),
            chain_ids,
            tx,
        ));
        (aggregator, rx)
    }

    #[tokio::test]
    async fn test_checkpoint_waits_for_all_networks() {
        let (aggregator, mut rx) = aggregator_with(&[1, 5]).await;

        aggregator.handle_new_historical_checkpoint(1, 50).await;
        // Network 5 is still at zero, so no global checkpoint yet.
        assert_eq!(aggregator.checkpoint(), 0);
        assert!(rx.try_recv().is_err());

        aggregator.handle_new_historical_checkpoint(5, 30).await;
        assert_eq!(aggregator.checkpoint(), 30);
        assert_eq!(
            rx.try_recv().unwrap(),
            AggregatorEvent::NewCheckpoint { timestamp: 30 }
        );
    }

    #[tokio::test]
    async fn test_cross_network_checkpoint_scenario() {
        // Two networks A (chain 1) and B (chain 5).
        let (aggregator, mut rx) = aggregator_with(&[1, 5]).await;

        // A: historical=50, realtime=80, sync complete → per-net 80.
        aggregator.handle_new_historical_checkpoint(1, 50).await;
        aggregator.handle_new_realtime_checkpoint(1, 80).await;
        aggregator.handle_historical_sync_complete(1).await;
        // B: historical=60, incomplete → per-net 60. Global = 60.
        aggregator.handle_new_historical_checkpoint(5, 60).await;
        assert_eq!(aggregator.checkpoint(), 60);

        // B advances to 75 → global 75.
        aggregator.handle_new_historical_checkpoint(5, 75).await;
        assert_eq!(aggregator.checkpoint(), 75);

        // B completes and reports realtime 90 → per-net(B)=90, global=min(80,90)=80.
        aggregator.handle_historical_sync_complete(5).await;
        aggregator.handle_new_realtime_checkpoint(5, 90).await;
        assert_eq!(aggregator.checkpoint(), 80);

        let mut emitted = Vec::new();
        while let Ok(event) = rx.try_recv() {
            emitted.push(event);
        }
        let checkpoints: Vec<u64> = emitted
            .iter()
            .filter_map(|e| match e {
                AggregatorEvent::NewCheckpoint { timestamp } => Some(*timestamp),
                _ => None,
            })
            .collect();
        assert_eq!(checkpoints, vec![60, 75, 80]);
        assert!(
            checkpoints.windows(2).all(|w| w[0] < w[1]),
            "checkpoint must be monotone"
        );
        assert!(emitted
            .iter()
            .any(|e| matches!(e, AggregatorEvent::HistoricalSyncComplete { .. })));
    }

    #[tokio::test]
    async fn test_checkpoint_monotone_under_stale_updates() {
        let (aggregator, _rx) = aggregator_with(&[1]).await;
        aggregator.handle_new_historical_checkpoint(1, 100).await;
        assert_eq!(aggregator.checkpoint(), 100);
        // A stale lower value must never move the checkpoint backwards.
        aggregator.handle_new_historical_checkpoint(1, 40).await;
        assert_eq!(aggregator.checkpoint(), 100);
    }

    #[tokio::test]
    async fn test_finality_checkpoint_is_min_across_networks() {
        let (aggregator, mut rx) = aggregator_with(&[1, 5]).await;
        aggregator.handle_new_finality_checkpoint(1, 500).await;
        assert_eq!(aggregator.finality_checkpoint(), 0);
        aggregator.handle_new_finality_checkpoint(5, 300).await;
        assert_eq!(aggregator.finality_checkpoint(), 300);
        assert_eq!(
            rx.try_recv().unwrap(),
            AggregatorEvent::NewFinalityCheckpoint { timestamp: 300 }
        );
    }

    #[tokio::test]
    async fn test_reorg_is_forwarded_in_order() {
        let (aggregator, mut rx) = aggregator_with(&[1]).await;
        aggregator.handle_new_historical_checkpoint(1, 10).await;
        aggregator
            .handle_sync_event(SyncEvent::ShallowReorg {
                chain_id: 1,
                common_ancestor_timestamp: 7,
            })
            .await;
        assert_eq!(
            rx.try_recv().unwrap(),
            AggregatorEvent::NewCheckpoint { timestamp: 10 }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            AggregatorEvent::Reorg {
                common_ancestor_timestamp: 7
            }
        );
    }
}
