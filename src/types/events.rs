//! Control-plane signals exchanged between components.
//!
//! The sync services publish [`SyncEvent`]s into a single channel consumed by
//! the aggregator; the aggregator publishes [`AggregatorEvent`]s into a
//! single channel consumed by the handler pipeline. One consumer per channel
//! keeps checkpoint and reorg handling totally ordered.

/// Progress and recovery signals raised by the per-network sync services.
///
/// All timestamps are block timestamps in seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Historical sync committed more cached data for a network.
    HistoricalCheckpoint { chain_id: u64, timestamp: u64 },
    /// Historical sync drained every task queue for a network.
    HistoricalSyncComplete { chain_id: u64 },
    /// Realtime sync persisted a new canonical block.
    RealtimeCheckpoint { chain_id: u64, timestamp: u64 },
    /// The finality window advanced for a network.
    FinalityCheckpoint { chain_id: u64, timestamp: u64 },
    /// A shallow reorg was recovered; derived state past the common ancestor
    /// must be rolled back.
    ShallowReorg {
        chain_id: u64,
        common_ancestor_timestamp: u64,
    },
    /// Unrecoverable failure in a sync service; initiates shutdown.
    Fatal { chain_id: u64, message: String },
}

/// Ordered signals the aggregator hands to the handler pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorEvent {
    /// The global checkpoint advanced; events up to `timestamp` are safe to
    /// process.
    NewCheckpoint { timestamp: u64 },
    /// The global finality checkpoint advanced.
    NewFinalityCheckpoint { timestamp: u64 },
    /// Every network finished its historical backfill.
    HistoricalSyncComplete { at: u64 },
    /// A reorg invalidated state past the common ancestor; delivered before
    /// any checkpoint that covers later events.
    Reorg { common_ancestor_timestamp: u64 },
    /// A sync service failed fatally; the pipeline stops.
    Fatal { message: String },
}
