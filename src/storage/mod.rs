//! Persistent stores: the canonical event store and the derived entity store.
//!
//! Both stores are expressed as capability traits with SQLite and PostgreSQL
//! backends; nothing backend-specific leaks past the trait objects. Writes
//! that must be externally visible atomically (historical block + cached
//! range, realtime block + logs, entity batches) run inside one database
//! transaction.

pub mod postgres;
pub mod sqlite;
pub(crate) mod sql;

pub use postgres::{PostgresDerivedStore, PostgresEventStore};
pub use sqlite::{SqliteDerivedStore, SqliteEventStore};

use std::collections::{HashMap, HashSet};

use alloy_primitives::{Address, Bytes, B256};
use async_trait::async_trait;

use crate::types::{Block, CachedRange, Cursor, Log, LogFilter, Transaction};
use crate::utils::error::Result;

/// A log joined with its block and transaction.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub log: Log,
    pub block: Block,
    pub transaction: Transaction,
}

/// Per-`(filter, topic0)` tally within one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventCount {
    pub filter_name: String,
    pub selector: Option<B256>,
    pub count: u64,
}

/// Iteration state attached to a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMetadata {
    /// Timestamp through which this page is complete: the last included
    /// log's block timestamp when truncated, the requested `to_timestamp`
    /// otherwise.
    pub page_ends_at_timestamp: u64,
    pub counts: Vec<EventCount>,
    /// Exclusive lower bound of the next page; `None` on the last page.
    pub cursor: Option<Cursor>,
}

impl PageMetadata {
    /// Whether this is the final page of the requested interval.
    #[must_use]
    pub fn is_last_page(&self) -> bool {
        self.cursor.is_none()
    }
}

/// One page of the ordered event stream.
#[derive(Debug, Clone)]
pub struct LogEventPage {
    pub events: Vec<LogEvent>,
    pub metadata: PageMetadata,
}

/// Arguments for [`EventStore::get_log_events`].
#[derive(Debug, Clone)]
pub struct GetLogEventsRequest<'a> {
    /// Inclusive block-timestamp bounds.
    pub from_timestamp: u64,
    pub to_timestamp: u64,
    /// A log is returned when it matches any of these filters.
    pub filters: &'a [LogFilter],
    /// When present, restricts the per-filter counts to these selectors.
    pub include_event_selectors: Option<&'a HashMap<String, HashSet<B256>>>,
    /// Maximum logs per page.
    pub page_size: usize,
    /// Resume after this position (exclusive).
    pub cursor: Option<Cursor>,
}

/// Canonical store of blocks, transactions, logs, cached-range metadata, and
/// contract-read results.
///
/// Iteration contract: [`get_log_events`](EventStore::get_log_events)
/// returns logs matching any requested filter whose block timestamp lies in
/// `[from_timestamp, to_timestamp]`, strictly ordered by `(timestamp,
/// chain_id, block_number, log_index)`. Re-issuing the request with the
/// previous page's cursor yields the strictly-greater remainder with no
/// duplicates and no gaps. A log whose transaction cannot be joined is a
/// fatal invariant violation.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Creates tables and indexes. Idempotent.
    async fn migrate(&self) -> Result<()>;

    /// Idempotent insert keyed on log id; conflicts are ignored.
    async fn insert_historical_logs(&self, chain_id: u64, logs: &[Log]) -> Result<()>;

    /// Atomically inserts a block with its transactions and records the
    /// cached range `[block_number_to_cache_from, block.number]` for
    /// `filter_key`.
    async fn insert_historical_block(
        &self,
        chain_id: u64,
        block: &Block,
        transactions: &[Transaction],
        filter_key: &str,
        block_number_to_cache_from: u64,
    ) -> Result<()>;

    /// Atomic upsert of a realtime block, its transactions, and its logs.
    /// Logs inserted here are not backed by a cached range.
    async fn insert_realtime_block(
        &self,
        chain_id: u64,
        block: &Block,
        transactions: &[Transaction],
        logs: &[Log],
    ) -> Result<()>;

    /// Deletes blocks, transactions, and logs at `number >=
    /// from_block_number` for `chain_id`. Cached ranges are untouched.
    async fn delete_realtime_data(&self, chain_id: u64, from_block_number: u64) -> Result<()>;

    /// Coalesces every cached range of `filter_key` and returns the end
    /// timestamp of the coalesced leading range (the one starting at or
    /// before `log_filter_start_block`), or 0 when there is none.
    async fn merge_log_filter_cached_ranges(
        &self,
        filter_key: &str,
        log_filter_start_block: u64,
    ) -> Result<u64>;

    /// Current cached ranges for `filter_key`, ordered by start block.
    async fn get_log_filter_cached_ranges(&self, filter_key: &str) -> Result<Vec<CachedRange>>;

    /// Content-addressed cache of `eth_call` results; values are immutable.
    async fn insert_contract_read_result(
        &self,
        chain_id: u64,
        address: Address,
        block_number: u64,
        calldata: &Bytes,
        result: &Bytes,
    ) -> Result<()>;

    /// Cached `eth_call` result, if any.
    async fn get_contract_read_result(
        &self,
        chain_id: u64,
        address: Address,
        block_number: u64,
        calldata: &Bytes,
    ) -> Result<Option<Bytes>>;

    /// One page of the ordered event stream. See the trait docs for the
    /// iteration contract.
    async fn get_log_events(&self, req: GetLogEventsRequest<'_>) -> Result<LogEventPage>;
}

/// A buffered write against the derived store.
///
/// `timestamp` is the block timestamp of the event that produced the write;
/// it versions the affected row for reorg rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityOp {
    Upsert {
        entity: String,
        id: String,
        data: serde_json::Value,
        timestamp: u64,
    },
    Delete {
        entity: String,
        id: String,
        timestamp: u64,
    },
}

/// Transactional user-facing entity store with versioned rows.
///
/// Exactly one live row (`valid_to` null) exists per `(entity, id)`.
/// Rolling back to timestamp `T` removes rows created after `T` and reopens
/// rows closed after `T`.
#[async_trait]
pub trait DerivedStore: Send + Sync {
    /// Creates tables and indexes. Idempotent.
    async fn migrate(&self) -> Result<()>;

    /// The live row for `(entity, id)`, if any.
    async fn find(&self, entity: &str, id: &str) -> Result<Option<serde_json::Value>>;

    /// Applies a batch of writes inside one database transaction.
    async fn apply(&self, ops: &[EntityOp]) -> Result<()>;

    /// Rolls every entity back to its state at `to_timestamp`.
    async fn revert(&self, to_timestamp: u64) -> Result<()>;

    /// Removes every entity row.
    async fn truncate(&self) -> Result<()>;
}
