//! SQLite backends for the event store and the derived store.
//!
//! Databases live as files under the configured directory (`events.db`,
//! `entities.db`), in WAL mode. In-memory constructors back the test suites.

use std::path::Path;

use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use super::sql::{self, SqlArg};
use super::{
    CachedRange, DerivedStore, EntityOp, EventStore, GetLogEventsRequest, LogEventPage,
};
use crate::types::{Block, Log, Transaction};
use crate::utils::error::Result;

const EVENT_STORE_DDL: [&str; 13] = [
    "CREATE TABLE IF NOT EXISTS blocks (
        chain_id INTEGER NOT NULL,
        hash BLOB NOT NULL,
        parent_hash BLOB NOT NULL,
        number INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        miner BLOB NOT NULL,
        gas_limit BLOB NOT NULL,
        gas_used BLOB NOT NULL,
        base_fee_per_gas BLOB,
        difficulty BLOB NOT NULL,
        total_difficulty BLOB NOT NULL,
        extra_data BLOB NOT NULL,
        logs_bloom BLOB NOT NULL,
        mix_hash BLOB NOT NULL,
        nonce BLOB NOT NULL,
        receipts_root BLOB NOT NULL,
        sha3_uncles BLOB NOT NULL,
        size BLOB NOT NULL,
        state_root BLOB NOT NULL,
        transactions_root BLOB NOT NULL,
        PRIMARY KEY (chain_id, hash)
    )",
    "CREATE INDEX IF NOT EXISTS idx_blocks_number ON blocks (chain_id, number)",
    "CREATE INDEX IF NOT EXISTS idx_blocks_timestamp ON blocks (chain_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS transactions (
        chain_id INTEGER NOT NULL,
        hash BLOB NOT NULL,
        block_hash BLOB NOT NULL,
        block_number INTEGER NOT NULL,
        transaction_index INTEGER NOT NULL,
        from_address BLOB NOT NULL,
        to_address BLOB,
        input BLOB NOT NULL,
        nonce INTEGER NOT NULL,
        value BLOB NOT NULL,
        gas BLOB NOT NULL,
        v BLOB NOT NULL,
        r BLOB NOT NULL,
        s BLOB NOT NULL,
        kind TEXT NOT NULL,
        gas_price BLOB,
        max_fee_per_gas BLOB,
        max_priority_fee_per_gas BLOB,
        access_list TEXT,
        PRIMARY KEY (chain_id, hash)
    )",
    "CREATE INDEX IF NOT EXISTS idx_transactions_block_number
        ON transactions (chain_id, block_number)",
    "CREATE TABLE IF NOT EXISTS logs (
        chain_id INTEGER NOT NULL,
        id BLOB NOT NULL,
        address BLOB NOT NULL,
        block_hash BLOB NOT NULL,
        block_number INTEGER NOT NULL,
        transaction_hash BLOB NOT NULL,
        transaction_index INTEGER NOT NULL,
        log_index INTEGER NOT NULL,
        data BLOB NOT NULL,
        topic0 BLOB,
        topic1 BLOB,
        topic2 BLOB,
        topic3 BLOB,
        PRIMARY KEY (chain_id, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_logs_block_number
        ON logs (chain_id, block_number, log_index)",
    "CREATE INDEX IF NOT EXISTS idx_logs_block_hash ON logs (chain_id, block_hash)",
    "CREATE INDEX IF NOT EXISTS idx_logs_address ON logs (address)",
    "CREATE INDEX IF NOT EXISTS idx_logs_topic0 ON logs (topic0)",
    "CREATE TABLE IF NOT EXISTS log_filter_cached_ranges (
        filter_key TEXT NOT NULL,
        start_block INTEGER NOT NULL,
        end_block INTEGER NOT NULL,
        end_block_timestamp INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_cached_ranges_filter_key
        ON log_filter_cached_ranges (filter_key, start_block)",
    "CREATE TABLE IF NOT EXISTS contract_read_results (
        chain_id INTEGER NOT NULL,
        address BLOB NOT NULL,
        block_number INTEGER NOT NULL,
        calldata BLOB NOT NULL,
        result BLOB NOT NULL,
        PRIMARY KEY (chain_id, address, block_number, calldata)
    )",
];

const DERIVED_STORE_DDL: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS entities (
        entity_name TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        valid_from INTEGER NOT NULL,
        valid_to INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_entities_live ON entities (entity_name, id, valid_to)",
    "CREATE INDEX IF NOT EXISTS idx_entities_valid_from ON entities (valid_from)",
    "CREATE INDEX IF NOT EXISTS idx_entities_valid_to ON entities (valid_to)",
];

fn bind<'q>(
    statement: &'q str,
    args: Vec<SqlArg>,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    let mut query = sqlx::query(statement);
    for arg in args {
        query = match arg {
            SqlArg::I64(v) => query.bind(v),
            SqlArg::Bytes(v) => query.bind(v),
            SqlArg::OptBytes(v) => query.bind(v),
            SqlArg::Text(v) => query.bind(v),
            SqlArg::OptText(v) => query.bind(v),
        };
    }
    query
}

async fn open_pool(path: &Path) -> Result<Pool<Sqlite>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| crate::utils::error::EvmIndexerError::Config(e.to_string()))?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    Ok(SqlitePoolOptions::new().connect_with(options).await?)
}

async fn memory_pool() -> Result<Pool<Sqlite>> {
    // One connection, or each pooled connection would see its own database.
    let options = SqliteConnectOptions::new().in_memory(true);
    Ok(SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?)
}

/// Event store backed by a SQLite database file.
pub struct SqliteEventStore {
    pool: Pool<Sqlite>,
}

impl SqliteEventStore {
    /// Opens (creating if needed) `events.db` under `directory`.
    pub async fn open(directory: &Path) -> Result<Self> {
        Ok(Self {
            pool: open_pool(&directory.join("events.db")).await?,
        })
    }

    /// An in-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        Ok(Self {
            pool: memory_pool().await?,
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn migrate(&self) -> Result<()> {
        for statement in EVENT_STORE_DDL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert_historical_logs(&self, chain_id: u64, logs: &[Log]) -> Result<()> {
        debug_assert!(logs.iter().all(|l| l.chain_id == chain_id));
        let mut tx = self.pool.begin().await?;
        for log in logs {
            bind(sql::INSERT_LOG, sql::log_insert_args(log))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_historical_block(
        &self,
        chain_id: u64,
        block: &Block,
        transactions: &[Transaction],
        filter_key: &str,
        block_number_to_cache_from: u64,
    ) -> Result<()> {
        debug_assert_eq!(block.chain_id, chain_id);
        let mut tx = self.pool.begin().await?;
        bind(sql::INSERT_BLOCK, sql::block_insert_args(block))
            .execute(&mut *tx)
            .await?;
        for transaction in transactions {
            bind(
                sql::INSERT_TRANSACTION,
                sql::transaction_insert_args(transaction)?,
            )
            .execute(&mut *tx)
            .await?;
        }
        bind(
            sql::INSERT_CACHED_RANGE,
            vec![
                SqlArg::Text(filter_key.to_string()),
                SqlArg::I64(block_number_to_cache_from as i64),
                SqlArg::I64(block.number as i64),
                SqlArg::I64(block.timestamp as i64),
            ],
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_realtime_block(
        &self,
        chain_id: u64,
        block: &Block,
        transactions: &[Transaction],
        logs: &[Log],
    ) -> Result<()> {
        debug_assert_eq!(block.chain_id, chain_id);
        let mut tx = self.pool.begin().await?;
        bind(sql::INSERT_BLOCK, sql::block_insert_args(block))
            .execute(&mut *tx)
            .await?;
        for transaction in transactions {
            bind(
                sql::INSERT_TRANSACTION,
                sql::transaction_insert_args(transaction)?,
            )
            .execute(&mut *tx)
            .await?;
        }
        for log in logs {
            bind(sql::INSERT_LOG, sql::log_insert_args(log))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_realtime_data(&self, chain_id: u64, from_block_number: u64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in [
            sql::DELETE_REALTIME_LOGS,
            sql::DELETE_REALTIME_TRANSACTIONS,
            sql::DELETE_REALTIME_BLOCKS,
        ] {
            bind(
                statement,
                vec![
                    SqlArg::I64(chain_id as i64),
                    SqlArg::I64(from_block_number as i64),
                ],
            )
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn merge_log_filter_cached_ranges(
        &self,
        filter_key: &str,
        log_filter_start_block: u64,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let rows = bind(
            sql::SELECT_CACHED_RANGES,
            vec![SqlArg::Text(filter_key.to_string())],
        )
        .fetch_all(&mut *tx)
        .await?;
        let ranges = rows
            .iter()
            .map(sql::decode_cached_range_row)
            .collect::<Result<Vec<_>>>()?;
        let merged = sql::coalesce_ranges(ranges);

        bind(
            sql::DELETE_CACHED_RANGES,
            vec![SqlArg::Text(filter_key.to_string())],
        )
        .execute(&mut *tx)
        .await?;
        for range in &merged {
            bind(
                sql::INSERT_CACHED_RANGE,
                vec![
                    SqlArg::Text(filter_key.to_string()),
                    SqlArg::I64(range.start_block as i64),
                    SqlArg::I64(range.end_block as i64),
                    SqlArg::I64(range.end_block_timestamp as i64),
                ],
            )
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(merged
            .iter()
            .rev()
            .find(|r| r.start_block <= log_filter_start_block)
            .map_or(0, |r| r.end_block_timestamp))
    }

    async fn get_log_filter_cached_ranges(&self, filter_key: &str) -> Result<Vec<CachedRange>> {
        let rows = bind(
            sql::SELECT_CACHED_RANGES,
            vec![SqlArg::Text(filter_key.to_string())],
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sql::decode_cached_range_row).collect()
    }

    async fn insert_contract_read_result(
        &self,
        chain_id: u64,
        address: Address,
        block_number: u64,
        calldata: &Bytes,
        result: &Bytes,
    ) -> Result<()> {
        bind(
            sql::INSERT_CONTRACT_READ,
            vec![
                SqlArg::I64(chain_id as i64),
                SqlArg::Bytes(address.to_vec()),
                SqlArg::I64(block_number as i64),
                SqlArg::Bytes(calldata.to_vec()),
                SqlArg::Bytes(result.to_vec()),
            ],
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_contract_read_result(
        &self,
        chain_id: u64,
        address: Address,
        block_number: u64,
        calldata: &Bytes,
    ) -> Result<Option<Bytes>> {
        let row = bind(
            sql::SELECT_CONTRACT_READ,
            vec![
                SqlArg::I64(chain_id as i64),
                SqlArg::Bytes(address.to_vec()),
                SqlArg::I64(block_number as i64),
                SqlArg::Bytes(calldata.to_vec()),
            ],
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| {
            use sqlx::Row as _;
            Bytes::from(row.get::<Vec<u8>, _>("result"))
        }))
    }

    async fn get_log_events(&self, req: GetLogEventsRequest<'_>) -> Result<LogEventPage> {
        let (statement, args) = sql::build_events_query(&req);
        let rows = bind(&statement, args).fetch_all(&self.pool).await?;
        let events = rows
            .iter()
            .map(sql::decode_event_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(sql::assemble_page(&req, events))
    }
}

/// Derived entity store backed by a SQLite database file.
pub struct SqliteDerivedStore {
    pool: Pool<Sqlite>,
}

impl SqliteDerivedStore {
    /// Opens (creating if needed) `entities.db` under `directory`.
    pub async fn open(directory: &Path) -> Result<Self> {
        Ok(Self {
            pool: open_pool(&directory.join("entities.db")).await?,
        })
    }

    /// An in-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        Ok(Self {
            pool: memory_pool().await?,
        })
    }
}

#[async_trait]
impl DerivedStore for SqliteDerivedStore {
    async fn migrate(&self) -> Result<()> {
        for statement in DERIVED_STORE_DDL {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn find(&self, entity: &str, id: &str) -> Result<Option<serde_json::Value>> {
        let row = bind(
            sql::ENTITY_FIND_LIVE,
            vec![SqlArg::Text(entity.to_string()), SqlArg::Text(id.to_string())],
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            use sqlx::Row as _;
            serde_json::from_str(&row.get::<String, _>("data")).map_err(Into::into)
        })
        .transpose()
    }

    async fn apply(&self, ops: &[EntityOp]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                EntityOp::Upsert {
                    entity,
                    id,
                    data,
                    timestamp,
                } => {
                    let key = vec![
                        SqlArg::Text(entity.clone()),
                        SqlArg::Text(id.clone()),
                        SqlArg::I64(*timestamp as i64),
                    ];
                    bind(sql::ENTITY_CLOSE_LIVE, key.clone())
                        .execute(&mut *tx)
                        .await?;
                    bind(sql::ENTITY_DELETE_SAME_TS, key).execute(&mut *tx).await?;
                    bind(
                        sql::ENTITY_INSERT_VERSION,
                        vec![
                            SqlArg::Text(entity.clone()),
                            SqlArg::Text(id.clone()),
                            SqlArg::Text(serde_json::to_string(data)?),
                            SqlArg::I64(*timestamp as i64),
                        ],
                    )
                    .execute(&mut *tx)
                    .await?;
                }
                EntityOp::Delete {
                    entity,
                    id,
                    timestamp,
                } => {
                    let key = vec![
                        SqlArg::Text(entity.clone()),
                        SqlArg::Text(id.clone()),
                        SqlArg::I64(*timestamp as i64),
                    ];
                    bind(sql::ENTITY_CLOSE_LIVE, key.clone())
                        .execute(&mut *tx)
                        .await?;
                    bind(sql::ENTITY_DELETE_SAME_TS, key).execute(&mut *tx).await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn revert(&self, to_timestamp: u64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        bind(
            sql::ENTITY_REVERT_DELETE,
            vec![SqlArg::I64(to_timestamp as i64)],
        )
        .execute(&mut *tx)
        .await?;
        bind(
            sql::ENTITY_REVERT_REOPEN,
            vec![SqlArg::I64(to_timestamp as i64)],
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn truncate(&self) -> Result<()> {
        sqlx::query(sql::ENTITY_TRUNCATE).execute(&self.pool).await?;
        Ok(())
    }
}
