//! SQL shared by the SQLite and PostgreSQL backends.
//!
//! Both dialects accept `$n` placeholders and bare `ON CONFLICT DO NOTHING`,
//! so statement text, argument marshalling, the dynamically built event
//! query, and row decoding live here; the backends contribute dialect DDL
//! and pool plumbing. Values wider than 64 bits are marshalled as fixed
//! 32-byte big-endian blobs so index order matches numeric order.

use std::collections::BTreeMap;

use alloy_primitives::{Address, Bytes, B256, B64, U256};
use sqlx::{ColumnIndex, Decode, Row, Type};

use super::{EventCount, GetLogEventsRequest, LogEvent, LogEventPage, PageMetadata};
use crate::types::{Block, CachedRange, Cursor, Log, Transaction, TransactionKind};
use crate::utils::error::{EvmIndexerError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Statements
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) const INSERT_BLOCK: &str = "\
INSERT INTO blocks (chain_id, hash, parent_hash, number, timestamp, miner, \
gas_limit, gas_used, base_fee_per_gas, difficulty, total_difficulty, extra_data, \
logs_bloom, mix_hash, nonce, receipts_root, sha3_uncles, size, state_root, \
transactions_root) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
$13, $14, $15, $16, $17, $18, $19, $20) ON CONFLICT DO NOTHING";

pub(crate) const INSERT_TRANSACTION: &str = "\
INSERT INTO transactions (chain_id, hash, block_hash, block_number, \
transaction_index, from_address, to_address, input, nonce, value, gas, v, r, s, \
kind, gas_price, max_fee_per_gas, max_priority_fee_per_gas, access_list) \
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
$17, $18, $19) ON CONFLICT DO NOTHING";

pub(crate) const INSERT_LOG: &str = "\
INSERT INTO logs (chain_id, id, address, block_hash, block_number, \
transaction_hash, transaction_index, log_index, data, topic0, topic1, topic2, \
topic3) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
ON CONFLICT DO NOTHING";

pub(crate) const INSERT_CACHED_RANGE: &str = "\
INSERT INTO log_filter_cached_ranges (filter_key, start_block, end_block, \
end_block_timestamp) VALUES ($1, $2, $3, $4)";

pub(crate) const SELECT_CACHED_RANGES: &str = "\
SELECT filter_key, start_block, end_block, end_block_timestamp \
FROM log_filter_cached_ranges WHERE filter_key = $1 ORDER BY start_block ASC";

pub(crate) const DELETE_CACHED_RANGES: &str =
    "DELETE FROM log_filter_cached_ranges WHERE filter_key = $1";

pub(crate) const DELETE_REALTIME_BLOCKS: &str =
    "DELETE FROM blocks WHERE chain_id = $1 AND number >= $2";
pub(crate) const DELETE_REALTIME_TRANSACTIONS: &str =
    "DELETE FROM transactions WHERE chain_id = $1 AND block_number >= $2";
pub(crate) const DELETE_REALTIME_LOGS: &str =
    "DELETE FROM logs WHERE chain_id = $1 AND block_number >= $2";

pub(crate) const INSERT_CONTRACT_READ: &str = "\
INSERT INTO contract_read_results (chain_id, address, block_number, calldata, \
result) VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING";

pub(crate) const SELECT_CONTRACT_READ: &str = "\
SELECT result FROM contract_read_results WHERE chain_id = $1 AND address = $2 \
AND block_number = $3 AND calldata = $4";

pub(crate) const ENTITY_CLOSE_LIVE: &str = "\
UPDATE entities SET valid_to = $3 WHERE entity_name = $1 AND id = $2 \
AND valid_to IS NULL AND valid_from < $3";

pub(crate) const ENTITY_DELETE_SAME_TS: &str = "\
DELETE FROM entities WHERE entity_name = $1 AND id = $2 AND valid_to IS NULL \
AND valid_from = $3";

pub(crate) const ENTITY_INSERT_VERSION: &str = "\
INSERT INTO entities (entity_name, id, data, valid_from, valid_to) \
VALUES ($1, $2, $3, $4, NULL)";

pub(crate) const ENTITY_FIND_LIVE: &str = "\
SELECT data FROM entities WHERE entity_name = $1 AND id = $2 AND valid_to IS NULL";

pub(crate) const ENTITY_REVERT_DELETE: &str = "DELETE FROM entities WHERE valid_from > $1";

pub(crate) const ENTITY_REVERT_REOPEN: &str = "\
UPDATE entities SET valid_to = NULL WHERE valid_to IS NOT NULL AND valid_to > $1";

pub(crate) const ENTITY_TRUNCATE: &str = "DELETE FROM entities";

// ─────────────────────────────────────────────────────────────────────────────
// Argument marshalling
// ─────────────────────────────────────────────────────────────────────────────

/// A positional bind value. Backends map these onto their own bind calls so
/// statement construction stays dialect-neutral.
#[derive(Debug, Clone)]
pub(crate) enum SqlArg {
    I64(i64),
    Bytes(Vec<u8>),
    OptBytes(Option<Vec<u8>>),
    Text(String),
    OptText(Option<String>),
}

pub(crate) fn u256_blob(value: U256) -> Vec<u8> {
    value.to_be_bytes::<32>().to_vec()
}

fn opt_u256_blob(value: Option<U256>) -> Option<Vec<u8>> {
    value.map(u256_blob)
}

pub(crate) fn block_insert_args(block: &Block) -> Vec<SqlArg> {
    vec![
        SqlArg::I64(block.chain_id as i64),
        SqlArg::Bytes(block.hash.to_vec()),
        SqlArg::Bytes(block.parent_hash.to_vec()),
        SqlArg::I64(block.number as i64),
        SqlArg::I64(block.timestamp as i64),
        SqlArg::Bytes(block.miner.to_vec()),
        SqlArg::Bytes(u256_blob(block.gas_limit)),
        SqlArg::Bytes(u256_blob(block.gas_used)),
        SqlArg::OptBytes(opt_u256_blob(block.base_fee_per_gas)),
        SqlArg::Bytes(u256_blob(block.difficulty)),
        SqlArg::Bytes(u256_blob(block.total_difficulty)),
        SqlArg::Bytes(block.extra_data.to_vec()),
        SqlArg::Bytes(block.logs_bloom.to_vec()),
        SqlArg::Bytes(block.mix_hash.to_vec()),
        SqlArg::Bytes(block.nonce.to_vec()),
        SqlArg::Bytes(block.receipts_root.to_vec()),
        SqlArg::Bytes(block.sha3_uncles.to_vec()),
        SqlArg::Bytes(u256_blob(block.size)),
        SqlArg::Bytes(block.state_root.to_vec()),
        SqlArg::Bytes(block.transactions_root.to_vec()),
    ]
}

pub(crate) fn transaction_insert_args(tx: &Transaction) -> Result<Vec<SqlArg>> {
    let access_list = tx
        .access_list
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    Ok(vec![
        SqlArg::I64(tx.chain_id as i64),
        SqlArg::Bytes(tx.hash.to_vec()),
        SqlArg::Bytes(tx.block_hash.to_vec()),
        SqlArg::I64(tx.block_number as i64),
        SqlArg::I64(tx.transaction_index as i64),
        SqlArg::Bytes(tx.from.to_vec()),
        SqlArg::OptBytes(tx.to.map(|a| a.to_vec())),
        SqlArg::Bytes(tx.input.to_vec()),
        SqlArg::I64(tx.nonce as i64),
        SqlArg::Bytes(u256_blob(tx.value)),
        SqlArg::Bytes(u256_blob(tx.gas)),
        SqlArg::Bytes(u256_blob(tx.v)),
        SqlArg::Bytes(u256_blob(tx.r)),
        SqlArg::Bytes(u256_blob(tx.s)),
        SqlArg::Text(tx.kind.as_str().to_string()),
        SqlArg::OptBytes(opt_u256_blob(tx.gas_price)),
        SqlArg::OptBytes(opt_u256_blob(tx.max_fee_per_gas)),
        SqlArg::OptBytes(opt_u256_blob(tx.max_priority_fee_per_gas)),
        SqlArg::OptText(access_list),
    ])
}

pub(crate) fn log_insert_args(log: &Log) -> Vec<SqlArg> {
    let topic = |t: Option<B256>| SqlArg::OptBytes(t.map(|t| t.to_vec()));
    vec![
        SqlArg::I64(log.chain_id as i64),
        SqlArg::Bytes(log.id().to_vec()),
        SqlArg::Bytes(log.address.to_vec()),
        SqlArg::Bytes(log.block_hash.to_vec()),
        SqlArg::I64(log.block_number as i64),
        SqlArg::Bytes(log.transaction_hash.to_vec()),
        SqlArg::I64(log.transaction_index as i64),
        SqlArg::I64(log.log_index as i64),
        SqlArg::Bytes(log.data.to_vec()),
        topic(log.topic0),
        topic(log.topic1),
        topic(log.topic2),
        topic(log.topic3),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Event query
// ─────────────────────────────────────────────────────────────────────────────

const EVENT_SELECT: &str = "\
SELECT \
l.address AS l_address, l.block_hash AS l_block_hash, \
l.block_number AS l_block_number, l.transaction_hash AS l_transaction_hash, \
l.transaction_index AS l_transaction_index, l.log_index AS l_log_index, \
l.data AS l_data, l.topic0 AS l_topic0, l.topic1 AS l_topic1, \
l.topic2 AS l_topic2, l.topic3 AS l_topic3, l.chain_id AS l_chain_id, \
b.hash AS b_hash, b.parent_hash AS b_parent_hash, b.number AS b_number, \
b.timestamp AS b_timestamp, b.miner AS b_miner, b.gas_limit AS b_gas_limit, \
b.gas_used AS b_gas_used, b.base_fee_per_gas AS b_base_fee_per_gas, \
b.difficulty AS b_difficulty, b.total_difficulty AS b_total_difficulty, \
b.extra_data AS b_extra_data, b.logs_bloom AS b_logs_bloom, \
b.mix_hash AS b_mix_hash, b.nonce AS b_nonce, \
b.receipts_root AS b_receipts_root, b.sha3_uncles AS b_sha3_uncles, \
b.size AS b_size, b.state_root AS b_state_root, \
b.transactions_root AS b_transactions_root, \
t.hash AS t_hash, t.block_number AS t_block_number, \
t.transaction_index AS t_transaction_index, t.from_address AS t_from_address, \
t.to_address AS t_to_address, t.input AS t_input, t.nonce AS t_nonce, \
t.value AS t_value, t.gas AS t_gas, t.v AS t_v, t.r AS t_r, t.s AS t_s, \
t.kind AS t_kind, t.gas_price AS t_gas_price, \
t.max_fee_per_gas AS t_max_fee_per_gas, \
t.max_priority_fee_per_gas AS t_max_priority_fee_per_gas, \
t.access_list AS t_access_list \
FROM logs l \
JOIN blocks b ON b.chain_id = l.chain_id AND b.hash = l.block_hash \
LEFT JOIN transactions t ON t.chain_id = l.chain_id AND t.hash = l.transaction_hash";

/// Builds the keyset-paginated event query for `req`. The LIMIT is
/// `page_size + 1` so the caller can detect truncation.
pub(crate) fn build_events_query(req: &GetLogEventsRequest<'_>) -> (String, Vec<SqlArg>) {
    let mut args: Vec<SqlArg> = Vec::new();
    let mut place = |args: &mut Vec<SqlArg>, arg: SqlArg| {
        args.push(arg);
        format!("${}", args.len())
    };

    let mut sql = String::from(EVENT_SELECT);
    sql.push_str(" WHERE b.timestamp >= ");
    sql.push_str(&place(&mut args, SqlArg::I64(req.from_timestamp as i64)));
    sql.push_str(" AND b.timestamp <= ");
    sql.push_str(&place(&mut args, SqlArg::I64(req.to_timestamp as i64)));

    let mut filter_clauses: Vec<String> = Vec::new();
    for filter in req.filters {
        let mut parts: Vec<String> = Vec::new();
        parts.push(format!(
            "l.chain_id = {}",
            place(&mut args, SqlArg::I64(filter.chain_id as i64))
        ));
        if let Some(addresses) = &filter.addresses {
            if !addresses.is_empty() {
                let placeholders: Vec<String> = addresses
                    .iter()
                    .map(|a| place(&mut args, SqlArg::Bytes(a.to_vec())))
                    .collect();
                parts.push(format!("l.address IN ({})", placeholders.join(", ")));
            }
        }
        for (slot, selector) in filter.topics.iter().enumerate() {
            if let Some(values) = selector {
                if values.is_empty() {
                    continue;
                }
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|v| place(&mut args, SqlArg::Bytes(v.to_vec())))
                    .collect();
                parts.push(format!("l.topic{slot} IN ({})", placeholders.join(", ")));
            }
        }
        filter_clauses.push(format!("({})", parts.join(" AND ")));
    }
    if filter_clauses.is_empty() {
        sql.push_str(" AND 1 = 0");
    } else {
        sql.push_str(" AND (");
        sql.push_str(&filter_clauses.join(" OR "));
        sql.push(')');
    }

    if let Some(cursor) = req.cursor {
        let a = place(&mut args, SqlArg::I64(cursor.timestamp as i64));
        let b = place(&mut args, SqlArg::I64(cursor.chain_id as i64));
        let c = place(&mut args, SqlArg::I64(cursor.block_number as i64));
        let d = place(&mut args, SqlArg::I64(cursor.log_index as i64));
        sql.push_str(&format!(
            " AND (b.timestamp, l.chain_id, l.block_number, l.log_index) > ({a}, {b}, {c}, {d})"
        ));
    }

    sql.push_str(
        " ORDER BY b.timestamp ASC, l.chain_id ASC, l.block_number ASC, l.log_index ASC LIMIT ",
    );
    let limit = req.page_size.max(1) as i64 + 1;
    sql.push_str(&place(&mut args, SqlArg::I64(limit)));

    (sql, args)
}

// ─────────────────────────────────────────────────────────────────────────────
// Row decoding
// ─────────────────────────────────────────────────────────────────────────────

fn blob_to_b256(bytes: &[u8], column: &str) -> Result<B256> {
    B256::try_from(bytes).map_err(|_| {
        EvmIndexerError::InvariantViolation(format!(
            "column {column}: expected 32 bytes, got {}",
            bytes.len()
        ))
    })
}

fn blob_to_address(bytes: &[u8], column: &str) -> Result<Address> {
    Address::try_from(bytes).map_err(|_| {
        EvmIndexerError::InvariantViolation(format!(
            "column {column}: expected 20 bytes, got {}",
            bytes.len()
        ))
    })
}

fn blob_to_u256(bytes: &[u8], column: &str) -> Result<U256> {
    if bytes.len() != 32 {
        return Err(EvmIndexerError::InvariantViolation(format!(
            "column {column}: expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(U256::from_be_slice(bytes))
}

/// Decodes one joined `(log, block, transaction)` row. A null transaction
/// side means the log→transaction join missed, which the iteration contract
/// treats as fatal.
pub(crate) fn decode_event_row<R>(row: &R) -> Result<LogEvent>
where
    R: Row,
    for<'a> &'a str: ColumnIndex<R>,
    for<'r> i64: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> Vec<u8>: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> String: Decode<'r, R::Database> + Type<R::Database>,
{
    let i64_col = |name: &str| -> Result<u64> { Ok(row.try_get::<i64, _>(name)? as u64) };
    let bytes_col = |name: &str| -> Result<Vec<u8>> { Ok(row.try_get::<Vec<u8>, _>(name)?) };
    let opt_bytes_col =
        |name: &str| -> Result<Option<Vec<u8>>> { Ok(row.try_get::<Option<Vec<u8>>, _>(name)?) };

    let chain_id = i64_col("l_chain_id")?;

    let topic = |name: &str| -> Result<Option<B256>> {
        opt_bytes_col(name)?
            .map(|b| blob_to_b256(&b, name))
            .transpose()
    };
    let log = Log {
        address: blob_to_address(&bytes_col("l_address")?, "l_address")?,
        block_hash: blob_to_b256(&bytes_col("l_block_hash")?, "l_block_hash")?,
        block_number: i64_col("l_block_number")?,
        transaction_hash: blob_to_b256(&bytes_col("l_transaction_hash")?, "l_transaction_hash")?,
        transaction_index: i64_col("l_transaction_index")?,
        log_index: i64_col("l_log_index")?,
        data: Bytes::from(bytes_col("l_data")?),
        topic0: topic("l_topic0")?,
        topic1: topic("l_topic1")?,
        topic2: topic("l_topic2")?,
        topic3: topic("l_topic3")?,
        chain_id,
    };

    let block = Block {
        hash: blob_to_b256(&bytes_col("b_hash")?, "b_hash")?,
        parent_hash: blob_to_b256(&bytes_col("b_parent_hash")?, "b_parent_hash")?,
        number: i64_col("b_number")?,
        timestamp: i64_col("b_timestamp")?,
        miner: blob_to_address(&bytes_col("b_miner")?, "b_miner")?,
        gas_limit: blob_to_u256(&bytes_col("b_gas_limit")?, "b_gas_limit")?,
        gas_used: blob_to_u256(&bytes_col("b_gas_used")?, "b_gas_used")?,
        base_fee_per_gas: opt_bytes_col("b_base_fee_per_gas")?
            .map(|b| blob_to_u256(&b, "b_base_fee_per_gas"))
            .transpose()?,
        difficulty: blob_to_u256(&bytes_col("b_difficulty")?, "b_difficulty")?,
        total_difficulty: blob_to_u256(&bytes_col("b_total_difficulty")?, "b_total_difficulty")?,
        extra_data: Bytes::from(bytes_col("b_extra_data")?),
        logs_bloom: Bytes::from(bytes_col("b_logs_bloom")?),
        mix_hash: blob_to_b256(&bytes_col("b_mix_hash")?, "b_mix_hash")?,
        nonce: B64::try_from(bytes_col("b_nonce")?.as_slice()).map_err(|_| {
            EvmIndexerError::InvariantViolation("column b_nonce: expected 8 bytes".to_string())
        })?,
        receipts_root: blob_to_b256(&bytes_col("b_receipts_root")?, "b_receipts_root")?,
        sha3_uncles: blob_to_b256(&bytes_col("b_sha3_uncles")?, "b_sha3_uncles")?,
        size: blob_to_u256(&bytes_col("b_size")?, "b_size")?,
        state_root: blob_to_b256(&bytes_col("b_state_root")?, "b_state_root")?,
        transactions_root: blob_to_b256(&bytes_col("b_transactions_root")?, "b_transactions_root")?,
        chain_id,
    };

    let Some(tx_hash) = opt_bytes_col("t_hash")? else {
        return Err(EvmIndexerError::InvariantViolation(format!(
            "log {} at block {} has no joined transaction {}",
            log.log_index, log.block_number, log.transaction_hash
        )));
    };
    let kind_text = row.try_get::<String, _>("t_kind")?;
    let transaction = Transaction {
        hash: blob_to_b256(&tx_hash, "t_hash")?,
        block_hash: log.block_hash,
        block_number: i64_col("t_block_number")?,
        transaction_index: i64_col("t_transaction_index")?,
        from: blob_to_address(&bytes_col("t_from_address")?, "t_from_address")?,
        to: opt_bytes_col("t_to_address")?
            .map(|b| blob_to_address(&b, "t_to_address"))
            .transpose()?,
        input: Bytes::from(bytes_col("t_input")?),
        nonce: i64_col("t_nonce")?,
        value: blob_to_u256(&bytes_col("t_value")?, "t_value")?,
        gas: blob_to_u256(&bytes_col("t_gas")?, "t_gas")?,
        v: blob_to_u256(&bytes_col("t_v")?, "t_v")?,
        r: blob_to_u256(&bytes_col("t_r")?, "t_r")?,
        s: blob_to_u256(&bytes_col("t_s")?, "t_s")?,
        kind: TransactionKind::parse(&kind_text).ok_or_else(|| {
            EvmIndexerError::InvariantViolation(format!("unknown transaction kind '{kind_text}'"))
        })?,
        gas_price: opt_bytes_col("t_gas_price")?
            .map(|b| blob_to_u256(&b, "t_gas_price"))
            .transpose()?,
        max_fee_per_gas: opt_bytes_col("t_max_fee_per_gas")?
            .map(|b| blob_to_u256(&b, "t_max_fee_per_gas"))
            .transpose()?,
        max_priority_fee_per_gas: opt_bytes_col("t_max_priority_fee_per_gas")?
            .map(|b| blob_to_u256(&b, "t_max_priority_fee_per_gas"))
            .transpose()?,
        access_list: row
            .try_get::<Option<String>, _>("t_access_list")?
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        chain_id,
    };

    Ok(LogEvent {
        log,
        block,
        transaction,
    })
}

pub(crate) fn decode_cached_range_row<R>(row: &R) -> Result<CachedRange>
where
    R: Row,
    for<'a> &'a str: ColumnIndex<R>,
    for<'r> i64: Decode<'r, R::Database> + Type<R::Database>,
    for<'r> String: Decode<'r, R::Database> + Type<R::Database>,
{
    Ok(CachedRange {
        filter_key: row.try_get::<String, _>("filter_key")?,
        start_block: row.try_get::<i64, _>("start_block")? as u64,
        end_block: row.try_get::<i64, _>("end_block")? as u64,
        end_block_timestamp: row.try_get::<i64, _>("end_block_timestamp")? as u64,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Page assembly and range arithmetic
// ─────────────────────────────────────────────────────────────────────────────

/// Finalizes a fetched row set into a page: detects truncation (the query
/// over-fetched by one), derives the resume cursor and end timestamp, and
/// tallies per-filter counts.
pub(crate) fn assemble_page(req: &GetLogEventsRequest<'_>, mut events: Vec<LogEvent>) -> LogEventPage {
    let page_size = req.page_size.max(1);
    let truncated = events.len() > page_size;
    if truncated {
        events.truncate(page_size);
    }

    let (page_ends_at_timestamp, cursor) = if truncated {
        let last = events.last().expect("truncated page is non-empty");
        (
            last.block.timestamp,
            Some(Cursor {
                timestamp: last.block.timestamp,
                chain_id: last.log.chain_id,
                block_number: last.log.block_number,
                log_index: last.log.log_index,
            }),
        )
    } else {
        (req.to_timestamp, None)
    };

    let counts = page_counts(req, &events);
    LogEventPage {
        events,
        metadata: PageMetadata {
            page_ends_at_timestamp,
            counts,
            cursor,
        },
    }
}

fn page_counts(req: &GetLogEventsRequest<'_>, events: &[LogEvent]) -> Vec<EventCount> {
    let mut tally: BTreeMap<(String, Option<B256>), u64> = BTreeMap::new();
    for event in events {
        for filter in req.filters {
            if !filter.matches(&event.log) {
                continue;
            }
            if let Some(include) = req.include_event_selectors {
                if let Some(selectors) = include.get(&filter.name) {
                    match event.log.topic0 {
                        Some(topic0) if selectors.contains(&topic0) => {}
                        _ => continue,
                    }
                }
            }
            *tally
                .entry((filter.name.clone(), event.log.topic0))
                .or_default() += 1;
        }
    }
    tally
        .into_iter()
        .map(|((filter_name, selector), count)| EventCount {
            filter_name,
            selector,
            count,
        })
        .collect()
}

/// Coalesces ranges sorted by start block, merging overlapping and adjacent
/// intervals. The merged range carries the end timestamp of the member with
/// the greatest end block.
pub(crate) fn coalesce_ranges(ranges: Vec<CachedRange>) -> Vec<CachedRange> {
    let mut merged: Vec<CachedRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.start_block <= last.end_block.saturating_add(1) => {
                if range.end_block > last.end_block {
                    last.end_block = range.end_block;
                    last.end_block_timestamp = range.end_block_timestamp;
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Subtracts `cached` (sorted, disjoint) from `[start, end]`, yielding the
/// uncached sub-intervals.
pub(crate) fn subtract_ranges(start: u64, end: u64, cached: &[CachedRange]) -> Vec<(u64, u64)> {
    let mut gaps = Vec::new();
    let mut next = start;
    for range in cached {
        if range.end_block < next {
            continue;
        }
        if range.start_block > end {
            break;
        }
        if range.start_block > next {
            gaps.push((next, range.start_block - 1));
        }
        next = range.end_block.saturating_add(1);
        if next > end {
            return gaps;
        }
    }
    if next <= end {
        gaps.push((next, end));
    }
    gaps
}
