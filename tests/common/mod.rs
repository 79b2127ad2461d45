//! Shared test scaffolding: a programmable in-memory RPC provider and JSON
//! builders for blocks, transactions, and logs.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use serde_json::{json, Value};

use evm_indexer::{EvmIndexerError, Result, RpcClient};

/// Deterministic block hash for canonical block `n`.
pub fn block_hash(n: u64) -> B256 {
    B256::from(U256::from(0xb10c_0000_0000u64 + n))
}

/// Deterministic block hash for the post-reorg fork at height `n`.
pub fn fork_hash(n: u64) -> B256 {
    B256::from(U256::from(0xf04c_0000_0000u64 + n))
}

/// Deterministic transaction hash.
pub fn tx_hash(n: u64) -> B256 {
    B256::from(U256::from(0x7a_0000_0000u64 + n))
}

pub fn address(n: u64) -> Address {
    Address::from_word(B256::from(U256::from(n)))
}

pub fn topic(n: u64) -> B256 {
    B256::from(U256::from(0x70_0000_0000u64 + n))
}

fn hex(n: u64) -> String {
    format!("0x{n:x}")
}

/// A full-transaction block JSON object as a JSON-RPC provider returns it.
pub fn make_block(
    number: u64,
    timestamp: u64,
    hash: B256,
    parent_hash: B256,
    transactions: Vec<Value>,
) -> Value {
    json!({
        "hash": hash,
        "parentHash": parent_hash,
        "number": hex(number),
        "timestamp": hex(timestamp),
        "miner": address(0xbeef),
        "gasLimit": "0x1c9c380",
        "gasUsed": "0x5208",
        "baseFeePerGas": "0x7",
        "difficulty": "0x0",
        "totalDifficulty": "0xc70d815d562d3cfa955",
        "extraData": "0x",
        "logsBloom": "0x00",
        "mixHash": B256::ZERO,
        "nonce": "0x0000000000000000",
        "receiptsRoot": B256::repeat_byte(0x0a),
        "sha3Uncles": B256::repeat_byte(0x0b),
        "size": "0x220",
        "stateRoot": B256::repeat_byte(0x0c),
        "transactionsRoot": B256::repeat_byte(0x0d),
        "transactions": transactions,
    })
}

pub fn make_tx(hash: B256, block_hash: B256, block_number: u64, index: u64) -> Value {
    json!({
        "hash": hash,
        "blockHash": block_hash,
        "blockNumber": hex(block_number),
        "transactionIndex": hex(index),
        "from": address(0xaaaa),
        "to": address(0xbbbb),
        "input": "0x",
        "nonce": hex(index),
        "value": "0xde0b6b3a7640000",
        "gas": "0x5208",
        "gasPrice": "0x3b9aca00",
        "v": "0x1b",
        "r": "0x1",
        "s": "0x2",
        "type": "0x0",
    })
}

pub fn make_log(
    log_address: Address,
    block_hash: B256,
    block_number: u64,
    transaction_hash: B256,
    log_index: u64,
    topics: Vec<B256>,
) -> Value {
    json!({
        "address": log_address,
        "blockHash": block_hash,
        "blockNumber": hex(block_number),
        "transactionHash": transaction_hash,
        "transactionIndex": "0x0",
        "logIndex": hex(log_index),
        "data": "0x",
        "topics": topics,
        "removed": false,
    })
}

#[derive(Default)]
pub struct MockState {
    pub head: u64,
    pub blocks_by_hash: HashMap<B256, Value>,
    /// Canonical view only; rewritten when simulating a reorg.
    pub blocks_by_number: HashMap<u64, Value>,
    pub logs: Vec<Value>,
    /// Errors returned by the next `eth_getLogs` calls, in order.
    pub get_logs_errors: Vec<(i64, String)>,
    /// Every `eth_getLogs` range requested, for assertions.
    pub requested_log_ranges: Vec<(u64, u64)>,
}

/// An in-memory JSON-RPC provider scripted by tests.
#[derive(Default)]
pub struct MockRpc {
    pub state: Mutex<MockState>,
}

impl MockRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `block` as canonical at its height and advances the head.
    pub fn add_canonical_block(&self, block: Value) {
        let mut state = self.state.lock().unwrap();
        let number = u64::from_str_radix(
            block["number"].as_str().unwrap().trim_start_matches("0x"),
            16,
        )
        .unwrap();
        let hash: B256 = serde_json::from_value(block["hash"].clone()).unwrap();
        state.blocks_by_hash.insert(hash, block.clone());
        state.blocks_by_number.insert(number, block);
        state.head = state.head.max(number);
    }

    /// Registers `block` by hash only (a fork block not yet canonical).
    pub fn add_fork_block(&self, block: Value) {
        let mut state = self.state.lock().unwrap();
        let hash: B256 = serde_json::from_value(block["hash"].clone()).unwrap();
        state.blocks_by_hash.insert(hash, block);
    }

    pub fn add_log(&self, log: Value) {
        self.state.lock().unwrap().logs.push(log);
    }

    pub fn push_get_logs_error(&self, code: i64, message: &str) {
        self.state
            .lock()
            .unwrap()
            .get_logs_errors
            .push((code, message.to_string()));
    }

    pub fn requested_log_ranges(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().requested_log_ranges.clone()
    }

    fn filter_logs(state: &MockState, filter: &Value) -> Vec<Value> {
        let parse_hex = |v: &Value| -> Option<u64> {
            v.as_str()
                .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        };
        let by_hash: Option<String> = filter["blockHash"].as_str().map(ToString::to_string);
        let from = parse_hex(&filter["fromBlock"]);
        let to = parse_hex(&filter["toBlock"]);
        let addresses: Option<Vec<String>> = match &filter["address"] {
            Value::String(s) => Some(vec![s.to_lowercase()]),
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_lowercase))
                    .collect(),
            ),
            _ => None,
        };
        let topic0: Option<Vec<String>> = match filter["topics"].get(0) {
            Some(Value::String(s)) => Some(vec![s.to_lowercase()]),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_lowercase))
                    .collect(),
            ),
            _ => None,
        };

        state
            .logs
            .iter()
            .filter(|log| {
                if let Some(hash) = &by_hash {
                    if log["blockHash"].as_str() != Some(hash.as_str()) {
                        return false;
                    }
                } else {
                    let number = parse_hex(&log["blockNumber"]).unwrap();
                    if from.is_some_and(|f| number < f) || to.is_some_and(|t| number > t) {
                        return false;
                    }
                }
                if let Some(addresses) = &addresses {
                    let log_address = log["address"].as_str().unwrap().to_lowercase();
                    if !addresses.contains(&log_address) {
                        return false;
                    }
                }
                if let Some(topic0) = &topic0 {
                    match log["topics"].get(0).and_then(Value::as_str) {
                        Some(t) if topic0.contains(&t.to_lowercase()) => {}
                        _ => return false,
                    }
                }
                true
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RpcClient for MockRpc {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        match method {
            "eth_blockNumber" => Ok(json!(hex(state.head))),
            "eth_getBlockByNumber" => {
                let reference = &params[0];
                let number = if reference == "latest" {
                    state.head
                } else {
                    u64::from_str_radix(
                        reference.as_str().unwrap().trim_start_matches("0x"),
                        16,
                    )
                    .unwrap()
                };
                Ok(state
                    .blocks_by_number
                    .get(&number)
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            "eth_getBlockByHash" => {
                let hash: B256 = serde_json::from_value(params[0].clone())?;
                Ok(state.blocks_by_hash.get(&hash).cloned().unwrap_or(Value::Null))
            }
            "eth_getLogs" => {
                let filter = params[0].clone();
                let parse_hex = |v: &Value| -> Option<u64> {
                    v.as_str()
                        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                };
                if let (Some(from), Some(to)) =
                    (parse_hex(&filter["fromBlock"]), parse_hex(&filter["toBlock"]))
                {
                    state.requested_log_ranges.push((from, to));
                }
                if !state.get_logs_errors.is_empty() {
                    let (code, message) = state.get_logs_errors.remove(0);
                    return Err(EvmIndexerError::RpcRequest { code, message });
                }
                Ok(json!(Self::filter_logs(&state, &filter)))
            }
            "eth_call" => Ok(json!("0x0000000000000000000000000000000000000000000000000000000000000001")),
            other => Err(EvmIndexerError::RpcRequest {
                code: -32_601,
                message: format!("mock does not implement {other}"),
            }),
        }
    }
}
