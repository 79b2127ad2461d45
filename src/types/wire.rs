//! JSON-RPC wire representations of blocks, transactions, and logs.
//!
//! Hex-quantity fields are deserialized through `alloy_primitives` integer
//! types and converted to the domain model at the boundary. Providers
//! disagree on a few optional fields (`baseFeePerGas` pre-London,
//! `totalDifficulty` post-merge, signature fields on some L2s); those are
//! optional here and defaulted during conversion.

use alloy_primitives::{Address, Bytes, B256, B64, U256, U64};
use serde::Deserialize;

use super::{Block, Log, Transaction, TransactionKind};

/// `eth_getBlockByNumber` / `eth_getBlockByHash` result with full
/// transaction objects.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    pub hash: B256,
    pub parent_hash: B256,
    pub number: U64,
    pub timestamp: U64,
    pub miner: Address,
    pub gas_limit: U256,
    pub gas_used: U256,
    #[serde(default)]
    pub base_fee_per_gas: Option<U256>,
    pub difficulty: U256,
    #[serde(default)]
    pub total_difficulty: Option<U256>,
    pub extra_data: Bytes,
    pub logs_bloom: Bytes,
    pub mix_hash: B256,
    pub nonce: B64,
    pub receipts_root: B256,
    pub sha3_uncles: B256,
    pub size: U256,
    pub state_root: B256,
    pub transactions_root: B256,
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
}

impl RpcBlock {
    /// Splits the wire block into the domain block and its transactions,
    /// stamped with `chain_id`.
    #[must_use]
    pub fn into_parts(self, chain_id: u64) -> (Block, Vec<Transaction>) {
        let block = Block {
            hash: self.hash,
            parent_hash: self.parent_hash,
            number: self.number.to::<u64>(),
            timestamp: self.timestamp.to::<u64>(),
            miner: self.miner,
            gas_limit: self.gas_limit,
            gas_used: self.gas_used,
            base_fee_per_gas: self.base_fee_per_gas,
            difficulty: self.difficulty,
            total_difficulty: self.total_difficulty.unwrap_or(U256::ZERO),
            extra_data: self.extra_data,
            logs_bloom: self.logs_bloom,
            mix_hash: self.mix_hash,
            nonce: self.nonce,
            receipts_root: self.receipts_root,
            sha3_uncles: self.sha3_uncles,
            size: self.size,
            state_root: self.state_root,
            transactions_root: self.transactions_root,
            chain_id,
        };
        let transactions = self
            .transactions
            .into_iter()
            .map(|tx| tx.into_transaction(chain_id))
            .collect();
        (block, transactions)
    }
}

/// A transaction object embedded in a full block response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    pub block_hash: B256,
    pub block_number: U64,
    pub transaction_index: U64,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    pub input: Bytes,
    pub nonce: U64,
    pub value: U256,
    pub gas: U256,
    #[serde(default)]
    pub v: Option<U256>,
    #[serde(default)]
    pub r: Option<U256>,
    #[serde(default)]
    pub s: Option<U256>,
    #[serde(rename = "type", default)]
    pub kind: Option<U64>,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub access_list: Option<serde_json::Value>,
}

impl RpcTransaction {
    /// Converts to the domain transaction, stamped with `chain_id`.
    #[must_use]
    pub fn into_transaction(self, chain_id: u64) -> Transaction {
        let kind = match self.kind.map(|k| k.to::<u64>()) {
            Some(1) => TransactionKind::Eip2930,
            Some(2) => TransactionKind::Eip1559,
            _ => TransactionKind::Legacy,
        };
        Transaction {
            hash: self.hash,
            block_hash: self.block_hash,
            block_number: self.block_number.to::<u64>(),
            transaction_index: self.transaction_index.to::<u64>(),
            from: self.from,
            to: self.to,
            input: self.input,
            nonce: self.nonce.to::<u64>(),
            value: self.value,
            gas: self.gas,
            v: self.v.unwrap_or(U256::ZERO),
            r: self.r.unwrap_or(U256::ZERO),
            s: self.s.unwrap_or(U256::ZERO),
            kind,
            gas_price: self.gas_price,
            max_fee_per_gas: self.max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
            access_list: self.access_list,
            chain_id,
        }
    }
}

/// `eth_getLogs` result entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub block_hash: B256,
    pub block_number: U64,
    pub transaction_hash: B256,
    pub transaction_index: U64,
    pub log_index: U64,
    pub data: Bytes,
    #[serde(default)]
    pub topics: Vec<B256>,
    #[serde(default)]
    pub removed: bool,
}

impl RpcLog {
    /// Converts to the domain log, stamped with `chain_id`.
    #[must_use]
    pub fn into_log(self, chain_id: u64) -> Log {
        let topic = |i: usize| self.topics.get(i).copied();
        Log {
            address: self.address,
            block_hash: self.block_hash,
            block_number: self.block_number.to::<u64>(),
            transaction_hash: self.transaction_hash,
            transaction_index: self.transaction_index.to::<u64>(),
            log_index: self.log_index.to::<u64>(),
            data: self.data,
            topic0: topic(0),
            topic1: topic(1),
            topic2: topic(2),
            topic3: topic(3),
            chain_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_deserializes_hex_quantities() {
        let raw = serde_json::json!({
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "parentHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "number": "0x64",
            "timestamp": "0x3e8",
            "miner": "0x00000000000000000000000000000000000000aa",
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x5208",
            "baseFeePerGas": "0x7",
            "difficulty": "0x0",
            "totalDifficulty": "0xc70d815d562d3cfa955",
            "extraData": "0x",
            "logsBloom": "0x00",
            "mixHash": "0x3333333333333333333333333333333333333333333333333333333333333333",
            "nonce": "0x0000000000000042",
            "receiptsRoot": "0x4444444444444444444444444444444444444444444444444444444444444444",
            "sha3Uncles": "0x5555555555555555555555555555555555555555555555555555555555555555",
            "size": "0x220",
            "stateRoot": "0x6666666666666666666666666666666666666666666666666666666666666666",
            "transactionsRoot": "0x7777777777777777777777777777777777777777777777777777777777777777",
            "transactions": []
        });
        let block: RpcBlock = serde_json::from_value(raw).unwrap();
        let (block, transactions) = block.into_parts(1);
        assert_eq!(block.number, 100);
        assert_eq!(block.timestamp, 1000);
        assert_eq!(block.base_fee_per_gas, Some(U256::from(7)));
        assert_eq!(block.chain_id, 1);
        assert!(transactions.is_empty());
    }

    #[test]
    fn test_transaction_kind_mapping() {
        let raw = serde_json::json!({
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "blockHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "blockNumber": "0x64",
            "transactionIndex": "0x0",
            "from": "0x00000000000000000000000000000000000000aa",
            "to": "0x00000000000000000000000000000000000000bb",
            "input": "0x",
            "nonce": "0x1",
            "value": "0xde0b6b3a7640000",
            "gas": "0x5208",
            "type": "0x2",
            "maxFeePerGas": "0x9",
            "maxPriorityFeePerGas": "0x1"
        });
        let tx: RpcTransaction = serde_json::from_value(raw).unwrap();
        let tx = tx.into_transaction(1);
        assert_eq!(tx.kind, TransactionKind::Eip1559);
        assert_eq!(tx.v, U256::ZERO);
        assert_eq!(tx.value, U256::from(10u64.pow(18)));
    }

    #[test]
    fn test_log_topics_spread_into_slots() {
        let raw = serde_json::json!({
            "address": "0x00000000000000000000000000000000000000aa",
            "blockHash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "blockNumber": "0x64",
            "transactionHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "transactionIndex": "0x0",
            "logIndex": "0x3",
            "data": "0x",
            "topics": [
                "0x3333333333333333333333333333333333333333333333333333333333333333",
                "0x4444444444444444444444444444444444444444444444444444444444444444"
            ]
        });
        let log: RpcLog = serde_json::from_value(raw).unwrap();
        let log = log.into_log(1);
        assert!(log.topic0.is_some());
        assert!(log.topic1.is_some());
        assert!(log.topic2.is_none());
        assert_eq!(log.log_index, 3);
    }
}
