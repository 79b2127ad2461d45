//! Core domain model shared across the sync services, the event store, and
//! the aggregation pipeline.
//!
//! Identity rules: blocks and transactions are keyed `(chain_id, hash)`,
//! logs by `id = block_hash ‖ log_index`. None of these records are mutated
//! once written; realtime data is removed only during reorg recovery.

pub mod events;
pub mod wire;

use alloy_primitives::{Address, Bytes, B256, B64, U256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A canonical-chain block header plus the fields the indexer persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub hash: B256,
    pub parent_hash: B256,
    pub number: u64,
    /// Unix timestamp, seconds.
    pub timestamp: u64,
    pub miner: Address,
    pub gas_limit: U256,
    pub gas_used: U256,
    pub base_fee_per_gas: Option<U256>,
    pub difficulty: U256,
    pub total_difficulty: U256,
    pub extra_data: Bytes,
    pub logs_bloom: Bytes,
    pub mix_hash: B256,
    pub nonce: B64,
    pub receipts_root: B256,
    pub sha3_uncles: B256,
    pub size: U256,
    pub state_root: B256,
    pub transactions_root: B256,
    pub chain_id: u64,
}

/// Transaction envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Legacy,
    Eip2930,
    Eip1559,
}

impl TransactionKind {
    /// Stable text discriminant used in store columns.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Eip2930 => "eip2930",
            Self::Eip1559 => "eip1559",
        }
    }

    /// Parses the store discriminant back into the enum.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "legacy" => Some(Self::Legacy),
            "eip2930" => Some(Self::Eip2930),
            "eip1559" => Some(Self::Eip1559),
            _ => None,
        }
    }
}

/// A mined transaction as persisted alongside its block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub transaction_index: u64,
    pub from: Address,
    /// `None` for contract-creation transactions.
    pub to: Option<Address>,
    pub input: Bytes,
    pub nonce: u64,
    pub value: U256,
    pub gas: U256,
    pub v: U256,
    pub r: U256,
    pub s: U256,
    pub kind: TransactionKind,
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    /// EIP-2930 access list, kept as raw JSON.
    pub access_list: Option<serde_json::Value>,
    pub chain_id: u64,
}

/// An emitted event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub block_hash: B256,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
    pub data: Bytes,
    pub topic0: Option<B256>,
    pub topic1: Option<B256>,
    pub topic2: Option<B256>,
    pub topic3: Option<B256>,
    pub chain_id: u64,
}

impl Log {
    /// Log identity: the 32-byte block hash followed by the log index as
    /// 8-byte big-endian.
    #[must_use]
    pub fn id(&self) -> [u8; 40] {
        let mut id = [0u8; 40];
        id[..32].copy_from_slice(self.block_hash.as_slice());
        id[32..].copy_from_slice(&self.log_index.to_be_bytes());
        id
    }

    /// Topic at `slot` (0..=3).
    #[must_use]
    pub fn topic(&self, slot: usize) -> Option<B256> {
        match slot {
            0 => self.topic0,
            1 => self.topic1,
            2 => self.topic2,
            3 => self.topic3,
            _ => None,
        }
    }
}

/// Per-slot topic selector: `None` (or an empty set) matches every log at
/// that slot, otherwise the log's topic must be one of the listed values.
pub type TopicFilter = Option<Vec<B256>>;

/// A named selector over logs: chain, optional address set, optional topic
/// matrix, and the block range to backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    /// Unique across the process.
    pub name: String,
    pub chain_id: u64,
    /// `None` matches any address.
    pub addresses: Option<Vec<Address>>,
    pub topics: [TopicFilter; 4],
    pub start_block: u64,
    /// `None` means the filter follows the chain head.
    pub end_block: Option<u64>,
    /// Upper bound on a single `eth_getLogs` span for this filter.
    pub max_block_range: u64,
}

impl LogFilter {
    /// Content identity of the filter: SHA-256 over chain id, sorted address
    /// set, topic matrix, and start block, hex encoded. Renaming a filter
    /// keeps its cached ranges.
    #[must_use]
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.chain_id.to_be_bytes());
        match &self.addresses {
            None => hasher.update([0u8]),
            Some(addresses) => {
                hasher.update([1u8]);
                let mut sorted = addresses.clone();
                sorted.sort_unstable();
                for address in sorted {
                    hasher.update(address.as_slice());
                }
            }
        }
        for slot in &self.topics {
            match slot {
                None => hasher.update([0u8]),
                Some(values) => {
                    hasher.update([1u8]);
                    let mut sorted = values.clone();
                    sorted.sort_unstable();
                    for value in sorted {
                        hasher.update(value.as_slice());
                    }
                }
            }
        }
        hasher.update(self.start_block.to_be_bytes());
        alloy_primitives::hex::encode(hasher.finalize())
    }

    /// Whether `log` satisfies this filter's chain, address, and topic
    /// constraints. Block range is intentionally not part of log matching.
    #[must_use]
    pub fn matches(&self, log: &Log) -> bool {
        if log.chain_id != self.chain_id {
            return false;
        }
        if let Some(addresses) = &self.addresses {
            if !addresses.is_empty() && !addresses.contains(&log.address) {
                return false;
            }
        }
        for (slot, selector) in self.topics.iter().enumerate() {
            if let Some(values) = selector {
                if values.is_empty() {
                    continue;
                }
                match log.topic(slot) {
                    Some(topic) if values.contains(&topic) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

/// An inclusive block-number interval for which the event store is known to
/// contain every log matching a filter, plus the timestamp of its end block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRange {
    pub filter_key: String,
    pub start_block: u64,
    pub end_block: u64,
    pub end_block_timestamp: u64,
}

/// Total-ordered position within the cross-network event stream, used for
/// keyset pagination. Field order is the comparison precedence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub log_index: u64,
}
