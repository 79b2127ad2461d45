//! Uniform request interface over Ethereum JSON-RPC.
//!
//! [`RpcClient`] is the capability every sync component depends on. The
//! concrete transports are:
//! - [`http::HttpRpcClient`] — direct JSON-RPC over HTTP.
//! - [`paid::PaidRpcClient`] — direct transport that acquires a payment
//!   voucher before configured methods.
//! - [`remote::RemoteIndexerRpcClient`] — translates log/block methods into
//!   GraphQL queries against a peer indexer.
//! - [`retry::RetryingRpcClient`] — decorator adding exponential backoff for
//!   transient failures.

pub mod http;
pub mod paid;
pub mod remote;
pub mod retry;

pub use http::HttpRpcClient;
pub use paid::{PaidRpcClient, PaymentProvider, DEFAULT_PAID_METHODS};
pub use remote::RemoteIndexerRpcClient;
pub use retry::RetryingRpcClient;

use alloy_primitives::{Address, Bytes, B256, U64};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::types::wire::{RpcBlock, RpcLog};
use crate::types::TopicFilter;
use crate::utils::error::{EvmIndexerError, Result};

/// Block reference for `eth_getBlockByNumber`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockNumberOrTag {
    Number(u64),
    Latest,
}

impl BlockNumberOrTag {
    fn to_value(self) -> Value {
        match self {
            Self::Number(n) => json!(format!("0x{n:x}")),
            Self::Latest => json!("latest"),
        }
    }
}

/// Parameters for `eth_getLogs`: either a block hash or a block range, plus
/// address and topic constraints.
#[derive(Debug, Clone, Default)]
pub struct GetLogsSelection {
    pub block_hash: Option<B256>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub addresses: Option<Vec<Address>>,
    pub topics: [TopicFilter; 4],
}

impl GetLogsSelection {
    /// The JSON-RPC filter object.
    #[must_use]
    pub fn to_params(&self) -> Value {
        let mut filter = serde_json::Map::new();
        if let Some(hash) = self.block_hash {
            filter.insert("blockHash".to_string(), json!(hash));
        } else {
            if let Some(from) = self.from_block {
                filter.insert("fromBlock".to_string(), json!(format!("0x{from:x}")));
            }
            if let Some(to) = self.to_block {
                filter.insert("toBlock".to_string(), json!(format!("0x{to:x}")));
            }
        }
        if let Some(addresses) = &self.addresses {
            match addresses.as_slice() {
                [] => {}
                [single] => {
                    filter.insert("address".to_string(), json!(single));
                }
                many => {
                    filter.insert("address".to_string(), json!(many));
                }
            }
        }
        let last_constrained = self
            .topics
            .iter()
            .rposition(|t| t.as_ref().is_some_and(|v| !v.is_empty()));
        if let Some(last) = last_constrained {
            let topics: Vec<Value> = self.topics[..=last]
                .iter()
                .map(|slot| match slot {
                    Some(values) if values.len() == 1 => json!(values[0]),
                    Some(values) if !values.is_empty() => json!(values),
                    _ => Value::Null,
                })
                .collect();
            filter.insert("topics".to_string(), json!(topics));
        }
        Value::Object(filter)
    }
}

fn parse_quantity(value: &Value) -> Result<u64> {
    let quantity: U64 = serde_json::from_value(value.clone())?;
    Ok(quantity.to::<u64>())
}

/// Uniform RPC request capability with typed helpers over the raw
/// `request` entry point.
#[async_trait]
pub trait RpcClient: Send + Sync {
    /// Performs a raw request and returns the JSON-RPC `result`.
    async fn request(&self, method: &str, params: Value) -> Result<Value>;

    /// `eth_blockNumber`.
    async fn block_number(&self) -> Result<u64> {
        let result = self.request("eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }

    /// `eth_getBlockByNumber`. `None` when the block does not exist.
    async fn get_block_by_number(
        &self,
        number: BlockNumberOrTag,
        full_transactions: bool,
    ) -> Result<Option<RpcBlock>> {
        let result = self
            .request(
                "eth_getBlockByNumber",
                json!([number.to_value(), full_transactions]),
            )
            .await?;
        if result.is_null() {
            Ok(None)
        } else {
            Ok(Some(serde_json::from_value(result)?))
        }
    }

    /// `eth_getBlockByHash`. `None` when the block is unknown.
    async fn get_block_by_hash(
        &self,
        hash: B256,
        full_transactions: bool,
    ) -> Result<Option<RpcBlock>> {
        let result = self
            .request("eth_getBlockByHash", json!([hash, full_transactions]))
            .await?;
        if result.is_null() {
            Ok(None)
        } else {
            Ok(Some(serde_json::from_value(result)?))
        }
    }

    /// `eth_getLogs`.
    async fn get_logs(&self, selection: &GetLogsSelection) -> Result<Vec<RpcLog>> {
        let result = self
            .request("eth_getLogs", json!([selection.to_params()]))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// `eth_call` against the state at `block_number`.
    async fn call(&self, to: Address, data: &Bytes, block_number: u64) -> Result<Bytes> {
        let result = self
            .request(
                "eth_call",
                json!([{ "to": to, "data": data }, format!("0x{block_number:x}")]),
            )
            .await?;
        serde_json::from_value(result).map_err(EvmIndexerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};

    #[test]
    fn test_get_logs_selection_range_params() {
        let selection = GetLogsSelection {
            block_hash: None,
            from_block: Some(100),
            to_block: Some(100),
            addresses: Some(vec![address!("00000000000000000000000000000000000000aa")]),
            topics: [
                Some(vec![b256!(
                    "3333333333333333333333333333333333333333333333333333333333333333"
                )]),
                None,
                None,
                None,
            ],
        };
        let params = selection.to_params();
        assert_eq!(params["fromBlock"], "0x64");
        assert_eq!(params["toBlock"], "0x64");
        assert_eq!(
            params["address"],
            "0x00000000000000000000000000000000000000aa"
        );
        assert_eq!(
            params["topics"][0],
            "0x3333333333333333333333333333333333333333333333333333333333333333"
        );
    }

    #[test]
    fn test_get_logs_selection_block_hash_wins() {
        let selection = GetLogsSelection {
            block_hash: Some(b256!(
                "1111111111111111111111111111111111111111111111111111111111111111"
            )),
            from_block: Some(1),
            to_block: Some(2),
            ..Default::default()
        };
        let params = selection.to_params();
        assert!(params.get("fromBlock").is_none());
        assert!(params.get("toBlock").is_none());
        assert_eq!(
            params["blockHash"],
            "0x1111111111111111111111111111111111111111111111111111111111111111"
        );
    }

    #[test]
    fn test_topic_matrix_serialization() {
        let t0 = b256!("3333333333333333333333333333333333333333333333333333333333333333");
        let t2a = b256!("4444444444444444444444444444444444444444444444444444444444444444");
        let t2b = b256!("5555555555555555555555555555555555555555555555555555555555555555");
        let selection = GetLogsSelection {
            topics: [Some(vec![t0]), None, Some(vec![t2a, t2b]), None],
            ..Default::default()
        };
        let params = selection.to_params();
        let topics = params["topics"].as_array().unwrap();
        assert_eq!(topics.len(), 3);
        assert!(topics[0].is_string());
        assert!(topics[1].is_null());
        assert_eq!(topics[2].as_array().unwrap().len(), 2);
    }
}
