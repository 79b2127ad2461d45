//! Remote-indexer transport: serves `eth_getLogs`, `eth_getBlockByNumber`,
//! and `eth_getBlockByHash` by querying a peer indexer's GraphQL API.
//!
//! The peer returns the same hex-quantity field encoding as JSON-RPC, so
//! responses flow into the shared wire structs untouched. Methods outside
//! the translated set are delegated to an optional fallback transport or
//! rejected with a logged error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::RpcClient;
use crate::utils::error::{EvmIndexerError, Result};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const GET_ETH_LOGS_QUERY: &str = "\
query GetEthLogs($blockHash: String, $fromBlock: String, $toBlock: String, \
$address: [String!], $topics: [[String!]]) {
  getEthLogs(blockHash: $blockHash, fromBlock: $fromBlock, toBlock: $toBlock, \
address: $address, topics: $topics) {
    address blockHash blockNumber transactionHash transactionIndex logIndex
    data topics removed
  }
}";

const GET_ETH_BLOCK_QUERY: &str = "\
query GetEthBlock($hash: String, $number: String, $fullTransactions: Boolean!) {
  getEthBlock(hash: $hash, number: $number, fullTransactions: $fullTransactions) {
    hash parentHash number timestamp miner gasLimit gasUsed baseFeePerGas
    difficulty totalDifficulty extraData logsBloom mixHash nonce receiptsRoot
    sha3Uncles size stateRoot transactionsRoot
    transactions {
      hash blockHash blockNumber transactionIndex from to input nonce value
      gas v r s type gasPrice maxFeePerGas maxPriorityFeePerGas accessList
    }
  }
}";

/// RPC transport backed by a peer indexer's GraphQL API.
pub struct RemoteIndexerRpcClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    fallback: Option<Arc<dyn RpcClient>>,
}

impl RemoteIndexerRpcClient {
    /// Creates a client for the peer indexer at `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            fallback: None,
        }
    }

    /// Delegates untranslated methods to `fallback` instead of rejecting
    /// them. The peer's `getEthBlock` resolver performs its own upstream
    /// fallback for blocks it does not hold.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn RpcClient>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value> {
        let body = json!({ "query": query, "variables": variables });
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EvmIndexerError::Timeout(self.timeout)
                } else {
                    EvmIndexerError::from(e)
                }
            })?
            .error_for_status()?;
        let payload: Value = response.json().await?;

        if let Some(errors) = payload.get("errors").and_then(Value::as_array) {
            if !errors.is_empty() {
                let messages: Vec<&str> = errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(Value::as_str))
                    .collect();
                return Err(EvmIndexerError::RpcRequest {
                    code: -32_000,
                    message: format!("remote indexer error: {}", messages.join("; ")),
                });
            }
        }

        payload
            .get("data")
            .cloned()
            .ok_or_else(|| EvmIndexerError::Internal("GraphQL response missing data".to_string()))
    }

    async fn get_eth_logs(&self, params: &Value) -> Result<Value> {
        let filter = params
            .get(0)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut variables = Map::new();
        for key in ["blockHash", "fromBlock", "toBlock", "topics"] {
            if let Some(value) = filter.get(key) {
                variables.insert(key.to_string(), value.clone());
            }
        }
        // The GraphQL schema takes an address list; normalize the JSON-RPC
        // single-or-array form.
        if let Some(address) = filter.get("address") {
            let normalized = if address.is_array() {
                address.clone()
            } else {
                json!([address])
            };
            variables.insert("address".to_string(), normalized);
        }
        let data = self
            .graphql(GET_ETH_LOGS_QUERY, Value::Object(variables))
            .await?;
        Ok(data.get("getEthLogs").cloned().unwrap_or(json!([])))
    }

    async fn get_eth_block(&self, method: &str, params: &Value) -> Result<Value> {
        let reference = params.get(0).cloned().unwrap_or(Value::Null);
        let full_transactions = params.get(1).and_then(Value::as_bool).unwrap_or(false);
        let variables = if method == "eth_getBlockByHash" {
            json!({ "hash": reference, "fullTransactions": full_transactions })
        } else {
            json!({ "number": reference, "fullTransactions": full_transactions })
        };
        let data = self.graphql(GET_ETH_BLOCK_QUERY, variables).await?;
        Ok(data.get("getEthBlock").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl RpcClient for RemoteIndexerRpcClient {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            "eth_getLogs" => self.get_eth_logs(&params).await,
            "eth_getBlockByNumber" | "eth_getBlockByHash" => {
                self.get_eth_block(method, &params).await
            }
            other => {
                if let Some(fallback) = &self.fallback {
                    fallback.request(other, params).await
                } else {
                    tracing::warn!(method = other, "Method not supported by remote indexer");
                    Err(EvmIndexerError::RpcRequest {
                        code: -32_601,
                        message: format!("method '{other}' not supported by remote indexer"),
                    })
                }
            }
        }
    }
}
