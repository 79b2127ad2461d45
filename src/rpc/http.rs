//! Direct JSON-RPC over HTTP.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::RpcClient;
use crate::utils::error::{EvmIndexerError, Result};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON-RPC client POSTing to a single endpoint.
pub struct HttpRpcClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    /// Creates a client for `url` with the default request timeout.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            next_id: AtomicU64::new(1),
        }
    }

    /// Overrides the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The endpoint this client talks to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Performs a request with extra HTTP headers attached. Used by the paid
    /// transport to carry payment vouchers.
    pub(crate) async fn request_with_headers(
        &self,
        method: &str,
        params: Value,
        headers: &[(&str, String)],
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EvmIndexerError::Timeout(self.timeout)
            } else {
                EvmIndexerError::from(e)
            }
        })?;
        let response = response.error_for_status()?;
        let payload: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                EvmIndexerError::Timeout(self.timeout)
            } else {
                EvmIndexerError::from(e)
            }
        })?;

        if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
            return Err(EvmIndexerError::RpcRequest {
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32_000),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown RPC error")
                    .to_string(),
            });
        }

        payload
            .get("result")
            .cloned()
            .ok_or_else(|| EvmIndexerError::Internal("RPC response missing result".to_string()))
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.request_with_headers(method, params, &[]).await
    }
}
