//! Paid transport: gates configured RPC methods behind payment vouchers.
//!
//! The payment-channel negotiation lifecycle lives in an external
//! collaborator behind [`PaymentProvider`]; this transport only acquires a
//! voucher per request and attaches it as an HTTP header. Failure to acquire
//! payment surfaces as an `RpcRequest` error.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::http::HttpRpcClient;
use super::RpcClient;
use crate::utils::error::{EvmIndexerError, Result};

/// Methods gated behind payment by default.
pub const DEFAULT_PAID_METHODS: [&str; 3] =
    ["eth_getLogs", "eth_getBlockByNumber", "eth_getBlockByHash"];

/// Header carrying the acquired voucher.
pub const PAYMENT_VOUCHER_HEADER: &str = "x-payment-voucher";

/// External payments collaborator.
///
/// `acquire_voucher` may suspend on channel negotiation; the transport
/// awaits it before issuing the RPC request.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Returns a voucher authorizing one paid `method` call.
    async fn acquire_voucher(&self, method: &str) -> Result<String>;
}

/// Direct HTTP transport that pays for configured methods.
pub struct PaidRpcClient {
    inner: HttpRpcClient,
    payments: Arc<dyn PaymentProvider>,
    paid_methods: HashSet<String>,
}

impl PaidRpcClient {
    /// Wraps `inner`, paying for the default method set.
    #[must_use]
    pub fn new(inner: HttpRpcClient, payments: Arc<dyn PaymentProvider>) -> Self {
        Self {
            inner,
            payments,
            paid_methods: DEFAULT_PAID_METHODS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Replaces the paid method set.
    #[must_use]
    pub fn with_paid_methods(mut self, methods: impl IntoIterator<Item = String>) -> Self {
        self.paid_methods = methods.into_iter().collect();
        self
    }
}

#[async_trait]
impl RpcClient for PaidRpcClient {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        if !self.paid_methods.contains(method) {
            return self.inner.request(method, params).await;
        }

        let voucher = self
            .payments
            .acquire_voucher(method)
            .await
            .map_err(|e| EvmIndexerError::RpcRequest {
                code: -32_000,
                message: format!("payment acquisition failed: {e}"),
            })?;

        self.inner
            .request_with_headers(method, params, &[(PAYMENT_VOUCHER_HEADER, voucher)])
            .await
    }
}
