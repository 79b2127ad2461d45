//! Configurable retry logic for transient RPC failures.
//!
//! This module provides:
//! - [`compute_backoff`] — exponential-backoff delay calculator with optional jitter.
//! - [`is_transient`] — classifies an [`EvmIndexerError`] as retryable or not.
//! - [`is_range_too_large`] — recognizes provider rejections of wide `eth_getLogs` spans.
//! - [`RetryingRpcClient`] — decorator that wraps any [`RpcClient`] with configurable retries.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;

use super::RpcClient;
use crate::config::RetryConfig;
use crate::utils::error::{EvmIndexerError, Result};

/// Computes the delay before the next retry.
///
/// `attempt` is 1-indexed: `attempt = 1` is the delay before the first retry.
///
/// Formula: `delay = initial_backoff_ms * backoff_multiplier^(attempt - 1)`,
/// capped at `max_backoff_ms`, then ±25 % jitter if enabled.
#[must_use]
pub fn compute_backoff(cfg: &RetryConfig, attempt: u32) -> Duration {
    let base = cfg.initial_backoff_ms as f64
        * cfg
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
    let capped = base.min(cfg.max_backoff_ms as f64);

    let ms = if cfg.jitter {
        // Pseudo-random jitter from the nanosecond clock; avoids a rand dep.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        // jitter factor in [0.75, 1.25]
        let factor = 0.75 + f64::from(nanos % 1_000_000) / 1_000_000.0 * 0.5;
        capped * factor
    } else {
        capped
    };

    Duration::from_millis(ms as u64)
}

/// Message fragments providers use when rejecting a log query whose block
/// span is too wide. Matched case-insensitively.
const RANGE_TOO_LARGE_FRAGMENTS: [&str; 5] = [
    "block range",
    "returned more than",
    "response size exceeded",
    "exceeds the range",
    "too many results",
];

/// Returns `true` if `err` is a provider rejection of a too-wide
/// `eth_getLogs` span. These are handled by range splitting, never by
/// blind retries.
#[must_use]
pub fn is_range_too_large(err: &EvmIndexerError) -> bool {
    match err {
        EvmIndexerError::RpcRequest { message, .. } => {
            let message = message.to_lowercase();
            RANGE_TOO_LARGE_FRAGMENTS
                .iter()
                .any(|fragment| message.contains(fragment))
        }
        _ => false,
    }
}

/// Returns `true` if `err` represents a transient failure that is safe to
/// retry.
///
/// | Error variant        | Retried | Reason                                  |
/// |----------------------|---------|-----------------------------------------|
/// | `HttpRequest`        | ✅      | Network blip or HTTP 429 / 503          |
/// | `Timeout`            | ✅      | Slow or overloaded provider             |
/// | `Internal`           | ✅      | tokio task join noise                   |
/// | `RpcRequest` (429)   | ✅      | Provider-side rate limiting             |
/// | `RpcRequest` (other) | ❌      | The server answered; splitting or config|
/// | `Database`           | ❌      | Schema / constraint problems are stable |
/// | `Decoding`           | ❌      | Bad data will not self-heal             |
/// | `Config`             | ❌      | Programmer error                        |
/// | `RetryExhausted`     | ❌      | Already exhausted                       |
#[must_use]
pub fn is_transient(err: &EvmIndexerError) -> bool {
    if is_range_too_large(err) {
        return false;
    }
    matches!(
        err,
        EvmIndexerError::HttpRequest(_)
            | EvmIndexerError::Timeout(_)
            | EvmIndexerError::Internal(_)
            | EvmIndexerError::RpcRequest { code: 429, .. }
    )
}

/// A decorator that wraps any [`RpcClient`] with configurable retry logic.
///
/// On each request, a transient error triggers an exponentially increasing
/// sleep (with optional jitter) and a transparent retry, up to
/// `config.max_retries` times. Permanent errors are returned immediately.
pub struct RetryingRpcClient<P> {
    inner: P,
    config: RetryConfig,
}

impl<P: RpcClient> RetryingRpcClient<P> {
    /// Wraps `inner` with the given retry `config`.
    pub fn new(inner: P, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<P: RpcClient> RpcClient for RetryingRpcClient<P> {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let mut last_err: Option<EvmIndexerError> = None;
        let mut attempt = 0u32;

        loop {
            match self.inner.request(method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !is_transient(&err) {
                        return Err(err);
                    }

                    attempt += 1;

                    let delay = compute_backoff(&self.config, attempt);
                    tracing::warn!(
                        method,
                        attempt,
                        max = self.config.max_retries,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Transient RPC error — retrying"
                    );

                    last_err = Some(err);

                    if attempt > self.config.max_retries {
                        break;
                    }

                    sleep(delay).await;
                }
            }
        }

        Err(EvmIndexerError::RetryExhausted {
            attempts: attempt,
            last_error: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter_cfg(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1, // keep tests fast
            backoff_multiplier: 2.0,
            max_backoff_ms: 100,
            jitter: false,
        }
    }

    #[test]
    fn test_compute_backoff_increases() {
        let cfg = no_jitter_cfg(5);
        let d1 = compute_backoff(&cfg, 1);
        let d2 = compute_backoff(&cfg, 2);
        let d3 = compute_backoff(&cfg, 3);
        assert!(d1 < d2, "backoff should grow: {d1:?} < {d2:?}");
        assert!(d2 < d3, "backoff should grow: {d2:?} < {d3:?}");
    }

    #[test]
    fn test_compute_backoff_capped() {
        let cfg = RetryConfig {
            max_backoff_ms: 500,
            initial_backoff_ms: 100,
            backoff_multiplier: 10.0,
            jitter: false,
            ..RetryConfig::default()
        };
        // attempt 4 → 100 * 10^3 = 100_000 ms → capped at 500
        let d = compute_backoff(&cfg, 4);
        assert_eq!(d.as_millis(), 500, "delay should be capped");
    }

    #[test]
    fn test_is_transient_classification() {
        assert!(is_transient(&EvmIndexerError::Timeout(
            Duration::from_secs(1)
        )));
        assert!(is_transient(&EvmIndexerError::Internal("join".into())));
        assert!(is_transient(&EvmIndexerError::RpcRequest {
            code: 429,
            message: "rate limited".into()
        }));
        assert!(!is_transient(&EvmIndexerError::Decoding("bad".into())));
        assert!(!is_transient(&EvmIndexerError::Config("missing".into())));
        assert!(!is_transient(&EvmIndexerError::RpcRequest {
            code: -32_602,
            message: "invalid params".into()
        }));
    }

    #[test]
    fn test_range_too_large_not_transient() {
        let err = EvmIndexerError::RpcRequest {
            code: -32_005,
            message: "query returned more than 10000 results".into(),
        };
        assert!(is_range_too_large(&err));
        assert!(!is_transient(&err));

        let err = EvmIndexerError::RpcRequest {
            code: -32_000,
            message: "Block range is too large".into(),
        };
        assert!(is_range_too_large(&err));
    }

    struct MockClient {
        fail_count: u32,
        calls: Arc<AtomicU32>,
        permanent: bool,
    }

    #[async_trait]
    impl RpcClient for MockClient {
        async fn request(&self, _method: &str, _params: Value) -> Result<Value> {
            let call_no = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.permanent {
                Err(EvmIndexerError::Decoding("permanent".into()))
            } else if call_no <= self.fail_count {
                Err(EvmIndexerError::Timeout(Duration::from_millis(1)))
            } else {
                Ok(json!("0x1"))
            }
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let mock = MockClient {
            fail_count: 2,
            calls: calls.clone(),
            permanent: false,
        };
        let retrying = RetryingRpcClient::new(mock, no_jitter_cfg(5));
        let result = retrying.request("eth_blockNumber", json!([])).await;

        assert!(result.is_ok(), "should eventually succeed: {result:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 3, "should have called 3 times");
    }

    #[tokio::test]
    async fn test_retry_permanent_error_no_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let mock = MockClient {
            fail_count: 99,
            calls: calls.clone(),
            permanent: true,
        };
        let retrying = RetryingRpcClient::new(mock, no_jitter_cfg(5));
        let result = retrying.request("eth_blockNumber", json!([])).await;

        assert!(result.is_err(), "should fail immediately");
        assert_eq!(
            calls.load(Ordering::SeqCst),
            1,
            "permanent error should not be retried"
        );
    }

    #[tokio::test]
    async fn test_retry_exhausts_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let max = 3u32;
        let mock = MockClient {
            fail_count: 999,
            calls: calls.clone(),
            permanent: false,
        };
        let retrying = RetryingRpcClient::new(mock, no_jitter_cfg(max));
        let result = retrying.request("eth_blockNumber", json!([])).await;

        assert!(
            matches!(result, Err(EvmIndexerError::RetryExhausted { .. })),
            "should return RetryExhausted"
        );
        assert_eq!(
            calls.load(Ordering::SeqCst),
            max + 1,
            "should have called max_retries+1 times total"
        );
    }
}
