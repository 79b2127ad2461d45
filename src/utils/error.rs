//! Error types for `EvmIndexer` operations.
//!
//! This module defines the crate-wide error enumeration using `thiserror`.
//! The variants map onto the failure policies the indexer applies: transient
//! RPC failures are retried, decode failures are logged and skipped, handler
//! failures halt the pipeline pending a reset, and invariant violations are
//! fatal and initiate shutdown.

use std::time::Duration;
use thiserror::Error;

/// Custom error type for `EvmIndexer` operations.
#[derive(Debug, Error)]
pub enum EvmIndexerError {
    /// Errors encountered during event-store or derived-store operations.
    ///
    /// Wraps `sqlx::Error` via `#[from]` so store code can propagate with `?`.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Transport-level HTTP failure (connection refused, DNS, TLS, malformed
    /// response body). Retryable.
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// The RPC server answered with a JSON-RPC error object.
    ///
    /// Not retried blindly: the historical sync inspects the message for
    /// range-too-large rejections and splits the offending block range
    /// instead.
    #[error("RPC request error (code {code}): {message}")]
    RpcRequest {
        /// JSON-RPC error code reported by the provider.
        code: i64,
        /// JSON-RPC error message reported by the provider.
        message: String,
    },

    /// An RPC request did not complete within the configured timeout.
    #[error("RPC request timed out after {0:?}")]
    Timeout(Duration),

    /// A retrying transport exhausted its attempt budget.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Total attempts made (initial call + retries).
        attempts: u32,
        /// Stringified final error.
        last_error: String,
    },

    /// Errors decoding a log against the registered ABI events.
    ///
    /// Never fatal: the offending log is reported and skipped.
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// A user handler returned an error.
    ///
    /// The pipeline halts at its current watermark pending a reset.
    #[error("Handler error in {filter_name}.{event_name}: {message}")]
    Handler {
        /// Log filter whose event was being handled.
        filter_name: String,
        /// ABI event name.
        event_name: String,
        /// Stringified handler failure.
        message: String,
    },

    /// A state the design assumes impossible was observed (log→transaction
    /// join miss, reorg deeper than the finality window). Fatal.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Invalid or incomplete configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization failure on the wire or in entity documents.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for unexpected failures (task join noise, channel teardown).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Type alias for Results using `EvmIndexerError`.
pub type Result<T> = std::result::Result<T, EvmIndexerError>;
