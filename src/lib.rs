//! `EvmIndexer` - an embeddable event-indexing core for EVM chains.
//!
//! `EvmIndexer` ingests event logs from one or more networks, persists them
//! in a canonical event store, folds per-network progress into a single
//! ordered cross-network event stream, and drives user-supplied handlers
//! that write into a transactional derived store.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use evm_indexer::{
//!     DecodedLogEvent, EvmIndexer, EvmIndexerConfigBuilder, HandlerContext,
//!     LogEventHandler, LogFilterConfig, NetworkConfig, Result,
//! };
//!
//! struct TransferHandler;
//!
//! #[async_trait]
//! impl LogEventHandler for TransferHandler {
//!     async fn handle(&self, event: &DecodedLogEvent, ctx: &HandlerContext<'_>) -> Result<()> {
//!         let id = event.log.address.to_string();
//!         ctx.entities.set("Account", &id, serde_json::json!({ "seen": true }));
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let abi: alloy_json_abi::JsonAbi = serde_json::from_str(
//!         r#"[{"type":"event","name":"Transfer","inputs":[
//!             {"name":"from","type":"address","indexed":true},
//!             {"name":"to","type":"address","indexed":true},
//!             {"name":"value","type":"uint256","indexed":false}]}]"#,
//!     )?;
//!     let config = EvmIndexerConfigBuilder::new()
//!         .with_sqlite_database(".evm-indexer")
//!         .with_network(NetworkConfig::new("mainnet", 1).with_rpc_url("http://127.0.0.1:8545"))
//!         .with_filter(
//!             LogFilterConfig::new("erc20", "mainnet", abi)
//!                 .with_event("Transfer")
//!                 .with_start_block(17_000_000),
//!         )
//!         .build()?;
//!
//!     let mut indexer = EvmIndexer::new(config).await?;
//!     indexer.register_handler("erc20", "Transfer", Arc::new(TransferHandler));
//!     indexer.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! 1. **Historical sync** - bounded backfill over uncached block ranges,
//!    with dynamic range partitioning and a cached-range index
//! 2. **Realtime sync** - head tailing, shallow-reorg recovery, finality
//!    tracking
//! 3. **Event aggregator** - per-network checkpoints folded into one
//!    monotone global checkpoint and an ordered event stream
//! 4. **Handler pipeline** - user handlers applied page by page against the
//!    versioned derived store, with reorg rollback and hot reload

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

// Public API exports
pub use self::abi::{AbiEventRegistry, DecodedLog, DecodedParam};
pub use self::config::{
    DatabaseConfig, EvmIndexerConfig, EvmIndexerConfigBuilder, IndexerOptions, LogFilterConfig,
    Mode, NetworkConfig, RetryConfig,
};
pub use self::core::aggregator::{
    DecodedEventPage, DecodedLogEvent, EventAggregator, EventSource, IncludeSelectors,
};
pub use self::core::historical::HistoricalSyncService;
pub use self::core::indexer::EvmIndexer;
pub use self::core::pipeline::{
    ContractReader, EntityView, HandlerContext, HandlerPipeline, HandlerRegistry, LogEventHandler,
    PipelineHandle, PipelineState,
};
pub use self::core::realtime::{RealtimeSyncService, SetupOutcome};
pub use self::rpc::{
    BlockNumberOrTag, GetLogsSelection, HttpRpcClient, PaidRpcClient, PaymentProvider,
    RemoteIndexerRpcClient, RetryingRpcClient, RpcClient,
};
pub use self::storage::{
    DerivedStore, EntityOp, EventCount, EventStore, GetLogEventsRequest, LogEvent, LogEventPage,
    PageMetadata, PostgresDerivedStore, PostgresEventStore, SqliteDerivedStore, SqliteEventStore,
};
pub use self::telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use self::types::events::{AggregatorEvent, SyncEvent};
pub use self::types::{Block, CachedRange, Cursor, Log, LogFilter, Transaction, TransactionKind};
pub use self::utils::error::{EvmIndexerError, Result};

// Module declarations
pub mod abi;
pub mod config;
pub mod core;
pub mod rpc;
pub mod storage;
pub mod telemetry;
pub mod types;
pub mod utils;
