//! Configuration management for `EvmIndexer`.
//!
//! This module provides a typed configuration system using the builder
//! pattern. Required fields are validated by `build()`; per-chain defaults
//! (log fetch span, finality depth) are derived from the chain id and RPC
//! endpoint when not set explicitly.

use std::path::PathBuf;

use alloy_json_abi::JsonAbi;
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::types::{LogFilter, TopicFilter};
use crate::utils::error::{EvmIndexerError, Result};

/// Chain ids of the Ethereum mainnet family (mainnet plus legacy and current
/// testnets), which use conservative log-fetch spans and PoS finality depth.
const ETHEREUM_CHAIN_IDS: [u64; 6] = [1, 3, 4, 5, 42, 11_155_111];
const OPTIMISM_CHAIN_IDS: [u64; 4] = [10, 69, 420, 11_155_420];
const ZORA_CHAIN_IDS: [u64; 2] = [7_777_777, 999];
const POLYGON_CHAIN_IDS: [u64; 2] = [137, 80_001];
const ARBITRUM_CHAIN_IDS: [u64; 2] = [42_161, 421_613];

/// Default `eth_getLogs` span for a chain.
///
/// Ethereum-family providers reject wide ranges, QuickNode caps at 10k,
/// everything else gets the permissive default. The historical sync lowers
/// the effective span further when a provider rejects a request.
#[must_use]
pub fn default_max_block_range(chain_id: u64, rpc_url: Option<&str>) -> u64 {
    if ETHEREUM_CHAIN_IDS.contains(&chain_id) {
        return 2_000;
    }
    if rpc_url.is_some_and(|url| url.contains("quiknode.pro")) {
        return 10_000;
    }
    50_000
}

/// Number of blocks below the head after which a block is considered final
/// and reorgs past it are treated as impossible.
#[must_use]
pub fn finality_block_count(chain_id: u64) -> u64 {
    if ETHEREUM_CHAIN_IDS.contains(&chain_id) {
        32
    } else if OPTIMISM_CHAIN_IDS.contains(&chain_id) || ZORA_CHAIN_IDS.contains(&chain_id) {
        5
    } else if POLYGON_CHAIN_IDS.contains(&chain_id) {
        100
    } else if ARBITRUM_CHAIN_IDS.contains(&chain_id) {
        40
    } else {
        5
    }
}

/// Backing database for the event store and the derived store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseConfig {
    /// SQLite database files created under `directory`.
    Sqlite { directory: PathBuf },
    /// A PostgreSQL server; both stores share the connection string.
    Postgres { connection_string: String },
}

/// Process role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Sync, event store, aggregator, and handler pipeline in one process.
    #[default]
    Standalone,
    /// Sync and event store only; events are served to remote watchers.
    Indexer,
    /// Handler pipeline and derived store only, driven by a remote indexer.
    Watcher,
}

/// Top-level runtime options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerOptions {
    /// Grace period before an unhealthy process fails its healthcheck.
    pub max_healthcheck_duration_secs: u64,
    pub mode: Mode,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            max_healthcheck_duration_secs: 240,
            mode: Mode::Standalone,
        }
    }
}

/// Retry/backoff policy shared by every RPC transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Ceiling on a single delay.
    pub max_backoff_ms: u64,
    /// Apply ±25 % jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_backoff_ms: 250,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30_000,
            jitter: true,
        }
    }
}

/// A network (chain) the indexer follows.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Unique across the process.
    pub name: String,
    pub chain_id: u64,
    /// Direct JSON-RPC endpoint. At least one of `rpc_url` / `indexer_url`
    /// is required.
    pub rpc_url: Option<String>,
    /// A peer indexer's GraphQL endpoint used as an RPC transport.
    pub indexer_url: Option<String>,
    /// Realtime head polling interval, milliseconds.
    pub polling_interval_ms: u64,
    /// Bound on concurrent RPC requests during historical sync.
    pub max_rpc_request_concurrency: usize,
    /// RPC methods gated behind payment vouchers; `None` disables the paid
    /// transport for this network.
    pub paid_rpc_methods: Option<Vec<String>>,
}

impl NetworkConfig {
    /// A network with required fields set and every option at its default.
    #[must_use]
    pub fn new(name: impl Into<String>, chain_id: u64) -> Self {
        Self {
            name: name.into(),
            chain_id,
            rpc_url: None,
            indexer_url: None,
            polling_interval_ms: 1_000,
            max_rpc_request_concurrency: 10,
            paid_rpc_methods: None,
        }
    }

    #[must_use]
    pub fn with_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_indexer_url(mut self, url: impl Into<String>) -> Self {
        self.indexer_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_polling_interval_ms(mut self, ms: u64) -> Self {
        self.polling_interval_ms = ms;
        self
    }

    #[must_use]
    pub fn with_max_rpc_request_concurrency(mut self, n: usize) -> Self {
        self.max_rpc_request_concurrency = n;
        self
    }
}

/// A named log filter over one network.
///
/// Either `event` (an ABI event name whose selector becomes the topic0
/// constraint) or an explicit `topics` matrix may be given; explicit topics
/// win when both are present.
#[derive(Debug, Clone)]
pub struct LogFilterConfig {
    /// Unique across the process.
    pub name: String,
    /// Name of the network this filter runs on.
    pub network: String,
    /// Contract ABI used to decode matching logs.
    pub abi: JsonAbi,
    /// Contract addresses to match; empty matches every address.
    pub addresses: Vec<Address>,
    /// ABI event name to restrict topic0 to.
    pub event: Option<String>,
    /// Explicit per-slot topic constraints.
    pub topics: Option<[TopicFilter; 4]>,
    pub start_block: u64,
    /// `None` follows the chain head (realtime).
    pub end_block: Option<u64>,
    /// Override for the derived per-chain default.
    pub max_block_range: Option<u64>,
}

impl LogFilterConfig {
    /// A filter with required fields set and every option at its default.
    #[must_use]
    pub fn new(name: impl Into<String>, network: impl Into<String>, abi: JsonAbi) -> Self {
        Self {
            name: name.into(),
            network: network.into(),
            abi,
            addresses: Vec::new(),
            event: None,
            topics: None,
            start_block: 0,
            end_block: None,
            max_block_range: None,
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: Address) -> Self {
        self.addresses.push(address);
        self
    }

    #[must_use]
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    #[must_use]
    pub fn with_topics(mut self, topics: [TopicFilter; 4]) -> Self {
        self.topics = Some(topics);
        self
    }

    #[must_use]
    pub fn with_start_block(mut self, block: u64) -> Self {
        self.start_block = block;
        self
    }

    #[must_use]
    pub fn with_end_block(mut self, block: u64) -> Self {
        self.end_block = Some(block);
        self
    }

    #[must_use]
    pub fn with_max_block_range(mut self, range: u64) -> Self {
        self.max_block_range = Some(range);
        self
    }

    /// Resolves this config against its network into the runtime
    /// [`LogFilter`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `event` names an event absent from the ABI.
    pub fn resolve(&self, network: &NetworkConfig) -> Result<LogFilter> {
        let topics = if let Some(topics) = &self.topics {
            topics.clone()
        } else if let Some(event_name) = &self.event {
            let selector = self
                .abi
                .events()
                .find(|e| &e.name == event_name)
                .map(alloy_json_abi::Event::selector)
                .ok_or_else(|| {
                    EvmIndexerError::Config(format!(
                        "Filter '{}': event '{event_name}' not found in ABI",
                        self.name
                    ))
                })?;
            [Some(vec![selector]), None, None, None]
        } else {
            [None, None, None, None]
        };
        Ok(LogFilter {
            name: self.name.clone(),
            chain_id: network.chain_id,
            addresses: if self.addresses.is_empty() {
                None
            } else {
                Some(self.addresses.clone())
            },
            topics,
            start_block: self.start_block,
            end_block: self.end_block,
            max_block_range: self.max_block_range.unwrap_or_else(|| {
                default_max_block_range(network.chain_id, network.rpc_url.as_deref())
            }),
        })
    }

    /// Event selectors named by this filter's ABI, for the decode registry.
    #[must_use]
    pub fn event_selectors(&self) -> Vec<(B256, alloy_json_abi::Event)> {
        self.abi
            .events()
            .map(|e| (e.selector(), e.clone()))
            .collect()
    }
}

/// Validated configuration for an `EvmIndexer` instance.
///
/// Construct through [`EvmIndexerConfigBuilder`].
#[derive(Debug, Clone)]
pub struct EvmIndexerConfig {
    pub database: DatabaseConfig,
    pub networks: Vec<NetworkConfig>,
    pub filters: Vec<LogFilterConfig>,
    pub options: IndexerOptions,
    pub retry: RetryConfig,
}

impl EvmIndexerConfig {
    /// The network a filter references. Validated at build time, so this
    /// only returns `None` for configs assembled by hand.
    #[must_use]
    pub fn network_for(&self, filter: &LogFilterConfig) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.name == filter.network)
    }
}

/// Builder for [`EvmIndexerConfig`].
///
/// # Example
///
/// ```no_run
/// use evm_indexer::config::{
///     EvmIndexerConfigBuilder, LogFilterConfig, NetworkConfig,
/// };
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let abi: alloy_json_abi::JsonAbi = serde_json::from_str(
///     r#"[{"type":"event","name":"Transfer","inputs":[
///         {"name":"from","type":"address","indexed":true},
///         {"name":"to","type":"address","indexed":true},
///         {"name":"value","type":"uint256","indexed":false}]}]"#,
/// )?;
/// let config = EvmIndexerConfigBuilder::new()
///     .with_sqlite_database(".evm-indexer")
///     .with_network(NetworkConfig::new("mainnet", 1).with_rpc_url("http://127.0.0.1:8545"))
///     .with_filter(
///         LogFilterConfig::new("erc20", "mainnet", abi)
///             .with_event("Transfer")
///             .with_start_block(17_000_000),
///     )
///     .build()?;
/// # let _ = config;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct EvmIndexerConfigBuilder {
    database: Option<DatabaseConfig>,
    networks: Vec<NetworkConfig>,
    filters: Vec<LogFilterConfig>,
    options: Option<IndexerOptions>,
    retry: Option<RetryConfig>,
}

impl EvmIndexerConfigBuilder {
    /// Creates a new configuration builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses SQLite database files under `directory`.
    #[must_use]
    pub fn with_sqlite_database(mut self, directory: impl Into<PathBuf>) -> Self {
        self.database = Some(DatabaseConfig::Sqlite {
            directory: directory.into(),
        });
        self
    }

    /// Uses a PostgreSQL server for both stores.
    #[must_use]
    pub fn with_postgres_database(mut self, connection_string: impl Into<String>) -> Self {
        self.database = Some(DatabaseConfig::Postgres {
            connection_string: connection_string.into(),
        });
        self
    }

    /// Adds a network.
    #[must_use]
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.networks.push(network);
        self
    }

    /// Adds a log filter.
    #[must_use]
    pub fn with_filter(mut self, filter: LogFilterConfig) -> Self {
        self.filters.push(filter);
        self
    }

    /// Sets the runtime options.
    #[must_use]
    pub fn with_options(mut self, options: IndexerOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Sets the process mode, keeping other options at their defaults.
    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        let mut options = self.options.take().unwrap_or_default();
        options.mode = mode;
        self.options = Some(options);
        self
    }

    /// Sets the RPC retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the database is missing, no network is
    /// configured, a network lacks both `rpc_url` and `indexer_url`, names
    /// collide, a filter references an unknown network, or a filter's event
    /// is absent from its ABI.
    pub fn build(self) -> Result<EvmIndexerConfig> {
        let database = self
            .database
            .ok_or_else(|| EvmIndexerError::Config("A database is required".to_string()))?;

        if self.networks.is_empty() {
            return Err(EvmIndexerError::Config(
                "At least one network is required".to_string(),
            ));
        }
        for (i, network) in self.networks.iter().enumerate() {
            if network.rpc_url.is_none() && network.indexer_url.is_none() {
                return Err(EvmIndexerError::Config(format!(
                    "Network '{}' needs an rpc_url or an indexer_url",
                    network.name
                )));
            }
            if self.networks[..i].iter().any(|n| n.name == network.name) {
                return Err(EvmIndexerError::Config(format!(
                    "Duplicate network name '{}'",
                    network.name
                )));
            }
        }
        for (i, filter) in self.filters.iter().enumerate() {
            if self.filters[..i].iter().any(|f| f.name == filter.name) {
                return Err(EvmIndexerError::Config(format!(
                    "Duplicate filter name '{}'",
                    filter.name
                )));
            }
            let network = self
                .networks
                .iter()
                .find(|n| n.name == filter.network)
                .ok_or_else(|| {
                    EvmIndexerError::Config(format!(
                        "Filter '{}' references unknown network '{}'",
                        filter.name, filter.network
                    ))
                })?;
            // Resolve eagerly so ABI/event mistakes fail at build time.
            filter.resolve(network)?;
        }

        Ok(EvmIndexerConfig {
            database,
            networks: self.networks,
            filters: self.filters,
            options: self.options.unwrap_or_default(),
            retry: self.retry.unwrap_or_default(),
        })
    }
}
