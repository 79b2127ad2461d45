//! Main orchestrator that wires stores, RPC stacks, sync services, the
//! aggregator, and the handler pipeline according to the configured mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::aggregator::{EventAggregator, EventSource};
use super::historical::HistoricalSyncService;
use super::pipeline::{ContractReader, HandlerPipeline, HandlerRegistry, LogEventHandler, PipelineHandle};
use super::realtime::RealtimeSyncService;
use crate::abi::AbiEventRegistry;
use crate::config::{finality_block_count, DatabaseConfig, EvmIndexerConfig, Mode};
use crate::rpc::{
    HttpRpcClient, PaidRpcClient, PaymentProvider, RemoteIndexerRpcClient, RetryingRpcClient,
    RpcClient,
};
use crate::storage::{
    DerivedStore, EventStore, PostgresDerivedStore, PostgresEventStore, SqliteDerivedStore,
    SqliteEventStore,
};
use crate::types::events::AggregatorEvent;
use crate::types::LogFilter;
use crate::utils::error::{EvmIndexerError, Result};

struct NetworkRuntime {
    chain_id: u64,
    name: String,
    rpc: Arc<dyn RpcClient>,
    filters: Vec<LogFilter>,
    polling_interval: Duration,
    max_rpc_request_concurrency: usize,
}

/// The indexer process: owns the stores and every running component.
///
/// # Example
///
/// ```no_run
/// use evm_indexer::{EvmIndexer, EvmIndexerConfigBuilder, NetworkConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = EvmIndexerConfigBuilder::new()
///     .with_sqlite_database(".evm-indexer")
///     .with_network(NetworkConfig::new("mainnet", 1).with_rpc_url("http://127.0.0.1:8545"))
///     .build()?;
///
/// let mut indexer = EvmIndexer::new(config).await?;
/// // indexer.register_handler("erc20", "Transfer", my_handler);
/// indexer.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct EvmIndexer {
    config: EvmIndexerConfig,
    event_store: Arc<dyn EventStore>,
    derived_store: Arc<dyn DerivedStore>,
    abi: Arc<AbiEventRegistry>,
    registry: Option<HandlerRegistry>,
    payments: Option<Arc<dyn PaymentProvider>>,
    external_source: Option<(Arc<dyn EventSource>, mpsc::Receiver<AggregatorEvent>)>,
    pipeline_handle: Option<PipelineHandle>,
    cancel_aggregator: CancellationToken,
    cancel_pipeline: CancellationToken,
    cancel_realtime: CancellationToken,
    cancel_historical: CancellationToken,
    aggregator_task: Option<JoinHandle<()>>,
    pipeline_task: Option<JoinHandle<()>>,
    realtime_tasks: Vec<JoinHandle<()>>,
    historical_tasks: Vec<JoinHandle<()>>,
}

impl EvmIndexer {
    /// Connects and migrates the stores and prepares the ABI registry.
    pub async fn new(config: EvmIndexerConfig) -> Result<Self> {
        let (event_store, derived_store): (Arc<dyn EventStore>, Arc<dyn DerivedStore>) =
            match &config.database {
                DatabaseConfig::Sqlite { directory } => (
                    Arc::new(SqliteEventStore::open(directory).await?),
                    Arc::new(SqliteDerivedStore::open(directory).await?),
                ),
                DatabaseConfig::Postgres { connection_string } => (
                    Arc::new(PostgresEventStore::connect(connection_string).await?),
                    Arc::new(PostgresDerivedStore::connect(connection_string).await?),
                ),
            };
        event_store.migrate().await?;
        derived_store.migrate().await?;

        let mut abi = AbiEventRegistry::new();
        for filter in &config.filters {
            abi.register_filter(filter.name.clone(), filter.event_selectors());
        }

        Ok(Self {
            config,
            event_store,
            derived_store,
            abi: Arc::new(abi),
            registry: Some(HandlerRegistry::new()),
            payments: None,
            external_source: None,
            pipeline_handle: None,
            cancel_aggregator: CancellationToken::new(),
            cancel_pipeline: CancellationToken::new(),
            cancel_realtime: CancellationToken::new(),
            cancel_historical: CancellationToken::new(),
            aggregator_task: None,
            pipeline_task: None,
            realtime_tasks: Vec::new(),
            historical_tasks: Vec::new(),
        })
    }

    /// Installs the payments collaborator used by networks that configure
    /// paid RPC methods.
    pub fn set_payment_provider(&mut self, payments: Arc<dyn PaymentProvider>) {
        self.payments = Some(payments);
    }

    /// Supplies the event source a `Watcher` process pulls from, together
    /// with its control-event channel.
    pub fn set_event_source(
        &mut self,
        source: Arc<dyn EventSource>,
        events: mpsc::Receiver<AggregatorEvent>,
    ) {
        self.external_source = Some((source, events));
    }

    /// Registers a user handler for `(filter_name, event_name)`.
    pub fn register_handler(
        &mut self,
        filter_name: impl Into<String>,
        event_name: impl Into<String>,
        handler: Arc<dyn LogEventHandler>,
    ) {
        self.registry
            .get_or_insert_with(HandlerRegistry::new)
            .register(filter_name, event_name, handler);
    }

    /// Observer/controller for the running pipeline; present after `start`
    /// in `Standalone` and `Watcher` modes.
    #[must_use]
    pub fn pipeline(&self) -> Option<&PipelineHandle> {
        self.pipeline_handle.as_ref()
    }

    /// The canonical event store handle.
    #[must_use]
    pub fn event_store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.event_store)
    }

    /// The derived entity store handle.
    #[must_use]
    pub fn derived_store(&self) -> Arc<dyn DerivedStore> {
        Arc::clone(&self.derived_store)
    }

    fn build_rpc(&self, network: &crate::config::NetworkConfig) -> Result<Arc<dyn RpcClient>> {
        let retry = self.config.retry.clone();
        if let Some(rpc_url) = &network.rpc_url {
            let http = HttpRpcClient::new(rpc_url.clone());
            if let Some(methods) = &network.paid_rpc_methods {
                let payments = self.payments.clone().ok_or_else(|| {
                    EvmIndexerError::Config(format!(
                        "Network '{}' configures paid RPC methods but no payment provider is set",
                        network.name
                    ))
                })?;
                let paid = PaidRpcClient::new(http, payments)
                    .with_paid_methods(methods.iter().cloned());
                Ok(Arc::new(RetryingRpcClient::new(paid, retry)))
            } else {
                Ok(Arc::new(RetryingRpcClient::new(http, retry)))
            }
        } else if let Some(indexer_url) = &network.indexer_url {
            let remote = RemoteIndexerRpcClient::new(indexer_url.clone());
            Ok(Arc::new(RetryingRpcClient::new(remote, retry)))
        } else {
            Err(EvmIndexerError::Config(format!(
                "Network '{}' has no endpoint",
                network.name
            )))
        }
    }

    fn resolve_networks(&self) -> Result<Vec<NetworkRuntime>> {
        let mut runtimes = Vec::with_capacity(self.config.networks.len());
        for network in &self.config.networks {
            let mut filters = Vec::new();
            for filter in self.config.filters.iter().filter(|f| f.network == network.name) {
                filters.push(filter.resolve(network)?);
            }
            runtimes.push(NetworkRuntime {
                chain_id: network.chain_id,
                name: network.name.clone(),
                rpc: self.build_rpc(network)?,
                filters,
                polling_interval: Duration::from_millis(network.polling_interval_ms),
                max_rpc_request_concurrency: network.max_rpc_request_concurrency,
            });
        }
        Ok(runtimes)
    }

    /// Starts every component for the configured mode and returns once they
    /// are running.
    pub async fn start(&mut self) -> Result<()> {
        let mode = self.config.options.mode;
        tracing::info!(?mode, networks = self.config.networks.len(), "Starting indexer");

        let networks = match mode {
            Mode::Standalone | Mode::Indexer => self.resolve_networks()?,
            Mode::Watcher => Vec::new(),
        };
        let rpc_by_chain: HashMap<u64, Arc<dyn RpcClient>> = networks
            .iter()
            .map(|n| (n.chain_id, Arc::clone(&n.rpc)))
            .collect();

        // Sync side: aggregator consuming one sync-event channel, fed by
        // every network's services.
        let mut local_events: Option<mpsc::Receiver<AggregatorEvent>> = None;
        let mut local_source: Option<Arc<dyn EventSource>> = None;
        if matches!(mode, Mode::Standalone | Mode::Indexer) {
            let (sync_tx, sync_rx) = mpsc::channel(1_024);
            let (agg_tx, agg_rx) = mpsc::channel(1_024);
            let chain_ids: Vec<u64> = networks.iter().map(|n| n.chain_id).collect();
            let all_filters: Vec<LogFilter> =
                networks.iter().flat_map(|n| n.filters.clone()).collect();
            let aggregator = Arc::new(EventAggregator::new(
                Arc::clone(&self.event_store),
                all_filters,
                Arc::clone(&self.abi),
                &chain_ids,
                agg_tx,
            ));
            {
                let aggregator = Arc::clone(&aggregator);
                let cancel = self.cancel_aggregator.clone();
                self.aggregator_task = Some(tokio::spawn(async move {
                    aggregator.run(sync_rx, cancel).await;
                }));
            }
            local_source = Some(aggregator);
            local_events = Some(agg_rx);

            for network in networks {
                let mut realtime = RealtimeSyncService::new(
                    network.chain_id,
                    Arc::clone(&network.rpc),
                    Arc::clone(&self.event_store),
                    &network.filters,
                    finality_block_count(network.chain_id),
                    network.polling_interval,
                    sync_tx.clone(),
                    self.cancel_realtime.child_token(),
                );
                let setup = realtime.setup().await?;
                let network_name = network.name.clone();
                self.realtime_tasks.push(tokio::spawn(async move {
                    if let Err(err) = realtime.start().await {
                        tracing::error!(network = %network_name, error = %err, "Realtime sync failed");
                    }
                }));

                let historical = HistoricalSyncService::new(
                    network.chain_id,
                    Arc::clone(&network.rpc),
                    Arc::clone(&self.event_store),
                    network.filters.clone(),
                    network.max_rpc_request_concurrency,
                    sync_tx.clone(),
                    self.cancel_historical.child_token(),
                );
                let network_name = network.name;
                self.historical_tasks.push(tokio::spawn(async move {
                    if let Err(err) = historical.run(setup.finalized_block_number).await {
                        tracing::error!(network = %network_name, error = %err, "Historical sync failed");
                    }
                }));
            }
        }

        // Handler side.
        match mode {
            Mode::Indexer => {
                // No pipeline; drain the control events the (out-of-scope)
                // GraphQL subscription server would consume.
                let mut events = local_events.expect("indexer mode has a local aggregator");
                self.pipeline_task = Some(tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        tracing::debug!(?event, "Aggregator event");
                    }
                }));
            }
            Mode::Standalone | Mode::Watcher => {
                let (source, events) = if mode == Mode::Watcher {
                    self.external_source.take().ok_or_else(|| {
                        EvmIndexerError::Config(
                            "Watcher mode requires an event source (see set_event_source)"
                                .to_string(),
                        )
                    })?
                } else {
                    (
                        local_source.expect("standalone mode has a local aggregator"),
                        local_events.expect("standalone mode has a local aggregator"),
                    )
                };
                let contracts = Arc::new(ContractReader::new(
                    Arc::clone(&self.event_store),
                    rpc_by_chain,
                ));
                let registry = self.registry.take().unwrap_or_default();
                let pipeline = HandlerPipeline::new(
                    source,
                    Arc::clone(&self.derived_store),
                    contracts,
                    Arc::clone(&self.abi),
                    registry,
                    self.cancel_pipeline.child_token(),
                );
                self.pipeline_handle = Some(pipeline.handle());
                self.pipeline_task = Some(tokio::spawn(async move {
                    if let Err(err) = pipeline.run(events).await {
                        tracing::error!(error = %err, "Handler pipeline failed");
                    }
                }));
            }
        }

        Ok(())
    }

    /// Shuts every component down: aggregator intake first, then the
    /// pipeline (which finishes its current page), then realtime polling,
    /// then outstanding historical tasks.
    pub async fn kill(&mut self) {
        tracing::info!("Shutting down indexer");
        self.cancel_aggregator.cancel();
        if let Some(task) = self.aggregator_task.take() {
            let _ = task.await;
        }
        self.cancel_pipeline.cancel();
        if let Some(task) = self.pipeline_task.take() {
            let _ = task.await;
        }
        self.cancel_realtime.cancel();
        for task in self.realtime_tasks.drain(..) {
            let _ = task.await;
        }
        self.cancel_historical.cancel();
        for task in self.historical_tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!("Indexer stopped");
    }
}
