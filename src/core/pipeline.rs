//! Handler pipeline: applies user handlers over the ordered event stream
//! against the derived store.
//!
//! `to_timestamp` is the watermark through which events have been applied.
//! Pages commit atomically: handler writes are buffered in an [`EntityView`]
//! and flushed in one derived-store transaction when the page succeeds; a
//! handler error drops the buffer, records a user-visible error, and halts
//! the pipeline at its current watermark pending a reset. A reorg reverts
//! the derived store to the common ancestor and clamps the watermark before
//! any later event is processed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::aggregator::{DecodedLogEvent, EventSource, IncludeSelectors};
use crate::abi::AbiEventRegistry;
use crate::rpc::RpcClient;
use crate::storage::{DerivedStore, EntityOp, EventStore};
use crate::types::events::AggregatorEvent;
use crate::utils::error::{EvmIndexerError, Result};

const DEFAULT_PAGE_SIZE: usize = 1_000;

/// User-supplied event handler, keyed on `(filter_name, event_name)`.
#[async_trait]
pub trait LogEventHandler: Send + Sync {
    /// Called once per decoded event, in stream order.
    async fn handle(&self, event: &DecodedLogEvent, ctx: &HandlerContext<'_>) -> Result<()>;
}

/// Handler registry mapping `(filter_name, event_name)` to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn LogEventHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `event_name` events of `filter_name`.
    pub fn register(
        &mut self,
        filter_name: impl Into<String>,
        event_name: impl Into<String>,
        handler: Arc<dyn LogEventHandler>,
    ) {
        self.handlers
            .insert((filter_name.into(), event_name.into()), handler);
    }

    #[must_use]
    pub fn get(&self, filter_name: &str, event_name: &str) -> Option<&Arc<dyn LogEventHandler>> {
        self.handlers
            .get(&(filter_name.to_string(), event_name.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Per-filter selectors this registry handles, for the event source's
    /// decode restriction.
    #[must_use]
    pub fn include_selectors(&self, abi: &AbiEventRegistry) -> IncludeSelectors {
        let mut include: IncludeSelectors = HashMap::new();
        for (filter_name, event_name) in self.handlers.keys() {
            if let Some(selector) = abi.selector_for(filter_name, event_name) {
                include.entry(filter_name.clone()).or_default().insert(selector);
            } else {
                tracing::warn!(
                    filter = %filter_name,
                    event = %event_name,
                    "Handler registered for an event absent from the filter ABI"
                );
            }
        }
        include
    }
}

struct ViewState {
    ops: Vec<EntityOp>,
    overlay: HashMap<(String, String), Option<serde_json::Value>>,
}

/// Per-page transactional view over the derived store.
///
/// Writes are buffered and applied in one transaction when the page commits;
/// reads see the buffer first so a handler observes its own writes.
pub struct EntityView<'a> {
    store: &'a dyn DerivedStore,
    timestamp: AtomicU64,
    state: Mutex<ViewState>,
}

impl<'a> EntityView<'a> {
    pub(crate) fn new(store: &'a dyn DerivedStore) -> Self {
        Self {
            store,
            timestamp: AtomicU64::new(0),
            state: Mutex::new(ViewState {
                ops: Vec::new(),
                overlay: HashMap::new(),
            }),
        }
    }

    /// Stamps subsequent writes with the current event's block timestamp.
    pub(crate) fn set_timestamp(&self, timestamp: u64) {
        self.timestamp.store(timestamp, Ordering::SeqCst);
    }

    pub(crate) fn take_ops(&self) -> Vec<EntityOp> {
        std::mem::take(&mut self.state.lock().expect("entity view poisoned").ops)
    }

    /// The entity as this page sees it: buffered writes first, then the
    /// live row in the store.
    pub async fn get(&self, entity: &str, id: &str) -> Result<Option<serde_json::Value>> {
        {
            let state = self.state.lock().expect("entity view poisoned");
            if let Some(buffered) = state.overlay.get(&(entity.to_string(), id.to_string())) {
                return Ok(buffered.clone());
            }
        }
        self.store.find(entity, id).await
    }

    /// Creates or replaces the entity at the current event's timestamp.
    pub fn set(&self, entity: &str, id: &str, data: serde_json::Value) {
        let timestamp = self.timestamp.load(Ordering::SeqCst);
        let mut state = self.state.lock().expect("entity view poisoned");
        state
            .overlay
            .insert((entity.to_string(), id.to_string()), Some(data.clone()));
        state.ops.push(EntityOp::Upsert {
            entity: entity.to_string(),
            id: id.to_string(),
            data,
            timestamp,
        });
    }

    /// Deletes the entity at the current event's timestamp.
    pub fn delete(&self, entity: &str, id: &str) {
        let timestamp = self.timestamp.load(Ordering::SeqCst);
        let mut state = self.state.lock().expect("entity view poisoned");
        state
            .overlay
            .insert((entity.to_string(), id.to_string()), None);
        state.ops.push(EntityOp::Delete {
            entity: entity.to_string(),
            id: id.to_string(),
            timestamp,
        });
    }
}

/// Read-only contract access backed by the contract-read-result cache with
/// an `eth_call` fallback.
pub struct ContractReader {
    store: Arc<dyn EventStore>,
    rpc_by_chain: HashMap<u64, Arc<dyn RpcClient>>,
}

impl ContractReader {
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, rpc_by_chain: HashMap<u64, Arc<dyn RpcClient>>) -> Self {
        Self { store, rpc_by_chain }
    }

    /// Calls `address` with `calldata` at `block_number`, keyed on
    /// `(chain_id, address, block_number, calldata)` in the immutable cache.
    pub async fn read(
        &self,
        chain_id: u64,
        address: Address,
        block_number: u64,
        calldata: Bytes,
    ) -> Result<Bytes> {
        if let Some(cached) = self
            .store
            .get_contract_read_result(chain_id, address, block_number, &calldata)
            .await?
        {
            return Ok(cached);
        }
        let rpc = self.rpc_by_chain.get(&chain_id).ok_or_else(|| {
            EvmIndexerError::Config(format!("no RPC client configured for chain {chain_id}"))
        })?;
        let result = rpc.call(address, &calldata, block_number).await?;
        self.store
            .insert_contract_read_result(chain_id, address, block_number, &calldata, &result)
            .await?;
        Ok(result)
    }
}

/// Views a handler receives alongside the decoded event.
pub struct HandlerContext<'a> {
    pub entities: &'a EntityView<'a>,
    pub contracts: &'a ContractReader,
}

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Processing,
    Reorging,
    Stopped,
}

/// Out-of-band pipeline commands.
pub enum PipelineCommand {
    /// Hot reload: empty the derived store, swap the handler registry, and
    /// reprocess from scratch.
    Reset { handlers: HandlerRegistry },
}

/// Cloneable observer/controller for a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    healthy: Arc<AtomicBool>,
    user_error: Arc<Mutex<Option<String>>>,
    state: Arc<Mutex<PipelineState>>,
    processed: watch::Receiver<u64>,
    commands: mpsc::Sender<PipelineCommand>,
}

impl PipelineHandle {
    /// Whether the watermark has caught up with the completed backfill.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// The halting user error, if a handler failed.
    #[must_use]
    pub fn user_error(&self) -> Option<String> {
        self.user_error.lock().expect("pipeline state poisoned").clone()
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        *self.state.lock().expect("pipeline state poisoned")
    }

    /// Watermark through which events have been applied.
    #[must_use]
    pub fn processed_through(&self) -> u64 {
        *self.processed.borrow()
    }

    /// Requests a hot reload with a new handler registry.
    pub async fn reset(&self, handlers: HandlerRegistry) -> Result<()> {
        self.commands
            .send(PipelineCommand::Reset { handlers })
            .await
            .map_err(|_| EvmIndexerError::Internal("pipeline is gone".to_string()))
    }
}

/// Applies user handlers over the ordered event stream.
pub struct HandlerPipeline {
    source: Arc<dyn EventSource>,
    derived: Arc<dyn DerivedStore>,
    contracts: Arc<ContractReader>,
    abi: Arc<AbiEventRegistry>,
    registry: HandlerRegistry,
    include: IncludeSelectors,
    to_timestamp: u64,
    page_size: usize,
    healthy: Arc<AtomicBool>,
    user_error: Arc<Mutex<Option<String>>>,
    state: Arc<Mutex<PipelineState>>,
    processed_tx: watch::Sender<u64>,
    commands: Option<mpsc::Receiver<PipelineCommand>>,
    commands_tx: mpsc::Sender<PipelineCommand>,
    cancel: CancellationToken,
}

impl HandlerPipeline {
    #[must_use]
    pub fn new(
        source: Arc<dyn EventSource>,
        derived: Arc<dyn DerivedStore>,
        contracts: Arc<ContractReader>,
        abi: Arc<AbiEventRegistry>,
        registry: HandlerRegistry,
        cancel: CancellationToken,
    ) -> Self {
        let include = registry.include_selectors(&abi);
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (processed_tx, _) = watch::channel(0);
        Self {
            source,
            derived,
            contracts,
            abi,
            registry,
            include,
            to_timestamp: 0,
            page_size: DEFAULT_PAGE_SIZE,
            healthy: Arc::new(AtomicBool::new(false)),
            user_error: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(PipelineState::Idle)),
            processed_tx,
            commands: Some(commands_rx),
            commands_tx,
            cancel,
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// An observer/controller handle; create before calling `run`.
    #[must_use]
    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            healthy: Arc::clone(&self.healthy),
            user_error: Arc::clone(&self.user_error),
            state: Arc::clone(&self.state),
            processed: self.processed_tx.subscribe(),
            commands: self.commands_tx.clone(),
        }
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock().expect("pipeline state poisoned") = state;
    }

    /// Consumes aggregator events until cancelled or the source fails
    /// fatally.
    pub async fn run(mut self, mut events: mpsc::Receiver<AggregatorEvent>) -> Result<()> {
        let mut commands = self
            .commands
            .take()
            .expect("pipeline run called twice");
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.set_state(PipelineState::Stopped);
                    tracing::info!("Handler pipeline stopping");
                    return Ok(());
                }
                command = commands.recv() => {
                    if let Some(PipelineCommand::Reset { handlers }) = command {
                        self.reset(handlers).await?;
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        self.set_state(PipelineState::Stopped);
                        return Ok(());
                    };
                    match event {
                        AggregatorEvent::NewCheckpoint { .. }
                        | AggregatorEvent::HistoricalSyncComplete { .. } => {
                            self.process_pending().await?;
                        }
                        AggregatorEvent::NewFinalityCheckpoint { timestamp } => {
                            tracing::debug!(timestamp, "Finality checkpoint advanced");
                        }
                        AggregatorEvent::Reorg { common_ancestor_timestamp } => {
                            self.handle_reorg(common_ancestor_timestamp).await?;
                        }
                        AggregatorEvent::Fatal { message } => {
                            tracing::error!(error = %message, "Stopping pipeline on fatal sync failure");
                            self.set_state(PipelineState::Stopped);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Drains events up to the source's current checkpoint, committing page
    /// by page.
    async fn process_pending(&mut self) -> Result<()> {
        if self
            .user_error
            .lock()
            .expect("pipeline state poisoned")
            .is_some()
        {
            // Halted pending reset.
            return Ok(());
        }
        self.set_state(PipelineState::Processing);

        loop {
            let checkpoint = self.source.checkpoint();
            if self.to_timestamp >= checkpoint {
                break;
            }
            let from = self.to_timestamp + 1;
            let mut cursor = None;
            loop {
                if self.cancel.is_cancelled() {
                    self.set_state(PipelineState::Stopped);
                    return Ok(());
                }
                let page = self
                    .source
                    .events_page(from, checkpoint, cursor, Some(&self.include), self.page_size)
                    .await?;

                let derived = Arc::clone(&self.derived);
                let view = EntityView::new(derived.as_ref());
                {
                    let ctx = HandlerContext {
                        entities: &view,
                        contracts: &self.contracts,
                    };
                    for event in &page.events {
                        let Some(handler) = self
                            .registry
                            .get(&event.filter_name, &event.event.event_name)
                        else {
                            continue;
                        };
                        view.set_timestamp(event.block.timestamp);
                        if let Err(err) = handler.handle(event, &ctx).await {
                            let message = EvmIndexerError::Handler {
                                filter_name: event.filter_name.clone(),
                                event_name: event.event.event_name.clone(),
                                message: err.to_string(),
                            }
                            .to_string();
                            tracing::error!(error = %message, "Handler failed — pipeline halted");
                            *self
                                .user_error
                                .lock()
                                .expect("pipeline state poisoned") = Some(message);
                            self.set_state(PipelineState::Idle);
                            return Ok(());
                        }
                    }
                }

                let ops = view.take_ops();
                self.derived.apply(&ops).await?;
                self.to_timestamp = page.metadata.page_ends_at_timestamp;
                let _ = self.processed_tx.send(self.to_timestamp);
                tracing::debug!(
                    events = page.events.len(),
                    to_timestamp = self.to_timestamp,
                    "Page applied"
                );

                if let Some(completed_at) = self.source.historical_sync_completed_at() {
                    if self.to_timestamp >= completed_at {
                        self.healthy.store(true, Ordering::SeqCst);
                    }
                }

                match page.metadata.cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }

        self.set_state(PipelineState::Idle);
        tracing::info!(to_timestamp = self.to_timestamp, "Events processed");
        Ok(())
    }

    /// Rolls the derived store back to the common ancestor, clamps the
    /// watermark, and resumes.
    async fn handle_reorg(&mut self, common_ancestor_timestamp: u64) -> Result<()> {
        self.set_state(PipelineState::Reorging);
        self.derived.revert(common_ancestor_timestamp).await?;
        if self.to_timestamp > common_ancestor_timestamp {
            self.to_timestamp = common_ancestor_timestamp;
            let _ = self.processed_tx.send(self.to_timestamp);
        }
        tracing::warn!(
            common_ancestor_timestamp,
            "Derived store rolled back after reorg"
        );
        self.set_state(PipelineState::Idle);
        self.process_pending().await
    }

    /// Hot reload: empty the derived store and reprocess with `handlers`.
    async fn reset(&mut self, handlers: HandlerRegistry) -> Result<()> {
        tracing::info!(handlers = handlers.len(), "Resetting handler pipeline");
        self.derived.truncate().await?;
        self.to_timestamp = 0;
        self.include = handlers.include_selectors(&self.abi);
        self.registry = handlers;
        *self
            .user_error
            .lock()
            .expect("pipeline state poisoned") = None;
        self.healthy.store(false, Ordering::SeqCst);
        let _ = self.processed_tx.send(0);
        self.process_pending().await
    }
}
