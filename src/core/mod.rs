//! The indexing core: per-network sync services, the cross-network
//! aggregator, the handler pipeline, and the orchestrator that wires them.

pub mod aggregator;
pub mod historical;
pub mod indexer;
pub mod pipeline;
pub mod realtime;
