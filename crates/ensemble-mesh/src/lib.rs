#![deny(unsafe_code)]
//! Ensemble Mesh - the discovery, task-routing and patch-gossip protocol
//! stack for a network of autonomous agent nodes.
//!
//! This crate provides:
//! - A point-to-point transport with typed message dispatch
//! - Capability advertisement and fuzzy requirement matching
//! - Recency-weighted peer reputation tracking
//! - Beacon discovery, contract delegation and chained result routing
//! - Dual-topology gossip of model-update patches

pub mod capability;
pub mod config;
pub mod exchange;
pub mod gossip;
pub mod identity;
pub mod node;
pub mod reputation;
pub mod transport;

// Re-export common entry points
pub use capability::CapabilityMatcher;
pub use config::{GossipSection, NeighborEntry, NodeConfig};
pub use exchange::TaskExchange;
pub use gossip::{GossipBroadcaster, GossipBus, GossipTopology};
pub use identity::{verify_signature, NodeIdentity};
pub use node::{MeshAgent, NodeError, PlanStep, TaskExecutor};
pub use reputation::ReputationTracker;
pub use transport::{Transport, TransportError};
