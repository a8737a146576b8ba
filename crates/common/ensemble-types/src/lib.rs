#![deny(unsafe_code)]
//! Shared data model for the ensemble mesh - the wire types exchanged by
//! cooperating agent nodes:
//! - Capability discovery (beacons and scored responses)
//! - Chained task delegation (subtasks, contracts, allocations, results)
//! - Model-update patch records carried by the gossip layer
//! - The typed transport envelope
//!
//! These are plain serde-derived types with no I/O of their own.

pub mod beacon;
pub mod contract;
pub mod envelope;
pub mod patch;

pub use beacon::{Beacon, BeaconResponse, DEFAULT_BEACON_TTL};
pub use contract::{SubTask, TaskAllocation, TaskContract, TaskResult};
pub use envelope::{DeliveryAck, Envelope, MessagePayload, MessageType};
pub use patch::{GossipMessage, PatchRecord};

/// Opaque, globally unique node identifier. Used as a map key everywhere
/// and never mutated once assigned.
pub type NodeId = String;

/// Round a score to three decimal places, the precision every protocol
/// score is quoted at.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Current Unix timestamp in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
