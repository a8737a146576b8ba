use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{round3, unix_now, NodeId};

/// Default advisory hop budget for a freshly issued beacon.
///
/// Carried on the wire but not consumed by any relaying logic yet;
/// reserved for multi-hop propagation.
pub const DEFAULT_BEACON_TTL: u32 = 2;

/// Broadcast discovery message advertising a capability requirement.
///
/// Immutable once constructed: every field is set at creation time and a
/// beacon is never edited in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    /// Unique identifier of this beacon.
    pub beacon_id: Uuid,

    /// Node that issued the beacon.
    pub sender: NodeId,

    /// Task this beacon belongs to; defaults to the beacon id when the
    /// beacon is not chaining an existing task.
    pub task_id: String,

    /// Free-text description of the capability being sought.
    pub requirement: String,

    /// Advisory remaining hop budget.
    pub ttl: u32,

    /// Unix timestamp of issuance.
    pub timestamp: i64,
}

impl Beacon {
    /// Create a beacon. When `task_id` is `None` the beacon id doubles as
    /// the task id.
    pub fn new(
        sender: impl Into<NodeId>,
        requirement: impl Into<String>,
        task_id: Option<String>,
        ttl: u32,
    ) -> Self {
        let beacon_id = Uuid::new_v4();
        Self {
            beacon_id,
            sender: sender.into(),
            task_id: task_id.unwrap_or_else(|| beacon_id.to_string()),
            requirement: requirement.into(),
            ttl,
            timestamp: unix_now(),
        }
    }
}

/// A peer's scored reply to a beacon. Produced at most once per beacon a
/// node chooses to answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconResponse {
    /// Unique identifier of this response.
    pub response_id: Uuid,

    /// Node that produced the response.
    pub responder_id: NodeId,

    /// Task the answered beacon belonged to.
    pub task_id: String,

    /// Capability match score in [0, 1], rounded to three decimals.
    pub match_score: f64,

    /// Estimated cost of executing the task, rounded to three decimals.
    pub estimate_cost: f64,

    /// Unix timestamp of the response.
    pub timestamp: i64,
}

impl BeaconResponse {
    pub fn new(
        responder_id: impl Into<NodeId>,
        task_id: impl Into<String>,
        match_score: f64,
        estimate_cost: f64,
    ) -> Self {
        Self {
            response_id: Uuid::new_v4(),
            responder_id: responder_id.into(),
            task_id: task_id.into(),
            match_score: round3(match_score.clamp(0.0, 1.0)),
            estimate_cost: round3(estimate_cost.max(0.0)),
            timestamp: unix_now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_task_id_defaults_to_beacon_id() {
        let beacon = Beacon::new("node-a", "math", None, DEFAULT_BEACON_TTL);
        assert_eq!(beacon.task_id, beacon.beacon_id.to_string());

        let chained = Beacon::new("node-a", "math", Some("task-7".into()), DEFAULT_BEACON_TTL);
        assert_eq!(chained.task_id, "task-7");
    }

    #[test]
    fn response_scores_are_clamped_and_rounded() {
        let response = BeaconResponse::new("node-b", "t", 1.23456, -4.0);
        assert_eq!(response.match_score, 1.0);
        assert_eq!(response.estimate_cost, 0.0);

        let response = BeaconResponse::new("node-b", "t", 0.66666, 0.12349);
        assert_eq!(response.match_score, 0.667);
        assert_eq!(response.estimate_cost, 0.123);
    }
}
