use std::fmt;

use serde::{Deserialize, Serialize};

use crate::beacon::{Beacon, BeaconResponse};
use crate::contract::{TaskAllocation, TaskContract, TaskResult};
use crate::{unix_now, NodeId};

/// The set of message types the transport dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Beacon,
    BeaconResponse,
    TaskAllocation,
    TaskContract,
    TaskResult,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Beacon => "beacon",
            MessageType::BeaconResponse => "beacon_response",
            MessageType::TaskAllocation => "task_allocation",
            MessageType::TaskContract => "task_contract",
            MessageType::TaskResult => "task_result",
        };
        f.write_str(name)
    }
}

/// Typed message body. On the wire this serializes as
/// `{"msg_type": "...", "data": {...}}`, one variant per known type, so
/// dispatch is exhaustive at compile time while the encoding stays the
/// string-tagged shape peers expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msg_type", content = "data", rename_all = "snake_case")]
pub enum MessagePayload {
    Beacon(Beacon),
    BeaconResponse(BeaconResponse),
    TaskAllocation(TaskAllocation),
    TaskContract(TaskContract),
    TaskResult(TaskResult),
}

impl MessagePayload {
    pub fn kind(&self) -> MessageType {
        match self {
            MessagePayload::Beacon(_) => MessageType::Beacon,
            MessagePayload::BeaconResponse(_) => MessageType::BeaconResponse,
            MessagePayload::TaskAllocation(_) => MessageType::TaskAllocation,
            MessagePayload::TaskContract(_) => MessageType::TaskContract,
            MessagePayload::TaskResult(_) => MessageType::TaskResult,
        }
    }
}

/// Point-to-point transport envelope: sender, addressee, typed body and a
/// send timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: NodeId,
    pub target_id: NodeId,
    #[serde(flatten)]
    pub payload: MessagePayload,
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(
        sender_id: impl Into<NodeId>,
        target_id: impl Into<NodeId>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            target_id: target_id.into(),
            payload,
            timestamp: unix_now(),
        }
    }
}

/// One-frame acknowledgement a receiver writes back after accepting an
/// envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub status: String,
}

impl DeliveryAck {
    pub const SUCCESS: &'static str = "success";

    pub fn success() -> Self {
        Self {
            status: Self::SUCCESS.to_string(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_BEACON_TTL;

    #[test]
    fn envelope_wire_shape_is_string_tagged() {
        let beacon = Beacon::new("node-a", "math", None, DEFAULT_BEACON_TTL);
        let envelope = Envelope::new("node-a", "node-b", MessagePayload::Beacon(beacon));

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["msg_type"], "beacon");
        assert_eq!(value["sender_id"], "node-a");
        assert_eq!(value["target_id"], "node-b");
        assert_eq!(value["data"]["requirement"], "math");

        let decoded: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.payload.kind(), MessageType::Beacon);
    }

    #[test]
    fn ack_status_round_trip() {
        assert!(DeliveryAck::success().is_success());
        assert!(!DeliveryAck::failure("no handler").is_success());
    }
}
