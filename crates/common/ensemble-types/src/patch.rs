use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{unix_now, NodeId};

/// Record describing one model-update patch offered to the network.
///
/// Identity is `patch_id`: once a node has seen a given id it never
/// re-broadcasts or re-applies the patch. The payload itself lives behind
/// `storage_locator`; the record only carries enough to fetch and apply it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRecord {
    pub patch_id: Uuid,

    /// Node that produced the patch.
    pub source_id: NodeId,

    /// Where the patch payload is stored (path or URI).
    pub storage_locator: String,

    /// Names of the adapter layers the patch updates.
    pub layer_names: Vec<String>,

    pub timestamp: i64,
}

impl PatchRecord {
    pub fn new(
        source_id: impl Into<NodeId>,
        storage_locator: impl Into<String>,
        layer_names: Vec<String>,
    ) -> Self {
        Self {
            patch_id: Uuid::new_v4(),
            source_id: source_id.into(),
            storage_locator: storage_locator.into(),
            layer_names,
            timestamp: unix_now(),
        }
    }
}

/// Envelope carried on the gossip channel, independent of the
/// contract/result transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipMessage {
    pub sender_id: NodeId,
    pub timestamp: i64,
    pub patch: PatchRecord,
}

impl GossipMessage {
    pub fn new(sender_id: impl Into<NodeId>, patch: PatchRecord) -> Self {
        Self {
            sender_id: sender_id.into(),
            timestamp: unix_now(),
            patch,
        }
    }
}
