use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::gossip::GossipTopology;
use crate::reputation::DEFAULT_HISTORY_CAPACITY;

/// One statically configured routing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub id: String,
    pub host: String,
    pub port: u16,
}

/// Gossip settings for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipSection {
    pub enabled: bool,
    pub topology: GossipTopology,
    /// Listen port for the neighbor topology. 0 picks an ephemeral port.
    pub listen_port: u16,
    pub neighbors: Vec<NeighborEntry>,
}

impl Default for GossipSection {
    fn default() -> Self {
        Self {
            enabled: false,
            topology: GossipTopology::NeighborBroadcast,
            listen_port: 0,
            neighbors: Vec::new(),
        }
    }
}

/// Full configuration of one mesh node.
///
/// Every field has a default so a TOML file only needs to state what it
/// changes. Port 0 binds an ephemeral port, which is how tests run several
/// nodes in one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub capabilities: Vec<String>,
    pub neighbors: Vec<NeighborEntry>,
    /// How long a discovery round waits for beacon responses.
    pub response_timeout_ms: u64,
    /// Per-message send timeout, connect to ack.
    pub send_timeout_ms: u64,
    /// How long a task originator waits for terminal results.
    pub result_deadline_ms: u64,
    /// How many executors the first step of a chain is delegated to.
    pub fan_out: usize,
    pub reputation_capacity: usize,
    /// Multiply candidate match scores by tracked trust before ranking.
    pub reputation_weighting: bool,
    /// Advertised execution cost, echoed in beacon responses.
    pub estimate_cost: f64,
    pub gossip: GossipSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            capabilities: Vec::new(),
            neighbors: Vec::new(),
            response_timeout_ms: 1000,
            send_timeout_ms: 5000,
            result_deadline_ms: 30_000,
            fan_out: 1,
            reputation_capacity: DEFAULT_HISTORY_CAPACITY,
            reputation_weighting: false,
            estimate_cost: 1.0,
            gossip: GossipSection::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("failed to parse node configuration")
    }

    pub fn response_window(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn result_deadline(&self) -> Duration {
        Duration::from_millis(self.result_deadline_ms)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }
}
