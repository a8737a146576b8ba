use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use ensemble_types::{GossipMessage, NodeId, PatchRecord};

use crate::transport::{read_frame, write_frame, TransportError};

/// How a node propagates patch announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GossipTopology {
    /// Every node publishes to and subscribes from one shared bus.
    GlobalBroadcast,
    /// Each node pushes point-to-point to its configured gossip neighbors.
    NeighborBroadcast,
}

/// Shared in-process fan-out bus backing the global-broadcast topology.
///
/// Clone a bus into every node that should share one global channel. Slow
/// subscribers may lag and miss announcements; delivery is best-effort.
#[derive(Clone)]
pub struct GossipBus {
    sender: broadcast::Sender<GossipMessage>,
}

impl GossipBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, message: GossipMessage) {
        // No subscribers is not an error.
        let _ = self.sender.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GossipMessage> {
        self.sender.subscribe()
    }
}

impl Default for GossipBus {
    fn default() -> Self {
        Self::new(256)
    }
}

enum Fabric {
    Global {
        bus: GossipBus,
    },
    Neighbor {
        neighbors: Mutex<HashMap<NodeId, (String, u16)>>,
        ack_timeout: Duration,
    },
}

type PatchCallback = Box<dyn Fn(&PatchRecord) + Send + Sync>;

/// Propagates patch announcements over the configured topology and
/// delivers each distinct patch to local subscribers exactly once.
///
/// Deduplication is by patch id: a node drops its own announcements coming
/// back and anything it has already processed, so cyclic neighbor graphs
/// terminate.
pub struct GossipBroadcaster {
    node_id: NodeId,
    fabric: Fabric,
    seen: Mutex<HashSet<Uuid>>,
    callbacks: Mutex<Vec<PatchCallback>>,
    shutdown: watch::Sender<bool>,
}

impl GossipBroadcaster {
    /// A broadcaster on the shared global bus.
    pub fn global(node_id: impl Into<NodeId>, bus: &GossipBus) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            node_id: node_id.into(),
            fabric: Fabric::Global { bus: bus.clone() },
            seen: Mutex::new(HashSet::new()),
            callbacks: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// A broadcaster pushing point-to-point to configured gossip neighbors.
    pub fn neighbor(node_id: impl Into<NodeId>, ack_timeout: Duration) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            node_id: node_id.into(),
            fabric: Fabric::Neighbor {
                neighbors: Mutex::new(HashMap::new()),
                ack_timeout,
            },
            seen: Mutex::new(HashSet::new()),
            callbacks: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    /// Add a gossip neighbor. Only meaningful on the neighbor topology; a
    /// no-op (with a warning) on the global one.
    pub fn add_gossip_neighbor(
        &self,
        node_id: impl Into<NodeId>,
        host: impl Into<String>,
        port: u16,
    ) {
        match &self.fabric {
            Fabric::Neighbor { neighbors, .. } => {
                let mut neighbors = neighbors.lock().unwrap_or_else(|e| e.into_inner());
                neighbors.insert(node_id.into(), (host.into(), port));
            }
            Fabric::Global { .. } => {
                warn!(
                    "node {} ignoring gossip neighbor on global topology",
                    self.node_id
                );
            }
        }
    }

    /// Register a callback invoked once per newly seen patch. Callbacks run
    /// synchronously on the receive path and should be quick.
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&PatchRecord) + Send + Sync + 'static,
    {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        callbacks.push(Box::new(callback));
    }

    /// Start the receive side. On the global topology this subscribes to
    /// the bus; on the neighbor topology it binds `bind` (required) and
    /// accepts inbound pushes. Returns the bound address for the neighbor
    /// topology, `None` for the global one.
    pub async fn start(
        self: &Arc<Self>,
        bind: Option<&str>,
    ) -> Result<Option<SocketAddr>, TransportError> {
        match &self.fabric {
            Fabric::Global { bus } => {
                let mut rx = bus.subscribe();
                let broadcaster = Arc::clone(self);
                let mut shutdown_rx = self.shutdown.subscribe();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            received = rx.recv() => match received {
                                Ok(message) => broadcaster.process_message(&message),
                                Err(broadcast::error::RecvError::Lagged(missed)) => {
                                    warn!(
                                        "node {} gossip subscriber lagged, {} announcements lost",
                                        broadcaster.node_id, missed
                                    );
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            },
                        }
                    }
                });
                Ok(None)
            }
            Fabric::Neighbor { ack_timeout, .. } => {
                let bind = bind.ok_or(TransportError::NotStarted)?;
                let listener = TcpListener::bind(bind).await?;
                let addr = listener.local_addr()?;
                info!("node {} gossip listening on {}", self.node_id, addr);

                let serve_timeout = *ack_timeout;
                let broadcaster = Arc::clone(self);
                let mut shutdown_rx = self.shutdown.subscribe();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            accepted = listener.accept() => match accepted {
                                Ok((stream, peer)) => {
                                    match tokio::time::timeout(
                                        serve_timeout,
                                        broadcaster.serve_push(stream),
                                    )
                                    .await
                                    {
                                        Ok(Ok(())) => {}
                                        Ok(Err(e)) => debug!(
                                            "node {} dropped gossip frame from {}: {}",
                                            broadcaster.node_id, peer, e
                                        ),
                                        Err(_) => debug!(
                                            "node {} dropped silent gossip connection from {}",
                                            broadcaster.node_id, peer
                                        ),
                                    }
                                }
                                Err(e) => {
                                    warn!("node {} gossip accept error: {}", broadcaster.node_id, e);
                                }
                            },
                        }
                    }
                });
                Ok(Some(addr))
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn serve_push(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let body = read_frame(&mut stream).await?;
        let message: GossipMessage = serde_json::from_slice(&body)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        // Ack before processing so a slow callback never stalls the sender.
        write_frame(&mut stream, b"OK").await?;
        self.process_message(&message);
        Ok(())
    }

    /// Announce a patch originating at this node. The patch is marked seen
    /// locally first so an echo from a neighbor is dropped.
    pub async fn broadcast_patch(&self, patch: PatchRecord) {
        {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            seen.insert(patch.patch_id);
        }
        let message = GossipMessage::new(self.node_id.clone(), patch);
        match &self.fabric {
            Fabric::Global { bus } => bus.publish(message),
            Fabric::Neighbor {
                neighbors,
                ack_timeout,
            } => {
                let targets: Vec<(NodeId, (String, u16))> = {
                    let neighbors = neighbors.lock().unwrap_or_else(|e| e.into_inner());
                    neighbors
                        .iter()
                        .map(|(id, addr)| (id.clone(), addr.clone()))
                        .collect()
                };
                let body = match serde_json::to_vec(&message) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("node {} failed to encode gossip message: {}", self.node_id, e);
                        return;
                    }
                };
                for (neighbor_id, (host, port)) in targets {
                    match tokio::time::timeout(*ack_timeout, Self::push(&host, port, &body)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(
                            "node {} gossip push to {} failed: {}",
                            self.node_id, neighbor_id, e
                        ),
                        Err(_) => warn!(
                            "node {} gossip push to {} timed out",
                            self.node_id, neighbor_id
                        ),
                    }
                }
            }
        }
    }

    async fn push(host: &str, port: u16, body: &[u8]) -> std::io::Result<()> {
        let mut stream = TcpStream::connect((host, port)).await?;
        write_frame(&mut stream, body).await?;
        let ack = read_frame(&mut stream).await?;
        if ack != b"OK" {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unexpected gossip ack",
            ));
        }
        Ok(())
    }

    /// Dedup and deliver one inbound announcement: own echoes and already
    /// seen patch ids are dropped, anything new runs the callbacks.
    fn process_message(&self, message: &GossipMessage) {
        if message.sender_id == self.node_id {
            return;
        }
        {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.insert(message.patch.patch_id) {
                debug!(
                    "node {} already saw patch {}",
                    self.node_id, message.patch.patch_id
                );
                return;
            }
        }
        info!(
            "node {} accepted patch {} from {}",
            self.node_id, message.patch.patch_id, message.sender_id
        );
        let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        for callback in callbacks.iter() {
            callback(&message.patch);
        }
    }

    /// Number of distinct patches this node has seen (its own included).
    pub fn seen_count(&self) -> usize {
        let seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.len()
    }
}
