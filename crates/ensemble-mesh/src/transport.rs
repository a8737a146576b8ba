use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use ensemble_types::{DeliveryAck, Envelope, MessagePayload, MessageType, NodeId};

/// Upper bound on a single frame body. Anything larger is treated as a
/// malformed frame and dropped.
pub(crate) const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Errors that can occur in transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport not started")]
    NotStarted,
}

/// Write one length-prefixed frame: 4-byte big-endian length, then the
/// UTF-8 body.
pub(crate) async fn write_frame(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    let len = body.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

/// Read one length-prefixed frame, rejecting oversized lengths.
pub(crate) async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {} exceeds limit", len),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

type Handler = Box<dyn Fn(NodeId, MessagePayload) + Send + Sync>;

/// Point-to-point transport for typed, serialized messages.
///
/// Maintains a static neighbor routing table and dispatches inbound
/// envelopes to the handler registered for their message type. Sending is
/// best-effort: one fresh connection per message, a bounded wait for the
/// receiver's acknowledgement, no retry.
pub struct Transport {
    node_id: NodeId,
    send_timeout: Duration,
    neighbors: RwLock<HashMap<NodeId, (String, u16)>>,
    handlers: RwLock<HashMap<MessageType, Handler>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    pub fn new(node_id: impl Into<NodeId>, send_timeout: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            node_id: node_id.into(),
            send_timeout,
            neighbors: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            local_addr: Mutex::new(None),
            shutdown,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register the handler for one message type. Last registration wins.
    pub fn register_handler<F>(&self, kind: MessageType, handler: F)
    where
        F: Fn(NodeId, MessagePayload) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(kind, Box::new(handler));
    }

    /// Insert or overwrite a routing entry. No liveness check is performed.
    pub fn add_neighbor(&self, node_id: impl Into<NodeId>, host: impl Into<String>, port: u16) {
        let mut neighbors = self.neighbors.write().unwrap_or_else(|e| e.into_inner());
        neighbors.insert(node_id.into(), (host.into(), port));
    }

    /// Ids of all known neighbors.
    pub fn neighbor_ids(&self) -> Vec<NodeId> {
        let neighbors = self.neighbors.read().unwrap_or_else(|e| e.into_inner());
        neighbors.keys().cloned().collect()
    }

    /// Address the accept loop is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind the listener and spawn the accept loop. Binding port 0 picks an
    /// ephemeral port; the chosen address is returned.
    pub async fn start(self: &Arc<Self>, bind_addr: &str) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let addr = listener.local_addr()?;
        {
            let mut local = self.local_addr.lock().unwrap_or_else(|e| e.into_inner());
            *local = Some(addr);
        }
        info!("node {} transport listening on {}", self.node_id, addr);

        let transport = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!("node {} transport accept loop stopping", transport.node_id);
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                // A single bad or silent connection must
                                // never stall the loop.
                                match tokio::time::timeout(
                                    transport.send_timeout,
                                    transport.serve_connection(stream),
                                )
                                .await
                                {
                                    Ok(Ok(())) => {}
                                    Ok(Err(e)) => debug!(
                                        "node {} dropped frame from {}: {}",
                                        transport.node_id, peer, e
                                    ),
                                    Err(_) => debug!(
                                        "node {} dropped silent connection from {}",
                                        transport.node_id, peer
                                    ),
                                }
                            }
                            Err(e) => {
                                warn!("node {} accept error: {}", transport.node_id, e);
                            }
                        }
                    }
                }
            }
        });

        Ok(addr)
    }

    /// Stop accepting new connections. In-flight sends run to their own
    /// timeout.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn serve_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let body = read_frame(&mut stream).await?;
        let envelope: Envelope = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("undecodable envelope: {}", e),
                ));
            }
        };

        let kind = envelope.payload.kind();
        {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            match handlers.get(&kind) {
                Some(handler) => handler(envelope.sender_id, envelope.payload),
                None => {
                    warn!(
                        "node {} has no handler for message type {}, discarding",
                        self.node_id, kind
                    );
                }
            }
        }

        let ack = serde_json::to_vec(&DeliveryAck::success())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_frame(&mut stream, &ack).await
    }

    /// Send one typed message to a neighbor and wait for its
    /// acknowledgement. Returns `false` (and logs) on unknown target,
    /// connection or timeout errors, or serialization failure - never
    /// raises.
    pub async fn send(&self, target_id: &str, payload: MessagePayload) -> bool {
        let addr = {
            let neighbors = self.neighbors.read().unwrap_or_else(|e| e.into_inner());
            neighbors.get(target_id).cloned()
        };
        let Some((host, port)) = addr else {
            warn!("node {} has no route to {}", self.node_id, target_id);
            return false;
        };

        let kind = payload.kind();
        let envelope = Envelope::new(self.node_id.clone(), target_id, payload);
        let body = match serde_json::to_vec(&envelope) {
            Ok(body) => body,
            Err(e) => {
                warn!("node {} failed to encode {}: {}", self.node_id, kind, e);
                return false;
            }
        };

        match tokio::time::timeout(self.send_timeout, Self::deliver(&host, port, &body)).await {
            Ok(Ok(ack)) if ack.is_success() => true,
            Ok(Ok(ack)) => {
                warn!(
                    "node {} send of {} to {} rejected: {}",
                    self.node_id, kind, target_id, ack.status
                );
                false
            }
            Ok(Err(e)) => {
                warn!(
                    "node {} send of {} to {} failed: {}",
                    self.node_id, kind, target_id, e
                );
                false
            }
            Err(_) => {
                warn!(
                    "node {} send of {} to {} timed out",
                    self.node_id, kind, target_id
                );
                false
            }
        }
    }

    async fn deliver(host: &str, port: u16, body: &[u8]) -> std::io::Result<DeliveryAck> {
        let mut stream = TcpStream::connect((host, port)).await?;
        write_frame(&mut stream, body).await?;
        let ack_body = read_frame(&mut stream).await?;
        serde_json::from_slice(&ack_body)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Best-effort send to every known neighbor not in `exclude`.
    /// Per-neighbor failures are logged by `send` and do not abort the
    /// broadcast.
    pub async fn broadcast(&self, payload: MessagePayload, exclude: &[NodeId]) {
        for neighbor_id in self.neighbor_ids() {
            if exclude.contains(&neighbor_id) {
                continue;
            }
            self.send(&neighbor_id, payload.clone()).await;
        }
    }
}
