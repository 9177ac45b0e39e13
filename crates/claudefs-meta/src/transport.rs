//! Delivery of encoded Raft frames between metadata servers.
//!
//! The transport is a capability chosen at construction time: TCP with
//! length-prefixed frames in production, an in-process network with
//! controllable partitions in tests. Delivery is best effort; Raft
//! retransmits on its own timers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};

use crate::types::NodeId;
use crate::wire::{HEADER_LEN, MAX_BODY_LEN};

/// Transport failures. None of them are fatal to a shard group.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// No address or mailbox is known for the peer
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),
    /// The peer cannot be reached right now
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),
    /// Connecting to the peer took too long
    #[error("connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout {
        /// Peer address
        addr: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },
    /// A frame exceeded the size limit
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    /// The receiving side has shut down
    #[error("transport closed")]
    Closed,
    /// Socket error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sends encoded frames to other metadata servers.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    /// Sends one frame to `to`.
    async fn send(&self, to: NodeId, frame: Bytes) -> Result<(), TransportError>;
}

#[derive(Default)]
struct NetworkState {
    mailboxes: HashMap<NodeId, mpsc::Sender<Bytes>>,
    /// Directed links that currently drop traffic.
    cut: HashSet<(NodeId, NodeId)>,
}

/// In-process network connecting any number of nodes, with partition control.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl InMemoryNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a node; returns its transport handle and its inbound frame stream.
    pub fn register(
        &self,
        node: NodeId,
        capacity: usize,
    ) -> (Arc<InMemoryTransport>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        if let Ok(mut state) = self.state.write() {
            state.mailboxes.insert(node, tx);
        }
        let transport = Arc::new(InMemoryTransport {
            node,
            network: self.clone(),
        });
        (transport, rx)
    }

    /// Splits the nodes into groups that can only talk among themselves.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        state.cut.clear();
        let nodes: Vec<NodeId> = state.mailboxes.keys().copied().collect();
        let group_of = |n: NodeId| groups.iter().position(|g| g.contains(&n));
        for a in &nodes {
            for b in &nodes {
                if a != b && group_of(*a) != group_of(*b) {
                    state.cut.insert((*a, *b));
                }
            }
        }
        tracing::debug!(groups = ?groups, "network partitioned");
    }

    /// Cuts every link to and from `node`.
    pub fn isolate(&self, node: NodeId) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        let nodes: Vec<NodeId> = state.mailboxes.keys().copied().collect();
        for other in nodes {
            if other != node {
                state.cut.insert((node, other));
                state.cut.insert((other, node));
            }
        }
    }

    /// Restores full connectivity.
    pub fn heal(&self) {
        if let Ok(mut state) = self.state.write() {
            state.cut.clear();
        }
        tracing::debug!("network healed");
    }

    fn deliver(&self, from: NodeId, to: NodeId, frame: Bytes) -> Result<(), TransportError> {
        let state = self.state.read().map_err(|_| TransportError::Closed)?;
        if state.cut.contains(&(from, to)) {
            return Err(TransportError::Unreachable(to));
        }
        let mailbox = state
            .mailboxes
            .get(&to)
            .ok_or(TransportError::UnknownPeer(to))?;
        mailbox.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Unreachable(to),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// One node's handle onto an [`InMemoryNetwork`].
pub struct InMemoryTransport {
    node: NodeId,
    network: InMemoryNetwork,
}

#[async_trait]
impl RaftTransport for InMemoryTransport {
    async fn send(&self, to: NodeId, frame: Bytes) -> Result<(), TransportError> {
        self.network.deliver(self.node, to, frame)
    }
}

/// TCP transport configuration.
#[derive(Clone, Debug)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY.
    pub nodelay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            nodelay: true,
        }
    }
}

/// Length-prefixed frames over TCP, one outbound connection per peer.
pub struct TcpRaftTransport {
    config: TcpTransportConfig,
    peers: HashMap<NodeId, String>,
    connections: Mutex<HashMap<NodeId, OwnedWriteHalf>>,
}

impl TcpRaftTransport {
    /// Creates a transport that knows how to reach `peers`.
    pub fn new(config: TcpTransportConfig, peers: HashMap<NodeId, String>) -> Self {
        Self {
            config,
            peers,
            connections: Mutex::new(HashMap::new()),
        }
    }

    async fn connect(&self, addr: &str) -> Result<OwnedWriteHalf, TransportError> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })??;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr = addr, "raft transport connected");
        let (_, write) = stream.into_split();
        Ok(write)
    }

    /// Accepts inbound connections and forwards every frame to `inbound` until shutdown.
    pub async fn serve(
        listener: TcpListener,
        inbound: mpsc::Sender<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let _ = stream.set_nodelay(true);
                    let inbound = inbound.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = read_frames(stream, inbound, shutdown).await {
                            tracing::debug!(peer = %peer, error = %e, "raft connection closed");
                        }
                    });
                }
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

async fn read_frames(
    mut stream: TcpStream,
    inbound: mpsc::Sender<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    loop {
        let len = tokio::select! {
            len = stream.read_u32() => len? as usize,
            _ = shutdown.changed() => return Ok(()),
        };
        if len < HEADER_LEN || len > HEADER_LEN + MAX_BODY_LEN {
            return Err(TransportError::FrameTooLarge(len));
        }
        let mut frame = vec![0u8; len];
        stream.read_exact(&mut frame).await?;
        inbound
            .send(Bytes::from(frame))
            .await
            .map_err(|_| TransportError::Closed)?;
    }
}

#[async_trait]
impl RaftTransport for TcpRaftTransport {
    async fn send(&self, to: NodeId, frame: Bytes) -> Result<(), TransportError> {
        if frame.len() > HEADER_LEN + MAX_BODY_LEN {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        let addr = self.peers.get(&to).ok_or(TransportError::UnknownPeer(to))?;
        let mut connections = self.connections.lock().await;
        if !connections.contains_key(&to) {
            let write = self.connect(addr).await?;
            connections.insert(to, write);
        }
        let Some(write) = connections.get_mut(&to) else {
            return Err(TransportError::Unreachable(to));
        };
        let result = async {
            write.write_u32(frame.len() as u32).await?;
            write.write_all(&frame).await?;
            write.flush().await
        }
        .await;
        if let Err(e) = result {
            // reconnect on the next send
            connections.remove(&to);
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> [NodeId; 3] {
        [NodeId::new(1), NodeId::new(2), NodeId::new(3)]
    }

    #[tokio::test]
    async fn test_in_memory_delivery() {
        let net = InMemoryNetwork::new();
        let [a, b, _] = nodes();
        let (ta, _ra) = net.register(a, 8);
        let (_tb, mut rb) = net.register(b, 8);

        ta.send(b, Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(rb.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert!(matches!(
            ta.send(NodeId::new(99), Bytes::new()).await,
            Err(TransportError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let net = InMemoryNetwork::new();
        let [a, b, c] = nodes();
        let (ta, _ra) = net.register(a, 8);
        let (_tb, mut rb) = net.register(b, 8);
        let (_tc, _rc) = net.register(c, 8);

        net.partition(&[&[a], &[b, c]]);
        assert!(matches!(
            ta.send(b, Bytes::from_static(b"x")).await,
            Err(TransportError::Unreachable(_))
        ));
        net.heal();
        ta.send(b, Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(rb.recv().await.unwrap(), Bytes::from_static(b"y"));
    }

    #[tokio::test]
    async fn test_isolate_is_bidirectional() {
        let net = InMemoryNetwork::new();
        let [a, b, _] = nodes();
        let (ta, _ra) = net.register(a, 8);
        let (tb, _rb) = net.register(b, 8);
        net.isolate(a);
        assert!(ta.send(b, Bytes::new()).await.is_err());
        assert!(tb.send(a, Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_frames_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(TcpRaftTransport::serve(listener, tx, stop_rx));

        let peer = NodeId::new(2);
        let transport = TcpRaftTransport::new(
            TcpTransportConfig::default(),
            HashMap::from([(peer, addr)]),
        );
        let frame = Bytes::from(vec![7u8; HEADER_LEN + 5]);
        transport.send(peer, frame.clone()).await.unwrap();
        transport.send(peer, frame.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), frame);
        assert_eq!(rx.recv().await.unwrap(), frame);

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
