//! Conduit: framed transport of authenticated entry batches between sites.
//!
//! An envelope travels as one frame:
//!
//! ```text
//! magic "CFRB" | version: u16 | reserved: u16 | source_site_id: u64 | bincode(body)
//! ```
//!
//! The conduit itself is a capability picked at construction time: TCP with
//! length-prefixed frames between real sites, paired in-process channels in
//! tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};

use crate::batch_auth::BatchTag;
use crate::error::ReplError;
use crate::journal::ReplicatedEntry;

/// Frame magic.
pub const BATCH_MAGIC: [u8; 4] = *b"CFRB";

/// Current envelope format version.
pub const BATCH_VERSION: u16 = 1;

/// Header size in bytes.
pub const BATCH_HEADER_LEN: usize = 16;

/// Largest envelope body accepted from the network (32 MiB).
pub const MAX_BATCH_BODY_LEN: usize = 32 * 1024 * 1024;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_BATCH_BODY_LEN as u64)
}

#[derive(Serialize, Deserialize)]
struct EnvelopeBody {
    batch_sequence: u64,
    entries: Vec<ReplicatedEntry>,
    auth_tag: BatchTag,
}

/// A signed batch of replicated entries from one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEnvelope {
    /// Sending site's ID.
    pub source_site_id: u64,
    /// Batch sequence number, increasing per (source, destination) pair.
    pub batch_sequence: u64,
    /// Entries in origin journal order.
    pub entries: Vec<ReplicatedEntry>,
    /// HMAC-SHA256 over the header fields and entries.
    pub auth_tag: BatchTag,
}

impl BatchEnvelope {
    /// Total entries in the batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the batch carries no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serializes the envelope into one frame.
    pub fn encode(&self) -> Result<Bytes, ReplError> {
        let body = EnvelopeBody {
            batch_sequence: self.batch_sequence,
            entries: self.entries.clone(),
            auth_tag: self.auth_tag,
        };
        let body = codec().serialize(&body)?;
        let mut buf = BytesMut::with_capacity(BATCH_HEADER_LEN + body.len());
        buf.put_slice(&BATCH_MAGIC);
        buf.put_u16_le(BATCH_VERSION);
        buf.put_u16_le(0);
        buf.put_u64_le(self.source_site_id);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Reads the source site from a frame header without decoding the body.
    pub fn peek_source(frame: &[u8]) -> Result<u64, ReplError> {
        let mut header = check_header(frame)?;
        header.advance(8);
        Ok(header.get_u64_le())
    }

    /// Parses a frame, rejecting bad magic, unknown versions and trailing bytes.
    pub fn decode(frame: &[u8]) -> Result<Self, ReplError> {
        let source_site_id = Self::peek_source(frame)?;
        let mut body = &frame[BATCH_HEADER_LEN..];
        if body.len() > MAX_BATCH_BODY_LEN {
            return Err(ReplError::Codec(format!(
                "batch body of {} bytes",
                body.len()
            )));
        }
        let decoded: EnvelopeBody = codec()
            .allow_trailing_bytes()
            .deserialize_from(&mut body)?;
        if !body.is_empty() {
            return Err(ReplError::Codec(format!(
                "{} trailing bytes after batch",
                body.len()
            )));
        }
        Ok(Self {
            source_site_id,
            batch_sequence: decoded.batch_sequence,
            entries: decoded.entries,
            auth_tag: decoded.auth_tag,
        })
    }
}

fn check_header(frame: &[u8]) -> Result<&[u8], ReplError> {
    if frame.len() < BATCH_HEADER_LEN {
        return Err(ReplError::Codec(format!(
            "batch frame too short: {} bytes",
            frame.len()
        )));
    }
    if frame[..4] != BATCH_MAGIC {
        return Err(ReplError::Codec("bad batch magic".to_string()));
    }
    let got = u16::from_le_bytes([frame[4], frame[5]]);
    if got != BATCH_VERSION {
        return Err(ReplError::VersionMismatch {
            expected: BATCH_VERSION,
            got,
        });
    }
    Ok(&frame[..BATCH_HEADER_LEN])
}

/// Moves encoded batches to and from one remote site.
#[async_trait]
pub trait Conduit: Send + Sync {
    /// The site on the other end.
    fn remote_site_id(&self) -> u64;

    /// Sends one frame.
    async fn send(&self, frame: Bytes) -> Result<(), ReplError>;

    /// Waits for the next frame; `Shutdown` once the conduit is closed.
    async fn recv(&self) -> Result<Bytes, ReplError>;
}

/// One end of an in-process conduit pair.
pub struct InMemoryConduit {
    remote_site_id: u64,
    sender: mpsc::Sender<Bytes>,
    receiver: Mutex<mpsc::Receiver<Bytes>>,
    connected: Arc<AtomicBool>,
}

impl InMemoryConduit {
    /// Creates connected ends for sites `a` and `b`; returns (a's end, b's end).
    pub fn pair(site_a: u64, site_b: u64, capacity: usize) -> (Self, Self) {
        let (tx_ab, rx_ab) = mpsc::channel(capacity.max(1));
        let (tx_ba, rx_ba) = mpsc::channel(capacity.max(1));
        let connected = Arc::new(AtomicBool::new(true));
        let a = Self {
            remote_site_id: site_b,
            sender: tx_ab,
            receiver: Mutex::new(rx_ba),
            connected: connected.clone(),
        };
        let b = Self {
            remote_site_id: site_a,
            sender: tx_ba,
            receiver: Mutex::new(rx_ab),
            connected,
        };
        (a, b)
    }

    /// Simulates a link outage; sends fail while disconnected.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl Conduit for InMemoryConduit {
    fn remote_site_id(&self) -> u64 {
        self.remote_site_id
    }

    async fn send(&self, frame: Bytes) -> Result<(), ReplError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ReplError::Transport {
                msg: format!("site {} unreachable", self.remote_site_id),
            });
        }
        self.sender.send(frame).await.map_err(|_| ReplError::Shutdown)
    }

    async fn recv(&self) -> Result<Bytes, ReplError> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.ok_or(ReplError::Shutdown)
    }
}

/// TCP conduit settings.
#[derive(Debug, Clone)]
pub struct ConduitConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY.
    pub nodelay: bool,
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            nodelay: true,
        }
    }
}

/// Conduit to a remote site over TCP.
///
/// Outbound frames use one lazily dialed connection; inbound frames arrive
/// through the [`ConduitListener`] that created the conduit.
pub struct TcpConduit {
    remote_site_id: u64,
    addr: String,
    config: ConduitConfig,
    writer: Mutex<Option<OwnedWriteHalf>>,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
}

impl TcpConduit {
    async fn connect(&self) -> Result<OwnedWriteHalf, ReplError> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ReplError::Transport {
                msg: format!(
                    "connect to {} timed out after {}ms",
                    self.addr, self.config.connect_timeout_ms
                ),
            })??;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(site_id = self.remote_site_id, addr = %self.addr, "conduit connected");
        let (_, write) = stream.into_split();
        Ok(write)
    }
}

#[async_trait]
impl Conduit for TcpConduit {
    fn remote_site_id(&self) -> u64 {
        self.remote_site_id
    }

    async fn send(&self, frame: Bytes) -> Result<(), ReplError> {
        if frame.len() > BATCH_HEADER_LEN + MAX_BATCH_BODY_LEN {
            return Err(ReplError::Codec(format!(
                "batch frame of {} bytes exceeds limit",
                frame.len()
            )));
        }
        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            *writer = Some(self.connect().await?);
        }
        let Some(write) = writer.as_mut() else {
            return Err(ReplError::Transport {
                msg: format!("site {} unreachable", self.remote_site_id),
            });
        };
        let result = async {
            write.write_u32(frame.len() as u32).await?;
            write.write_all(&frame).await?;
            write.flush().await
        }
        .await;
        if let Err(e) = result {
            // reconnect on the next send
            *writer = None;
            return Err(e.into());
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, ReplError> {
        let mut inbound = self.inbound.lock().await;
        inbound.recv().await.ok_or(ReplError::Shutdown)
    }
}

/// Accepts connections from remote sites and routes frames by source site.
#[derive(Default)]
pub struct ConduitListener {
    routes: HashMap<u64, mpsc::Sender<Bytes>>,
}

impl ConduitListener {
    /// Creates a listener with no known sites.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the conduit for one remote site reachable at `addr`.
    pub fn register(&mut self, remote_site_id: u64, addr: &str, config: ConduitConfig) -> TcpConduit {
        let (tx, rx) = mpsc::channel(256);
        self.routes.insert(remote_site_id, tx);
        TcpConduit {
            remote_site_id,
            addr: addr.to_string(),
            config,
            writer: Mutex::new(None),
            inbound: Mutex::new(rx),
        }
    }

    /// Accepts connections until shutdown. Dropping the routes afterwards
    /// closes every registered conduit's inbound side.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ReplError> {
        let routes = Arc::new(self.routes);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let _ = stream.set_nodelay(true);
                    let routes = routes.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = read_frames(stream, routes, shutdown).await {
                            tracing::debug!(peer = %peer, error = %e, "conduit connection closed");
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
    routes: Arc<HashMap<u64, mpsc::Sender<Bytes>>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ReplError> {
    loop {
        let len = tokio::select! {
            len = stream.read_u32() => len? as usize,
            _ = shutdown.changed() => return Ok(()),
        };
        if len < BATCH_HEADER_LEN || len > BATCH_HEADER_LEN + MAX_BATCH_BODY_LEN {
            return Err(ReplError::Codec(format!("bad batch frame length {}", len)));
        }
        let mut frame = vec![0u8; len];
        stream.read_exact(&mut frame).await?;
        let source = BatchEnvelope::peek_source(&frame)?;
        match routes.get(&source) {
            Some(route) => route
                .send(Bytes::from(frame))
                .await
                .map_err(|_| ReplError::Shutdown)?,
            None => {
                tracing::warn!(site_id = source, "dropping batch from unknown site");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claudefs_meta::{InodeId, LogEntry, LogIndex, MetaOp, ShardId, Term, Timestamp, VectorClock};

    fn envelope(entries: usize) -> BatchEnvelope {
        BatchEnvelope {
            source_site_id: 3,
            batch_sequence: 9,
            entries: (1..=entries as u64)
                .map(|seq| ReplicatedEntry {
                    epoch: 1,
                    sequence: seq,
                    shard_id: ShardId::new(1),
                    committed_at: Timestamp::new(seq, 0),
                    clock: VectorClock::new(3, seq),
                    base_clock: Some(VectorClock::new(3, seq - 1)),
                    entry: LogEntry {
                        index: LogIndex::new(seq),
                        term: Term::new(2),
                        op: MetaOp::DeleteInode {
                            ino: InodeId::new(seq + 100),
                        },
                    },
                })
                .collect(),
            auth_tag: BatchTag::new([5u8; 32]),
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let batch = envelope(3);
        let frame = batch.encode().unwrap();
        assert_eq!(&frame[..4], b"CFRB");
        assert_eq!(BatchEnvelope::peek_source(&frame).unwrap(), 3);
        assert_eq!(BatchEnvelope::decode(&frame).unwrap(), batch);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        let frame = envelope(1).encode().unwrap().to_vec();

        let mut bad_magic = frame.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            BatchEnvelope::decode(&bad_magic),
            Err(ReplError::Codec(_))
        ));

        let mut bad_version = frame.clone();
        bad_version[4] = 9;
        assert!(matches!(
            BatchEnvelope::decode(&bad_version),
            Err(ReplError::VersionMismatch { expected: 1, got: 9 })
        ));

        let mut trailing = frame.clone();
        trailing.push(0);
        assert!(BatchEnvelope::decode(&trailing).is_err());

        assert!(BatchEnvelope::decode(&frame[..10]).is_err());
    }

    #[tokio::test]
    async fn test_in_memory_pair() {
        let (a, b) = InMemoryConduit::pair(1, 2, 8);
        assert_eq!(a.remote_site_id(), 2);
        assert_eq!(b.remote_site_id(), 1);
        a.send(Bytes::from_static(b"ab")).await.unwrap();
        b.send(Bytes::from_static(b"ba")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"ba"));
    }

    #[tokio::test]
    async fn test_in_memory_disconnect() {
        let (a, b) = InMemoryConduit::pair(1, 2, 8);
        b.set_connected(false);
        assert!(matches!(
            a.send(Bytes::from_static(b"x")).await,
            Err(ReplError::Transport { .. })
        ));
        a.set_connected(true);
        a.send(Bytes::from_static(b"y")).await.unwrap();
        drop(a);
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"y"));
        assert!(matches!(b.recv().await, Err(ReplError::Shutdown)));
    }

    #[tokio::test]
    async fn test_tcp_conduit_routes_by_source() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // site 1 listens; site 3 dials it
        let mut site1 = ConduitListener::new();
        let from_site3 = site1.register(3, "127.0.0.1:1", ConduitConfig::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(site1.serve(listener, shutdown_rx));

        let mut site3 = ConduitListener::new();
        let to_site1 = site3.register(1, &addr, ConduitConfig::default());

        let batch = envelope(2);
        to_site1.send(batch.encode().unwrap()).await.unwrap();
        let frame = from_site3.recv().await.unwrap();
        assert_eq!(BatchEnvelope::decode(&frame).unwrap(), batch);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
