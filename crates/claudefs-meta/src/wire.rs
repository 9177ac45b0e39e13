//! Wire framing for Raft messages exchanged between metadata servers.
//!
//! A frame is a 16-byte header followed by the bincode body:
//!
//! ```text
//! magic "CFRM" | version: u16 | shard_id: u16 | from: u64 | bincode(RaftMessage)
//! ```
//!
//! Header integers and the body use fixed-width little-endian encoding.
//! Frames with an unknown version are rejected.

use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{MetaError, NodeId, RaftMessage, ShardId};

/// Frame magic.
pub const FRAME_MAGIC: [u8; 4] = *b"CFRM";

/// Current wire format version.
pub const WIRE_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_LEN: usize = 16;

/// Largest body accepted from the network (64 MiB, enough for a snapshot chunk).
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_BODY_LEN as u64)
}

/// A Raft message addressed to one shard group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireFrame {
    /// Shard whose group should receive the message
    pub shard_id: ShardId,
    /// Sending node
    pub from: NodeId,
    /// The message itself
    pub message: RaftMessage,
}

impl WireFrame {
    /// Creates a new frame.
    pub fn new(shard_id: ShardId, from: NodeId, message: RaftMessage) -> Self {
        Self {
            shard_id,
            from,
            message,
        }
    }

    /// Serializes the frame.
    pub fn encode(&self) -> Result<Bytes, MetaError> {
        let body = codec()
            .serialize(&self.message)
            .map_err(|e| MetaError::Codec(e.to_string()))?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u16_le(WIRE_VERSION);
        buf.put_u16_le(self.shard_id.as_u16());
        buf.put_u64_le(self.from.as_u64());
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Parses a frame, rejecting bad magic, unknown versions and trailing bytes.
    pub fn decode(mut buf: &[u8]) -> Result<Self, MetaError> {
        if buf.len() < HEADER_LEN {
            return Err(MetaError::Codec(format!(
                "frame too short: {} bytes",
                buf.len()
            )));
        }
        if buf[..4] != FRAME_MAGIC {
            return Err(MetaError::Codec("bad frame magic".to_string()));
        }
        buf.advance(4);
        let version = buf.get_u16_le();
        if version != WIRE_VERSION {
            return Err(MetaError::Codec(format!(
                "unsupported wire version {}",
                version
            )));
        }
        let shard_id = ShardId::new(buf.get_u16_le());
        let from = NodeId::new(buf.get_u64_le());
        if buf.len() > MAX_BODY_LEN {
            return Err(MetaError::Codec(format!("frame body of {} bytes", buf.len())));
        }
        let message = codec()
            .allow_trailing_bytes()
            .deserialize_from(&mut buf)
            .map_err(|e| MetaError::Codec(e.to_string()))?;
        if !buf.is_empty() {
            return Err(MetaError::Codec(format!(
                "{} trailing bytes after message",
                buf.len()
            )));
        }
        Ok(Self {
            shard_id,
            from,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use proptest::prelude::*;

    fn heartbeat() -> RaftMessage {
        RaftMessage::AppendEntries {
            term: Term::new(3),
            leader_id: NodeId::new(1),
            prev_log_index: LogIndex::new(10),
            prev_log_term: Term::new(2),
            entries: vec![],
            leader_commit: LogIndex::new(9),
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = WireFrame::new(ShardId::new(0x0102), NodeId::new(7), heartbeat());
        let bytes = frame.encode().unwrap();
        assert_eq!(&bytes[..4], b"CFRM");
        assert_eq!(&bytes[4..6], &[1, 0]);
        assert_eq!(&bytes[6..8], &[0x02, 0x01]);
        assert_eq!(&bytes[8..16], &7u64.to_le_bytes());
    }

    #[test]
    fn test_rejects_unknown_version() {
        let frame = WireFrame::new(ShardId::new(1), NodeId::new(2), heartbeat());
        let mut bytes = frame.encode().unwrap().to_vec();
        bytes[4] = 9;
        let err = WireFrame::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported wire version 9"));
    }

    #[test]
    fn test_rejects_bad_magic_and_truncation() {
        let frame = WireFrame::new(ShardId::new(1), NodeId::new(2), heartbeat());
        let bytes = frame.encode().unwrap().to_vec();

        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(WireFrame::decode(&bad).is_err());
        assert!(WireFrame::decode(&bytes[..10]).is_err());
        assert!(WireFrame::decode(&bytes[..bytes.len() - 1]).is_err());

        let mut long = bytes;
        long.push(0);
        assert!(WireFrame::decode(&long).is_err());
    }

    fn arb_op() -> impl Strategy<Value = MetaOp> {
        prop_oneof![
            any::<u64>().prop_map(|ino| MetaOp::DeleteInode {
                ino: InodeId::new(ino)
            }),
            (any::<u64>(), "[a-z.]{1,12}", proptest::collection::vec(any::<u8>(), 0..16))
                .prop_map(|(ino, key, value)| MetaOp::SetXattr {
                    ino: InodeId::new(ino),
                    key,
                    value,
                }),
            (any::<u64>(), "[a-z]{1,8}", "[a-z]{1,8}").prop_map(|(p, a, b)| MetaOp::Rename {
                src_parent: InodeId::new(p),
                src_name: a,
                dst_parent: InodeId::new(p),
                dst_name: b,
            }),
        ]
    }

    fn arb_message() -> impl Strategy<Value = RaftMessage> {
        prop_oneof![
            (any::<u64>(), any::<u64>(), any::<u64>(), any::<u64>()).prop_map(
                |(t, c, i, lt)| RaftMessage::RequestVote {
                    term: Term::new(t),
                    candidate_id: NodeId::new(c),
                    last_log_index: LogIndex::new(i),
                    last_log_term: Term::new(lt),
                }
            ),
            (any::<u64>(), any::<bool>()).prop_map(|(t, g)| RaftMessage::RequestVoteResponse {
                term: Term::new(t),
                vote_granted: g,
            }),
            (
                any::<u64>(),
                any::<u64>(),
                0u64..1000,
                proptest::collection::vec(arb_op(), 0..4)
            )
                .prop_map(|(t, l, prev, ops)| RaftMessage::AppendEntries {
                    term: Term::new(t),
                    leader_id: NodeId::new(l),
                    prev_log_index: LogIndex::new(prev),
                    prev_log_term: Term::new(t),
                    entries: ops
                        .into_iter()
                        .enumerate()
                        .map(|(i, op)| LogEntry {
                            index: LogIndex::new(prev + 1 + i as u64),
                            term: Term::new(t),
                            op,
                        })
                        .collect(),
                    leader_commit: LogIndex::new(prev),
                }),
            (any::<u64>(), any::<bool>(), any::<u64>()).prop_map(|(t, s, m)| {
                RaftMessage::AppendEntriesResponse {
                    term: Term::new(t),
                    success: s,
                    match_index: LogIndex::new(m),
                }
            }),
            (
                any::<u64>(),
                any::<u64>(),
                proptest::collection::vec(any::<u8>(), 0..64)
            )
                .prop_map(|(t, i, data)| RaftMessage::InstallSnapshot {
                    term: Term::new(t),
                    leader_id: NodeId::new(1),
                    last_included_index: LogIndex::new(i),
                    last_included_term: Term::new(t),
                    data,
                }),
        ]
    }

    proptest! {
        #[test]
        fn prop_frame_decode_inverts_encode(
            shard in any::<u16>(),
            from in any::<u64>(),
            message in arb_message(),
        ) {
            let frame = WireFrame::new(ShardId::new(shard), NodeId::new(from), message);
            let bytes = frame.encode().unwrap();
            prop_assert_eq!(WireFrame::decode(&bytes).unwrap(), frame);
        }

        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = WireFrame::decode(&bytes);
        }
    }
}
