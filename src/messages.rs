//! # Typed Messages and Body Frames
//!
//! The closed set of message kinds exchanged between nodes, and the mapping
//! between each kind and its body frames (ordered opaque byte blobs).
//!
//! Blocks, transactions, and headers are carried as opaque serialized bytes;
//! this layer neither parses nor validates chain data. Peers of the same
//! protocol version must agree on these per-kind encodings:
//!
//! | Kind | Body frames |
//! |------|-------------|
//! | `Ping`, `Pong`, `GetChainStatus`, `DifferentVersion` | none |
//! | `GetBlockHashes` | locator (bincode), stop hash (empty when absent) |
//! | `BlockHashes`, `GetBlocks` | one 32-byte frame per hash |
//! | `TxIds`, `GetTxs` | one 32-byte frame per id |
//! | `Blocks` | one frame per serialized block |
//! | `Tx` | one frame with the transaction bytes |
//! | `FindNeighbors` | one 32-byte identity frame |
//! | `Neighbors` | one bincode peer record per frame |
//! | `BlockHeader` | genesis hash, header bytes |
//! | `ChainStatus` | genesis hash, tip index, tip hash, total difficulty |

use std::fmt;

use bincode::Options;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::TransportError;
use crate::identity::{Identity, Peer};
use crate::version::AppProtocolVersion;

/// Maximum buffer size accepted by bounded deserialization. Set above the
/// frame-group cap so framing overhead never trips it.
pub(crate) const MAX_DESERIALIZE_SIZE: u64 = 9 * 1024 * 1024;

/// Returns bincode options with the size limit enforced. All inbound
/// deserialization goes through this; raw `bincode::deserialize` would
/// allocate attacker-controlled lengths before reading.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Serialize a wire record.
pub(crate) fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    bincode_options()
        .serialize(value)
        .map_err(|e| TransportError::InvalidMessage(format!("serialize: {e}")))
}

/// Deserialize a wire record with size bounds enforced.
pub(crate) fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    bincode_options()
        .deserialize(bytes)
        .map_err(|e| TransportError::InvalidMessage(format!("deserialize: {e}")))
}

// ============================================================================
// Opaque chain payloads
// ============================================================================

/// A 32-byte block hash. Opaque to the transport.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash([u8; 32]);

/// A 32-byte transaction id. Opaque to the transport.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId([u8; 32]);

macro_rules! impl_digest {
    ($name:ident) => {
        impl $name {
            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// Content hash of raw serialized bytes.
            pub fn of(data: &[u8]) -> Self {
                Self(*blake3::hash(data).as_bytes())
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::encode(&self.0[..8]))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }
    };
}

impl_digest!(BlockHash);
impl_digest!(TxId);

// ============================================================================
// Message kinds
// ============================================================================

/// Wire tag for each message kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0x01,
    Pong = 0x02,
    GetBlockHashes = 0x03,
    BlockHashes = 0x04,
    TxIds = 0x05,
    GetBlocks = 0x06,
    GetTxs = 0x07,
    Blocks = 0x08,
    Tx = 0x09,
    FindNeighbors = 0x0a,
    Neighbors = 0x0b,
    BlockHeader = 0x0c,
    GetChainStatus = 0x0d,
    ChainStatus = 0x0e,
    DifferentVersion = 0x0f,
}

impl MessageKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Ping,
            0x02 => Self::Pong,
            0x03 => Self::GetBlockHashes,
            0x04 => Self::BlockHashes,
            0x05 => Self::TxIds,
            0x06 => Self::GetBlocks,
            0x07 => Self::GetTxs,
            0x08 => Self::Blocks,
            0x09 => Self::Tx,
            0x0a => Self::FindNeighbors,
            0x0b => Self::Neighbors,
            0x0c => Self::BlockHeader,
            0x0d => Self::GetChainStatus,
            0x0e => Self::ChainStatus,
            0x0f => Self::DifferentVersion,
            _ => return None,
        })
    }
}

/// A typed transport message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Liveness probe.
    Ping,
    /// Liveness answer.
    Pong,
    /// Request block hashes following a locator.
    GetBlockHashes {
        locator: Vec<BlockHash>,
        stop: Option<BlockHash>,
    },
    /// Hashes answering `GetBlockHashes`.
    BlockHashes(Vec<BlockHash>),
    /// Announcement of transaction ids held by the sender.
    TxIds(Vec<TxId>),
    /// Request full blocks by hash.
    GetBlocks(Vec<BlockHash>),
    /// Request full transactions by id.
    GetTxs(Vec<TxId>),
    /// Serialized blocks, one per frame.
    Blocks(Vec<Vec<u8>>),
    /// One serialized transaction.
    Tx(Vec<u8>),
    /// Request peers near the given identity.
    FindNeighbors(Identity),
    /// Peer records answering `FindNeighbors`.
    Neighbors(Vec<Peer>),
    /// Announcement of a new tip header.
    BlockHeader {
        genesis_hash: BlockHash,
        header: Vec<u8>,
    },
    /// Request the sender's chain status.
    GetChainStatus,
    /// Chain status answering `GetChainStatus`.
    ChainStatus {
        genesis_hash: BlockHash,
        tip_index: u64,
        tip_hash: BlockHash,
        total_difficulty: u128,
    },
    /// Emitted to a peer whose protocol version was rejected.
    DifferentVersion,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ping => MessageKind::Ping,
            Message::Pong => MessageKind::Pong,
            Message::GetBlockHashes { .. } => MessageKind::GetBlockHashes,
            Message::BlockHashes(_) => MessageKind::BlockHashes,
            Message::TxIds(_) => MessageKind::TxIds,
            Message::GetBlocks(_) => MessageKind::GetBlocks,
            Message::GetTxs(_) => MessageKind::GetTxs,
            Message::Blocks(_) => MessageKind::Blocks,
            Message::Tx(_) => MessageKind::Tx,
            Message::FindNeighbors(_) => MessageKind::FindNeighbors,
            Message::Neighbors(_) => MessageKind::Neighbors,
            Message::BlockHeader { .. } => MessageKind::BlockHeader,
            Message::GetChainStatus => MessageKind::GetChainStatus,
            Message::ChainStatus { .. } => MessageKind::ChainStatus,
            Message::DifferentVersion => MessageKind::DifferentVersion,
        }
    }

    /// Kind name for log fields.
    pub fn kind_name(&self) -> &'static str {
        match self.kind() {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::GetBlockHashes => "get_block_hashes",
            MessageKind::BlockHashes => "block_hashes",
            MessageKind::TxIds => "tx_ids",
            MessageKind::GetBlocks => "get_blocks",
            MessageKind::GetTxs => "get_txs",
            MessageKind::Blocks => "blocks",
            MessageKind::Tx => "tx",
            MessageKind::FindNeighbors => "find_neighbors",
            MessageKind::Neighbors => "neighbors",
            MessageKind::BlockHeader => "block_header",
            MessageKind::GetChainStatus => "get_chain_status",
            MessageKind::ChainStatus => "chain_status",
            MessageKind::DifferentVersion => "different_version",
        }
    }

    /// Serialize the kind-specific body frames.
    pub(crate) fn to_body_frames(&self) -> Result<Vec<Bytes>, TransportError> {
        let frames = match self {
            Message::Ping
            | Message::Pong
            | Message::GetChainStatus
            | Message::DifferentVersion => Vec::new(),
            Message::GetBlockHashes { locator, stop } => {
                let stop_frame = match stop {
                    Some(hash) => Bytes::copy_from_slice(hash.as_bytes()),
                    None => Bytes::new(),
                };
                vec![Bytes::from(serialize(locator)?), stop_frame]
            }
            Message::BlockHashes(hashes) | Message::GetBlocks(hashes) => hashes
                .iter()
                .map(|h| Bytes::copy_from_slice(h.as_bytes()))
                .collect(),
            Message::TxIds(ids) | Message::GetTxs(ids) => ids
                .iter()
                .map(|id| Bytes::copy_from_slice(id.as_bytes()))
                .collect(),
            Message::Blocks(blocks) => blocks
                .iter()
                .map(|b| Bytes::copy_from_slice(b))
                .collect(),
            Message::Tx(tx) => vec![Bytes::copy_from_slice(tx)],
            Message::FindNeighbors(target) => {
                vec![Bytes::copy_from_slice(target.as_bytes())]
            }
            Message::Neighbors(peers) => peers
                .iter()
                .map(|p| serialize(p).map(Bytes::from))
                .collect::<Result<_, _>>()?,
            Message::BlockHeader {
                genesis_hash,
                header,
            } => vec![
                Bytes::copy_from_slice(genesis_hash.as_bytes()),
                Bytes::copy_from_slice(header),
            ],
            Message::ChainStatus {
                genesis_hash,
                tip_index,
                tip_hash,
                total_difficulty,
            } => vec![
                Bytes::copy_from_slice(genesis_hash.as_bytes()),
                Bytes::copy_from_slice(&tip_index.to_be_bytes()),
                Bytes::copy_from_slice(tip_hash.as_bytes()),
                Bytes::copy_from_slice(&total_difficulty.to_be_bytes()),
            ],
        };
        Ok(frames)
    }

    /// Reconstruct a message from its kind tag and body frames.
    pub(crate) fn from_body_frames(
        kind: MessageKind,
        frames: &[Bytes],
    ) -> Result<Self, TransportError> {
        let message = match kind {
            MessageKind::Ping => expect_empty(frames, Message::Ping)?,
            MessageKind::Pong => expect_empty(frames, Message::Pong)?,
            MessageKind::GetChainStatus => expect_empty(frames, Message::GetChainStatus)?,
            MessageKind::DifferentVersion => expect_empty(frames, Message::DifferentVersion)?,
            MessageKind::GetBlockHashes => {
                let [locator_frame, stop_frame] = exact_frames::<2>(frames)?;
                let locator: Vec<BlockHash> = deserialize_bounded(locator_frame)?;
                let stop = if stop_frame.is_empty() {
                    None
                } else {
                    Some(BlockHash::from_bytes(digest_frame(stop_frame)?))
                };
                Message::GetBlockHashes { locator, stop }
            }
            MessageKind::BlockHashes => Message::BlockHashes(digest_frames(frames, BlockHash::from_bytes)?),
            MessageKind::GetBlocks => Message::GetBlocks(digest_frames(frames, BlockHash::from_bytes)?),
            MessageKind::TxIds => Message::TxIds(digest_frames(frames, TxId::from_bytes)?),
            MessageKind::GetTxs => Message::GetTxs(digest_frames(frames, TxId::from_bytes)?),
            MessageKind::Blocks => {
                Message::Blocks(frames.iter().map(|f| f.to_vec()).collect())
            }
            MessageKind::Tx => {
                let [tx] = exact_frames::<1>(frames)?;
                Message::Tx(tx.to_vec())
            }
            MessageKind::FindNeighbors => {
                let [target] = exact_frames::<1>(frames)?;
                Message::FindNeighbors(Identity::from_bytes(digest_frame(target)?))
            }
            MessageKind::Neighbors => {
                let peers = frames
                    .iter()
                    .map(|f| deserialize_bounded::<Peer>(f))
                    .collect::<Result<Vec<_>, _>>()?;
                Message::Neighbors(peers)
            }
            MessageKind::BlockHeader => {
                let [genesis, header] = exact_frames::<2>(frames)?;
                Message::BlockHeader {
                    genesis_hash: BlockHash::from_bytes(digest_frame(genesis)?),
                    header: header.to_vec(),
                }
            }
            MessageKind::ChainStatus => {
                let [genesis, tip_index, tip_hash, difficulty] = exact_frames::<4>(frames)?;
                Message::ChainStatus {
                    genesis_hash: BlockHash::from_bytes(digest_frame(genesis)?),
                    tip_index: u64::from_be_bytes(fixed_frame::<8>(tip_index)?),
                    tip_hash: BlockHash::from_bytes(digest_frame(tip_hash)?),
                    total_difficulty: u128::from_be_bytes(fixed_frame::<16>(difficulty)?),
                }
            }
        };
        Ok(message)
    }
}

fn expect_empty(frames: &[Bytes], message: Message) -> Result<Message, TransportError> {
    if frames.is_empty() {
        Ok(message)
    } else {
        Err(TransportError::InvalidMessage(format!(
            "{} carries no body frames, got {}",
            message.kind_name(),
            frames.len()
        )))
    }
}

fn exact_frames<const N: usize>(frames: &[Bytes]) -> Result<[&Bytes; N], TransportError> {
    let slice: Vec<&Bytes> = frames.iter().collect();
    slice.try_into().map_err(|_| {
        TransportError::InvalidMessage(format!("expected {N} body frames, got {}", frames.len()))
    })
}

fn digest_frame(frame: &Bytes) -> Result<[u8; 32], TransportError> {
    fixed_frame::<32>(frame)
}

fn fixed_frame<const N: usize>(frame: &Bytes) -> Result<[u8; N], TransportError> {
    frame.as_ref().try_into().map_err(|_| {
        TransportError::InvalidMessage(format!("expected {N}-byte frame, got {}", frame.len()))
    })
}

fn digest_frames<T>(
    frames: &[Bytes],
    construct: impl Fn([u8; 32]) -> T,
) -> Result<Vec<T>, TransportError> {
    frames
        .iter()
        .map(|f| digest_frame(f).map(&construct))
        .collect()
}

// ============================================================================
// Decoded envelope
// ============================================================================

/// A decoded inbound message plus the metadata attached at decode time.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// The typed message.
    pub message: Message,
    /// The sending peer, parsed from the peer frame.
    pub remote: Peer,
    /// The sender's protocol version.
    pub version: AppProtocolVersion,
    /// The sender's wire timestamp.
    pub timestamp: DateTime<Utc>,
    /// Routing identity attached by the listening socket; `None` for
    /// replies read from a request socket. Pass this to `reply` to answer.
    pub identity: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{HostEndpoint, Keypair};

    fn round_trip(message: Message) {
        let frames = message.to_body_frames().expect("encode body");
        let decoded =
            Message::from_body_frames(message.kind(), &frames).expect("decode body");
        assert_eq!(message, decoded);
    }

    #[test]
    fn body_frames_round_trip_all_kinds() {
        let identity = Keypair::generate().identity();
        let peer = Peer::bound(identity, HostEndpoint::new("node.example", 31234));

        round_trip(Message::Ping);
        round_trip(Message::Pong);
        round_trip(Message::GetBlockHashes {
            locator: vec![BlockHash::of(b"tip"), BlockHash::of(b"parent")],
            stop: Some(BlockHash::of(b"stop")),
        });
        round_trip(Message::GetBlockHashes {
            locator: vec![],
            stop: None,
        });
        round_trip(Message::BlockHashes(vec![BlockHash::of(b"a"), BlockHash::of(b"b")]));
        round_trip(Message::TxIds(vec![TxId::of(b"t1")]));
        round_trip(Message::GetBlocks(vec![BlockHash::of(b"a")]));
        round_trip(Message::GetTxs(vec![TxId::of(b"t1"), TxId::of(b"t2")]));
        round_trip(Message::Blocks(vec![b"block-1".to_vec(), b"block-2".to_vec()]));
        round_trip(Message::Tx(b"tx-bytes".to_vec()));
        round_trip(Message::FindNeighbors(identity));
        round_trip(Message::Neighbors(vec![peer]));
        round_trip(Message::BlockHeader {
            genesis_hash: BlockHash::of(b"genesis"),
            header: b"header-bytes".to_vec(),
        });
        round_trip(Message::GetChainStatus);
        round_trip(Message::ChainStatus {
            genesis_hash: BlockHash::of(b"genesis"),
            tip_index: 123_456,
            tip_hash: BlockHash::of(b"tip"),
            total_difficulty: u128::MAX / 3,
        });
        round_trip(Message::DifferentVersion);
    }

    #[test]
    fn empty_kind_rejects_stray_frames() {
        let err = Message::from_body_frames(MessageKind::Ping, &[Bytes::from_static(b"x")])
            .expect_err("ping with body frames is invalid");
        assert!(matches!(err, TransportError::InvalidMessage(_)));
    }

    #[test]
    fn wrong_digest_length_rejected() {
        let err = Message::from_body_frames(MessageKind::BlockHashes, &[Bytes::from_static(b"short")])
            .expect_err("21-byte hash frame is invalid");
        assert!(matches!(err, TransportError::InvalidMessage(_)));
    }

    #[test]
    fn unknown_tag_is_none() {
        assert!(MessageKind::from_tag(0x00).is_none());
        assert!(MessageKind::from_tag(0x10).is_none());
        assert_eq!(MessageKind::from_tag(0x0f), Some(MessageKind::DifferentVersion));
    }
}
