//! # Wire Codec
//!
//! Maps between typed [`Message`]s and multi-frame wire messages.
//!
//! ## Frame groups
//!
//! A TCP stream carries a sequence of *frame groups*. Each group is a `u32`
//! big-endian byte length followed by that many bytes of body; the body is a
//! sequence of frames, each a `u32` big-endian length plus payload. Length
//! and frame-count caps are checked before any allocation.
//!
//! ## Message frames
//!
//! An encoded message is one frame group with the frames, in order:
//!
//! 1. version: bincode [`AppProtocolVersion`]
//! 2. type: one-byte kind tag
//! 3. peer: bincode sending [`Peer`]
//! 4. timestamp: RFC 3339 UTC instant
//! 5. signature: Ed25519 over frames 1-4 plus all body frames
//! 6. body frames, per kind
//!
//! The routing identity frame never appears inside an encoded message. It is
//! attached by the receiving router (which learned it from the connection
//! preamble) and split off here when `expect_identity` is set.
//!
//! Decode order: identity split, header parse, version gate, lifespan gate,
//! signature verification, kind dispatch. Each step fails with the matching
//! [`TransportError`] variant.

use std::io;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use tokio_util::codec::{Decoder, Encoder};

use crate::crypto::{sign_with_domain, verify_with_domain, MESSAGE_SIGNATURE_DOMAIN};
use crate::error::TransportError;
use crate::identity::{Keypair, Peer};
use crate::messages::{Envelope, Message, MessageKind};
use crate::version::AppProtocolVersion;

/// Maximum bytes in one frame group.
pub(crate) const MAX_GROUP_BYTES: usize = 8 * 1024 * 1024;

/// Maximum frames in one frame group.
pub(crate) const MAX_FRAMES_PER_GROUP: usize = 256;

const LEN_SIZE: usize = 4;

/// A group of ordered frames, the unit read from and written to a socket.
pub(crate) type FrameGroup = Vec<Bytes>;

// ============================================================================
// Frame group codec
// ============================================================================

/// Length-delimited frame-group codec for `Framed` TCP streams.
pub(crate) struct FrameCodec;

impl Encoder<FrameGroup> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, group: FrameGroup, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if group.len() > MAX_FRAMES_PER_GROUP {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame group has {} frames (max {})", group.len(), MAX_FRAMES_PER_GROUP),
            ));
        }
        let body_len: usize = group.iter().map(|f| LEN_SIZE + f.len()).sum();
        if body_len > MAX_GROUP_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame group is {body_len} bytes (max {MAX_GROUP_BYTES})"),
            ));
        }

        dst.reserve(LEN_SIZE + body_len);
        dst.put_u32(body_len as u32);
        for frame in &group {
            dst.put_u32(frame.len() as u32);
            dst.put_slice(frame);
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = FrameGroup;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_SIZE {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if body_len > MAX_GROUP_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("inbound frame group is {body_len} bytes (max {MAX_GROUP_BYTES})"),
            ));
        }
        if src.len() < LEN_SIZE + body_len {
            src.reserve(LEN_SIZE + body_len - src.len());
            return Ok(None);
        }

        src.advance(LEN_SIZE);
        let mut body = src.split_to(body_len).freeze();

        let mut frames = Vec::new();
        while !body.is_empty() {
            if frames.len() == MAX_FRAMES_PER_GROUP {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "inbound frame group exceeds frame cap",
                ));
            }
            if body.len() < LEN_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated frame header",
                ));
            }
            let frame_len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
            body.advance(LEN_SIZE);
            if body.len() < frame_len {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "truncated frame payload",
                ));
            }
            frames.push(body.split_to(frame_len));
        }

        Ok(Some(frames))
    }
}

// ============================================================================
// Message encode
// ============================================================================

/// Assemble and sign the wire frames for a message.
///
/// Deterministic for a fixed `(message, keypair, sender, timestamp, version)`
/// input: the signature covers every header and body frame in order, with
/// each frame length-prefixed inside the signed buffer so frame boundaries
/// are unambiguous.
pub fn encode_message(
    message: &Message,
    keypair: &Keypair,
    sender: &Peer,
    timestamp: DateTime<Utc>,
    version: &AppProtocolVersion,
) -> Result<FrameGroup, TransportError> {
    let version_frame = Bytes::from(crate::messages::serialize(version)?);
    let type_frame = Bytes::copy_from_slice(&[message.kind() as u8]);
    let peer_frame = Bytes::from(crate::messages::serialize(sender)?);
    let timestamp_frame = Bytes::from(
        timestamp
            .to_rfc3339_opts(SecondsFormat::Micros, true)
            .into_bytes(),
    );
    let body_frames = message.to_body_frames()?;

    let signed = signing_buffer(
        [&version_frame, &type_frame, &peer_frame, &timestamp_frame]
            .into_iter()
            .chain(body_frames.iter()),
    );
    let signature = Bytes::from(sign_with_domain(
        keypair,
        MESSAGE_SIGNATURE_DOMAIN,
        &signed,
    ));

    let mut frames = Vec::with_capacity(5 + body_frames.len());
    frames.push(version_frame);
    frames.push(type_frame);
    frames.push(peer_frame);
    frames.push(timestamp_frame);
    frames.push(signature);
    frames.extend(body_frames);
    Ok(frames)
}

fn signing_buffer<'a>(frames: impl Iterator<Item = &'a Bytes>) -> Vec<u8> {
    let mut buffer = Vec::new();
    for frame in frames {
        buffer.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buffer.extend_from_slice(frame);
    }
    buffer
}

// ============================================================================
// Message decode
// ============================================================================

/// Parse, gate, verify, and dispatch an inbound frame group.
///
/// `expect_identity` is set for messages received through the listening
/// socket, where the router has prepended the connection's routing identity
/// as frame 0. `validator` is the version gate callback; it receives the
/// identity, the claimed sender, and the remote version, and rejects with
/// [`TransportError::DifferentAppProtocolVersion`].
pub fn decode_message(
    frames: &[Bytes],
    expect_identity: bool,
    lifespan: Option<Duration>,
    validator: impl Fn(Option<&[u8]>, &Peer, &AppProtocolVersion) -> Result<(), TransportError>,
) -> Result<Envelope, TransportError> {
    let (identity, rest) = if expect_identity {
        let (first, rest) = frames
            .split_first()
            .ok_or_else(|| TransportError::InvalidMessage("empty frame group".into()))?;
        (Some(first.as_ref()), rest)
    } else {
        (None, frames)
    };

    if rest.len() < 5 {
        return Err(TransportError::InvalidMessage(format!(
            "message needs at least 5 frames, got {}",
            rest.len()
        )));
    }
    let version_frame = &rest[0];
    let type_frame = &rest[1];
    let peer_frame = &rest[2];
    let timestamp_frame = &rest[3];
    let signature_frame = &rest[4];
    let body_frames = &rest[5..];

    let version: AppProtocolVersion = crate::messages::deserialize_bounded(version_frame)?;
    if type_frame.len() != 1 {
        return Err(TransportError::InvalidMessage(format!(
            "type frame must be 1 byte, got {}",
            type_frame.len()
        )));
    }
    let kind = MessageKind::from_tag(type_frame[0])
        .ok_or_else(|| TransportError::InvalidMessage(format!("unknown type tag {:#04x}", type_frame[0])))?;
    let remote: Peer = crate::messages::deserialize_bounded(peer_frame)?;
    let timestamp_str = std::str::from_utf8(timestamp_frame)
        .map_err(|_| TransportError::InvalidMessage("timestamp frame is not utf-8".into()))?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp_str)
        .map_err(|e| TransportError::InvalidMessage(format!("timestamp: {e}")))?
        .with_timezone(&Utc);

    validator(identity, &remote, &version)?;

    if let Some(lifespan) = lifespan {
        let window = TimeDelta::from_std(lifespan).unwrap_or(TimeDelta::MAX);
        let now = Utc::now();
        if now.signed_duration_since(timestamp) > window
            || timestamp.signed_duration_since(now) > window
        {
            return Err(TransportError::InvalidTimestamp {
                timestamp,
                lifespan,
            });
        }
    }

    let signed = signing_buffer(
        [version_frame, type_frame, peer_frame, timestamp_frame]
            .into_iter()
            .chain(body_frames.iter()),
    );
    verify_with_domain(
        &remote.identity,
        MESSAGE_SIGNATURE_DOMAIN,
        &signed,
        signature_frame,
    )
    .map_err(|e| TransportError::InvalidMessage(format!("signature: {e}")))?;

    let message = Message::from_body_frames(kind, body_frames)?;

    Ok(Envelope {
        message,
        remote,
        version,
        timestamp,
        identity: identity.map(|id| id.to_vec()),
    })
}

// ============================================================================
// Shared wire context
// ============================================================================

/// Everything a background task needs to encode outbound and decode inbound
/// messages: the node keypair, the advertised peer record, the local version
/// and its gate, and the configured message lifespan. Built once at start.
pub(crate) struct WireContext {
    pub keypair: std::sync::Arc<Keypair>,
    pub local_peer: Peer,
    pub version: AppProtocolVersion,
    pub gate: crate::version::VersionGate,
    pub lifespan: Option<Duration>,
}

impl WireContext {
    /// Encode a message stamped with the current instant.
    pub fn encode(&self, message: &Message) -> Result<FrameGroup, TransportError> {
        encode_message(
            message,
            &self.keypair,
            &self.local_peer,
            Utc::now(),
            &self.version,
        )
    }

    /// Decode an inbound frame group under the configured gate and lifespan.
    pub fn decode(
        &self,
        frames: &[Bytes],
        expect_identity: bool,
    ) -> Result<Envelope, TransportError> {
        decode_message(frames, expect_identity, self.lifespan, |id, peer, version| {
            self.gate.check(id, peer, version)
        })
    }
}

/// Fresh 16-byte routing identity for a client-side socket.
pub(crate) fn generate_wire_identity() -> [u8; 16] {
    rand::random()
}

/// The preamble frame group announcing a socket's routing identity.
pub(crate) fn preamble_group(identity: &[u8]) -> FrameGroup {
    vec![Bytes::copy_from_slice(identity)]
}

/// Timestamp shared by the router and the request workers, updated on every
/// successful inbound decode.
pub(crate) type LastMessage = std::sync::Arc<std::sync::RwLock<Option<DateTime<Utc>>>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{HostEndpoint, Keypair};
    use crate::messages::TxId;
    use proptest::prelude::*;

    fn accept_any(
        _: Option<&[u8]>,
        _: &Peer,
        _: &AppProtocolVersion,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn test_parts() -> (Keypair, Peer, AppProtocolVersion) {
        let keypair = Keypair::generate();
        let peer = Peer::bound(keypair.identity(), HostEndpoint::new("127.0.0.1", 31000));
        let version = AppProtocolVersion::sign(&keypair, 1, vec![]);
        (keypair, peer, version)
    }

    #[test]
    fn frame_codec_round_trip() {
        let mut codec = FrameCodec;
        let group: FrameGroup = vec![
            Bytes::from_static(b"first"),
            Bytes::new(),
            Bytes::from_static(b"third frame"),
        ];

        let mut buf = BytesMut::new();
        codec.encode(group.clone(), &mut buf).expect("encode");
        let decoded = codec.decode(&mut buf).expect("decode").expect("complete");
        assert_eq!(decoded, group);
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_codec_handles_partial_input() {
        let mut codec = FrameCodec;
        let group: FrameGroup = vec![Bytes::from_static(b"payload")];

        let mut full = BytesMut::new();
        codec.encode(group.clone(), &mut full).expect("encode");

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).expect("no error").is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        let decoded = codec.decode(&mut partial).expect("decode").expect("complete");
        assert_eq!(decoded, group);
    }

    #[test]
    fn frame_codec_rejects_oversized_group() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_GROUP_BYTES + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn message_round_trip_without_identity() {
        let (keypair, peer, version) = test_parts();
        let message = Message::TxIds(vec![TxId::of(b"t1"), TxId::of(b"t2")]);
        let timestamp = Utc::now();

        let frames =
            encode_message(&message, &keypair, &peer, timestamp, &version).expect("encode");
        let envelope = decode_message(&frames, false, None, accept_any).expect("decode");

        assert_eq!(envelope.message, message);
        assert_eq!(envelope.remote, peer);
        assert_eq!(envelope.version, version);
        assert_eq!(envelope.identity, None);
        // Micro-second precision survives the RFC 3339 form.
        assert_eq!(
            envelope.timestamp.timestamp_micros(),
            timestamp.timestamp_micros()
        );
    }

    #[test]
    fn identity_frame_split_and_echoed() {
        let (keypair, peer, version) = test_parts();
        let frames =
            encode_message(&Message::Ping, &keypair, &peer, Utc::now(), &version).expect("encode");

        let mut routed = vec![Bytes::from_static(b"conn-identity")];
        routed.extend(frames);
        let envelope = decode_message(&routed, true, None, accept_any).expect("decode");

        assert_eq!(envelope.identity.as_deref(), Some(&b"conn-identity"[..]));
        assert_eq!(envelope.message, Message::Ping);
    }

    #[test]
    fn stale_timestamp_rejected() {
        let (keypair, peer, version) = test_parts();
        let stale = Utc::now() - TimeDelta::seconds(120);
        let frames =
            encode_message(&Message::Ping, &keypair, &peer, stale, &version).expect("encode");

        let err = decode_message(&frames, false, Some(Duration::from_secs(30)), accept_any)
            .expect_err("stale timestamp rejected");
        assert!(matches!(err, TransportError::InvalidTimestamp { .. }));

        decode_message(&frames, false, Some(Duration::from_secs(600)), accept_any)
            .expect("within lifespan accepted");
    }

    #[test]
    fn future_timestamp_rejected() {
        let (keypair, peer, version) = test_parts();
        let future = Utc::now() + TimeDelta::seconds(120);
        let frames =
            encode_message(&Message::Ping, &keypair, &peer, future, &version).expect("encode");

        let err = decode_message(&frames, false, Some(Duration::from_secs(30)), accept_any)
            .expect_err("future timestamp rejected");
        assert!(matches!(err, TransportError::InvalidTimestamp { .. }));
    }

    #[test]
    fn validator_rejection_wins_over_signature() {
        let (keypair, peer, version) = test_parts();
        // Corrupt the signature; the validator must fire first per decode order.
        let mut frames =
            encode_message(&Message::Ping, &keypair, &peer, Utc::now(), &version).expect("encode");
        frames[4] = Bytes::from_static(&[0u8; 64]);

        let err = decode_message(&frames, false, None, |id, _, remote| {
            Err(TransportError::DifferentAppProtocolVersion {
                identity: id.map(|i| i.to_vec()),
                local: remote.clone(),
                remote: remote.clone(),
            })
        })
        .expect_err("validator rejects");
        assert!(matches!(
            err,
            TransportError::DifferentAppProtocolVersion { .. }
        ));
    }

    proptest! {
        /// Flipping any byte of any non-identity frame must fail signature
        /// verification (or earlier structural parsing), never decode.
        #[test]
        fn mutated_frames_never_decode(frame_idx in 0usize..6, byte_idx in 0usize..64, flip in 1u8..=255) {
            let (keypair, peer, version) = test_parts();
            let message = Message::Blocks(vec![vec![7u8; 64]]);
            let frames = encode_message(&message, &keypair, &peer, Utc::now(), &version).unwrap();

            let mut mutated: Vec<Vec<u8>> = frames.iter().map(|f| f.to_vec()).collect();
            let frame = &mut mutated[frame_idx % frames.len()];
            if !frame.is_empty() {
                let i = byte_idx % frame.len();
                frame[i] ^= flip;
                let mutated: Vec<Bytes> = mutated.into_iter().map(Bytes::from).collect();
                prop_assert!(decode_message(&mutated, false, None, accept_any).is_err());
            }
        }

        /// Round-trip holds for arbitrary tx payload contents.
        #[test]
        fn tx_round_trip(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
            let (keypair, peer, version) = test_parts();
            let message = Message::Tx(payload);
            let frames = encode_message(&message, &keypair, &peer, Utc::now(), &version).unwrap();
            let envelope = decode_message(&frames, false, None, accept_any).unwrap();
            prop_assert_eq!(envelope.message, message);
        }
    }
}
