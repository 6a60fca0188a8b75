//! # Blockwire - Peer-to-Peer Message Transport
//!
//! Blockwire lets a blockchain node exchange typed, signed, timestamped
//! messages with other nodes over a single listening socket:
//!
//! - **Identity**: Ed25519 keypairs; a peer's 32-byte public key is its
//!   identity, and every wire message is signed by its sender
//! - **Versioning**: a signed app protocol version rides on every message
//!   and is gated at decode time (trusted signers, optional callback)
//! - **Request/reply**: worker pool with per-request sockets, configurable
//!   timeouts, and expected-reply counts
//! - **Broadcast**: fire-and-forget fan-out over cached outbound sockets
//!   with idle eviction
//! - **NAT traversal**: advertised endpoint resolution via a configured
//!   host or a TURN/STUN server pool
//!
//! ## Quick start
//!
//! ```ignore
//! let keypair = Keypair::generate();
//! let version = AppProtocolVersion::sign(&keypair, 1, vec![]);
//! let mut config = TransportConfig::new(keypair, version);
//! config.host = Some("node.example.org".into());
//!
//! let transport = Arc::new(Transport::new(config));
//! transport.add_message_handler(handler);
//! transport.start(&CancellationToken::new()).await?;
//!
//! let pong = transport
//!     .send_with_reply(&peer, Message::Ping, Some(Duration::from_secs(1)), &cancel)
//!     .await?;
//! ```
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `transport` | Public facade: lifecycle, send/broadcast/reply surface |
//! | `identity` | Keypairs, identities, peers, endpoints |
//! | `version` | Signed app protocol versions and the decode-time gate |
//! | `messages` | Typed message kinds and their body-frame encodings |
//! | `codec` | Frame-group framing plus message sign/verify encode/decode |
//! | `nat` | Public endpoint resolution over STUN/TURN |
//! | `outbound` | Cached outbound sockets and the broadcast pump |
//! | `requests` | Request queue and worker pool |
//! | `router` | Listening socket, reply routing, handler dispatch |
//! | `crypto` | Domain-separated signing helpers |
//! | `error` | The `TransportError` taxonomy |

mod codec;
mod crypto;
mod error;
mod identity;
mod messages;
mod nat;
mod outbound;
mod requests;
mod router;
mod transport;
mod version;

pub use codec::{decode_message, encode_message};
pub use crypto::SignatureError;
pub use error::TransportError;
pub use identity::{BoundPeer, HostEndpoint, Identity, Keypair, Peer};
pub use messages::{BlockHash, Envelope, Message, MessageKind, TxId};
pub use nat::{Allocation, IceClient, IceServer};
pub use router::MessageHandler;
pub use transport::{Transport, TransportConfig, TransportState};
pub use version::{AppProtocolVersion, DifferentVersionCallback};

pub use async_trait::async_trait;
pub use bytes::Bytes;
pub use tokio_util::sync::CancellationToken;
