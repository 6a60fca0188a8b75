//! # Node Identity and Peers
//!
//! Core identity types for the transport:
//!
//! - [`Keypair`]: Ed25519 signing keypair owned by the local node
//! - [`Identity`]: 32-byte public key serving as a peer's unique identifier
//! - [`HostEndpoint`]: DNS-capable host + port a peer can be dialed at
//! - [`Peer`] / [`BoundPeer`]: a remote participant, optionally addressable
//!
//! ## Identity Model
//!
//! The transport uses the same identity model throughout: **Identity =
//! Ed25519 Public Key**. Possession of the private key proves identity; no
//! external registry is consulted. Message authenticity is established per
//! message by the signature frame, not per connection.
//!
//! ## Bound vs. unbound peers
//!
//! A peer learned from a `Neighbors` record or resolved at startup may lack
//! an endpoint (for example, a node behind NAT advertising only its public
//! IP). Only a [`BoundPeer`] can be the target of `send` or `broadcast`;
//! the conversion is explicit via [`Peer::try_into_bound`].

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::net::lookup_host;

use crate::crypto::SignatureError;

// ============================================================================
// Identity
// ============================================================================

/// A peer's unique identifier: its 32-byte Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    /// Construct from raw public key bytes. The bytes are not validated as
    /// a curve point here; validation happens when a verifying key is
    /// actually needed.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from 64 hex characters.
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Truncated hex form used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Interpret the identity as an Ed25519 verifying key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, SignatureError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| SignatureError::InvalidPublicKey)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ============================================================================
// Keypair
// ============================================================================

/// The local node's Ed25519 signing keypair.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Reconstruct from a hex-encoded 32-byte seed, as provisioned in node
    /// configuration files.
    pub fn from_seed_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        let seed: [u8; 32] = bytes.try_into().ok()?;
        Some(Self::from_seed(seed))
    }

    /// Hex form of the seed, for persisting a generated key.
    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// The public identity derived from this keypair.
    pub fn identity(&self) -> Identity {
        Identity(self.signing.verifying_key().to_bytes())
    }

    /// Sign raw bytes. Callers go through the domain-separated helpers in
    /// [`crate::crypto`] rather than signing directly.
    pub(crate) fn sign_raw(&self, data: &[u8]) -> Signature {
        self.signing.sign(data)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.identity().short())
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// A dialable endpoint: DNS hostname or IP literal plus port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEndpoint {
    pub host: String,
    pub port: u16,
}

impl HostEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to a socket address. DNS names resolve at dial time, so a
    /// peer whose address record outlives a DNS change still dials the
    /// current target.
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address found for {}", self),
                )
            })
    }
}

impl From<SocketAddr> for HostEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// Peers
// ============================================================================

/// A remote participant: public key identity, optionally a dialable
/// endpoint, optionally the public IP observed during NAT resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub identity: Identity,
    pub endpoint: Option<HostEndpoint>,
    pub public_ip: Option<IpAddr>,
}

impl Peer {
    /// An unbound peer: identity only.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            endpoint: None,
            public_ip: None,
        }
    }

    /// A peer with a known endpoint.
    pub fn bound(identity: Identity, endpoint: HostEndpoint) -> Self {
        Self {
            identity,
            endpoint: Some(endpoint),
            public_ip: None,
        }
    }

    pub fn with_public_ip(mut self, ip: IpAddr) -> Self {
        self.public_ip = Some(ip);
        self
    }

    /// Convert into an addressable peer, or `None` if no endpoint is known.
    pub fn try_into_bound(self) -> Option<BoundPeer> {
        if self.endpoint.is_some() {
            Some(BoundPeer(self))
        } else {
            None
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Some(ep) => write!(f, "{}@{}", self.identity.short(), ep),
            None => write!(f, "{}@<unbound>", self.identity.short()),
        }
    }
}

/// A peer whose endpoint is known. The only addressable kind: `send`,
/// `send_with_reply`, and `broadcast` all take `BoundPeer`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundPeer(Peer);

impl BoundPeer {
    pub fn peer(&self) -> &Peer {
        &self.0
    }

    pub fn into_peer(self) -> Peer {
        self.0
    }

    pub fn identity(&self) -> Identity {
        self.0.identity
    }

    /// The endpoint this peer is dialed at.
    pub fn endpoint(&self) -> &HostEndpoint {
        self.0
            .endpoint
            .as_ref()
            .expect("BoundPeer endpoint is present by construction")
    }
}

impl fmt::Display for BoundPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hex_round_trip() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();
        let parsed = Identity::from_hex(&identity.to_hex()).expect("hex round trip");
        assert_eq!(identity, parsed);
    }

    #[test]
    fn identity_rejects_bad_hex() {
        assert!(Identity::from_hex("zz").is_none());
        assert!(Identity::from_hex("abcd").is_none());
    }

    #[test]
    fn keypair_seed_round_trip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_seed_hex(&keypair.seed_hex()).expect("seed round trip");
        assert_eq!(keypair.identity(), restored.identity());
    }

    #[test]
    fn bound_peer_requires_endpoint() {
        let identity = Keypair::generate().identity();
        assert!(Peer::new(identity).try_into_bound().is_none());

        let bound = Peer::bound(identity, HostEndpoint::new("127.0.0.1", 9000))
            .try_into_bound()
            .expect("peer with endpoint is bindable");
        assert_eq!(bound.endpoint().port, 9000);
    }

    #[tokio::test]
    async fn endpoint_resolves_ip_literal() {
        let ep = HostEndpoint::new("127.0.0.1", 4242);
        let addr = ep.resolve().await.expect("loopback resolves");
        assert_eq!(addr.port(), 4242);
        assert!(addr.ip().is_loopback());
    }
}
