//! # Signing Primitives
//!
//! Domain-separated Ed25519 signing and verification used by the wire codec
//! and the protocol-version records.
//!
//! Every signed data type uses a unique domain prefix so a signature minted
//! for one context cannot be replayed in another: message signatures cover
//! the framed wire message, version signatures cover a protocol-version
//! record.

use ed25519_dalek::{Signature, Verifier};

use crate::identity::{Identity, Keypair};

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Domain separation prefix for wire message signatures.
pub const MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"blockwire-message-v1:";

/// Domain separation prefix for app protocol version signatures.
pub const VERSION_SIGNATURE_DOMAIN: &[u8] = b"blockwire-version-v1:";

/// Sign `data` under a domain prefix with the node keypair.
///
/// Returns the 64-byte Ed25519 signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign_raw(&prefixed).to_vec()
}

/// Verify a domain-separated signature against a signer identity.
pub fn verify_with_domain(
    signer: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let signature = Signature::from_bytes(&sig_bytes);

    let key = signer
        .verifying_key()
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    key.verify(&prefixed, &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}
