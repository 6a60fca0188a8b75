//! # App Protocol Version Gating
//!
//! Every wire message carries the sender's [`AppProtocolVersion`], a signed
//! version token. The receiver gates messages at decode time:
//!
//! 1. A remote version equal to the local one is always accepted.
//! 2. Otherwise, if a trusted-signer set is configured and the remote token
//!    is not validly signed by a member, the message is rejected.
//! 3. Otherwise a configured callback decides; with no callback, reject.
//!
//! An unset trusted-signer set means "trust any signer", which still routes
//! unequal versions through the callback (or rejection).

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::{
    sign_with_domain, verify_with_domain, SignatureError, VERSION_SIGNATURE_DOMAIN,
};
use crate::error::TransportError;
use crate::identity::{Identity, Keypair, Peer};

/// Callback deciding whether to talk to a peer whose version differs from
/// the local one. Arguments are `(local, remote)`; returning `true` accepts.
pub type DifferentVersionCallback =
    Arc<dyn Fn(&AppProtocolVersion, &AppProtocolVersion) -> bool + Send + Sync>;

/// A signed protocol version token: `(version, extra)` signed by `signer`.
///
/// `extra` is an opaque payload the operator attaches to the version (for
/// example a chain identifier); the transport only signs and compares it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProtocolVersion {
    pub version: u64,
    pub extra: Vec<u8>,
    pub signer: Identity,
    pub signature: Vec<u8>,
}

impl AppProtocolVersion {
    /// Mint a signed version token with the given keypair.
    pub fn sign(keypair: &Keypair, version: u64, extra: Vec<u8>) -> Self {
        let payload = Self::signed_payload(version, &extra);
        let signature = sign_with_domain(keypair, VERSION_SIGNATURE_DOMAIN, &payload);
        Self {
            version,
            extra,
            signer: keypair.identity(),
            signature,
        }
    }

    /// Verify the token's signature against its claimed signer.
    pub fn verify(&self) -> Result<(), SignatureError> {
        let payload = Self::signed_payload(self.version, &self.extra);
        verify_with_domain(
            &self.signer,
            VERSION_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        )
    }

    fn signed_payload(version: u64, extra: &[u8]) -> Vec<u8> {
        let mut payload = Vec::with_capacity(8 + extra.len());
        payload.extend_from_slice(&version.to_be_bytes());
        payload.extend_from_slice(extra);
        payload
    }
}

// ============================================================================
// Version gate
// ============================================================================

/// The receiver-side version policy, built once from transport
/// configuration and consulted by the codec on every decode.
pub(crate) struct VersionGate {
    local: AppProtocolVersion,
    trusted_signers: Option<HashSet<Identity>>,
    callback: Option<DifferentVersionCallback>,
}

impl VersionGate {
    pub fn new(
        local: AppProtocolVersion,
        trusted_signers: Option<HashSet<Identity>>,
        callback: Option<DifferentVersionCallback>,
    ) -> Self {
        Self {
            local,
            trusted_signers,
            callback,
        }
    }

    /// Apply the policy to a remote version. `identity` is the routing
    /// identity of the inbound message, carried into the error so the
    /// router can address a `DifferentVersion` reply.
    pub fn check(
        &self,
        identity: Option<&[u8]>,
        _remote_peer: &Peer,
        remote: &AppProtocolVersion,
    ) -> Result<(), TransportError> {
        if remote == &self.local {
            return Ok(());
        }

        let reject = || TransportError::DifferentAppProtocolVersion {
            identity: identity.map(|id| id.to_vec()),
            local: self.local.clone(),
            remote: remote.clone(),
        };

        if let Some(trusted) = &self.trusted_signers {
            let signed_by_trusted = trusted.contains(&remote.signer) && remote.verify().is_ok();
            if !signed_by_trusted {
                return Err(reject());
            }
        }

        match &self.callback {
            Some(callback) if callback(&self.local, remote) => Ok(()),
            _ => Err(reject()),
        }
    }
}
